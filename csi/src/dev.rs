//! Transport-independent block device helpers shared by the attach and
//! detach code: size probes, health checks and the size-tolerance rule
//! applied before a device is ever formatted or mounted.

use std::time::Duration;

use crate::{error::DeviceError, shell};

pub(crate) mod nfs;
pub(crate) mod nvmf;

/// Timeout of a single size probe.
const SIZE_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a device may take to report a non-zero size after attach.
const DEVICE_INIT_TIMEOUT: Duration = Duration::from_secs(60);
const DEVICE_INIT_ATTEMPTS: u32 = 45;
const DEVICE_INIT_INTERVAL: Duration = Duration::from_secs(1);

/// Devices smaller than expected by more than max(10% of expected, 100 MiB)
/// are refused; larger is fine (the volume may have been expanded).
const MIN_SIZE_TOLERANCE: u64 = 100 * 1024 * 1024;

/// Size of the block device in bytes via `blockdev --getsize64`.
pub(crate) async fn device_size(device: &str) -> Result<u64, DeviceError> {
    let stdout =
        shell::run_checked("blockdev", &["--getsize64", device], SIZE_PROBE_TIMEOUT).await?;
    Ok(stdout.trim().parse()?)
}

/// Quick health check: the device exists and reports a non-zero size.
pub(crate) async fn is_device_healthy(device: &str) -> bool {
    matches!(device_size(device).await, Ok(size) if size > 0)
}

/// Patient health check used on reused connections: a stale session may
/// keep the device node around while reporting zero size.
pub(crate) async fn verify_device_healthy(device: &str) -> bool {
    const ATTEMPTS: u32 = 5;
    const INTERVAL: Duration = Duration::from_millis(500);

    for attempt in 1..=ATTEMPTS {
        match device_size(device).await {
            Ok(size) if size > 0 => {
                debug!(
                    "device {} health check passed: size={} (attempt {})",
                    device, size, attempt
                );
                return true;
            }
            Ok(_) => debug!(
                "device {} health check attempt {}/{}: zero size",
                device, attempt, ATTEMPTS
            ),
            Err(error) => debug!(
                "device {} health check attempt {}/{} failed: {}",
                device, attempt, ATTEMPTS, error
            ),
        }
        if attempt < ATTEMPTS {
            tokio::time::sleep(INTERVAL).await;
        }
    }
    false
}

/// Wait until `device` reports a non-zero size, i.e. the namespace finished
/// initialising.
pub(crate) async fn wait_device_initialized(device: &str) -> Result<(), DeviceError> {
    let deadline = tokio::time::Instant::now() + DEVICE_INIT_TIMEOUT;
    for attempt in 1..=DEVICE_INIT_ATTEMPTS {
        match device_size(device).await {
            Ok(size) if size > 0 => {
                debug!(
                    "device {} initialised with size {} after {} attempts",
                    device, size, attempt
                );
                return Ok(());
            }
            Ok(_) => debug!(
                "device {} size check {}/{}: still zero",
                device, attempt, DEVICE_INIT_ATTEMPTS
            ),
            Err(error) => debug!(
                "device {} size check {}/{} failed: {}",
                device, attempt, DEVICE_INIT_ATTEMPTS, error
            ),
        }
        if tokio::time::Instant::now() + DEVICE_INIT_INTERVAL > deadline {
            break;
        }
        tokio::time::sleep(DEVICE_INIT_INTERVAL).await;
    }
    Err(DeviceError::from(format!(
        "device {device} failed to initialise: size remained zero or unreadable"
    )))
}

/// Force the kernel to drop cached state of `device` so metadata reads see
/// the target's current contents. Failures are logged and ignored, the
/// subsequent probes decide whether the device is usable.
pub(crate) async fn flush_device_caches(device: &str) {
    let five = Duration::from_secs(5);
    if let Err(error) = shell::run("sync", &[], five).await {
        debug!("sync failed: {}", error);
    }
    if let Err(error) = shell::run("blockdev", &["--flushbufs", device], five).await {
        debug!("blockdev --flushbufs {} failed: {}", device, error);
    }
    if let Err(error) = shell::run("udevadm", &["trigger", "--action=change", device], five).await {
        debug!("udevadm trigger {} failed: {}", device, error);
    }
    if let Err(error) = shell::run(
        "udevadm",
        &["settle", "--timeout=5"],
        Duration::from_secs(10),
    )
    .await
    {
        debug!("udevadm settle failed: {}", error);
    }
}

/// Verify the attached device is the volume we expect. Larger than declared
/// is fine (expansion); smaller beyond the tolerance means we are looking
/// at the wrong namespace and must not touch it.
pub(crate) fn verify_size_match(actual: u64, expected: u64) -> Result<(), String> {
    if actual >= expected {
        return Ok(());
    }
    let shortfall = expected - actual;
    let tolerance = (expected / 10).max(MIN_SIZE_TOLERANCE);
    if shortfall > tolerance {
        return Err(format!(
            "device size mismatch: expected {expected} bytes, got {actual} bytes \
             (short by {shortfall}, tolerance {tolerance})"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn larger_device_is_accepted() {
        assert!(verify_size_match(20 * GIB, 10 * GIB).is_ok());
        assert!(verify_size_match(10 * GIB, 10 * GIB).is_ok());
    }

    #[test]
    fn small_shortfall_within_tolerance() {
        // 10% of 10GiB is ~1GiB; a 512MiB shortfall passes
        assert!(verify_size_match(10 * GIB - 512 * 1024 * 1024, 10 * GIB).is_ok());
    }

    #[test]
    fn large_shortfall_is_refused() {
        assert!(verify_size_match(8 * GIB, 10 * GIB).is_err());
    }

    #[test]
    fn minimum_tolerance_is_100_mib() {
        // expected 500MiB: 10% would be 50MiB, the floor raises it to 100MiB
        let expected = 500 * 1024 * 1024;
        assert!(verify_size_match(expected - 90 * 1024 * 1024, expected).is_ok());
        assert!(verify_size_match(expected - 120 * 1024 * 1024, expected).is_err());
    }
}
