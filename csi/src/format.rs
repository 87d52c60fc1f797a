//! Utility functions for probing and formatting a device with a
//! filesystem. The probe runs blkid with retries: freshly attached fabric
//! devices can report busy for a few seconds, which must not be mistaken
//! for "no filesystem" or a cloned volume would be wiped.

use std::time::Duration;

use crate::{error::DeviceError, shell};

/// Filesystems the node plugin knows how to create.
pub(crate) const SUPPORTED_FILESYSTEMS: &[&str] = &["ext4", "ext3", "xfs"];

const BLKID_TIMEOUT: Duration = Duration::from_secs(5);
const MKFS_TIMEOUT: Duration = Duration::from_secs(300);
const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// blkid exits with 2 when the requested tag does not exist on the device,
/// i.e. there is no filesystem signature.
const BLKID_TAG_NOT_FOUND: i32 = 2;

pub(crate) fn fstype_supported(fstype: &str) -> bool {
    SUPPORTED_FILESYSTEMS.contains(&fstype)
}

/// Determine whether `device` needs a fresh filesystem. Clones get more
/// patience, their metadata may still be settling after the transport
/// attach.
pub(crate) async fn needs_format(device: &str, is_clone: bool) -> Result<bool, DeviceError> {
    let attempts = if is_clone { 8 } else { 5 };
    let mut last_failure = String::new();

    for attempt in 1..=attempts {
        let output = shell::run(
            "blkid",
            &["-s", "TYPE", "-o", "value", device],
            BLKID_TIMEOUT,
        )
        .await?;

        if output.success {
            let fstype = output.stdout.trim();
            if fstype.is_empty() {
                return Ok(true);
            }
            debug!("found existing filesystem ({}) on device {}", fstype, device);
            return Ok(false);
        }
        if output.code == Some(BLKID_TAG_NOT_FOUND) {
            return Ok(true);
        }

        // Any other failure is most likely the device still being busy.
        last_failure = output.combined();
        debug!(
            "blkid probe of {} failed (attempt {}/{}): {}",
            device, attempt, attempts, last_failure
        );
        if attempt < attempts {
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    Err(DeviceError::from(format!(
        "could not determine filesystem state of {device} after {attempts} probes: {last_failure}"
    )))
}

/// Create a filesystem on `device`.
pub(crate) async fn format_device(
    device: &str,
    fstype: &str,
    volume_id: &str,
) -> Result<(), DeviceError> {
    if !fstype_supported(fstype) {
        return Err(DeviceError::from(format!(
            "filesystem {fstype} is not supported (choose one of {SUPPORTED_FILESYSTEMS:?})"
        )));
    }

    info!(
        "creating new filesystem ({}) on device {} for volume {}",
        fstype, device, volume_id
    );
    let binary = format!("mkfs.{fstype}");
    let output = shell::run(&binary, &[device], MKFS_TIMEOUT).await?;
    if output.success {
        return Ok(());
    }
    Err(DeviceError::from(format!(
        "{binary} {device} failed: {}",
        output.combined()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_filesystem_list() {
        assert!(fstype_supported("ext4"));
        assert!(fstype_supported("ext3"));
        assert!(fstype_supported("xfs"));
        assert!(!fstype_supported("btrfs"));
        assert!(!fstype_supported(""));
    }
}
