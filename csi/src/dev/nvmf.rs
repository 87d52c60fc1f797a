//! NVMe-over-Fabrics attach engine. Staging drives the host kernel through
//! nvme-cli: connect the subsystem, wait for it to report "live", wait for
//! the namespace device to exist and report a non-zero size, then hand the
//! device to the staging code. Every step retries; the whole cycle is
//! re-entered (after a disconnect) when a later step times out.
//!
//! The outer loop checks the caller's cancellation flag only between
//! attempts. Individual commands run under their own timeouts in a
//! detached scope, so a sidecar-imposed RPC deadline can never abort a
//! half-finished `nvme connect` and leave the kernel mid-registration.

use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use serde_json::Value;

use crate::{
    dev,
    error::DeviceError,
    ids, mount,
    retry::{self, RetryConfig},
    shell,
};

pub(crate) const DEFAULT_TRANSPORT: &str = "tcp";
pub(crate) const DEFAULT_PORT: &str = "4420";
pub(crate) const DEFAULT_NR_IO_QUEUES: &str = "4";

const SUBSYSTEM_STATE_LIVE: &str = "live";
const SYSFS_NVME_CLASS: &str = "/sys/class/nvme";

/// Wait budget for the subsystem to reach "live" after a connect.
const STATE_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Wait budget for the namespace device to appear and become usable.
const DEVICE_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Full connect cycles before staging gives up.
const MAX_CONNECT_CYCLES: u32 = 10;
const CYCLE_DELAY: Duration = Duration::from_secs(2);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_SUBSYS_TIMEOUT: Duration = Duration::from_secs(5);
const NS_RESCAN_TIMEOUT: Duration = Duration::from_secs(5);
/// Kernel settle time after a successful connect before device probing.
const POST_CONNECT_DELAY: Duration = Duration::from_secs(2);
/// Kernel cleanup time after a disconnect.
const CLEANUP_DELAY: Duration = Duration::from_secs(1);

/// Connect failures that indicate the target subsystem is not ready yet
/// (freshly created subsystems, e.g. right after a snapshot restore).
const TRANSIENT_CONNECT_PATTERNS: &[&str] = &[
    "failed to write to nvme-fabrics device",
    "could not add new controller",
    "connection refused",
    "connection timed out",
    "No route to host",
    "Host is down",
    "Network is unreachable",
];

/// Validated connection parameters from the volume context. NSID is always
/// 1, every volume owns an independent subsystem.
#[derive(Debug, Clone)]
pub(crate) struct NvmfParams {
    pub nqn: String,
    pub server: String,
    pub transport: String,
    pub port: String,
    pub nr_io_queues: String,
    pub queue_size: Option<String>,
}

impl NvmfParams {
    pub(crate) fn from_context(
        context: &HashMap<String, String>,
    ) -> Result<NvmfParams, DeviceError> {
        let get = |key: &str| {
            context
                .get(key)
                .map(String::as_str)
                .unwrap_or("")
                .to_string()
        };
        let nqn = get(ids::CONTEXT_NQN);
        let server = get(ids::CONTEXT_SERVER);
        if nqn.is_empty() || server.is_empty() {
            return Err(DeviceError::new(
                "nqn and server must be provided in volume context for NVMe-oF volumes",
            ));
        }

        let transport = match get(ids::CONTEXT_TRANSPORT) {
            value if value.is_empty() => DEFAULT_TRANSPORT.to_string(),
            value => value,
        };
        let port = match get(ids::CONTEXT_PORT) {
            value if value.is_empty() => DEFAULT_PORT.to_string(),
            value => value,
        };
        let nr_io_queues = match get(ids::CONTEXT_NR_IO_QUEUES) {
            value if value.is_empty() => DEFAULT_NR_IO_QUEUES.to_string(),
            value => value,
        };
        let queue_size = Some(get(ids::CONTEXT_QUEUE_SIZE)).filter(|value| !value.is_empty());

        Ok(NvmfParams {
            nqn,
            server,
            transport,
            port,
            nr_io_queues,
            queue_size,
        })
    }
}

/// Outcome of a device lookup for one NQN.
#[derive(Debug)]
pub(crate) enum DeviceLookup {
    /// Device node exists and reports a non-zero size.
    Healthy { device: String },
    /// The controller is registered but its namespace is absent or reports
    /// zero size; either a stale session or one still initialising.
    Unhealthy {
        device: String,
        controller: Option<String>,
    },
    Missing,
}

/// Fail FailedPrecondition early when nvme-cli is not installed.
pub(crate) async fn check_nvme_cli() -> Result<(), DeviceError> {
    let output = shell::run("nvme", &["version"], Duration::from_secs(5)).await?;
    if output.success {
        Ok(())
    } else {
        Err(DeviceError::new(
            "nvme command not found - please install nvme-cli",
        ))
    }
}

pub(crate) struct NvmfAttach {
    params: NvmfParams,
    enable_discovery: bool,
}

impl NvmfAttach {
    pub(crate) fn new(params: NvmfParams, enable_discovery: bool) -> NvmfAttach {
        NvmfAttach {
            params,
            enable_discovery,
        }
    }

    /// Look for an existing attachment of this NQN.
    pub(crate) async fn find(&self) -> Result<DeviceLookup, DeviceError> {
        lookup_device(&self.params.nqn, true).await
    }

    /// Drive the transport until a healthy namespace device exists, up to
    /// [`MAX_CONNECT_CYCLES`] connect cycles. `cancelled` is consulted only
    /// between cycles; see the module comment.
    pub(crate) async fn attach(&self, cancelled: &AtomicBool) -> Result<String, DeviceError> {
        let nqn = &self.params.nqn;
        let mut last_error: Option<DeviceError> = None;

        for attempt in 1..=MAX_CONNECT_CYCLES {
            if cancelled.load(Ordering::Relaxed) {
                warn!(
                    "staging of {} canceled, stopping connection attempts at attempt {}",
                    nqn, attempt
                );
                return Err(DeviceError::from(match last_error {
                    Some(error) => format!(
                        "staging canceled after {} attempts (last error: {error})",
                        attempt - 1
                    ),
                    None => "staging canceled before the first connection attempt".to_string(),
                }));
            }
            if attempt > 1 {
                info!(
                    "retrying NVMe-oF connection (attempt {}/{}) for NQN {}",
                    attempt, MAX_CONNECT_CYCLES, nqn
                );
            }

            if let Err(error) = self.connect_target().await {
                warn!("nvme connect cycle {} failed: {}", attempt, error);
                last_error = Some(error);
                tokio::time::sleep(CYCLE_DELAY).await;
                continue;
            }

            if let Err(error) = wait_subsystem_live(nqn).await {
                warn!(
                    "subsystem {} did not become live on attempt {}: {}",
                    nqn, attempt, error
                );
                last_error = Some(error);
                let _ = disconnect(nqn).await;
                tokio::time::sleep(CYCLE_DELAY).await;
                continue;
            }

            match wait_for_device(nqn).await {
                Ok(device) => {
                    info!(
                        "NVMe-oF device connected at {} (NQN: {}) on attempt {}",
                        device, nqn, attempt
                    );
                    return Ok(device);
                }
                Err(error) => {
                    warn!("device wait failed on attempt {}: {}", attempt, error);
                    last_error = Some(error);
                    let _ = disconnect(nqn).await;
                    tokio::time::sleep(CYCLE_DELAY).await;
                }
            }
        }

        Err(DeviceError::from(format!(
            "failed to find NVMe device after {MAX_CONNECT_CYCLES} connection attempts \
             (NQN: {nqn}): {}",
            last_error
                .map(|error| error.message)
                .unwrap_or_else(|| "no error recorded".to_string())
        )))
    }

    /// Discover (optional) and connect, retrying transient connect errors
    /// with backoff. A fresh subsystem on the appliance may refuse the
    /// first few attempts.
    async fn connect_target(&self) -> Result<(), DeviceError> {
        if self.enable_discovery {
            debug!(
                "discovering NVMe-oF targets at {}:{}",
                self.params.server, self.params.port
            );
            let discover = shell::run(
                "nvme",
                &[
                    "discover",
                    "-t",
                    &self.params.transport,
                    "-a",
                    &self.params.server,
                    "-s",
                    &self.params.port,
                ],
                DISCOVER_TIMEOUT,
            )
            .await;
            match discover {
                Ok(output) if !output.success => warn!(
                    "nvme discover failed (may be fine if the target is already known): {}",
                    output.combined()
                ),
                Err(error) => warn!("nvme discover failed: {}", error),
                _ => {}
            }
        }

        let config = RetryConfig {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            operation: format!("nvme-connect({})", self.params.nqn),
        };
        retry::with_retry(&config, is_transient_connect_error, || {
            self.attempt_connect()
        })
        .await?;

        // Give the kernel a moment to register the controller and enumerate
        // namespaces before anything starts probing for the device.
        tokio::time::sleep(POST_CONNECT_DELAY).await;
        trigger_udev().await;
        Ok(())
    }

    async fn attempt_connect(&self) -> Result<(), DeviceError> {
        let mut args: Vec<String> = [
            "connect",
            "-t",
            self.params.transport.as_str(),
            "-n",
            self.params.nqn.as_str(),
            "-a",
            self.params.server.as_str(),
            "-s",
            self.params.port.as_str(),
            "--reconnect-delay=2",
            "--ctrl-loss-tmo=60",
            "--keep-alive-tmo=5",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        args.push(format!("--nr-io-queues={}", self.params.nr_io_queues));
        if let Some(queue_size) = &self.params.queue_size {
            args.push(format!("--queue-size={queue_size}"));
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = shell::run("nvme", &arg_refs, CONNECT_TIMEOUT).await?;
        if output.success {
            return Ok(());
        }
        let combined = output.combined();
        if combined.contains("already connected") {
            debug!("nvme device already connected: {}", combined);
            return Ok(());
        }
        Err(DeviceError::from(format!(
            "nvme connect failed: {combined}"
        )))
    }
}

pub(crate) fn is_transient_connect_error(error: &DeviceError) -> bool {
    TRANSIENT_CONNECT_PATTERNS
        .iter()
        .any(|pattern| error.message.contains(pattern))
}

/// Disconnect the subsystem and give the kernel a moment to clean up the
/// device nodes. "Already gone" counts as success.
pub(crate) async fn disconnect(nqn: &str) -> Result<(), DeviceError> {
    debug!("disconnecting from NVMe-oF target {}", nqn);
    let output = shell::run("nvme", &["disconnect", "-n", nqn], DISCONNECT_TIMEOUT).await?;
    if !output.success {
        let combined = output.combined();
        if combined.contains("No subsystems") || combined.contains("not found") {
            debug!("NVMe device already disconnected");
            return Ok(());
        }
        return Err(DeviceError::from(format!(
            "failed to disconnect NVMe-oF device: {combined}"
        )));
    }
    tokio::time::sleep(CLEANUP_DELAY).await;
    Ok(())
}

async fn list_subsys_json() -> Result<Value, DeviceError> {
    let stdout = shell::run_checked(
        "nvme",
        &["list-subsys", "-o", "json"],
        LIST_SUBSYS_TIMEOUT,
    )
    .await?;
    Ok(serde_json::from_str(&stdout)?)
}

/// Find the JSON object of the subsystem with this NQN, wherever nvme-cli
/// happens to nest it (top-level array, "Subsystems" array, host wrapper).
fn find_subsystem<'a>(value: &'a Value, nqn: &str) -> Option<&'a Value> {
    match value {
        Value::Array(entries) => entries.iter().find_map(|entry| find_subsystem(entry, nqn)),
        Value::Object(map) => {
            if map.get("NQN").and_then(Value::as_str) == Some(nqn) {
                return Some(value);
            }
            map.values()
                .filter(|nested| nested.is_array())
                .find_map(|nested| find_subsystem(nested, nqn))
        }
        _ => None,
    }
}

/// Connection state of the subsystem ("live", "connecting", ...) from
/// parsed list-subsys output.
fn subsystem_state_from(output: &Value, nqn: &str) -> Option<String> {
    let subsystem = find_subsystem(output, nqn)?;
    let paths = subsystem.get("Paths")?.as_array()?;
    paths
        .iter()
        .find_map(|path| path.get("State").and_then(Value::as_str))
        .map(str::to_string)
}

/// Controller name ("nvme0") serving the subsystem, from parsed
/// list-subsys output.
fn controller_from(output: &Value, nqn: &str) -> Option<String> {
    let subsystem = find_subsystem(output, nqn)?;
    let paths = subsystem.get("Paths")?.as_array()?;
    paths
        .iter()
        .filter_map(|path| path.get("Name").and_then(Value::as_str))
        .find(|name| name.starts_with("nvme") && !name[4..].contains('n'))
        .map(str::to_string)
}

/// Fabric controllers visible in sysfs as (controller name, subsystem NQN).
fn sysfs_controllers() -> Result<Vec<(String, String)>, DeviceError> {
    let mut controllers = Vec::new();
    for entry in glob::glob(&format!("{SYSFS_NVME_CLASS}/nvme*"))? {
        let path = entry?;
        let name = match path.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => continue,
        };
        // skip namespace nodes (nvme0n1) and subsystem aliases (nvme-subsys0)
        if name.contains('-') || name[4..].contains('n') {
            continue;
        }
        let nqn = match std::fs::read_to_string(path.join("subsysnqn")) {
            Ok(nqn) => nqn.trim().to_string(),
            Err(error) => {
                trace!("cannot read NQN of {}: {}", name, error);
                continue;
            }
        };
        if !nqn.is_empty() {
            controllers.push((name, nqn));
        }
    }
    Ok(controllers)
}

/// Current subsystem state: list-subsys first, sysfs state file fallback.
pub(crate) async fn subsystem_state(nqn: &str) -> Option<String> {
    if let Ok(output) = list_subsys_json().await {
        if let Some(state) = subsystem_state_from(&output, nqn) {
            return Some(state);
        }
    }
    let controllers = sysfs_controllers().ok()?;
    let (controller, _) = controllers.into_iter().find(|(_, cnqn)| cnqn == nqn)?;
    std::fs::read_to_string(format!("{SYSFS_NVME_CLASS}/{controller}/state"))
        .ok()
        .map(|state| state.trim().to_string())
}

/// Block until the subsystem reports "live". A successful connect does not
/// mean the kernel is ready for device operations; the device wait below is
/// a separate step with its own budget.
pub(crate) async fn wait_subsystem_live(nqn: &str) -> Result<(), DeviceError> {
    debug!(
        "waiting for NVMe subsystem {} to reach '{}' state (timeout {:?})",
        nqn, SUBSYSTEM_STATE_LIVE, STATE_WAIT_TIMEOUT
    );
    let deadline = tokio::time::Instant::now() + STATE_WAIT_TIMEOUT;
    let mut attempt = 0u32;
    let mut last_state = String::new();

    while tokio::time::Instant::now() < deadline {
        attempt += 1;
        match subsystem_state(nqn).await {
            Some(state) if state == SUBSYSTEM_STATE_LIVE => {
                debug!("subsystem {} live after {} attempts", nqn, attempt);
                return Ok(());
            }
            Some(state) => {
                debug!(
                    "subsystem {} state is '{}', waiting for '{}' (attempt {})",
                    nqn, state, SUBSYSTEM_STATE_LIVE, attempt
                );
                last_state = state;
            }
            None => debug!(
                "subsystem {} not yet visible in list-subsys (attempt {})",
                nqn, attempt
            ),
        }
        if attempt % 5 == 0 {
            trigger_udev().await;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    Err(DeviceError::from(format!(
        "timeout waiting for NVMe subsystem to become live: NQN={nqn}, \
         last state={last_state:?}, attempts={attempt}"
    )))
}

/// Nudge udev to process newly connected NVMe devices and wait for the
/// event queue to drain. Best effort throughout.
pub(crate) async fn trigger_udev() {
    let five = Duration::from_secs(5);
    for subsystem in ["nvme", "block"] {
        let match_arg = format!("--subsystem-match={subsystem}");
        let args = ["trigger", "--action=add", match_arg.as_str()];
        if let Err(error) = shell::run("udevadm", &args, five).await {
            debug!("udevadm trigger for {} failed: {}", subsystem, error);
        }
    }
    if let Err(error) = shell::run(
        "udevadm",
        &["settle", "--timeout=10"],
        Duration::from_secs(15),
    )
    .await
    {
        debug!("udevadm settle failed: {}", error);
    }
}

/// Force the kernel to rescan namespaces on a controller ("/dev/nvme0").
pub(crate) async fn ns_rescan(controller: &str) {
    debug!("forcing namespace rescan on controller {}", controller);
    match shell::run("nvme", &["ns-rescan", controller], NS_RESCAN_TIMEOUT).await {
        Ok(output) if !output.success => {
            debug!(
                "nvme ns-rescan {} failed: {}",
                controller,
                output.combined()
            );
        }
        Err(error) => debug!("nvme ns-rescan {} failed: {}", controller, error),
        _ => {}
    }
}

/// Locate the namespace device for `nqn`. With one namespace per subsystem
/// the device is always `/dev/<controller>n1`. `rescan_if_not_ready`
/// controls whether a controller whose namespace is absent or zero-sized
/// gets an immediate ns-rescan before the verdict.
pub(crate) async fn lookup_device(
    nqn: &str,
    rescan_if_not_ready: bool,
) -> Result<DeviceLookup, DeviceError> {
    let controller = match list_subsys_json().await {
        Ok(output) => controller_from(&output, nqn),
        Err(error) => {
            debug!("nvme list-subsys failed: {}, falling back to sysfs", error);
            None
        }
    };
    let controller = match controller {
        Some(controller) => Some(controller),
        None => sysfs_controllers()?
            .into_iter()
            .find(|(_, cnqn)| cnqn == nqn)
            .map(|(name, _)| name),
    };

    let Some(controller) = controller else {
        return Ok(DeviceLookup::Missing);
    };

    let device = format!("/dev/{controller}n1");
    if Path::new(&device).exists() && dev::is_device_healthy(&device).await {
        return Ok(DeviceLookup::Healthy { device });
    }

    if rescan_if_not_ready {
        ns_rescan(&format!("/dev/{controller}")).await;
        if Path::new(&device).exists() && dev::is_device_healthy(&device).await {
            return Ok(DeviceLookup::Healthy { device });
        }
    }

    Ok(DeviceLookup::Unhealthy {
        device,
        controller: Some(controller),
    })
}

/// Wait for the namespace device to exist and report a non-zero size.
/// Should run after [`wait_subsystem_live`] confirmed the subsystem.
pub(crate) async fn wait_for_device(nqn: &str) -> Result<String, DeviceError> {
    debug!(
        "waiting for NVMe device for NQN {} (timeout {:?})",
        nqn, DEVICE_WAIT_TIMEOUT
    );
    let deadline = tokio::time::Instant::now() + DEVICE_WAIT_TIMEOUT;
    let mut attempt = 0u32;
    let mut last_controller = String::new();

    while tokio::time::Instant::now() < deadline {
        attempt += 1;
        match lookup_device(nqn, false).await {
            Ok(DeviceLookup::Healthy { device }) => {
                info!(
                    "NVMe device found and healthy at {} after {} attempts",
                    device, attempt
                );
                return Ok(device);
            }
            Ok(DeviceLookup::Unhealthy { device, controller }) => {
                debug!(
                    "device {} exists but is not usable yet (attempt {})",
                    device, attempt
                );
                if let Some(controller) = controller {
                    // rescan immediately the first time a controller shows
                    // up, then every 5th attempt
                    if controller != last_controller {
                        last_controller = controller.clone();
                        ns_rescan(&format!("/dev/{controller}")).await;
                    } else if attempt % 5 == 0 {
                        ns_rescan(&format!("/dev/{controller}")).await;
                    }
                }
            }
            Ok(DeviceLookup::Missing) => {
                if attempt % 10 == 0 {
                    log_discovery_diagnostics(nqn).await;
                }
            }
            Err(error) => debug!("device lookup failed (attempt {}): {}", attempt, error),
        }
        if attempt % 10 == 0 {
            trigger_udev().await;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    log_discovery_diagnostics(nqn).await;
    Err(DeviceError::from(format!(
        "timeout waiting for NVMe device to appear after {attempt} attempts \
         (NQN: {nqn}, timeout: {DEVICE_WAIT_TIMEOUT:?})"
    )))
}

/// Dump the host's view of the NVMe world to the log, for stuck-discovery
/// postmortems.
pub(crate) async fn log_discovery_diagnostics(nqn: &str) {
    debug!("=== NVMe discovery diagnostics for NQN {} ===", nqn);
    let five = Duration::from_secs(5);
    match shell::run("nvme", &["list-subsys"], five).await {
        Ok(output) => debug!("nvme list-subsys:\n{}", output.combined()),
        Err(error) => debug!("nvme list-subsys failed: {}", error),
    }
    match shell::run("nvme", &["list"], five).await {
        Ok(output) => debug!("nvme list:\n{}", output.combined()),
        Err(error) => debug!("nvme list failed: {}", error),
    }
    match sysfs_controllers() {
        Ok(controllers) => {
            for (controller, cnqn) in controllers {
                debug!("  {}/subsysnqn = {:?}", controller, cnqn);
            }
        }
        Err(error) => debug!("sysfs scan failed: {}", error),
    }
    if let Ok(devices) = glob::glob("/dev/nvme*") {
        let devices: Vec<String> = devices
            .flatten()
            .map(|path| path.display().to_string())
            .collect();
        debug!("/dev/nvme* devices: {:?}", devices);
    }
    debug!("=== end NVMe diagnostics ===");
}

/// Extract the controller device path from a namespace device path
/// (/dev/nvme0n1 -> /dev/nvme0, /dev/nvme1n2 -> /dev/nvme1).
pub(crate) fn controller_of(device_path: &str) -> Option<String> {
    let bytes = device_path.as_bytes();
    for index in (1..bytes.len()).rev() {
        if bytes[index] == b'n'
            && bytes[index - 1].is_ascii_digit()
            && index + 1 < bytes.len()
            && bytes[index + 1].is_ascii_digit()
        {
            return Some(device_path[..index].to_string());
        }
    }
    None
}

/// Recover the NQN of the subsystem backing a staging path, used when the
/// unstage request has no volume context. Filesystem mode resolves the
/// backing device through the mount table, block mode through the bind-mounted
/// device node; either way the controller's sysfs entry has the NQN.
pub(crate) async fn derive_nqn_from_staging_path(staging_path: &str) -> Result<String, DeviceError> {
    let mut device: Option<String> = None;

    if mount::is_mounted(staging_path).await.unwrap_or(false) {
        if let Some(source) = mount::backing_device(staging_path).await? {
            let base = source.rsplit('/').next().unwrap_or(&source);
            if base.starts_with("nvme") {
                device = Some(source);
            }
        }
    }

    let device = match device {
        Some(device) => device,
        None => {
            let resolved = std::fs::canonicalize(staging_path)?;
            let resolved = resolved.display().to_string();
            let base = resolved.rsplit('/').next().unwrap_or(&resolved);
            if !base.starts_with("nvme") {
                return Err(DeviceError::from(format!(
                    "staging path {staging_path} resolved to non-NVMe device {resolved}"
                )));
            }
            resolved
        }
    };

    let controller_path = controller_of(&device).ok_or_else(|| {
        DeviceError::from(format!(
            "could not extract NVMe controller path from device path {device}"
        ))
    })?;
    let controller = controller_path
        .rsplit('/')
        .next()
        .unwrap_or(&controller_path);

    let nqn_path = format!("{SYSFS_NVME_CLASS}/{controller}/subsysnqn");
    let nqn = std::fs::read_to_string(&nqn_path)
        .map_err(|error| DeviceError::from(format!("failed to read NQN from {nqn_path}: {error}")))?
        .trim()
        .to_string();
    if nqn.is_empty() {
        return Err(DeviceError::from(format!("empty NQN in {nqn_path}")));
    }
    Ok(nqn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn params_apply_defaults() {
        let params = NvmfParams::from_context(&context(&[
            ("nqn", "nqn.test:vol1"),
            ("server", "10.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(params.transport, "tcp");
        assert_eq!(params.port, "4420");
        assert_eq!(params.nr_io_queues, "4");
        assert_eq!(params.queue_size, None);
    }

    #[test]
    fn params_require_nqn_and_server() {
        assert!(NvmfParams::from_context(&context(&[("server", "10.0.0.1")])).is_err());
        assert!(NvmfParams::from_context(&context(&[("nqn", "nqn.test:vol1")])).is_err());
    }

    #[test]
    fn params_pass_tuning_through() {
        let params = NvmfParams::from_context(&context(&[
            ("nqn", "nqn.test:vol1"),
            ("server", "10.0.0.1"),
            ("transport", "rdma"),
            ("port", "4421"),
            ("nvmeof.nr-io-queues", "8"),
            ("nvmeof.queue-size", "256"),
        ]))
        .unwrap();
        assert_eq!(params.transport, "rdma");
        assert_eq!(params.port, "4421");
        assert_eq!(params.nr_io_queues, "8");
        assert_eq!(params.queue_size.as_deref(), Some("256"));
    }

    #[test]
    fn transient_connect_errors_match_known_patterns() {
        for pattern in TRANSIENT_CONNECT_PATTERNS {
            let error = DeviceError::from(format!("nvme connect failed: {pattern}, output: x"));
            assert!(is_transient_connect_error(&error), "{pattern}");
        }
        assert!(!is_transient_connect_error(&DeviceError::new(
            "invalid argument"
        )));
    }

    fn list_subsys_fixture() -> Value {
        json!([
            {
                "HostNQN": "nqn.2014-08.org.nvmexpress:uuid:host",
                "Subsystems": [
                    {
                        "Name": "nvme-subsys0",
                        "NQN": "nqn.test:vol0",
                        "Paths": [
                            { "Name": "nvme0", "Transport": "tcp",
                              "Address": "traddr=10.0.0.1,trsvcid=4420", "State": "live" }
                        ]
                    },
                    {
                        "Name": "nvme-subsys1",
                        "NQN": "nqn.test:vol1",
                        "Paths": [
                            { "Name": "nvme1", "Transport": "tcp",
                              "Address": "traddr=10.0.0.1,trsvcid=4420", "State": "connecting" }
                        ]
                    }
                ]
            }
        ])
    }

    #[test]
    fn state_extraction_from_list_subsys() {
        let output = list_subsys_fixture();
        assert_eq!(
            subsystem_state_from(&output, "nqn.test:vol0").as_deref(),
            Some("live")
        );
        assert_eq!(
            subsystem_state_from(&output, "nqn.test:vol1").as_deref(),
            Some("connecting")
        );
        assert_eq!(subsystem_state_from(&output, "nqn.test:absent"), None);
    }

    #[test]
    fn controller_extraction_from_list_subsys() {
        let output = list_subsys_fixture();
        assert_eq!(
            controller_from(&output, "nqn.test:vol1").as_deref(),
            Some("nvme1")
        );
        assert_eq!(controller_from(&output, "nqn.test:absent"), None);
    }

    #[test]
    fn controller_of_namespace_paths() {
        assert_eq!(controller_of("/dev/nvme0n1").as_deref(), Some("/dev/nvme0"));
        assert_eq!(
            controller_of("/dev/nvme12n3").as_deref(),
            Some("/dev/nvme12")
        );
        assert_eq!(controller_of("/dev/nvme0"), None);
        assert_eq!(controller_of("/dev/sda"), None);
    }
}
