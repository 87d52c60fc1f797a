//! NFS staging: mount the export at the staging path. All the transport
//! heavy lifting lives on the appliance side; the node only needs an
//! idempotent mount and unmount.

use crate::{error::DeviceError, mount};

/// Mount `server:/share` at `staging_path` unless something is already
/// mounted there (retried stage requests are common).
pub(crate) async fn stage(
    server: &str,
    share: &str,
    staging_path: &str,
    options: &[String],
) -> Result<(), DeviceError> {
    if mount::is_mounted(staging_path).await? {
        debug!("staging path {} is already mounted", staging_path);
        return Ok(());
    }
    std::fs::create_dir_all(staging_path)?;
    let remote = format!("{server}:{share}");
    mount::mount_nfs(&remote, staging_path, options).await
}
