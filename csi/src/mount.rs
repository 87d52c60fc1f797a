//! Utility functions for mounting and unmounting filesystems, plus the
//! mount-table lookups the staging code needs. All mounts run through the
//! mount(8) binary with a per-command timeout so a hung transport cannot
//! wedge an RPC forever; lookups go through findmnt's JSON output.

use std::time::Duration;

use serde::Deserialize;

use crate::{error::DeviceError, shell};

const MOUNT_TIMEOUT: Duration = Duration::from_secs(30);
const UNMOUNT_TIMEOUT: Duration = Duration::from_secs(30);
const FINDMNT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default mount options merged into every filesystem mount. User options
/// from the storage class win on conflict.
pub(crate) const DEFAULT_MOUNT_OPTIONS: &[&str] = &["noatime"];

/// One row of the mount table as findmnt reports it. Submounts arrive
/// nested under their parent.
#[derive(Debug, Deserialize)]
pub(crate) struct MountEntry {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    children: Vec<MountEntry>,
}

#[derive(Debug, Deserialize)]
struct MountTable {
    #[serde(default)]
    filesystems: Vec<MountEntry>,
}

/// findmnt renders bind and device mounts as `devtmpfs[/nvme0n1]` or
/// `udev[/nvme0n1]` depending on the system; reduce those to the plain
/// /dev path the rest of the engine works with.
fn normalize_source(source: &str) -> String {
    if let Some((_, bracketed)) = source.split_once('[') {
        if let Some(device) = bracketed.strip_suffix(']') {
            if device.starts_with('/') {
                return format!("/dev{device}");
            }
        }
    }
    source.to_string()
}

/// Flatten the nested mount tree findmnt produces; row order is not
/// meaningful to the lookups built on top.
fn flatten_mounts(table: MountTable) -> Vec<MountEntry> {
    let mut flat = Vec::new();
    let mut pending = table.filesystems;
    while let Some(mut entry) = pending.pop() {
        pending.append(&mut entry.children);
        flat.push(entry);
    }
    flat
}

/// The mount-table rows findmnt associates with `path`. Empty when nothing
/// is mounted there (findmnt exits non-zero for an unknown target, which
/// is not an error here).
async fn mounts_at(path: &str) -> Result<Vec<MountEntry>, DeviceError> {
    let output = shell::run(
        "findmnt",
        &["-J", "-o", "SOURCE,TARGET", path],
        FINDMNT_TIMEOUT,
    )
    .await?;
    if !output.success {
        return Ok(Vec::new());
    }
    let table: MountTable = serde_json::from_str(&output.stdout)?;
    Ok(flatten_mounts(table))
}

/// Whether anything is mounted at exactly `target`.
pub(crate) async fn is_mounted(target: &str) -> Result<bool, DeviceError> {
    Ok(mounts_at(target)
        .await?
        .iter()
        .any(|entry| entry.target == target))
}

/// The device backing the mount at `target`, if any. Used to recover the
/// transport session behind a staging path when a request carries no
/// volume context.
pub(crate) async fn backing_device(target: &str) -> Result<Option<String>, DeviceError> {
    Ok(mounts_at(target)
        .await?
        .into_iter()
        .find(|entry| entry.target == target)
        .map(|entry| normalize_source(&entry.source)))
}

/// The key of a mount option: "key" for "key=value" options, the flag
/// itself otherwise.
fn option_key(option: &str) -> &str {
    match option.find('=') {
        Some(index) => &option[..index],
        None => option,
    }
}

/// Merge user-provided mount options with the driver defaults. User
/// options come first and suppress any default sharing the same key.
pub(crate) fn merge_mount_options(user_options: &[String]) -> Vec<String> {
    if user_options.is_empty() {
        return DEFAULT_MOUNT_OPTIONS
            .iter()
            .map(|option| option.to_string())
            .collect();
    }

    let mut merged: Vec<String> = user_options.to_vec();
    for default in DEFAULT_MOUNT_OPTIONS {
        let key = option_key(default);
        if !user_options
            .iter()
            .any(|option| option_key(option) == key)
        {
            merged.push(default.to_string());
        }
    }
    merged
}

/// Mount a block device at `target`.
pub(crate) async fn mount_device(
    device: &str,
    target: &str,
    fstype: Option<&str>,
    options: &[String],
) -> Result<(), DeviceError> {
    let joined = options.join(",");
    let mut args: Vec<&str> = Vec::new();
    if let Some(fstype) = fstype {
        args.extend(["-t", fstype]);
    }
    if !joined.is_empty() {
        args.extend(["-o", &joined]);
    }
    args.extend([device, target]);
    shell::run_checked("mount", &args, MOUNT_TIMEOUT).await?;
    info!("mounted {} at {}", device, target);
    Ok(())
}

/// Mount an NFS export, `remote` being `server:/path`.
pub(crate) async fn mount_nfs(
    remote: &str,
    target: &str,
    options: &[String],
) -> Result<(), DeviceError> {
    let joined = options.join(",");
    let mut args: Vec<&str> = vec!["-t", "nfs"];
    if !joined.is_empty() {
        args.extend(["-o", &joined]);
    }
    args.extend([remote, target]);
    shell::run_checked("mount", &args, MOUNT_TIMEOUT).await?;
    info!("mounted nfs export {} at {}", remote, target);
    Ok(())
}

/// Bind-mount `source` onto `target` (directory onto directory, or device
/// node onto a regular file for raw-block staging).
pub(crate) async fn bind_mount(source: &str, target: &str) -> Result<(), DeviceError> {
    shell::run_checked("mount", &["--bind", source, target], MOUNT_TIMEOUT).await?;
    Ok(())
}

/// Downgrade an existing bind mount to read-only.
pub(crate) async fn remount_readonly(target: &str) -> Result<(), DeviceError> {
    shell::run_checked("mount", &["-o", "remount,ro,bind", target], MOUNT_TIMEOUT).await?;
    Ok(())
}

pub(crate) async fn unmount(target: &str) -> Result<(), DeviceError> {
    shell::run_checked("umount", &[target], UNMOUNT_TIMEOUT).await?;
    info!("unmounted {}", target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(list: &[&str]) -> Vec<String> {
        list.iter().map(|option| option.to_string()).collect()
    }

    #[test]
    fn defaults_apply_when_no_user_options() {
        assert_eq!(merge_mount_options(&[]), options(&["noatime"]));
    }

    #[test]
    fn user_options_win_on_conflicting_key() {
        let merged = merge_mount_options(&options(&["noatime"]));
        assert_eq!(merged, options(&["noatime"]));
    }

    #[test]
    fn defaults_append_after_user_options() {
        let merged = merge_mount_options(&options(&["ro", "data=ordered"]));
        assert_eq!(merged, options(&["ro", "data=ordered", "noatime"]));
    }

    #[test]
    fn option_key_splits_assignments() {
        assert_eq!(option_key("data=ordered"), "data");
        assert_eq!(option_key("noatime"), "noatime");
    }

    #[test]
    fn sources_normalise_to_dev_paths() {
        assert_eq!(normalize_source("udev[/nvme0n1]"), "/dev/nvme0n1");
        assert_eq!(normalize_source("devtmpfs[/nvme2n1]"), "/dev/nvme2n1");
        assert_eq!(normalize_source("/dev/nvme0n1"), "/dev/nvme0n1");
        assert_eq!(normalize_source("nas:/mnt/tank/vol"), "nas:/mnt/tank/vol");
    }

    #[test]
    fn nested_mount_tables_flatten() {
        let table: MountTable = serde_json::from_value(json!({
            "filesystems": [
                {
                    "target": "/",
                    "source": "/dev/sda1",
                    "fstype": "ext4",
                    "children": [
                        {
                            "target": "/var/lib/stage/vol-1",
                            "source": "devtmpfs[/nvme2n1]",
                            "fstype": "ext4"
                        }
                    ]
                }
            ]
        }))
        .unwrap();

        let flat = flatten_mounts(table);
        assert_eq!(flat.len(), 2);
        let staged = flat
            .iter()
            .find(|entry| entry.target == "/var/lib/stage/vol-1")
            .unwrap();
        assert_eq!(normalize_source(&staged.source), "/dev/nvme2n1");
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let table: MountTable =
            serde_json::from_value(json!({ "filesystems": [ { "target": "/x" } ] })).unwrap();
        let flat = flatten_mounts(table);
        assert_eq!(flat[0].source, "");
        assert!(flat[0].children.is_empty());
    }
}
