//! The user-property schema that carries CSI metadata into appliance state.
//! All keys are namespaced to keep clear of appliance-owned properties; the
//! backing dataset is the only persistent store the plugin has.

/// Namespace prefix of every CSI-owned user property.
pub const PROPERTY_NAMESPACE: &str = "zetastor";

/// Sentinel property identifying CSI-owned datasets. Any verb that deletes
/// or rewrites a dataset must verify this first.
pub const PROPERTY_MANAGED_BY: &str = "zetastor:managed_by";
/// The fixed value of [`PROPERTY_MANAGED_BY`].
pub const MANAGED_BY_VALUE: &str = "zetastor-csi";

/// CSI-supplied logical volume name.
pub const PROPERTY_CSI_VOLUME_NAME: &str = "zetastor:csi_volume_name";
/// One of nfs, nvmeof, iscsi.
pub const PROPERTY_PROTOCOL: &str = "zetastor:protocol";
/// Authoritative declared size in decimal bytes.
pub const PROPERTY_CAPACITY_BYTES: &str = "zetastor:capacity_bytes";
/// delete or retain.
pub const PROPERTY_DELETE_STRATEGY: &str = "zetastor:delete_strategy";
/// none, snapshot or volume.
pub const PROPERTY_CONTENT_SOURCE_TYPE: &str = "zetastor:content_source_type";
/// Source CSI id when cloned.
pub const PROPERTY_CONTENT_SOURCE_ID: &str = "zetastor:content_source_id";
/// cow, promoted or detached.
pub const PROPERTY_CLONE_MODE: &str = "zetastor:clone_mode";
/// Full ZFS name of the origin snapshot, COW clones only.
pub const PROPERTY_ORIGIN_SNAPSHOT: &str = "zetastor:origin_snapshot";
/// Path exported over NFS.
pub const PROPERTY_NFS_SHARE_PATH: &str = "zetastor:nfs_share_path";
/// NQN of the dedicated NVMe-oF subsystem.
pub const PROPERTY_NVME_SUBSYSTEM_NQN: &str = "zetastor:nvme_subsystem_nqn";

// Detached-snapshot datasets carry their own bundle.
pub const PROPERTY_SNAPSHOT_ID: &str = "zetastor:snapshot_id";
pub const PROPERTY_SOURCE_VOLUME_ID: &str = "zetastor:source_volume_id";
pub const PROPERTY_DETACHED_SNAPSHOT: &str = "zetastor:detached_snapshot";
pub const PROPERTY_SOURCE_DATASET: &str = "zetastor:source_dataset";

pub const VALUE_TRUE: &str = "true";
pub const VALUE_FALSE: &str = "false";

pub const CLONE_MODE_COW: &str = "cow";
pub const CLONE_MODE_PROMOTED: &str = "promoted";
pub const CLONE_MODE_DETACHED: &str = "detached";

pub const DELETE_STRATEGY_DELETE: &str = "delete";
pub const DELETE_STRATEGY_RETAIN: &str = "retain";

pub const CONTENT_SOURCE_NONE: &str = "none";
pub const CONTENT_SOURCE_SNAPSHOT: &str = "snapshot";
pub const CONTENT_SOURCE_VOLUME: &str = "volume";

/// Every key the plugin may set on a volume dataset, used when clearing CSI
/// metadata off a retained dataset.
pub const VOLUME_PROPERTY_KEYS: &[&str] = &[
    PROPERTY_MANAGED_BY,
    PROPERTY_CSI_VOLUME_NAME,
    PROPERTY_PROTOCOL,
    PROPERTY_CAPACITY_BYTES,
    PROPERTY_DELETE_STRATEGY,
    PROPERTY_CONTENT_SOURCE_TYPE,
    PROPERTY_CONTENT_SOURCE_ID,
    PROPERTY_CLONE_MODE,
    PROPERTY_ORIGIN_SNAPSHOT,
    PROPERTY_NFS_SHARE_PATH,
    PROPERTY_NVME_SUBSYSTEM_NQN,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_is_namespaced() {
        for key in VOLUME_PROPERTY_KEYS {
            assert!(
                key.starts_with("zetastor:"),
                "{key} escapes the property namespace"
            );
        }
        for key in [
            PROPERTY_SNAPSHOT_ID,
            PROPERTY_SOURCE_VOLUME_ID,
            PROPERTY_DETACHED_SNAPSHOT,
            PROPERTY_SOURCE_DATASET,
        ] {
            assert!(key.starts_with("zetastor:"));
        }
    }
}
