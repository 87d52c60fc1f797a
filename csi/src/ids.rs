//! Identifier plumbing shared by the controller and node services: the
//! protocol taxonomy, the compact snapshot-id codec, volume-id helpers and
//! the storage-class / volume-context key names.

use std::{collections::HashMap, fmt};

// Storage-class parameter keys.
pub const PARAM_PROTOCOL: &str = "protocol";
pub const PARAM_POOL: &str = "pool";
pub const PARAM_PARENT_DATASET: &str = "parentDataset";
pub const PARAM_SERVER: &str = "server";
pub const PARAM_SUBSYSTEM_NQN: &str = "subsystemNQN";
pub const PARAM_DELETE_STRATEGY: &str = "deleteStrategy";
pub const PARAM_VOLBLOCKSIZE: &str = "volblocksize";
pub const PARAM_NAME_TEMPLATE: &str = "nameTemplate";
pub const PARAM_NAME_PREFIX: &str = "namePrefix";
pub const PARAM_NAME_SUFFIX: &str = "nameSuffix";
pub const PARAM_NR_IO_QUEUES: &str = "nvmeof.nr-io-queues";
pub const PARAM_QUEUE_SIZE: &str = "nvmeof.queue-size";
pub const PARAM_PROMOTED_FROM_SNAPSHOTS: &str = "promotedVolumesFromSnapshots";
pub const PARAM_PROMOTED_FROM_VOLUMES: &str = "promotedVolumesFromVolumes";
pub const PARAM_DETACHED_FROM_SNAPSHOTS: &str = "detachedVolumesFromSnapshots";
pub const PARAM_DETACHED_FROM_VOLUMES: &str = "detachedVolumesFromVolumes";

// Snapshot-class parameter keys.
pub const PARAM_DETACHED_SNAPSHOTS: &str = "detachedSnapshots";
pub const PARAM_DETACHED_SNAPSHOTS_PARENT: &str = "detachedSnapshotsParentDataset";

// Volume-context keys returned by CreateVolume and consumed at stage time.
pub const CONTEXT_SERVER: &str = "server";
pub const CONTEXT_PROTOCOL: &str = "protocol";
pub const CONTEXT_DATASET_NAME: &str = "datasetName";
pub const CONTEXT_EXPECTED_CAPACITY: &str = "expectedCapacity";
pub const CONTEXT_NFS_SHARE: &str = "share";
pub const CONTEXT_NQN: &str = "nqn";
pub const CONTEXT_TRANSPORT: &str = "transport";
pub const CONTEXT_PORT: &str = "port";
pub const CONTEXT_NR_IO_QUEUES: &str = "nvmeof.nr-io-queues";
pub const CONTEXT_QUEUE_SIZE: &str = "nvmeof.queue-size";
pub const CONTEXT_CLONED_FROM_SNAPSHOT: &str = "clonedFromSnapshot";

pub const VALUE_TRUE: &str = "true";

/// Dataset under the pool that holds detached snapshots by default.
pub const DETACHED_SNAPSHOTS_FOLDER: &str = "csi-detached-snapshots";

/// Prefix marking the snapshot id of a detached snapshot.
pub const DETACHED_SNAPSHOT_ID_PREFIX: &str = "detached:";

/// CSI requires snapshot ids to stay within 128 bytes.
pub const MAX_SNAPSHOT_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Nfs,
    Nvmeof,
    Iscsi,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Nfs => "nfs",
            Protocol::Nvmeof => "nvmeof",
            Protocol::Iscsi => "iscsi",
        }
    }

    pub fn parse(value: &str) -> Option<Protocol> {
        match value {
            "nfs" => Some(Protocol::Nfs),
            "nvmeof" => Some(Protocol::Nvmeof),
            "iscsi" => Some(Protocol::Iscsi),
            _ => None,
        }
    }

    /// Block protocols are backed by a ZVOL, NFS by a filesystem dataset.
    pub fn is_block(&self) -> bool {
        !matches!(self, Protocol::Nfs)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum IdError {
    EmptySourceVolume,
    EmptySnapshotName,
    MissingProtocolSeparator,
    MissingSnapshotSeparator,
    UnknownProtocol(String),
    TooLong(usize),
}

impl fmt::Display for IdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IdError::EmptySourceVolume => write!(f, "source volume id is empty"),
            IdError::EmptySnapshotName => write!(f, "snapshot name is empty"),
            IdError::MissingProtocolSeparator => {
                write!(f, "snapshot id is missing the ':' protocol separator")
            }
            IdError::MissingSnapshotSeparator => {
                write!(f, "snapshot id is missing the '@' snapshot separator")
            }
            IdError::UnknownProtocol(protocol) => {
                write!(f, "unknown protocol {protocol:?} in snapshot id")
            }
            IdError::TooLong(len) => write!(
                f,
                "snapshot id is {len} bytes, exceeding the {MAX_SNAPSHOT_ID_LEN} byte limit"
            ),
        }
    }
}

impl std::error::Error for IdError {}

/// The compact, CSI-compliant snapshot identifier:
///
///   regular:  `<protocol>:<source-volume-id>@<snapshot-name>`
///   detached: `detached:<protocol>:<source-volume-id>@<snapshot-name>`
///
/// The full ZFS path is reconstructible whenever the source volume id is a
/// dataset path; legacy ids require a name-filtered snapshot query instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotId {
    pub protocol: Protocol,
    pub source_volume: String,
    /// Bare snapshot name, never `dataset@name`.
    pub name: String,
    pub detached: bool,
}

impl SnapshotId {
    pub fn new(protocol: Protocol, source_volume: &str, name: &str, detached: bool) -> SnapshotId {
        // accept a full `dataset@name` and keep only the bare name
        let name = name.rsplit('@').next().unwrap_or(name);
        SnapshotId {
            protocol,
            source_volume: source_volume.to_string(),
            name: name.to_string(),
            detached,
        }
    }

    pub fn encode(&self) -> Result<String, IdError> {
        if self.source_volume.is_empty() {
            return Err(IdError::EmptySourceVolume);
        }
        if self.name.is_empty() {
            return Err(IdError::EmptySnapshotName);
        }
        let base = format!("{}:{}@{}", self.protocol, self.source_volume, self.name);
        let encoded = if self.detached {
            format!("{DETACHED_SNAPSHOT_ID_PREFIX}{base}")
        } else {
            base
        };
        if encoded.len() > MAX_SNAPSHOT_ID_LEN {
            return Err(IdError::TooLong(encoded.len()));
        }
        Ok(encoded)
    }

    pub fn decode(id: &str) -> Result<SnapshotId, IdError> {
        let (detached, remainder) = match id.strip_prefix(DETACHED_SNAPSHOT_ID_PREFIX) {
            Some(remainder) => (true, remainder),
            None => (false, id),
        };

        let colon = remainder
            .find(':')
            .ok_or(IdError::MissingProtocolSeparator)?;
        let protocol = &remainder[..colon];
        let protocol =
            Protocol::parse(protocol).ok_or_else(|| IdError::UnknownProtocol(protocol.into()))?;

        let remainder = &remainder[colon + 1..];
        let at = remainder
            .rfind('@')
            .ok_or(IdError::MissingSnapshotSeparator)?;
        let source_volume = &remainder[..at];
        let name = &remainder[at + 1..];
        if source_volume.is_empty() {
            return Err(IdError::EmptySourceVolume);
        }
        if name.is_empty() {
            return Err(IdError::EmptySnapshotName);
        }

        Ok(SnapshotId {
            protocol,
            source_volume: source_volume.to_string(),
            name: name.to_string(),
            detached,
        })
    }

    /// The full ZFS snapshot name, available without a query when the
    /// source volume id is a dataset path.
    pub fn zfs_name(&self) -> Option<String> {
        if is_dataset_path(&self.source_volume) {
            Some(format!("{}@{}", self.source_volume, self.name))
        } else {
            None
        }
    }
}

/// Canonical volume ids are full dataset paths; legacy ids are bare leaf
/// names that have to be resolved by search.
pub fn is_dataset_path(volume_id: &str) -> bool {
    volume_id.contains('/')
}

/// `pool/parent/leaf` -> `pool`.
pub fn pool_of(dataset: &str) -> &str {
    dataset.split('/').next().unwrap_or(dataset)
}

fn valid_volume_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Apply the storage-class name template to the CSI-supplied name:
/// `nameTemplate` may reference `{name}`, and `namePrefix`/`nameSuffix`
/// wrap the result. The outcome must be a valid ZFS name component.
pub fn apply_name_template(name: &str, params: &HashMap<String, String>) -> Result<String, String> {
    let templated = match params.get(PARAM_NAME_TEMPLATE) {
        Some(template) if !template.is_empty() => template.replace("{name}", name),
        _ => name.to_string(),
    };
    let prefix = params
        .get(PARAM_NAME_PREFIX)
        .map(String::as_str)
        .unwrap_or("");
    let suffix = params
        .get(PARAM_NAME_SUFFIX)
        .map(String::as_str)
        .unwrap_or("");
    let full = format!("{prefix}{templated}{suffix}");
    if !valid_volume_name(&full) {
        return Err(format!(
            "templated volume name {full:?} is not a valid dataset component"
        ));
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_regular() {
        let id = SnapshotId::new(Protocol::Nfs, "tank/k8s/src", "snap1", false);
        let encoded = id.encode().unwrap();
        assert_eq!(encoded, "nfs:tank/k8s/src@snap1");
        assert_eq!(SnapshotId::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn round_trip_detached() {
        let id = SnapshotId::new(Protocol::Nvmeof, "tank/k8s/vol1", "snap-dr", true);
        let encoded = id.encode().unwrap();
        assert_eq!(encoded, "detached:nvmeof:tank/k8s/vol1@snap-dr");
        assert_eq!(SnapshotId::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn encode_strips_dataset_from_full_snapshot_name() {
        let id = SnapshotId::new(Protocol::Nfs, "tank/k8s/src", "tank/k8s/src@snap1", false);
        assert_eq!(id.encode().unwrap(), "nfs:tank/k8s/src@snap1");
    }

    #[test]
    fn encode_rejects_empty_fields() {
        let id = SnapshotId {
            protocol: Protocol::Nfs,
            source_volume: String::new(),
            name: "snap".into(),
            detached: false,
        };
        assert_eq!(id.encode().unwrap_err(), IdError::EmptySourceVolume);

        let id = SnapshotId {
            protocol: Protocol::Nfs,
            source_volume: "tank/k8s/src".into(),
            name: String::new(),
            detached: false,
        };
        assert_eq!(id.encode().unwrap_err(), IdError::EmptySnapshotName);
    }

    #[test]
    fn encode_enforces_length_limit() {
        let id = SnapshotId::new(Protocol::Nfs, &"p/".repeat(70), "snap", false);
        assert!(matches!(id.encode().unwrap_err(), IdError::TooLong(_)));
    }

    #[test]
    fn decode_rejects_malformed_ids() {
        assert_eq!(
            SnapshotId::decode("no-separators").unwrap_err(),
            IdError::MissingProtocolSeparator
        );
        assert_eq!(
            SnapshotId::decode("nfs:volume-without-at").unwrap_err(),
            IdError::MissingSnapshotSeparator
        );
        assert_eq!(
            SnapshotId::decode("smb:vol@snap").unwrap_err(),
            IdError::UnknownProtocol("smb".into())
        );
        assert_eq!(
            SnapshotId::decode("nfs:@snap").unwrap_err(),
            IdError::EmptySourceVolume
        );
        assert_eq!(
            SnapshotId::decode("nfs:vol@").unwrap_err(),
            IdError::EmptySnapshotName
        );
    }

    #[test]
    fn zfs_name_requires_dataset_path() {
        let id = SnapshotId::new(Protocol::Nfs, "tank/k8s/src", "snap1", false);
        assert_eq!(id.zfs_name().unwrap(), "tank/k8s/src@snap1");
        let legacy = SnapshotId::new(Protocol::Nfs, "pvc-legacy", "snap1", false);
        assert_eq!(legacy.zfs_name(), None);
    }

    #[test]
    fn dataset_path_helpers() {
        assert!(is_dataset_path("tank/k8s/vol"));
        assert!(!is_dataset_path("pvc-legacy"));
        assert_eq!(pool_of("tank/k8s/vol"), "tank");
        assert_eq!(pool_of("tank"), "tank");
    }

    #[test]
    fn name_template_application() {
        let mut params = HashMap::new();
        assert_eq!(apply_name_template("pvc-abc", &params).unwrap(), "pvc-abc");

        params.insert(PARAM_NAME_PREFIX.into(), "k8s-".into());
        params.insert(PARAM_NAME_SUFFIX.into(), "-prod".into());
        assert_eq!(
            apply_name_template("pvc-abc", &params).unwrap(),
            "k8s-pvc-abc-prod"
        );

        params.insert(PARAM_NAME_TEMPLATE.into(), "vol-{name}".into());
        assert_eq!(
            apply_name_template("pvc-abc", &params).unwrap(),
            "k8s-vol-pvc-abc-prod"
        );
    }

    #[test]
    fn name_template_rejects_invalid_output() {
        let mut params = HashMap::new();
        params.insert(PARAM_NAME_TEMPLATE.into(), "bad/{name}".into());
        assert!(apply_name_template("pvc-abc", &params).is_err());
        params.insert(PARAM_NAME_TEMPLATE.into(), String::new());
        assert!(apply_name_template("", &params).is_err());
    }
}
