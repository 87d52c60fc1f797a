//! Volume clone routing. Three ways to materialise a volume from existing
//! data, selected by storage-class parameters:
//!
//!   * cow (default): `zfs clone`, the new volume depends on the snapshot,
//!   * promoted: clone then `zfs promote`, reversing the dependency so the
//!     source snapshot can be deleted,
//!   * detached: one-shot send/receive replication plus promote, a full
//!     copy with no dependency in either direction.
//!
//! Restores from detached snapshots are their own case: a temporary
//! snapshot is taken on the detached-snapshot dataset and COW-cloned. The
//! restored volume must NOT be promoted, otherwise the dependency reverses
//! and blocks deletion of the detached snapshot itself.

use std::{collections::HashMap, time::Duration};

use nasapi::{property, replication::ReplicationRunOnetimeParams, Dataset};
use tonic::Status;

use crate::{
    controller::{param_true, Controller, ResolvedVolume},
    csi::{volume_content_source, CreateVolumeRequest},
    ids::{self, SnapshotId},
};

/// Upper bound on a send/receive replication; a detached copy moves the
/// full volume contents.
const REPLICATION_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// Temporary snapshot prefix for volume-to-volume cloning.
pub(crate) const VOLUME_SOURCE_SNAPSHOT_PREFIX: &str = "volume-source-for-volume-";
/// Temporary snapshot prefix for detached-snapshot restores.
pub(crate) const RESTORE_SNAPSHOT_PREFIX: &str = "csi-restore-for-";

/// How a volume was produced from its content source, recorded in the
/// dataset's properties and echoed in the CreateVolume response.
#[derive(Debug, Clone)]
pub(crate) struct CloneInfo {
    pub mode: &'static str,
    /// Full ZFS name of the origin snapshot; COW clones only.
    pub origin_snapshot: Option<String>,
    pub source_type: &'static str,
    pub source_id: String,
}

impl CloneInfo {
    /// Reconstruct what a retried CreateVolume should record when the
    /// dataset exists but the first attempt died before the property step.
    pub(crate) fn from_request(msg: &CreateVolumeRequest) -> Option<CloneInfo> {
        let source = msg.volume_content_source.as_ref()?.r#type.as_ref()?;
        Some(match source {
            volume_content_source::Type::Snapshot(snapshot) => {
                let mode = if snapshot
                    .snapshot_id
                    .starts_with(ids::DETACHED_SNAPSHOT_ID_PREFIX)
                {
                    // detached-snapshot restores are always plain clones
                    property::CLONE_MODE_COW
                } else {
                    clone_mode_from_params(&msg.parameters, true)
                };
                CloneInfo {
                    mode,
                    origin_snapshot: None,
                    source_type: property::CONTENT_SOURCE_SNAPSHOT,
                    source_id: snapshot.snapshot_id.clone(),
                }
            }
            volume_content_source::Type::Volume(volume) => CloneInfo {
                mode: clone_mode_from_params(&msg.parameters, false),
                origin_snapshot: None,
                source_type: property::CONTENT_SOURCE_VOLUME,
                source_id: volume.volume_id.clone(),
            },
        })
    }
}

/// Read the recorded clone metadata off an existing dataset.
pub(crate) fn clone_info_from_properties(dataset: &Dataset) -> Option<CloneInfo> {
    let source_type = match dataset.user_property(property::PROPERTY_CONTENT_SOURCE_TYPE)? {
        value if value == property::CONTENT_SOURCE_SNAPSHOT => property::CONTENT_SOURCE_SNAPSHOT,
        value if value == property::CONTENT_SOURCE_VOLUME => property::CONTENT_SOURCE_VOLUME,
        _ => return None,
    };
    let source_id = dataset
        .user_property(property::PROPERTY_CONTENT_SOURCE_ID)?
        .to_string();
    let mode = match dataset.user_property(property::PROPERTY_CLONE_MODE) {
        Some(value) if value == property::CLONE_MODE_PROMOTED => property::CLONE_MODE_PROMOTED,
        Some(value) if value == property::CLONE_MODE_DETACHED => property::CLONE_MODE_DETACHED,
        _ => property::CLONE_MODE_COW,
    };
    Some(CloneInfo {
        mode,
        origin_snapshot: dataset
            .user_property(property::PROPERTY_ORIGIN_SNAPSHOT)
            .map(str::to_string),
        source_type,
        source_id,
    })
}

/// Clone mode selected by the storage class. Detached wins when both
/// detached and promoted are requested.
pub(crate) fn clone_mode_from_params(
    params: &HashMap<String, String>,
    from_snapshot: bool,
) -> &'static str {
    let (detached_key, promoted_key) = if from_snapshot {
        (
            ids::PARAM_DETACHED_FROM_SNAPSHOTS,
            ids::PARAM_PROMOTED_FROM_SNAPSHOTS,
        )
    } else {
        (
            ids::PARAM_DETACHED_FROM_VOLUMES,
            ids::PARAM_PROMOTED_FROM_VOLUMES,
        )
    };
    let detached = param_true(params, detached_key);
    let promoted = param_true(params, promoted_key);
    if detached && promoted {
        warn!("both detached and promoted clone modes requested; using detached");
    }
    if detached {
        property::CLONE_MODE_DETACHED
    } else if promoted {
        property::CLONE_MODE_PROMOTED
    } else {
        property::CLONE_MODE_COW
    }
}

impl Controller {
    async fn dataset_required(&self, name: &str) -> Result<Dataset, Status> {
        self.client
            .dataset_get(name)
            .await
            .map_err(Status::from)?
            .ok_or_else(|| Status::internal(format!("dataset {name} disappeared mid-operation")))
    }

    /// `zfs clone` with partial-state cleanup on failure.
    async fn cow_clone(&self, snapshot: &str, target: &str) -> Result<(), Status> {
        debug!("cloning snapshot {} to dataset {}", snapshot, target);
        match self.client.snapshot_clone(snapshot, target).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Err(Status::not_found(format!(
                "snapshot {snapshot} not found"
            ))),
            Err(error) => {
                self.cleanup_partial_dataset(target).await;
                Err(Status::internal(format!(
                    "failed to clone snapshot {snapshot}: {error}"
                )))
            }
        }
    }

    async fn promote_or_cleanup(&self, target: &str) -> Result<(), Status> {
        if let Err(error) = self.client.dataset_promote(target).await {
            error!("failed to promote clone {}: {}, cleaning up", target, error);
            self.cleanup_partial_dataset(target).await;
            return Err(Status::internal(format!(
                "failed to promote clone {target}: {error}"
            )));
        }
        Ok(())
    }

    async fn cleanup_partial_dataset(&self, name: &str) {
        match self.client.dataset_delete(name, true, true).await {
            Ok(()) => info!("cleaned up partially created dataset {}", name),
            Err(error) if error.is_not_found() => {}
            Err(error) => error!("failed to clean up partial dataset {}: {}", name, error),
        }
    }

    /// Full send/receive copy of one snapshot of `source` into `target`,
    /// promoted afterwards to break the residual clone relationship the
    /// appliance's local replication may leave behind.
    async fn detached_copy(
        &self,
        source: &str,
        snapshot_name: &str,
        target: &str,
    ) -> Result<(), Status> {
        let params = ReplicationRunOnetimeParams::local_copy(source, target, snapshot_name);
        if let Err(error) = self
            .client
            .replication_run_and_wait(&params, REPLICATION_TIMEOUT)
            .await
        {
            warn!(
                "replication to {} failed: {}, cleaning up partial copy",
                target, error
            );
            self.cleanup_partial_dataset(target).await;
            return Err(Status::internal(format!(
                "failed to create detached copy via replication: {error}"
            )));
        }

        // Without the promote, deleting the source later fails with
        // "dataset has dependent clones".
        if let Err(error) = self.client.dataset_promote(target).await {
            warn!(
                "promote of detached copy {} failed: {} (source deletion may be blocked later)",
                target, error
            );
        }

        let replicated = format!("{target}@{snapshot_name}");
        if let Err(error) = self.client.snapshot_delete(&replicated).await {
            if !error.is_not_found() {
                warn!(
                    "failed to delete replicated temporary snapshot {}: {}",
                    replicated, error
                );
            }
        }
        Ok(())
    }

    /// CreateVolume with a snapshot content source.
    pub(crate) async fn clone_from_snapshot(
        &self,
        snapshot_id: &str,
        params: &HashMap<String, String>,
        new_name: &str,
        target_dataset: &str,
    ) -> Result<(Dataset, CloneInfo), Status> {
        let id = SnapshotId::decode(snapshot_id).map_err(|error| {
            Status::not_found(format!("snapshot {snapshot_id} not found: {error}"))
        })?;

        if id.detached {
            let Some(source) = self.lookup_detached_snapshot(&id.name).await? else {
                return Err(Status::not_found(format!(
                    "detached snapshot {snapshot_id} not found"
                )));
            };
            return self
                .restore_from_detached(snapshot_id, &source, new_name, target_dataset)
                .await;
        }

        let Some(zfs_name) = self.resolve_zfs_snapshot_name(&id).await? else {
            return Err(Status::not_found(format!(
                "snapshot {snapshot_id} not found"
            )));
        };

        let mode = clone_mode_from_params(params, true);
        info!(
            "creating {} clone of snapshot {} at {}",
            mode, zfs_name, target_dataset
        );
        let clone = match mode {
            mode if mode == property::CLONE_MODE_DETACHED => {
                let source_dataset = zfs_name.split('@').next().unwrap_or(&zfs_name);
                self.detached_copy(source_dataset, &id.name, target_dataset)
                    .await?;
                CloneInfo {
                    mode,
                    origin_snapshot: None,
                    source_type: property::CONTENT_SOURCE_SNAPSHOT,
                    source_id: snapshot_id.to_string(),
                }
            }
            mode if mode == property::CLONE_MODE_PROMOTED => {
                self.cow_clone(&zfs_name, target_dataset).await?;
                self.promote_or_cleanup(target_dataset).await?;
                CloneInfo {
                    mode,
                    origin_snapshot: None,
                    source_type: property::CONTENT_SOURCE_SNAPSHOT,
                    source_id: snapshot_id.to_string(),
                }
            }
            mode => {
                self.cow_clone(&zfs_name, target_dataset).await?;
                CloneInfo {
                    mode,
                    origin_snapshot: Some(zfs_name),
                    source_type: property::CONTENT_SOURCE_SNAPSHOT,
                    source_id: snapshot_id.to_string(),
                }
            }
        };

        let dataset = self.dataset_required(target_dataset).await?;
        Ok((dataset, clone))
    }

    /// Restore from a detached snapshot: snapshot the detached dataset and
    /// COW-clone it. The temporary snapshot is retained deliberately, the
    /// restored volume depends on it; ZFS reclaims it with the last clone.
    async fn restore_from_detached(
        &self,
        snapshot_id: &str,
        source: &Dataset,
        new_name: &str,
        target_dataset: &str,
    ) -> Result<(Dataset, CloneInfo), Status> {
        let temp_name = format!("{RESTORE_SNAPSHOT_PREFIX}{new_name}");
        let temp_full = format!("{}@{}", source.name, temp_name);
        info!(
            "restoring volume {} from detached snapshot dataset {}",
            new_name, source.name
        );

        let existing = self
            .client
            .snapshot_query_by_dataset(&source.name)
            .await
            .unwrap_or_else(|error| {
                debug!("snapshot query on {} failed: {}", source.name, error);
                Vec::new()
            });
        if existing.iter().any(|snapshot| snapshot.id == temp_full) {
            debug!("snapshot {} already exists, reusing for restore", temp_full);
        } else {
            match self.client.snapshot_create(&source.name, &temp_name).await {
                Ok(_) => {}
                Err(error) if error.is_conflict() => {}
                Err(error) => {
                    return Err(Status::internal(format!(
                        "failed to snapshot detached snapshot dataset {}: {error}",
                        source.name
                    )))
                }
            }
        }

        self.cow_clone(&temp_full, target_dataset).await?;

        let dataset = self.dataset_required(target_dataset).await?;
        Ok((
            dataset,
            CloneInfo {
                mode: property::CLONE_MODE_COW,
                origin_snapshot: Some(temp_full),
                source_type: property::CONTENT_SOURCE_SNAPSHOT,
                source_id: snapshot_id.to_string(),
            },
        ))
    }

    /// CreateVolume with a volume content source: a temporary snapshot of
    /// the source feeds the selected clone mode.
    pub(crate) async fn clone_from_volume(
        &self,
        source_volume_id: &str,
        params: &HashMap<String, String>,
        new_name: &str,
        target_dataset: &str,
    ) -> Result<(Dataset, CloneInfo), Status> {
        let Some(ResolvedVolume { dataset: source, .. }) =
            self.resolve_volume(source_volume_id).await?
        else {
            return Err(Status::not_found(format!(
                "source volume {source_volume_id} not found"
            )));
        };

        let temp_name = format!("{VOLUME_SOURCE_SNAPSHOT_PREFIX}{new_name}");
        let temp_full = format!("{}@{}", source.name, temp_name);
        match self.client.snapshot_create(&source.name, &temp_name).await {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {
                debug!("temporary snapshot {} already exists, reusing", temp_full)
            }
            Err(error) => {
                return Err(Status::internal(format!(
                    "failed to snapshot source volume {}: {error}",
                    source.name
                )))
            }
        }

        let mode = clone_mode_from_params(params, false);
        info!(
            "creating {} clone of volume {} at {}",
            mode, source.name, target_dataset
        );
        let clone = match mode {
            mode if mode == property::CLONE_MODE_DETACHED => {
                self.detached_copy(&source.name, &temp_name, target_dataset)
                    .await?;
                self.delete_snapshot_quietly(&temp_full).await;
                CloneInfo {
                    mode,
                    origin_snapshot: None,
                    source_type: property::CONTENT_SOURCE_VOLUME,
                    source_id: source_volume_id.to_string(),
                }
            }
            mode if mode == property::CLONE_MODE_PROMOTED => {
                self.cow_clone(&temp_full, target_dataset).await?;
                self.promote_or_cleanup(target_dataset).await?;
                // promotion migrated the temporary snapshot onto the clone
                self.delete_snapshot_quietly(&format!("{target_dataset}@{temp_name}"))
                    .await;
                CloneInfo {
                    mode,
                    origin_snapshot: None,
                    source_type: property::CONTENT_SOURCE_VOLUME,
                    source_id: source_volume_id.to_string(),
                }
            }
            mode => {
                // the clone depends on the temporary snapshot, which is
                // retained until the clone goes away
                self.cow_clone(&temp_full, target_dataset).await?;
                CloneInfo {
                    mode,
                    origin_snapshot: Some(temp_full),
                    source_type: property::CONTENT_SOURCE_VOLUME,
                    source_id: source_volume_id.to_string(),
                }
            }
        };

        let dataset = self.dataset_required(target_dataset).await?;
        Ok((dataset, clone))
    }

    pub(crate) async fn delete_snapshot_quietly(&self, snapshot: &str) {
        match self.client.snapshot_delete(snapshot).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => warn!("failed to delete snapshot {}: {}", snapshot, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn default_mode_is_cow() {
        assert_eq!(
            clone_mode_from_params(&params(&[]), true),
            property::CLONE_MODE_COW
        );
        assert_eq!(
            clone_mode_from_params(&params(&[]), false),
            property::CLONE_MODE_COW
        );
    }

    #[test]
    fn promoted_and_detached_selection() {
        let promoted = params(&[("promotedVolumesFromSnapshots", "true")]);
        assert_eq!(
            clone_mode_from_params(&promoted, true),
            property::CLONE_MODE_PROMOTED
        );
        // the snapshot flag does not affect volume sources
        assert_eq!(
            clone_mode_from_params(&promoted, false),
            property::CLONE_MODE_COW
        );

        let detached = params(&[("detachedVolumesFromVolumes", "true")]);
        assert_eq!(
            clone_mode_from_params(&detached, false),
            property::CLONE_MODE_DETACHED
        );
    }

    #[test]
    fn detached_wins_over_promoted() {
        let both = params(&[
            ("detachedVolumesFromSnapshots", "true"),
            ("promotedVolumesFromSnapshots", "true"),
        ]);
        assert_eq!(
            clone_mode_from_params(&both, true),
            property::CLONE_MODE_DETACHED
        );
    }
}
