//! Snapshot create and delete. Regular snapshots are plain ZFS snapshots;
//! detached snapshots are full replicated copies living as datasets under
//! `<pool>/csi-detached-snapshots/`, tagged through user properties so they
//! survive (and remain restorable after) source-volume deletion.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nasapi::{property, replication::ReplicationRunOnetimeParams, Dataset, DatasetCreateParams};
use tonic::Status;

use crate::{
    controller::{param, param_true, Controller, ResolvedVolume},
    csi::{CreateSnapshotRequest, CreateSnapshotResponse, DeleteSnapshotRequest, Snapshot},
    ids::{self, Protocol, SnapshotId},
};

/// Upper bound on the replication behind a detached snapshot.
const REPLICATION_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

/// Prefix of the temporary snapshot feeding a detached-snapshot copy.
const DETACHED_TEMP_SNAPSHOT_PREFIX: &str = "csi-detached-temp-";

pub(crate) fn now_timestamp() -> prost_types::Timestamp {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    prost_types::Timestamp {
        seconds: since_epoch.as_secs() as i64,
        nanos: 0,
    }
}

fn snapshot_response(
    id: &SnapshotId,
    source_volume_id: &str,
    size_bytes: u64,
) -> Result<CreateSnapshotResponse, Status> {
    let snapshot_id = id
        .encode()
        .map_err(|error| Status::internal(format!("failed to encode snapshot id: {error}")))?;
    Ok(CreateSnapshotResponse {
        snapshot: Some(Snapshot {
            size_bytes: size_bytes as i64,
            snapshot_id,
            source_volume_id: source_volume_id.to_string(),
            creation_time: Some(now_timestamp()),
            // ZFS snapshots are usable the moment they exist
            ready_to_use: true,
        }),
    })
}

impl Controller {
    pub(crate) async fn do_create_snapshot(
        &self,
        msg: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, Status> {
        if msg.name.is_empty() {
            return Err(Status::invalid_argument("snapshot name is required"));
        }
        if msg.source_volume_id.is_empty() {
            return Err(Status::invalid_argument("source volume id is required"));
        }

        let Some(ResolvedVolume { dataset, protocol }) =
            self.resolve_volume(&msg.source_volume_id).await?
        else {
            return Err(Status::not_found(format!(
                "source volume {} not found",
                msg.source_volume_id
            )));
        };

        let params = &msg.parameters;
        if param_true(params, ids::PARAM_DETACHED_SNAPSHOTS) {
            let parent = param(params, ids::PARAM_DETACHED_SNAPSHOTS_PARENT);
            self.create_detached_snapshot(
                &msg.name,
                &msg.source_volume_id,
                &dataset,
                protocol,
                param(params, ids::PARAM_POOL),
                parent,
            )
            .await
        } else {
            self.create_regular_snapshot(&msg.name, &msg.source_volume_id, &dataset, protocol)
                .await
        }
    }

    async fn create_regular_snapshot(
        &self,
        name: &str,
        source_volume_id: &str,
        dataset: &Dataset,
        protocol: Protocol,
    ) -> Result<CreateSnapshotResponse, Status> {
        info!(
            "creating snapshot {} of volume {} (dataset {})",
            name, source_volume_id, dataset.name
        );

        // CSI requires snapshot names to be unique across ALL volumes; ZFS
        // only enforces per-dataset uniqueness, so probe globally first.
        match self.client.snapshot_query_by_name(name).await {
            Ok(existing) => {
                for snapshot in existing {
                    if snapshot.dataset == dataset.name {
                        info!(
                            "snapshot {} already exists on {} (idempotent)",
                            name, dataset.name
                        );
                        let id = SnapshotId::new(protocol, source_volume_id, name, false);
                        return snapshot_response(
                            &id,
                            source_volume_id,
                            dataset.capacity_bytes().unwrap_or(0),
                        );
                    }
                    return Err(Status::already_exists(format!(
                        "snapshot name {name:?} already exists on a different volume \
                         (dataset {} vs {})",
                        snapshot.dataset, dataset.name
                    )));
                }
            }
            Err(error) => {
                // creation below will fail if the name is actually taken
                warn!("failed to query existing snapshots: {}", error);
            }
        }

        let created = self
            .client
            .snapshot_create(&dataset.name, name)
            .await
            .map_err(Status::from)?;
        info!("created snapshot {}", created.id);

        let properties = [
            (
                property::PROPERTY_MANAGED_BY,
                property::MANAGED_BY_VALUE.to_string(),
            ),
            (property::PROPERTY_SNAPSHOT_ID, name.to_string()),
            (
                property::PROPERTY_SOURCE_VOLUME_ID,
                source_volume_id.to_string(),
            ),
            (
                property::PROPERTY_DETACHED_SNAPSHOT,
                property::VALUE_FALSE.to_string(),
            ),
            (property::PROPERTY_PROTOCOL, protocol.as_str().to_string()),
            (
                property::PROPERTY_DELETE_STRATEGY,
                property::DELETE_STRATEGY_DELETE.to_string(),
            ),
        ];
        if let Err(error) = self
            .client
            .snapshot_set_user_properties(&created.id, &properties)
            .await
        {
            // non-fatal, the snapshot itself is usable
            warn!("failed to set CSI properties on {}: {}", created.id, error);
        }

        let id = SnapshotId::new(protocol, source_volume_id, name, false);
        snapshot_response(&id, source_volume_id, dataset.capacity_bytes().unwrap_or(0))
    }

    /// Detached snapshot: replicate a temporary snapshot of the source into
    /// an independent dataset, promote it, and tag it with the property
    /// bundle that makes it discoverable later.
    async fn create_detached_snapshot(
        &self,
        name: &str,
        source_volume_id: &str,
        source: &Dataset,
        protocol: Protocol,
        pool_param: &str,
        parent_param: &str,
    ) -> Result<CreateSnapshotResponse, Status> {
        let parent = if parent_param.is_empty() {
            let pool = if pool_param.is_empty() {
                ids::pool_of(&source.name)
            } else {
                pool_param
            };
            if pool.is_empty() {
                return Err(Status::invalid_argument(format!(
                    "cannot determine the pool for detached snapshots; set {:?}",
                    ids::PARAM_DETACHED_SNAPSHOTS_PARENT
                )));
            }
            format!("{pool}/{}", ids::DETACHED_SNAPSHOTS_FOLDER)
        } else {
            parent_param.to_string()
        };
        self.ensure_detached_parent(&parent).await?;

        let target = format!("{parent}/{name}");
        info!(
            "creating detached snapshot {} of volume {} (source {}, target {})",
            name, source_volume_id, source.name, target
        );

        let id = SnapshotId::new(protocol, source_volume_id, name, true);
        let size = source.capacity_bytes().unwrap_or(0);

        // idempotency: the target dataset existing means a prior attempt
        // finished the copy
        if self
            .client
            .dataset_get(&target)
            .await
            .map_err(Status::from)?
            .is_some()
        {
            info!("detached snapshot dataset {} already exists", target);
            return snapshot_response(&id, source_volume_id, size);
        }

        let temp_name = format!("{DETACHED_TEMP_SNAPSHOT_PREFIX}{name}");
        let temp_full = format!("{}@{}", source.name, temp_name);
        match self.client.snapshot_create(&source.name, &temp_name).await {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {
                debug!("temporary snapshot {} already exists, reusing", temp_full)
            }
            Err(error) => {
                return Err(Status::internal(format!(
                    "failed to create temporary snapshot for detached copy: {error}"
                )))
            }
        }

        let replication =
            ReplicationRunOnetimeParams::local_copy(&source.name, &target, &temp_name);
        if let Err(error) = self
            .client
            .replication_run_and_wait(&replication, REPLICATION_TIMEOUT)
            .await
        {
            warn!(
                "detached snapshot replication failed: {}, cleaning up {}",
                error, target
            );
            match self.client.dataset_delete(&target, true, true).await {
                Ok(()) => {}
                Err(cleanup) if cleanup.is_not_found() => {}
                Err(cleanup) => warn!("failed to clean up partial copy: {}", cleanup),
            }
            self.delete_snapshot_quietly(&temp_full).await;
            return Err(Status::internal(format!(
                "failed to create detached snapshot via replication: {error}"
            )));
        }

        // Local replication leaves the copy as a clone of the temporary
        // snapshot; promote to break the dependency so the source volume
        // stays deletable.
        if let Err(error) = self.client.dataset_promote(&target).await {
            warn!(
                "promote of {} failed: {} (source volume deletion may be blocked later)",
                target, error
            );
        }

        self.delete_snapshot_quietly(&format!("{target}@{temp_name}"))
            .await;
        self.delete_snapshot_quietly(&temp_full).await;

        let properties = [
            (
                property::PROPERTY_MANAGED_BY,
                property::MANAGED_BY_VALUE.to_string(),
            ),
            (property::PROPERTY_SNAPSHOT_ID, name.to_string()),
            (
                property::PROPERTY_SOURCE_VOLUME_ID,
                source_volume_id.to_string(),
            ),
            (
                property::PROPERTY_DETACHED_SNAPSHOT,
                property::VALUE_TRUE.to_string(),
            ),
            (property::PROPERTY_SOURCE_DATASET, source.name.clone()),
            (property::PROPERTY_PROTOCOL, protocol.as_str().to_string()),
            (
                property::PROPERTY_DELETE_STRATEGY,
                property::DELETE_STRATEGY_DELETE.to_string(),
            ),
        ];
        if let Err(error) = self
            .client
            .dataset_set_user_properties(&target, &properties)
            .await
        {
            // Without the snapshot_id property the copy can never be found
            // again; a half-tagged dataset is worse than a failed RPC.
            error!(
                "failed to set CSI properties on detached snapshot {}: {}, cleaning up",
                target, error
            );
            match self.client.dataset_delete(&target, true, true).await {
                Ok(()) => {}
                Err(cleanup) => warn!("failed to clean up {}: {}", target, cleanup),
            }
            return Err(Status::internal(format!(
                "failed to set CSI properties on detached snapshot: {error}"
            )));
        }

        info!("created detached snapshot dataset {}", target);
        snapshot_response(&id, source_volume_id, size)
    }

    /// Make sure the detached-snapshots container dataset exists.
    async fn ensure_detached_parent(&self, parent: &str) -> Result<(), Status> {
        if self
            .client
            .dataset_get(parent)
            .await
            .map_err(Status::from)?
            .is_some()
        {
            return Ok(());
        }
        info!("creating detached snapshots parent dataset {}", parent);
        match self
            .client
            .dataset_create(DatasetCreateParams::filesystem(parent))
            .await
        {
            Ok(_) => {}
            Err(error) if error.is_conflict() => {}
            Err(error) => return Err(error.into()),
        }
        if let Err(error) = self
            .client
            .dataset_set_user_properties(
                parent,
                &[(
                    property::PROPERTY_MANAGED_BY,
                    property::MANAGED_BY_VALUE.to_string(),
                )],
            )
            .await
        {
            warn!("failed to tag parent dataset {}: {}", parent, error);
        }
        Ok(())
    }

    pub(crate) async fn do_delete_snapshot(
        &self,
        msg: DeleteSnapshotRequest,
    ) -> Result<(), Status> {
        if msg.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("snapshot id is required"));
        }
        let id = match SnapshotId::decode(&msg.snapshot_id) {
            Ok(id) => id,
            Err(error) => {
                // undecodable ids cannot refer to anything we created
                warn!(
                    "cannot decode snapshot id {:?} ({}), treating delete as a no-op",
                    msg.snapshot_id, error
                );
                return Ok(());
            }
        };

        if id.detached {
            return self.delete_detached_snapshot(&id).await;
        }

        let Some(zfs_name) = self.resolve_zfs_snapshot_name(&id).await? else {
            info!(
                "snapshot {} not found, delete is a no-op",
                msg.snapshot_id
            );
            return Ok(());
        };
        match self.client.snapshot_delete(&zfs_name).await {
            Ok(()) => {
                info!("deleted snapshot {}", zfs_name);
                Ok(())
            }
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn delete_detached_snapshot(&self, id: &SnapshotId) -> Result<(), Status> {
        let Some(dataset) = self.lookup_detached_snapshot(&id.name).await? else {
            info!(
                "detached snapshot {} not found, delete is a no-op",
                id.name
            );
            return Ok(());
        };
        if !dataset.is_managed() {
            return Err(Status::failed_precondition(format!(
                "dataset {} is not managed by this plugin, refusing to delete",
                dataset.name
            )));
        }
        if dataset.user_property(property::PROPERTY_DETACHED_SNAPSHOT) != Some(property::VALUE_TRUE)
        {
            return Err(Status::failed_precondition(format!(
                "dataset {} is not a detached snapshot",
                dataset.name
            )));
        }

        match self.client.dataset_delete(&dataset.name, true, true).await {
            Ok(()) => {
                info!("deleted detached snapshot dataset {}", dataset.name);
                Ok(())
            }
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Resolve the `dataset@name` form of a snapshot id: directly when the
    /// source volume id is a dataset path, otherwise through a
    /// name-filtered query matched against the legacy volume id.
    pub(crate) async fn resolve_zfs_snapshot_name(
        &self,
        id: &SnapshotId,
    ) -> Result<Option<String>, Status> {
        if let Some(zfs_name) = id.zfs_name() {
            return Ok(Some(zfs_name));
        }
        let suffix = format!("@{}", id.name);
        let snapshots = self
            .client
            .snapshot_query_by_name(&id.name)
            .await
            .map_err(Status::from)?;
        for snapshot in snapshots {
            if snapshot.id.ends_with(&suffix) && snapshot.dataset.contains(&id.source_volume) {
                return Ok(Some(snapshot.id));
            }
        }
        Ok(None)
    }

    /// Locate a detached snapshot dataset by its recorded snapshot name.
    pub(crate) async fn lookup_detached_snapshot(
        &self,
        name: &str,
    ) -> Result<Option<Dataset>, Status> {
        let matches = self
            .client
            .dataset_find_by_property("", property::PROPERTY_SNAPSHOT_ID, name)
            .await
            .map_err(Status::from)?;
        Ok(matches.into_iter().find(|dataset| {
            dataset.user_property(property::PROPERTY_DETACHED_SNAPSHOT)
                == Some(property::VALUE_TRUE)
        }))
    }
}
