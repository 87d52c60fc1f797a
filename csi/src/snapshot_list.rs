//! ListSnapshots and GetSnapshot. Three query shapes: by snapshot id, by
//! source volume, and unfiltered. The unfiltered path enumerates managed
//! datasets first and queries snapshots per dataset; an unfiltered global
//! snapshot query would overrun reply buffers on large appliances.

use nasapi::property;
use tonic::Status;

use crate::{
    controller::{protocol_of, Controller, ResolvedVolume},
    csi::{
        list_snapshots_response::Entry, GetSnapshotRequest, GetSnapshotResponse,
        ListSnapshotsRequest, ListSnapshotsResponse, Snapshot,
    },
    ids::{self, SnapshotId},
    snapshot::now_timestamp,
};

fn encode_list_token(offset: usize) -> String {
    offset.to_string()
}

fn parse_list_token(token: &str) -> Result<usize, Status> {
    token
        .parse()
        .map_err(|_| Status::aborted(format!("invalid starting token {token:?}")))
}

fn empty_response() -> ListSnapshotsResponse {
    ListSnapshotsResponse {
        entries: Vec::new(),
        next_token: String::new(),
    }
}

fn entry(snapshot_id: String, source_volume_id: String, size_bytes: u64) -> Entry {
    Entry {
        snapshot: Some(Snapshot {
            size_bytes: size_bytes as i64,
            snapshot_id,
            source_volume_id,
            creation_time: Some(now_timestamp()),
            ready_to_use: true,
        }),
    }
}

/// Apply max_entries / starting_token to a full entry list.
fn paginate(
    mut entries: Vec<Entry>,
    max_entries: i32,
    starting_token: &str,
) -> Result<ListSnapshotsResponse, Status> {
    let start = if starting_token.is_empty() {
        0
    } else {
        parse_list_token(starting_token)?
    };
    if start >= entries.len() {
        return Ok(empty_response());
    }
    let page_size = if max_entries > 0 {
        max_entries as usize
    } else {
        entries.len()
    };
    let end = (start + page_size).min(entries.len());
    let next_token = if end < entries.len() {
        encode_list_token(end)
    } else {
        String::new()
    };
    let entries = entries.drain(start..end).collect();
    Ok(ListSnapshotsResponse {
        entries,
        next_token,
    })
}

impl Controller {
    pub(crate) async fn do_list_snapshots(
        &self,
        msg: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, Status> {
        if !msg.snapshot_id.is_empty() {
            return self.list_snapshot_by_id(&msg.snapshot_id).await;
        }
        if !msg.source_volume_id.is_empty() {
            return self
                .list_snapshots_by_source(&msg.source_volume_id, msg.max_entries, &msg.starting_token)
                .await;
        }
        self.list_all_snapshots(msg.max_entries, &msg.starting_token)
            .await
    }

    pub(crate) async fn do_get_snapshot(
        &self,
        msg: GetSnapshotRequest,
    ) -> Result<GetSnapshotResponse, Status> {
        if msg.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("snapshot id is required"));
        }
        let listed = self.list_snapshot_by_id(&msg.snapshot_id).await?;
        let entry = listed
            .entries
            .into_iter()
            .next()
            .ok_or_else(|| Status::not_found(format!("snapshot {} not found", msg.snapshot_id)))?;
        Ok(GetSnapshotResponse {
            snapshot: entry.snapshot,
        })
    }

    /// The declared capacity of a volume referenced by a snapshot, for the
    /// entry's size_bytes. Zero when the source volume is gone.
    async fn source_capacity(&self, source_volume_id: &str) -> u64 {
        if !ids::is_dataset_path(source_volume_id) {
            return 0;
        }
        match self.client.dataset_get(source_volume_id).await {
            Ok(Some(dataset)) => dataset.capacity_bytes().unwrap_or(0),
            _ => 0,
        }
    }

    async fn list_snapshot_by_id(&self, snapshot_id: &str) -> Result<ListSnapshotsResponse, Status> {
        let id = match SnapshotId::decode(snapshot_id) {
            Ok(id) => id,
            Err(error) => {
                // malformed ids cannot exist, per CSI that is an empty list
                debug!("invalid snapshot id {:?}: {}", snapshot_id, error);
                return Ok(empty_response());
            }
        };

        if id.detached {
            let Some(dataset) = self.lookup_detached_snapshot(&id.name).await? else {
                return Ok(empty_response());
            };
            let source_volume = dataset
                .user_property(property::PROPERTY_SOURCE_VOLUME_ID)
                .unwrap_or(&id.source_volume)
                .to_string();
            let size = self.source_capacity(&source_volume).await;
            return Ok(ListSnapshotsResponse {
                entries: vec![entry(snapshot_id.to_string(), source_volume, size)],
                next_token: String::new(),
            });
        }

        let Some(zfs_name) = self.resolve_zfs_snapshot_name(&id).await? else {
            return Ok(empty_response());
        };
        let found = self
            .client
            .snapshot_query(serde_json::json!([["id", "=", zfs_name]]))
            .await
            .map_err(Status::from)?;
        if found.is_empty() {
            return Ok(empty_response());
        }

        let size = self.source_capacity(&id.source_volume).await;
        Ok(ListSnapshotsResponse {
            entries: vec![entry(
                snapshot_id.to_string(),
                id.source_volume.clone(),
                size,
            )],
            next_token: String::new(),
        })
    }

    async fn list_snapshots_by_source(
        &self,
        source_volume_id: &str,
        max_entries: i32,
        starting_token: &str,
    ) -> Result<ListSnapshotsResponse, Status> {
        let Some(ResolvedVolume { dataset, protocol }) =
            self.resolve_volume(source_volume_id).await?
        else {
            debug!(
                "source volume {} not found, returning empty snapshot list",
                source_volume_id
            );
            return Ok(empty_response());
        };
        let size = dataset.capacity_bytes().unwrap_or(0);

        let snapshots = self
            .client
            .snapshot_query_by_dataset(&dataset.name)
            .await
            .map_err(Status::from)?;
        debug!(
            "found {} snapshots of volume {}",
            snapshots.len(),
            source_volume_id
        );

        let mut entries = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let id = SnapshotId::new(protocol, source_volume_id, snapshot.short_name(), false);
            match id.encode() {
                Ok(encoded) => entries.push(entry(encoded, source_volume_id.to_string(), size)),
                Err(error) => warn!("skipping unencodable snapshot {}: {}", snapshot.id, error),
            }
        }
        paginate(entries, max_entries, starting_token)
    }

    async fn list_all_snapshots(
        &self,
        max_entries: i32,
        starting_token: &str,
    ) -> Result<ListSnapshotsResponse, Status> {
        let datasets = self
            .client
            .dataset_find_by_property(
                "",
                property::PROPERTY_MANAGED_BY,
                property::MANAGED_BY_VALUE,
            )
            .await
            .map_err(Status::from)?;

        let mut entries = Vec::new();
        for dataset in datasets {
            // detached snapshots are datasets, not volumes with snapshots
            if dataset.user_property(property::PROPERTY_DETACHED_SNAPSHOT)
                == Some(property::VALUE_TRUE)
            {
                continue;
            }
            let protocol = protocol_of(&dataset);
            let size = dataset.capacity_bytes().unwrap_or(0);

            let snapshots = match self.client.snapshot_query_by_dataset(&dataset.name).await {
                Ok(snapshots) => snapshots,
                Err(error) => {
                    warn!("failed to query snapshots of {}: {}", dataset.name, error);
                    continue;
                }
            };
            for snapshot in snapshots {
                let id = SnapshotId::new(protocol, &dataset.name, snapshot.short_name(), false);
                match id.encode() {
                    Ok(encoded) => entries.push(entry(encoded, dataset.name.clone(), size)),
                    Err(error) => {
                        warn!("skipping unencodable snapshot {}: {}", snapshot.id, error)
                    }
                }
            }
        }

        debug!("found {} snapshots across managed datasets", entries.len());
        paginate(entries, max_entries, starting_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(count: usize) -> Vec<Entry> {
        (0..count)
            .map(|index| entry(format!("nfs:tank/k8s/vol@snap-{index}"), "tank/k8s/vol".into(), 0))
            .collect()
    }

    #[test]
    fn token_round_trip() {
        assert_eq!(parse_list_token(&encode_list_token(17)).unwrap(), 17);
        assert!(parse_list_token("not-a-number").is_err());
    }

    #[test]
    fn pagination_walks_the_full_list() {
        let page = paginate(entries(5), 2, "").unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_token, "2");

        let page = paginate(entries(5), 2, "2").unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.next_token, "4");

        let page = paginate(entries(5), 2, "4").unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.next_token, "");
    }

    #[test]
    fn pagination_without_limit_returns_everything() {
        let page = paginate(entries(5), 0, "").unwrap();
        assert_eq!(page.entries.len(), 5);
        assert_eq!(page.next_token, "");
    }

    #[test]
    fn pagination_past_the_end_is_empty() {
        let page = paginate(entries(3), 2, "7").unwrap();
        assert!(page.entries.is_empty());
        assert_eq!(page.next_token, "");
    }
}
