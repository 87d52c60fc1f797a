//! ZFS snapshot verbs. A snapshot id is always `dataset@name`; the bare
//! name is globally unique only by CSI convention, which the controller
//! engine enforces with a pre-create query.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{client::ApiClient, error::ApiError};

#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    /// Full ZFS name, `dataset@name`.
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub dataset: String,
    /// The bare snapshot name after the `@`.
    #[serde(default)]
    pub snapshot_name: Option<String>,
}

impl Snapshot {
    /// The bare name after the `@`, derived from the id when the appliance
    /// did not fill the dedicated field.
    pub fn short_name(&self) -> &str {
        if let Some(name) = self.snapshot_name.as_deref() {
            return name;
        }
        self.id.rsplit('@').next().unwrap_or(&self.id)
    }
}

impl ApiClient {
    pub async fn snapshot_create(&self, dataset: &str, name: &str) -> Result<Snapshot, ApiError> {
        self.call_de(
            "zfs.snapshot.create",
            json!([{ "dataset": dataset, "name": name, "recursive": false }]),
        )
        .await
    }

    pub async fn snapshot_delete(&self, id: &str) -> Result<(), ApiError> {
        self.call("zfs.snapshot.delete", json!([id])).await?;
        Ok(())
    }

    /// Clone `snapshot` (full ZFS name) into the dataset `target`.
    pub async fn snapshot_clone(&self, snapshot: &str, target: &str) -> Result<(), ApiError> {
        self.call(
            "zfs.snapshot.clone",
            json!([{ "snapshot": snapshot, "dataset_dst": target }]),
        )
        .await?;
        Ok(())
    }

    /// Query snapshots with raw appliance filters, e.g.
    /// `[["dataset", "=", "tank/k8s/vol"]]` or `[["name", "=", "snap"]]`.
    pub async fn snapshot_query(&self, filters: Value) -> Result<Vec<Snapshot>, ApiError> {
        self.call_de("zfs.snapshot.query", json!([filters, {}]))
            .await
    }

    /// All snapshots whose bare name matches, across every dataset. Used by
    /// the global-uniqueness probe; never issue an unfiltered query.
    pub async fn snapshot_query_by_name(&self, name: &str) -> Result<Vec<Snapshot>, ApiError> {
        self.snapshot_query(json!([["name", "=", name]])).await
    }

    /// All snapshots of one dataset.
    pub async fn snapshot_query_by_dataset(
        &self,
        dataset: &str,
    ) -> Result<Vec<Snapshot>, ApiError> {
        self.snapshot_query(json!([["dataset", "=", dataset]]))
            .await
    }

    pub async fn snapshot_set_user_properties(
        &self,
        id: &str,
        properties: &[(&str, String)],
    ) -> Result<(), ApiError> {
        let update: Vec<Value> = properties
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        self.call(
            "zfs.snapshot.update",
            json!([id, { "user_properties_update": update }]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_prefers_dedicated_field() {
        let snapshot: Snapshot = serde_json::from_value(json!({
            "id": "tank/k8s/vol@snap-1",
            "dataset": "tank/k8s/vol",
            "snapshot_name": "snap-1"
        }))
        .unwrap();
        assert_eq!(snapshot.short_name(), "snap-1");
    }

    #[test]
    fn short_name_derives_from_id() {
        let snapshot: Snapshot = serde_json::from_value(json!({
            "id": "tank/k8s/vol@snap-2",
            "dataset": "tank/k8s/vol"
        }))
        .unwrap();
        assert_eq!(snapshot.short_name(), "snap-2");
    }
}
