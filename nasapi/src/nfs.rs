//! NFS share verbs. One share per filesystem volume, bound to the dataset
//! mountpoint.

use serde::Deserialize;
use serde_json::json;

use crate::{client::ApiClient, error::ApiError};

#[derive(Debug, Clone, Deserialize)]
pub struct NfsShare {
    pub id: i64,
    pub path: String,
    #[serde(default)]
    pub enabled: bool,
}

impl ApiClient {
    pub async fn nfs_share_create(&self, path: &str) -> Result<NfsShare, ApiError> {
        self.call_de(
            "sharing.nfs.create",
            json!([{ "path": path, "enabled": true }]),
        )
        .await
    }

    pub async fn nfs_share_delete(&self, id: i64) -> Result<(), ApiError> {
        self.call("sharing.nfs.delete", json!([id])).await?;
        Ok(())
    }

    pub async fn nfs_share_query_by_path(&self, path: &str) -> Result<Vec<NfsShare>, ApiError> {
        self.call_de("sharing.nfs.query", json!([[["path", "=", path]], {}]))
            .await
    }

    /// Full share listing, used only by legacy volume-id resolution.
    pub async fn nfs_share_query_all(&self) -> Result<Vec<NfsShare>, ApiError> {
        self.call_de("sharing.nfs.query", json!([[], {}])).await
    }
}
