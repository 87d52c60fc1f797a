//! iSCSI target verbs. A block volume exported over iSCSI owns one target,
//! one extent backed by its ZVOL, and the target-extent map joining them.

use serde::Deserialize;
use serde_json::json;

use crate::{client::ApiClient, error::ApiError};

#[derive(Debug, Clone, Deserialize)]
pub struct IscsiTarget {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IscsiExtent {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Backing device, `zvol/<dataset>` for ZVOL extents.
    #[serde(default)]
    pub disk: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IscsiTargetExtent {
    pub id: i64,
    pub target: i64,
    pub extent: i64,
    #[serde(default)]
    pub lunid: Option<i64>,
}

impl ApiClient {
    pub async fn iscsi_target_create(&self, name: &str) -> Result<IscsiTarget, ApiError> {
        self.call_de(
            "iscsi.target.create",
            json!([{ "name": name, "groups": [] }]),
        )
        .await
    }

    pub async fn iscsi_target_delete(&self, id: i64) -> Result<(), ApiError> {
        self.call("iscsi.target.delete", json!([id, true])).await?;
        Ok(())
    }

    pub async fn iscsi_target_query_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<IscsiTarget>, ApiError> {
        self.call_de("iscsi.target.query", json!([[["name", "=", name]], {}]))
            .await
    }

    pub async fn iscsi_extent_create(
        &self,
        name: &str,
        disk: &str,
    ) -> Result<IscsiExtent, ApiError> {
        self.call_de(
            "iscsi.extent.create",
            json!([{ "name": name, "type": "DISK", "disk": disk }]),
        )
        .await
    }

    pub async fn iscsi_extent_delete(&self, id: i64) -> Result<(), ApiError> {
        self.call("iscsi.extent.delete", json!([id, true, true]))
            .await?;
        Ok(())
    }

    pub async fn iscsi_extent_query_by_name(
        &self,
        name: &str,
    ) -> Result<Vec<IscsiExtent>, ApiError> {
        self.call_de("iscsi.extent.query", json!([[["name", "=", name]], {}]))
            .await
    }

    /// Full extent listing, used only by legacy volume-id resolution.
    pub async fn iscsi_extent_query_all(&self) -> Result<Vec<IscsiExtent>, ApiError> {
        self.call_de("iscsi.extent.query", json!([[], {}])).await
    }

    pub async fn iscsi_targetextent_create(
        &self,
        target: i64,
        extent: i64,
    ) -> Result<IscsiTargetExtent, ApiError> {
        self.call_de(
            "iscsi.targetextent.create",
            json!([{ "target": target, "extent": extent, "lunid": 0 }]),
        )
        .await
    }

    pub async fn iscsi_targetextent_delete(&self, id: i64) -> Result<(), ApiError> {
        self.call("iscsi.targetextent.delete", json!([id, true]))
            .await?;
        Ok(())
    }

    pub async fn iscsi_targetextent_query_by_target(
        &self,
        target: i64,
    ) -> Result<Vec<IscsiTargetExtent>, ApiError> {
        self.call_de(
            "iscsi.targetextent.query",
            json!([[["target", "=", target]], {}]),
        )
        .await
    }

    /// Pick up target/extent changes without interrupting live sessions.
    pub async fn iscsi_service_reload(&self) -> Result<(), ApiError> {
        self.call("service.reload", json!(["iscsitarget"])).await?;
        Ok(())
    }

    /// Raw portal listing, passed through as the appliance reports it.
    pub async fn iscsi_portal_query(&self) -> Result<serde_json::Value, ApiError> {
        self.call("iscsi.portal.query", json!([[], {}])).await
    }

    /// Raw initiator-group listing, passed through.
    pub async fn iscsi_initiator_query(&self) -> Result<serde_json::Value, ApiError> {
        self.call("iscsi.initiator.query", json!([[], {}])).await
    }

    /// The appliance's global iSCSI configuration (base name and friends).
    pub async fn iscsi_global_config(&self) -> Result<serde_json::Value, ApiError> {
        self.call("iscsi.global.config", json!([])).await
    }
}
