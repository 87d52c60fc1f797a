//! NVMe-oF target verbs. Each CSI volume owns a dedicated subsystem with a
//! single namespace (NSID 1) pointing at its ZVOL, bound to every listener
//! port of the appliance.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{client::ApiClient, error::ApiError};

/// One namespace per subsystem, always NSID 1.
pub const NSID: i64 = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct NvmetSubsystem {
    pub id: i64,
    pub name: String,
    pub subnqn: String,
}

/// Nested resource reference as the appliance returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct NvmetRef {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NvmetNamespace {
    pub id: i64,
    #[serde(default)]
    pub nsid: Option<i64>,
    pub device_path: String,
    pub subsys: NvmetRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NvmetPort {
    pub id: i64,
    pub addr_trtype: String,
    pub addr_traddr: String,
    /// Service id; a number for tcp/rdma ports.
    pub addr_trsvcid: Value,
}

impl NvmetPort {
    pub fn transport(&self) -> String {
        self.addr_trtype.to_lowercase()
    }

    pub fn service_id(&self) -> String {
        match &self.addr_trsvcid {
            Value::String(svc) => svc.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NvmetPortSubsys {
    pub id: i64,
    pub port: NvmetRef,
    pub subsys: NvmetRef,
}

impl ApiClient {
    pub async fn nvmet_subsys_create(
        &self,
        name: &str,
        subnqn: &str,
    ) -> Result<NvmetSubsystem, ApiError> {
        self.call_de(
            "nvmet.subsys.create",
            json!([{ "name": name, "subnqn": subnqn }]),
        )
        .await
    }

    pub async fn nvmet_subsys_delete(&self, id: i64) -> Result<(), ApiError> {
        self.call("nvmet.subsys.delete", json!([id])).await?;
        Ok(())
    }

    pub async fn nvmet_subsys_query_by_nqn(
        &self,
        subnqn: &str,
    ) -> Result<Vec<NvmetSubsystem>, ApiError> {
        self.call_de(
            "nvmet.subsys.query",
            json!([[["subnqn", "=", subnqn]], {}]),
        )
        .await
    }

    pub async fn nvmet_namespace_create(
        &self,
        subsys_id: i64,
        device_path: &str,
    ) -> Result<NvmetNamespace, ApiError> {
        self.call_de(
            "nvmet.namespace.create",
            json!([{
                "subsys_id": subsys_id,
                "nsid": NSID,
                "device_type": "ZVOL",
                "device_path": device_path,
            }]),
        )
        .await
    }

    pub async fn nvmet_namespace_delete(&self, id: i64) -> Result<(), ApiError> {
        self.call("nvmet.namespace.delete", json!([id])).await?;
        Ok(())
    }

    pub async fn nvmet_namespace_query(&self) -> Result<Vec<NvmetNamespace>, ApiError> {
        self.call_de("nvmet.namespace.query", json!([[], {}])).await
    }

    pub async fn nvmet_namespace_query_by_subsys(
        &self,
        subsys_id: i64,
    ) -> Result<Vec<NvmetNamespace>, ApiError> {
        self.call_de(
            "nvmet.namespace.query",
            json!([[["subsys.id", "=", subsys_id]], {}]),
        )
        .await
    }

    /// Every configured listener port.
    pub async fn nvmet_port_query(&self) -> Result<Vec<NvmetPort>, ApiError> {
        self.call_de("nvmet.port.query", json!([[], {}])).await
    }

    pub async fn nvmet_port_subsys_create(
        &self,
        port_id: i64,
        subsys_id: i64,
    ) -> Result<NvmetPortSubsys, ApiError> {
        self.call_de(
            "nvmet.port_subsys.create",
            json!([{ "port_id": port_id, "subsys_id": subsys_id }]),
        )
        .await
    }

    pub async fn nvmet_port_subsys_delete(&self, id: i64) -> Result<(), ApiError> {
        self.call("nvmet.port_subsys.delete", json!([id])).await?;
        Ok(())
    }

    pub async fn nvmet_port_subsys_query_by_subsys(
        &self,
        subsys_id: i64,
    ) -> Result<Vec<NvmetPortSubsys>, ApiError> {
        self.call_de(
            "nvmet.port_subsys.query",
            json!([[["subsys.id", "=", subsys_id]], {}]),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_service_id_handles_numbers_and_strings() {
        let port: NvmetPort = serde_json::from_value(json!({
            "id": 1, "addr_trtype": "TCP", "addr_traddr": "10.0.0.1", "addr_trsvcid": 4420
        }))
        .unwrap();
        assert_eq!(port.transport(), "tcp");
        assert_eq!(port.service_id(), "4420");

        let port: NvmetPort = serde_json::from_value(json!({
            "id": 2, "addr_trtype": "RDMA", "addr_traddr": "10.0.0.2", "addr_trsvcid": "4421"
        }))
        .unwrap();
        assert_eq!(port.service_id(), "4421");
    }

    #[test]
    fn namespace_keeps_subsystem_reference() {
        let namespace: NvmetNamespace = serde_json::from_value(json!({
            "id": 7,
            "nsid": 1,
            "device_path": "zvol/tank/k8s/pvc-abc",
            "subsys": { "id": 3, "name": "pvc-abc" }
        }))
        .unwrap();
        assert_eq!(namespace.subsys.id, 3);
        assert_eq!(namespace.device_path, "zvol/tank/k8s/pvc-abc");
    }
}
