//! Dataset verbs and the dataset resource model. A dataset is either a
//! FILESYSTEM (directory tree with a mountpoint) or a VOLUME (a ZVOL block
//! device sized by `volsize`); the full `pool/path/leaf` name is the
//! primary key everywhere.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    client::ApiClient,
    error::ApiError,
    property::{MANAGED_BY_VALUE, PROPERTY_CAPACITY_BYTES, PROPERTY_MANAGED_BY},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetType {
    Filesystem,
    Volume,
}

/// Appliance composite value: most ZFS attributes come back as an object
/// carrying the raw string and a parsed representation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompositeValue {
    #[serde(default)]
    pub rawvalue: Option<String>,
    #[serde(default)]
    pub parsed: Option<Value>,
    #[serde(default)]
    pub value: Option<String>,
}

impl CompositeValue {
    /// The parsed numeric value, falling back to the raw string.
    pub fn as_u64(&self) -> Option<u64> {
        if let Some(parsed) = self.parsed.as_ref().and_then(Value::as_u64) {
            return Some(parsed);
        }
        self.rawvalue
            .as_deref()
            .or(self.value.as_deref())
            .and_then(|raw| raw.parse().ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        self.parsed
            .as_ref()
            .and_then(Value::as_str)
            .or(self.value.as_deref())
            .or(self.rawvalue.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProperty {
    pub value: String,
    #[serde(default)]
    pub rawvalue: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: DatasetType,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub volsize: Option<CompositeValue>,
    #[serde(default)]
    pub volblocksize: Option<CompositeValue>,
    #[serde(default)]
    pub origin: Option<CompositeValue>,
    #[serde(default)]
    pub user_properties: HashMap<String, UserProperty>,
}

impl Dataset {
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .get(key)
            .map(|property| property.value.as_str())
            .filter(|value| !value.is_empty() && *value != "-")
    }

    /// Whether this dataset carries the CSI ownership sentinel.
    pub fn is_managed(&self) -> bool {
        self.user_property(PROPERTY_MANAGED_BY) == Some(MANAGED_BY_VALUE)
    }

    /// ZVOL size as reported by the appliance.
    pub fn zvol_capacity(&self) -> Option<u64> {
        self.volsize.as_ref().and_then(CompositeValue::as_u64)
    }

    /// The authoritative declared capacity: the CSI property when present,
    /// otherwise the ZVOL size.
    pub fn capacity_bytes(&self) -> Option<u64> {
        self.user_property(PROPERTY_CAPACITY_BYTES)
            .and_then(|value| value.parse().ok())
            .or_else(|| self.zvol_capacity())
    }
}

#[derive(Debug, Clone)]
pub struct DatasetCreateParams {
    pub name: String,
    pub kind: DatasetType,
    /// VOLUME only.
    pub volsize: Option<u64>,
    /// VOLUME only, e.g. "16K".
    pub volblocksize: Option<String>,
    pub sparse: bool,
}

impl DatasetCreateParams {
    pub fn filesystem(name: &str) -> Self {
        DatasetCreateParams {
            name: name.to_string(),
            kind: DatasetType::Filesystem,
            volsize: None,
            volblocksize: None,
            sparse: false,
        }
    }

    pub fn zvol(name: &str, volsize: u64) -> Self {
        DatasetCreateParams {
            name: name.to_string(),
            kind: DatasetType::Volume,
            volsize: Some(volsize),
            volblocksize: None,
            sparse: true,
        }
    }
}

/// Query options asking the appliance to include user properties and skip
/// child listings.
fn query_options() -> Value {
    json!({ "extra": { "retrieve_children": false, "user_properties": true } })
}

impl ApiClient {
    pub async fn dataset_create(&self, params: DatasetCreateParams) -> Result<Dataset, ApiError> {
        let mut body = json!({ "name": params.name, "type": params.kind });
        if let Some(volsize) = params.volsize {
            body["volsize"] = json!(volsize);
            body["sparse"] = json!(params.sparse);
        }
        if let Some(volblocksize) = params.volblocksize {
            body["volblocksize"] = json!(volblocksize);
        }
        self.call_de("pool.dataset.create", json!([body])).await
    }

    /// Delete a dataset. NotFound is surfaced to the caller, who treats it
    /// as success on idempotent paths.
    pub async fn dataset_delete(
        &self,
        name: &str,
        recursive: bool,
        force: bool,
    ) -> Result<(), ApiError> {
        self.call(
            "pool.dataset.delete",
            json!([name, { "recursive": recursive, "force": force }]),
        )
        .await?;
        Ok(())
    }

    /// Fetch one dataset by its full path, None when absent.
    pub async fn dataset_get(&self, name: &str) -> Result<Option<Dataset>, ApiError> {
        let datasets: Vec<Dataset> = self
            .call_de(
                "pool.dataset.query",
                json!([[["id", "=", name]], query_options()]),
            )
            .await?;
        Ok(datasets.into_iter().next())
    }

    /// All datasets whose name starts with `prefix`; every dataset when the
    /// prefix is empty.
    pub async fn dataset_query(&self, prefix: &str) -> Result<Vec<Dataset>, ApiError> {
        let filters = if prefix.is_empty() {
            json!([])
        } else {
            json!([["name", "^", prefix]])
        };
        self.call_de("pool.dataset.query", json!([filters, query_options()]))
            .await
    }

    /// Reverse the origin dependency between a clone and its snapshot.
    pub async fn dataset_promote(&self, name: &str) -> Result<(), ApiError> {
        self.call("pool.dataset.promote", json!([name])).await?;
        Ok(())
    }

    /// Resize a ZVOL.
    pub async fn dataset_set_volsize(&self, name: &str, volsize: u64) -> Result<(), ApiError> {
        self.call("pool.dataset.update", json!([name, { "volsize": volsize }]))
            .await?;
        Ok(())
    }

    /// Cap a filesystem dataset via quota and refquota.
    pub async fn dataset_set_quota(&self, name: &str, bytes: u64) -> Result<(), ApiError> {
        self.call(
            "pool.dataset.update",
            json!([name, { "refquota": bytes, "quota": bytes }]),
        )
        .await?;
        Ok(())
    }

    pub async fn dataset_set_user_properties(
        &self,
        name: &str,
        properties: &[(&str, String)],
    ) -> Result<(), ApiError> {
        let update: Vec<Value> = properties
            .iter()
            .map(|(key, value)| json!({ "key": key, "value": value }))
            .collect();
        self.call(
            "pool.dataset.update",
            json!([name, { "user_properties_update": update }]),
        )
        .await?;
        Ok(())
    }

    /// Remove CSI properties from a dataset, reverting them to inherited.
    pub async fn dataset_clear_user_properties(
        &self,
        name: &str,
        keys: &[&str],
    ) -> Result<(), ApiError> {
        let update: Vec<Value> = keys
            .iter()
            .map(|key| json!({ "key": key, "remove": true }))
            .collect();
        self.call(
            "pool.dataset.update",
            json!([name, { "user_properties_update": update }]),
        )
        .await?;
        Ok(())
    }

    /// Datasets under `prefix` whose user property `key` equals `value`.
    /// The appliance cannot filter on user properties server side, so the
    /// (already prefix-bounded) listing is filtered here.
    pub async fn dataset_find_by_property(
        &self,
        prefix: &str,
        key: &str,
        value: &str,
    ) -> Result<Vec<Dataset>, ApiError> {
        let datasets = self.dataset_query(prefix).await?;
        Ok(datasets
            .into_iter()
            .filter(|dataset| dataset.user_property(key) == Some(value))
            .collect())
    }

    /// Raw pool listing, passed through as the appliance reports it.
    pub async fn pool_query(&self) -> Result<Value, ApiError> {
        self.call("pool.query", json!([[], {}])).await
    }

    /// Locate the managed dataset backing the CSI volume `csi_name`.
    pub async fn dataset_find_by_csi_name(
        &self,
        prefix: &str,
        csi_name: &str,
    ) -> Result<Option<Dataset>, ApiError> {
        let matches = self
            .dataset_find_by_property(
                prefix,
                crate::property::PROPERTY_CSI_VOLUME_NAME,
                csi_name,
            )
            .await?;
        Ok(matches.into_iter().find(Dataset::is_managed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PROPERTY_PROTOCOL;

    fn sample() -> Dataset {
        serde_json::from_value(json!({
            "id": "tank/k8s/pvc-abc",
            "name": "tank/k8s/pvc-abc",
            "type": "VOLUME",
            "pool": "tank",
            "mountpoint": null,
            "volsize": { "rawvalue": "1073741824", "parsed": 1073741824u64, "value": "1G" },
            "user_properties": {
                "zetastor:managed_by": { "value": "zetastor-csi" },
                "zetastor:protocol": { "value": "nvmeof" },
                "zetastor:capacity_bytes": { "value": "1073741824" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn dataset_deserialises_appliance_shape() {
        let dataset = sample();
        assert_eq!(dataset.kind, DatasetType::Volume);
        assert!(dataset.is_managed());
        assert_eq!(dataset.user_property(PROPERTY_PROTOCOL), Some("nvmeof"));
        assert_eq!(dataset.zvol_capacity(), Some(1073741824));
        assert_eq!(dataset.capacity_bytes(), Some(1073741824));
    }

    #[test]
    fn capacity_prefers_declared_property() {
        let mut dataset = sample();
        dataset
            .user_properties
            .get_mut("zetastor:capacity_bytes")
            .unwrap()
            .value = "2147483648".into();
        assert_eq!(dataset.capacity_bytes(), Some(2147483648));
    }

    #[test]
    fn composite_value_falls_back_to_rawvalue() {
        let value = CompositeValue {
            rawvalue: Some("4096".into()),
            parsed: None,
            value: None,
        };
        assert_eq!(value.as_u64(), Some(4096));
    }

    #[test]
    fn empty_or_dash_property_reads_as_absent() {
        let mut dataset = sample();
        dataset
            .user_properties
            .get_mut("zetastor:protocol")
            .unwrap()
            .value = "-".into();
        assert_eq!(dataset.user_property(PROPERTY_PROTOCOL), None);
    }
}
