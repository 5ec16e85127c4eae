//! Dataset verbs: `pool.dataset.*` on the appliance. spec.md §4.1.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::client::Client;
use super::error::ApplianceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetType {
    Filesystem,
    Volume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(rename = "type")]
    pub dataset_type: DatasetType,
    pub mountpoint: Option<String>,
    pub volsize: Option<u64>,
    pub volblocksize: Option<u64>,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFilesystemArgs<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub dataset_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeArgs<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub dataset_type: &'static str,
    pub volsize: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volblocksize: Option<u64>,
}

impl Client {
    pub async fn dataset_create_filesystem(&self, name: &str) -> Result<Dataset, ApplianceError> {
        self.call("pool.dataset.create", (CreateFilesystemArgs { name, dataset_type: "FILESYSTEM" },))
            .await
    }

    pub async fn dataset_create_volume(&self, name: &str, volsize: u64, volblocksize: Option<u64>) -> Result<Dataset, ApplianceError> {
        self.call(
            "pool.dataset.create",
            (CreateVolumeArgs {
                name,
                dataset_type: "VOLUME",
                volsize,
                volblocksize,
            },),
        )
        .await
    }

    pub async fn dataset_delete(&self, name: &str, recursive: bool, force: bool) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self
            .call("pool.dataset.delete", (name, json!({"recursive": recursive, "force": force})))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn dataset_get(&self, name: &str) -> Result<Option<Dataset>, ApplianceError> {
        match self.call::<_, Dataset>("pool.dataset.get_instance", (name,)).await {
            Ok(d) => Ok(Some(d)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn dataset_query_prefix(&self, prefix: &str) -> Result<Vec<Dataset>, ApplianceError> {
        self.call("pool.dataset.query", (json!([["name", "^", prefix]]),)).await
    }

    pub async fn dataset_update_volsize(&self, name: &str, volsize: u64) -> Result<(), ApplianceError> {
        self.call("pool.dataset.update", (name, json!({"volsize": volsize}))).await
    }

    pub async fn dataset_update_quota(&self, name: &str, quota: u64, refquota: u64) -> Result<(), ApplianceError> {
        self.call("pool.dataset.update", (name, json!({"quota": quota, "refquota": refquota})))
            .await
    }

    pub async fn dataset_promote(&self, name: &str) -> Result<(), ApplianceError> {
        self.call("pool.dataset.promote", (name,)).await
    }

    pub async fn dataset_exists(&self, name: &str) -> Result<bool, ApplianceError> {
        Ok(self.dataset_get(name).await?.is_some())
    }
}
