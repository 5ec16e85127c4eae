//! ZFS snapshot/clone verbs. spec.md §4.1, §4.3.3, §4.3.4, §4.3.5.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::client::Client;
use super::error::ApplianceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZfsSnapshot {
    pub name: String,
    pub dataset: String,
    pub snapshot_name: String,
    #[serde(default)]
    pub properties: std::collections::HashMap<String, String>,
}

impl Client {
    pub async fn snapshot_create(&self, dataset: &str, name: &str) -> Result<ZfsSnapshot, ApplianceError> {
        self.call("zfs.snapshot.create", (json!({"dataset": dataset, "name": name}),)).await
    }

    pub async fn snapshot_delete(&self, full_name: &str) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self.call("zfs.snapshot.delete", (full_name,)).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `zfs clone`: `snapshot -> target`.
    pub async fn snapshot_clone(&self, snapshot_full_name: &str, target_dataset: &str) -> Result<(), ApplianceError> {
        self.call("zfs.snapshot.clone", (snapshot_full_name, target_dataset)).await
    }

    pub async fn snapshot_query_by_dataset(&self, dataset: &str) -> Result<Vec<ZfsSnapshot>, ApplianceError> {
        self.call("zfs.snapshot.query", (json!([["dataset", "=", dataset]]),)).await
    }

    /// Finds every snapshot across the whole appliance whose
    /// `snapshot_name` matches, to enforce CSI's global-uniqueness
    /// requirement (spec.md §3, §4.3.4). Never call this without a name
    /// filter on a large appliance (spec.md §4.3.5).
    pub async fn snapshot_query_by_name(&self, name: &str) -> Result<Vec<ZfsSnapshot>, ApplianceError> {
        self.call("zfs.snapshot.query", (json!([["snapshot_name", "=", name]]),)).await
    }
}
