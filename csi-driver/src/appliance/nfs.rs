//! NFS share verbs. spec.md §4.1, §4.2.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::client::Client;
use super::error::ApplianceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NfsShare {
    pub id: u64,
    pub path: String,
}

impl Client {
    pub async fn nfs_share_create(&self, path: &str) -> Result<NfsShare, ApplianceError> {
        self.call("sharing.nfs.create", (json!({"path": path}),)).await
    }

    pub async fn nfs_share_delete(&self, share_id: u64) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self.call("sharing.nfs.delete", (share_id,)).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn nfs_share_query_by_path(&self, path: &str) -> Result<Vec<NfsShare>, ApplianceError> {
        self.call("sharing.nfs.query", (json!([["path", "=", path]]),)).await
    }
}
