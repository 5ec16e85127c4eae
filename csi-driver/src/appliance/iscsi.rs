//! iSCSI target/extent/target-extent verbs. spec.md §3, §4.1, §4.2.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::client::Client;
use super::error::ApplianceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IscsiTarget {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IscsiExtent {
    pub id: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IscsiTargetExtent {
    pub id: u64,
    pub target_id: u64,
    pub extent_id: u64,
}

impl Client {
    pub async fn iscsi_target_create(&self, name: &str) -> Result<IscsiTarget, ApplianceError> {
        self.call("iscsi.target.create", (json!({"name": name}),)).await
    }

    pub async fn iscsi_target_delete(&self, target_id: u64) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self.call("iscsi.target.delete", (target_id,)).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn iscsi_extent_create(&self, name: &str, device_path: &str) -> Result<IscsiExtent, ApplianceError> {
        self.call("iscsi.extent.create", (json!({"name": name, "path": device_path, "type": "DISK"}),))
            .await
    }

    pub async fn iscsi_extent_delete(&self, extent_id: u64) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self.call("iscsi.extent.delete", (extent_id,)).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn iscsi_targetextent_create(&self, target_id: u64, extent_id: u64) -> Result<IscsiTargetExtent, ApplianceError> {
        self.call("iscsi.targetextent.create", (json!({"target": target_id, "extent": extent_id, "lunid": 0}),))
            .await
    }

    pub async fn iscsi_targetextent_delete(&self, id: u64) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self.call("iscsi.targetextent.delete", (id,)).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn iscsi_service_reload(&self) -> Result<(), ApplianceError> {
        self.call("service.reload", ("iscsitarget",)).await
    }

    pub async fn iscsi_target_query_by_name(&self, name: &str) -> Result<Vec<IscsiTarget>, ApplianceError> {
        self.call("iscsi.target.query", (json!([["name", "=", name]]),)).await
    }

    pub async fn iscsi_extent_query_by_name(&self, name: &str) -> Result<Vec<IscsiExtent>, ApplianceError> {
        self.call("iscsi.extent.query", (json!([["name", "=", name]]),)).await
    }

    pub async fn iscsi_targetextent_query_by_target(&self, target_id: u64) -> Result<Vec<IscsiTargetExtent>, ApplianceError> {
        self.call("iscsi.targetextent.query", (json!([["target", "=", target_id]]),)).await
    }
}
