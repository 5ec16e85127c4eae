//! NVMe-oF subsystem/namespace/port verbs. spec.md §3, §4.1, §4.2.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::client::Client;
use super::error::ApplianceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvmeSubsystem {
    pub id: u64,
    pub nqn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvmeNamespace {
    pub id: u64,
    pub subsystem_id: u64,
    pub nsid: u32,
    pub device_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvmePort {
    pub id: u64,
    pub addr_trtype: String,
    pub addr_traddr: String,
    pub addr_trsvcid: u16,
}

/// NSID is always 1 in this system: one namespace per subsystem.
/// spec.md §3, GLOSSARY.
pub const FIXED_NSID: u32 = 1;

impl Client {
    pub async fn nvmeof_subsystem_create(&self, nqn: &str) -> Result<NvmeSubsystem, ApplianceError> {
        self.call("nvmet.subsys.create", (json!({"nqn": nqn}),)).await
    }

    pub async fn nvmeof_subsystem_delete(&self, subsystem_id: u64) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self.call("nvmet.subsys.delete", (subsystem_id,)).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn nvmeof_subsystem_query_by_nqn(&self, nqn: &str) -> Result<Option<NvmeSubsystem>, ApplianceError> {
        let results: Vec<NvmeSubsystem> = self.call("nvmet.subsys.query", (json!([["nqn", "=", nqn]]),)).await?;
        Ok(results.into_iter().next())
    }

    pub async fn nvmeof_namespace_create(&self, subsystem_id: u64, device_path: &str) -> Result<NvmeNamespace, ApplianceError> {
        self.call(
            "nvmet.namespace.create",
            (json!({"subsys_id": subsystem_id, "nsid": FIXED_NSID, "device_path": device_path}),),
        )
        .await
    }

    pub async fn nvmeof_namespace_delete(&self, namespace_id: u64) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self.call("nvmet.namespace.delete", (namespace_id,)).await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn nvmeof_port_query(&self) -> Result<Vec<NvmePort>, ApplianceError> {
        self.call("nvmet.port.query", json!([])).await
    }

    pub async fn nvmeof_add_subsystem_to_port(&self, port_id: u64, subsystem_id: u64) -> Result<(), ApplianceError> {
        self.call("nvmet.port_subsys.create", (json!({"port_id": port_id, "subsys_id": subsystem_id}),))
            .await
    }

    pub async fn nvmeof_remove_subsystem_from_port(&self, port_id: u64, subsystem_id: u64) -> Result<(), ApplianceError> {
        let result: Result<serde_json::Value, ApplianceError> = self
            .call("nvmet.port_subsys.delete", (json!({"port_id": port_id, "subsys_id": subsystem_id}),))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
