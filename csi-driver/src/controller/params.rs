//! Class parameter parsing (spec.md §6 "Class parameters").

use std::collections::HashMap;

use crate::error::EngineError;
use crate::taxonomy::Protocol;

#[derive(Debug, Clone)]
pub struct VolumeClassParams {
    pub protocol: Protocol,
    pub pool: Option<String>,
    pub parent_dataset: Option<String>,
    pub server: Option<String>,
    pub subsystem_nqn: Option<String>,
    pub fs_type: Option<String>,
    pub mount_options: Vec<String>,
    pub nvme_nr_io_queues: Option<u32>,
    pub nvme_queue_size: Option<u32>,
    pub promoted_from_snapshots: bool,
    pub promoted_from_volumes: bool,
    pub detached_from_snapshots: bool,
    pub detached_from_volumes: bool,
}

fn truthy(v: &str) -> bool {
    matches!(v, "true" | "True" | "TRUE" | "1")
}

impl VolumeClassParams {
    pub fn parse(params: &HashMap<String, String>) -> Result<Self, EngineError> {
        let protocol = params
            .get("protocol")
            .ok_or_else(|| EngineError::InvalidArgument("missing required class parameter 'protocol'".to_string()))?
            .parse::<Protocol>()
            .map_err(|e| EngineError::InvalidArgument(e.to_string()))?;

        Ok(Self {
            protocol,
            pool: params.get("pool").cloned(),
            parent_dataset: params.get("parentDataset").cloned(),
            server: params.get("server").cloned(),
            subsystem_nqn: params.get("subsystemNQN").cloned(),
            fs_type: params.get("fsType").cloned(),
            mount_options: params
                .get("mountOptions")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            nvme_nr_io_queues: params.get("nvmeof.nr-io-queues").and_then(|v| v.parse().ok()),
            nvme_queue_size: params.get("nvmeof.queue-size").and_then(|v| v.parse().ok()),
            promoted_from_snapshots: params.get("promotedVolumesFromSnapshots").map(|v| truthy(v)).unwrap_or(false),
            promoted_from_volumes: params.get("promotedVolumesFromVolumes").map(|v| truthy(v)).unwrap_or(false),
            detached_from_snapshots: params.get("detachedVolumesFromSnapshots").map(|v| truthy(v)).unwrap_or(false),
            detached_from_volumes: params.get("detachedVolumesFromVolumes").map(|v| truthy(v)).unwrap_or(false),
        })
    }

    pub fn resolve_parent(&self) -> Result<String, EngineError> {
        if let Some(p) = &self.parent_dataset {
            return Ok(p.clone());
        }
        if let Some(pool) = &self.pool {
            return Ok(pool.clone());
        }
        Err(EngineError::InvalidArgument(
            "one of 'parentDataset' or 'pool' is required".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotClassParams {
    pub detached: bool,
    pub detached_parent_dataset: Option<String>,
}

impl SnapshotClassParams {
    pub fn parse(params: &HashMap<String, String>) -> Self {
        Self {
            detached: params.get("detachedSnapshots").map(|v| truthy(v)).unwrap_or(false),
            detached_parent_dataset: params.get("detachedSnapshotsParentDataset").cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_nfs_params() {
        let mut p = HashMap::new();
        p.insert("protocol".to_string(), "nfs".to_string());
        p.insert("parentDataset".to_string(), "tank/k8s".to_string());
        let parsed = VolumeClassParams::parse(&p).unwrap();
        assert_eq!(parsed.protocol, Protocol::Nfs);
        assert_eq!(parsed.resolve_parent().unwrap(), "tank/k8s");
    }

    #[test]
    fn missing_protocol_is_invalid_argument() {
        let p = HashMap::new();
        assert!(VolumeClassParams::parse(&p).is_err());
    }

    #[test]
    fn missing_parent_and_pool_is_invalid_argument() {
        let mut p = HashMap::new();
        p.insert("protocol".to_string(), "nvmeof".to_string());
        let parsed = VolumeClassParams::parse(&p).unwrap();
        assert!(parsed.resolve_parent().is_err());
    }

    #[test]
    fn truthy_flags_accept_common_spellings() {
        let mut p = HashMap::new();
        p.insert("protocol".to_string(), "nfs".to_string());
        p.insert("pool".to_string(), "tank".to_string());
        p.insert("promotedVolumesFromSnapshots".to_string(), "true".to_string());
        let parsed = VolumeClassParams::parse(&p).unwrap();
        assert!(parsed.promoted_from_snapshots);
        assert!(!parsed.detached_from_snapshots);
    }

    #[test]
    fn mount_options_split_and_trim() {
        let mut p = HashMap::new();
        p.insert("protocol".to_string(), "nvmeof".to_string());
        p.insert("pool".to_string(), "tank".to_string());
        p.insert("mountOptions".to_string(), "noatime, nodiratime".to_string());
        let parsed = VolumeClassParams::parse(&p).unwrap();
        assert_eq!(parsed.mount_options, vec!["noatime", "nodiratime"]);
    }
}
