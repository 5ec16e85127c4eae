use std::collections::HashMap;

use super::ids::{CloneMode, ContentSourceType, DeleteStrategy, Protocol, TaxonomyError};
use super::MANAGED_BY_SENTINEL;

/// Namespace prefix for every ZFS user property this plugin writes, to
/// avoid collision with appliance-native properties. spec.md §3.
pub const PROPERTY_PREFIX: &str = "csi";

fn key(name: &str) -> String {
    format!("{PROPERTY_PREFIX}:{name}")
}

/// The CSI-visible metadata carried on a backing dataset's ZFS user
/// properties. Each field is its own individual property (see
/// SPEC_FULL.md §3), not a single serialized blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeProperties {
    pub managed_by: String,
    pub csi_volume_name: String,
    pub protocol: Protocol,
    pub capacity_bytes: u64,
    pub delete_strategy: DeleteStrategy,
    pub content_source_type: ContentSourceType,
    pub content_source_id: Option<String>,
    pub clone_mode: Option<CloneMode>,
    pub origin_snapshot: Option<String>,
    pub nfs_share_path: Option<String>,
    pub nvme_subsystem_nqn: Option<String>,
    pub snapshot_id: Option<String>,
    pub source_volume_id: Option<String>,
    pub detached_snapshot: Option<bool>,
    pub source_dataset: Option<String>,
}

impl VolumeProperties {
    pub fn new(csi_volume_name: impl Into<String>, protocol: Protocol, capacity_bytes: u64) -> Self {
        Self {
            managed_by: MANAGED_BY_SENTINEL.to_string(),
            csi_volume_name: csi_volume_name.into(),
            protocol,
            capacity_bytes,
            delete_strategy: DeleteStrategy::Delete,
            content_source_type: ContentSourceType::None,
            content_source_id: None,
            clone_mode: None,
            origin_snapshot: None,
            nfs_share_path: None,
            nvme_subsystem_nqn: None,
            snapshot_id: None,
            source_volume_id: None,
            detached_snapshot: None,
            source_dataset: None,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.managed_by == MANAGED_BY_SENTINEL
    }

    /// Flatten into the `key -> value` pairs the appliance client sets via
    /// `property.set`. Only `Some` optional fields are emitted.
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        out.insert(key("managed_by"), self.managed_by.clone());
        out.insert(key("csi_volume_name"), self.csi_volume_name.clone());
        out.insert(key("protocol"), self.protocol.to_string());
        out.insert(key("capacity_bytes"), self.capacity_bytes.to_string());
        out.insert(key("delete_strategy"), self.delete_strategy.to_string());
        out.insert(key("content_source_type"), self.content_source_type.to_string());

        if let Some(v) = &self.content_source_id {
            out.insert(key("content_source_id"), v.clone());
        }
        if let Some(v) = self.clone_mode {
            out.insert(key("clone_mode"), v.to_string());
        }
        if let Some(v) = &self.origin_snapshot {
            out.insert(key("origin_snapshot"), v.clone());
        }
        if let Some(v) = &self.nfs_share_path {
            out.insert(key("nfs_share_path"), v.clone());
        }
        if let Some(v) = &self.nvme_subsystem_nqn {
            out.insert(key("nvme_subsystem_nqn"), v.clone());
        }
        if let Some(v) = &self.snapshot_id {
            out.insert(key("snapshot_id"), v.clone());
        }
        if let Some(v) = &self.source_volume_id {
            out.insert(key("source_volume_id"), v.clone());
        }
        if let Some(v) = self.detached_snapshot {
            out.insert(key("detached_snapshot"), v.to_string());
        }
        if let Some(v) = &self.source_dataset {
            out.insert(key("source_dataset"), v.clone());
        }
        out
    }

    /// Reconstruct from the raw property map the appliance client returns
    /// via `property.get_all`. Required fields missing or unparsable fail;
    /// this is how the engine decides a dataset is not (or no longer)
    /// CSI-managed.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, TaxonomyError> {
        let get = |name: &str| props.get(&key(name)).cloned();

        let managed_by = get("managed_by").unwrap_or_default();
        let csi_volume_name = get("csi_volume_name").unwrap_or_default();
        let protocol = get("protocol")
            .unwrap_or_default()
            .parse::<Protocol>()?;
        let capacity_bytes = get("capacity_bytes")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let delete_strategy = get("delete_strategy")
            .unwrap_or_else(|| "delete".to_string())
            .parse::<DeleteStrategy>()?;
        let content_source_type = get("content_source_type")
            .unwrap_or_else(|| "none".to_string())
            .parse::<ContentSourceType>()?;

        let clone_mode = get("clone_mode")
            .map(|v| v.parse::<CloneMode>())
            .transpose()?;
        let detached_snapshot = get("detached_snapshot").map(|v| v == "true");

        Ok(Self {
            managed_by,
            csi_volume_name,
            protocol,
            capacity_bytes,
            delete_strategy,
            content_source_type,
            content_source_id: get("content_source_id"),
            clone_mode,
            origin_snapshot: get("origin_snapshot"),
            nfs_share_path: get("nfs_share_path"),
            nvme_subsystem_nqn: get("nvme_subsystem_nqn"),
            snapshot_id: get("snapshot_id"),
            source_volume_id: get("source_volume_id"),
            detached_snapshot,
            source_dataset: get("source_dataset"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_property_map() {
        let mut props = VolumeProperties::new("pvc-abc", Protocol::Nfs, 1024);
        props.content_source_type = ContentSourceType::Snapshot;
        props.clone_mode = Some(CloneMode::Promoted);
        props.detached_snapshot = Some(true);

        let map = props.to_properties();
        let restored = VolumeProperties::from_properties(&map).unwrap();
        assert_eq!(props, restored);
    }

    #[test]
    fn unmanaged_dataset_reports_not_managed() {
        let mut props = HashMap::new();
        props.insert(key("managed_by"), "someone-else".to_string());
        props.insert(key("protocol"), "nfs".to_string());
        let restored = VolumeProperties::from_properties(&props).unwrap();
        assert!(!restored.is_managed());
    }

    #[test]
    fn missing_properties_yield_defaults_not_panics() {
        let props = HashMap::new();
        // protocol is required and unparsable when absent ("" is not a
        // known protocol); the engine treats this as "not managed".
        assert!(VolumeProperties::from_properties(&props).is_err());
    }
}
