use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of an encoded snapshot ID, per the CSI spec's own limit.
const MAX_SNAPSHOT_ID_BYTES: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TaxonomyError {
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),

    #[error("unknown clone mode '{0}'")]
    UnknownCloneMode(String),

    #[error("unknown delete strategy '{0}'")]
    UnknownDeleteStrategy(String),

    #[error("unknown content source type '{0}'")]
    UnknownContentSourceType(String),

    #[error("snapshot id has an empty {0}")]
    EmptySnapshotIdField(&'static str),

    #[error("snapshot id exceeds {MAX_SNAPSHOT_ID_BYTES} bytes")]
    SnapshotIdTooLong,

    #[error("malformed snapshot id '{0}'")]
    MalformedSnapshotId(String),
}

/// Transport protocol a volume is materialised over. See spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Nfs,
    Nvmeof,
    Iscsi,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Nfs => "nfs",
            Protocol::Nvmeof => "nvmeof",
            Protocol::Iscsi => "iscsi",
        })
    }
}

impl FromStr for Protocol {
    type Err = TaxonomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nfs" => Ok(Protocol::Nfs),
            "nvmeof" => Ok(Protocol::Nvmeof),
            "iscsi" => Ok(Protocol::Iscsi),
            other => Err(TaxonomyError::UnknownProtocol(other.to_string())),
        }
    }
}

/// What happens to the backing dataset on DeleteVolume. spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteStrategy {
    Delete,
    Retain,
}

impl fmt::Display for DeleteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeleteStrategy::Delete => "delete",
            DeleteStrategy::Retain => "retain",
        })
    }
}

impl FromStr for DeleteStrategy {
    type Err = TaxonomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(DeleteStrategy::Delete),
            "retain" => Ok(DeleteStrategy::Retain),
            other => Err(TaxonomyError::UnknownDeleteStrategy(other.to_string())),
        }
    }
}

/// Where a volume's initial content came from. spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentSourceType {
    None,
    Snapshot,
    Volume,
}

impl fmt::Display for ContentSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContentSourceType::None => "none",
            ContentSourceType::Snapshot => "snapshot",
            ContentSourceType::Volume => "volume",
        })
    }
}

impl FromStr for ContentSourceType {
    type Err = TaxonomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ContentSourceType::None),
            "snapshot" => Ok(ContentSourceType::Snapshot),
            "volume" => Ok(ContentSourceType::Volume),
            other => Err(TaxonomyError::UnknownContentSourceType(other.to_string())),
        }
    }
}

/// Clone strategy selected for a volume created from a content source.
/// spec.md §4.3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    Cow,
    Promoted,
    Detached,
}

impl fmt::Display for CloneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloneMode::Cow => "cow",
            CloneMode::Promoted => "promoted",
            CloneMode::Detached => "detached",
        })
    }
}

impl FromStr for CloneMode {
    type Err = TaxonomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cow" => Ok(CloneMode::Cow),
            "promoted" => Ok(CloneMode::Promoted),
            "detached" => Ok(CloneMode::Detached),
            other => Err(TaxonomyError::UnknownCloneMode(other.to_string())),
        }
    }
}

/// The external identifier of a CSI volume.
///
/// New volumes always use the canonical full dataset path
/// (`pool/parent/leaf`); legacy volumes may carry a bare leaf name and must
/// be resolved by property search instead of direct path lookup. See
/// spec.md §3 and §9 ("ID schemes").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(String);

impl VolumeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A canonical ID is a full dataset path and can be used directly as a
    /// `zfs` identity without a property search.
    pub fn is_canonical(&self) -> bool {
        self.0.contains('/')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Either a regular ZFS snapshot or a detached snapshot dataset.
/// spec.md §3 and §4.2 ("ID codec").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotId {
    pub detached: bool,
    pub protocol: Protocol,
    pub source_volume_id: VolumeId,
    pub name: String,
}

impl SnapshotId {
    pub fn encode(&self) -> Result<String, TaxonomyError> {
        if self.source_volume_id.as_str().is_empty() {
            return Err(TaxonomyError::EmptySnapshotIdField("source volume id"));
        }
        if self.name.is_empty() {
            return Err(TaxonomyError::EmptySnapshotIdField("name"));
        }

        let body = format!("{}:{}@{}", self.protocol, self.source_volume_id, self.name);
        let encoded = if self.detached {
            format!("detached:{body}")
        } else {
            body
        };

        if encoded.len() > MAX_SNAPSHOT_ID_BYTES {
            return Err(TaxonomyError::SnapshotIdTooLong);
        }
        Ok(encoded)
    }

    pub fn decode(s: &str) -> Result<Self, TaxonomyError> {
        let (detached, rest) = match s.strip_prefix("detached:") {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (protocol_str, remainder) = rest
            .split_once(':')
            .ok_or_else(|| TaxonomyError::MalformedSnapshotId(s.to_string()))?;
        let protocol = protocol_str.parse::<Protocol>()?;

        let (source_volume_id, name) = remainder
            .rsplit_once('@')
            .ok_or_else(|| TaxonomyError::MalformedSnapshotId(s.to_string()))?;

        if source_volume_id.is_empty() {
            return Err(TaxonomyError::EmptySnapshotIdField("source volume id"));
        }
        if name.is_empty() {
            return Err(TaxonomyError::EmptySnapshotIdField("name"));
        }

        Ok(SnapshotId {
            detached,
            protocol,
            source_volume_id: VolumeId::new(source_volume_id),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_round_trips() {
        for p in [Protocol::Nfs, Protocol::Nvmeof, Protocol::Iscsi] {
            assert_eq!(p.to_string().parse::<Protocol>().unwrap(), p);
        }
    }

    #[test]
    fn protocol_rejects_unknown() {
        assert!("smb".parse::<Protocol>().is_err());
    }

    #[test]
    fn snapshot_id_round_trip_regular() {
        let id = SnapshotId {
            detached: false,
            protocol: Protocol::Nfs,
            source_volume_id: VolumeId::new("tank/k8s/src"),
            name: "snap1".to_string(),
        };
        let encoded = id.encode().unwrap();
        assert_eq!(encoded, "nfs:tank/k8s/src@snap1");
        assert_eq!(SnapshotId::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn snapshot_id_round_trip_detached() {
        let id = SnapshotId {
            detached: true,
            protocol: Protocol::Nvmeof,
            source_volume_id: VolumeId::new("tank/k8s/vol1"),
            name: "snap-dr".to_string(),
        };
        let encoded = id.encode().unwrap();
        assert_eq!(encoded, "detached:nvmeof:tank/k8s/vol1@snap-dr");
        assert_eq!(SnapshotId::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn encode_rejects_empty_fields() {
        let id = SnapshotId {
            detached: false,
            protocol: Protocol::Nfs,
            source_volume_id: VolumeId::new(""),
            name: "snap1".to_string(),
        };
        assert!(matches!(
            id.encode(),
            Err(TaxonomyError::EmptySnapshotIdField("source volume id"))
        ));

        let id = SnapshotId {
            detached: false,
            protocol: Protocol::Nfs,
            source_volume_id: VolumeId::new("tank/src"),
            name: "".to_string(),
        };
        assert!(matches!(
            id.encode(),
            Err(TaxonomyError::EmptySnapshotIdField("name"))
        ));
    }

    #[test]
    fn decode_rejects_unknown_protocol() {
        assert!(SnapshotId::decode("smb:tank/src@snap1").is_err());
    }

    #[test]
    fn decode_rejects_malformed_separators() {
        assert!(SnapshotId::decode("nfs-tank-src-snap1").is_err());
        assert!(SnapshotId::decode("nfs:tank/src").is_err());
    }

    #[test]
    fn decode_legacy_bare_source_volume_id() {
        // Legacy volume IDs have no '/'; the codec still round-trips, the
        // engine is responsible for resolving them via property search.
        let id = SnapshotId::decode("iscsi:legacyvol@snap1").unwrap();
        assert!(!id.source_volume_id.is_canonical());
    }
}
