//! Resource taxonomy (component B): the CSI <-> appliance entity mapping,
//! the ID codecs, and the ZFS user-property schema.

mod ids;
mod properties;

pub use ids::{CloneMode, ContentSourceType, DeleteStrategy, Protocol, SnapshotId, TaxonomyError, VolumeId};
pub use properties::{VolumeProperties, PROPERTY_PREFIX};

/// Value of the `managed_by` user property on every dataset this plugin owns.
pub const MANAGED_BY_SENTINEL: &str = "appliance-csi";
