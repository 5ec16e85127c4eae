//! Appliance client (component A): connection lifecycle, JSON-RPC
//! multiplexing, and typed resource verbs over a single WebSocket. spec.md
//! §4.1.

mod client;
mod dataset;
mod error;
mod iscsi;
mod nfs;
mod nvmeof;
mod property;
mod replication;
mod snapshot;

pub use client::{Client, ClientConfig, DEFAULT_CALL_TIMEOUT};
pub use dataset::{Dataset, DatasetType};
pub use error::ApplianceError;
pub use iscsi::{IscsiExtent, IscsiTarget, IscsiTargetExtent};
pub use nfs::NfsShare;
pub use nvmeof::{NvmeNamespace, NvmePort, NvmeSubsystem, FIXED_NSID};
pub use replication::{TransportMode, EXCLUDED_REPLICATION_PROPERTIES};
pub use snapshot::ZfsSnapshot;
