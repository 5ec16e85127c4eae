//! CSI driver for a ZFS-based network storage appliance.
//!
//! Serves Kubernetes over gRPC on two UNIX sockets (Controller, Node) and
//! talks to the appliance itself over JSON-RPC 2.0 on a WebSocket.

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod appliance;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod retry;
pub mod taxonomy;

pub use controller::ControllerService;
pub use identity::IdentityService;
pub use node::NodeService;
