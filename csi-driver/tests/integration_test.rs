//! Integration tests exercising the Identity/Node gRPC services directly
//! against `csi_driver`, without requiring a live appliance connection or
//! real iSCSI/NVMe-oF/filesystem state.

use std::collections::HashMap;

use csi_driver::csi;
use csi_driver::csi::identity_server::Identity;
use csi_driver::csi::node_server::Node;
use csi_driver::{IdentityService, NodeService};
use tonic::Request;

fn node_service() -> NodeService {
    NodeService::new("test-node", 4)
}

#[tokio::test]
async fn get_plugin_info_reports_driver_name_and_version() {
    let svc = IdentityService::new("appliance.csi.example.com");
    let resp = Identity::get_plugin_info(&svc, Request::new(csi::GetPluginInfoRequest {})).await.unwrap();
    let info = resp.into_inner();
    assert_eq!(info.name, "appliance.csi.example.com");
    assert!(!info.vendor_version.is_empty());
}

#[tokio::test]
async fn identity_probe_reports_ready_without_explicit_readiness_state() {
    let svc = IdentityService::new("appliance.csi.example.com");
    let resp = Identity::probe(&svc, Request::new(csi::ProbeRequest {})).await.unwrap();
    assert_eq!(resp.into_inner().ready, Some(true));
}

#[tokio::test]
async fn node_get_capabilities_advertises_stage_unstage_and_expand() {
    let svc = node_service();
    let resp = Node::node_get_capabilities(&svc, Request::new(csi::NodeGetCapabilitiesRequest {})).await.unwrap();
    let caps = resp.into_inner().capabilities;
    assert_eq!(caps.len(), 2);
}

#[tokio::test]
async fn node_get_info_reports_configured_node_id() {
    let svc = node_service();
    let resp = Node::node_get_info(&svc, Request::new(csi::NodeGetInfoRequest {})).await.unwrap();
    assert_eq!(resp.into_inner().node_id, "test-node");
}

#[tokio::test]
async fn node_stage_volume_rejects_missing_staging_target_path() {
    let svc = node_service();
    let req = Request::new(csi::NodeStageVolumeRequest {
        volume_id: "vol1".to_string(),
        staging_target_path: String::new(),
        volume_capability: None,
        volume_context: HashMap::new(),
        publish_context: HashMap::new(),
        secrets: HashMap::new(),
    });
    let err = Node::node_stage_volume(&svc, req).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn node_stage_volume_rejects_missing_protocol_in_volume_context() {
    let svc = node_service();
    let req = Request::new(csi::NodeStageVolumeRequest {
        volume_id: "vol1".to_string(),
        staging_target_path: "/var/lib/kubelet/staging/vol1".to_string(),
        volume_capability: None,
        volume_context: HashMap::new(),
        publish_context: HashMap::new(),
        secrets: HashMap::new(),
    });
    let err = Node::node_stage_volume(&svc, req).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
    assert!(err.message().contains("protocol"));
}

#[tokio::test]
async fn node_publish_volume_rejects_missing_target_path() {
    let svc = node_service();
    let req = Request::new(csi::NodePublishVolumeRequest {
        volume_id: "vol1".to_string(),
        staging_target_path: "/staging/vol1".to_string(),
        target_path: String::new(),
        volume_capability: None,
        readonly: false,
        volume_context: HashMap::new(),
        publish_context: HashMap::new(),
        secrets: HashMap::new(),
    });
    let err = Node::node_publish_volume(&svc, req).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn node_get_volume_stats_is_unimplemented() {
    let svc = node_service();
    let req = Request::new(csi::NodeGetVolumeStatsRequest {
        volume_id: "vol1".to_string(),
        volume_path: "/var/lib/kubelet/vol1".to_string(),
        staging_target_path: String::new(),
    });
    let err = Node::node_get_volume_stats(&svc, req).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unimplemented);
}
