//! CSI Node Service Implementation (component D).
//!
//! Realises a CSI volume as a usable block device or mounted filesystem
//! on this host: NVMe-oF via the state machine in `nvme`, iSCSI/NFS via
//! direct shell-outs (no state machine needed for those, spec.md §4.4).

mod nvme;
mod stage;

use std::future::Future;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::csi;
use crate::error::EngineError;
use crate::metrics::OperationTimer;
use crate::platform::linux;
use crate::taxonomy::Protocol;

pub use nvme::NvmeParams;

/// Times an RPC body and records it under `operation`, success or failure.
async fn timed<T, Fut>(operation: &'static str, fut: Fut) -> Result<Response<T>, Status>
where
    Fut: Future<Output = Result<Response<T>, Status>>,
{
    let timer = OperationTimer::new(operation);
    match fut.await {
        Ok(resp) => {
            timer.success();
            Ok(resp)
        }
        Err(status) => {
            timer.failure(&format!("{:?}", status.code()));
            Err(status)
        }
    }
}

async fn run(program: &str, args: &[&str], budget: Duration) -> Result<std::process::Output, EngineError> {
    let fut = Command::new(program).args(args).output();
    match timeout(budget, fut).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(EngineError::Internal(format!("failed to execute {program}: {e}"))),
        Err(_) => Err(EngineError::DeadlineExceeded(format!("{program} {args:?} timed out after {budget:?}"))),
    }
}

/// CSI Node Service: stages/unstages/publishes volumes on this host.
pub struct NodeService {
    node_id: String,
    attach_semaphore: Semaphore,
}

impl NodeService {
    pub fn new(node_id: impl Into<String>, attach_concurrency: usize) -> Self {
        Self {
            node_id: node_id.into(),
            attach_semaphore: Semaphore::new(attach_concurrency.max(1)),
        }
    }

    fn protocol(context: &std::collections::HashMap<String, String>) -> Result<Protocol, Status> {
        context
            .get("protocol")
            .ok_or_else(|| Status::invalid_argument("volume_context missing 'protocol'"))?
            .parse::<Protocol>()
            .map_err(|e| Status::invalid_argument(e.to_string()))
    }

    fn is_block(capability: &Option<csi::VolumeCapability>) -> bool {
        matches!(
            capability.as_ref().and_then(|c| c.access_type.as_ref()),
            Some(csi::volume_capability::AccessType::Block(_))
        )
    }

    fn mount_flags(capability: &Option<csi::VolumeCapability>) -> Vec<String> {
        match capability.as_ref().and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(m)) => m.mount_flags.clone(),
            _ => Vec::new(),
        }
    }

    fn fs_type(capability: &Option<csi::VolumeCapability>) -> String {
        match capability.as_ref().and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(m)) if !m.fs_type.is_empty() => m.fs_type.clone(),
            _ => linux::default_fs_type().to_string(),
        }
    }

    async fn attach_device(&self, context: &std::collections::HashMap<String, String>) -> Result<(Protocol, Option<String>), Status> {
        let protocol = Self::protocol(context)?;
        let device = match protocol {
            Protocol::Nvmeof => {
                let params = NvmeParams::parse(context).map_err(Status::from)?;
                Some(nvme::attach(&params, &self.attach_semaphore).await.map_err(Status::from)?)
            }
            Protocol::Iscsi => {
                let iqn = context.get("iqn").ok_or_else(|| Status::invalid_argument("volume_context missing 'iqn'"))?.clone();
                let portal = context.get("server").map(String::as_str);
                let portal_owned = portal.map(str::to_string);
                Some(
                    tokio::task::spawn_blocking(move || linux::connect_iscsi(&iqn, portal_owned.as_deref()))
                        .await
                        .map_err(|e| Status::internal(format!("iscsi connect task panicked: {e}")))?
                        .map_err(Status::from)?,
                )
            }
            Protocol::Nfs => None,
        };
        Ok((protocol, device))
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn node_stage_volume(&self, request: Request<csi::NodeStageVolumeRequest>) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        timed("node_stage_volume", async move {
            let req = request.into_inner();
            if req.staging_target_path.is_empty() {
                return Err(Status::invalid_argument("staging_target_path is required"));
            }

            let staging_path = req.staging_target_path.clone();
            let already_staged = tokio::task::spawn_blocking(move || linux::is_mounted(&staging_path))
                .await
                .map_err(|e| Status::internal(format!("is_mounted task panicked: {e}")))?
                .map_err(Status::from)?;
            if already_staged {
                debug!(volume_id = %req.volume_id, staging_target_path = %req.staging_target_path, "node_stage_volume: already staged");
                return Ok(Response::new(csi::NodeStageVolumeResponse {}));
            }

            let (protocol, device) = self.attach_device(&req.volume_context).await?;

            match protocol {
                Protocol::Nfs => {
                    let server = req.volume_context.get("server").ok_or_else(|| Status::invalid_argument("volume_context missing 'server'"))?;
                    let dataset = req.volume_context.get("datasetName").ok_or_else(|| Status::invalid_argument("volume_context missing 'datasetName'"))?;
                    let share = format!("{server}:/mnt/{dataset}");
                    nfs_mount(&share, &req.staging_target_path).await.map_err(Status::from)?;
                }
                Protocol::Nvmeof | Protocol::Iscsi => {
                    let device = device.ok_or_else(|| Status::internal("attach succeeded without a device path"))?;
                    if Self::is_block(&req.volume_capability) {
                        stage::stage_raw_block(&device, &req.staging_target_path).await.map_err(Status::from)?;
                    } else {
                        let fs_type = Self::fs_type(&req.volume_capability);
                        let mount_flags = Self::mount_flags(&req.volume_capability);
                        let expected_capacity = req.volume_context.get("expectedCapacity").and_then(|v| v.parse::<u64>().ok());
                        let cloned_from_snapshot = req.volume_context.get("clonedFromSnapshot").map(|v| v == "true").unwrap_or(false);
                        stage::stage_filesystem(&device, &req.staging_target_path, &fs_type, &mount_flags, expected_capacity, cloned_from_snapshot)
                            .await
                            .map_err(Status::from)?;
                    }
                }
            }

            info!(volume_id = %req.volume_id, staging_target_path = %req.staging_target_path, "volume staged");
            Ok(Response::new(csi::NodeStageVolumeResponse {}))
        })
        .await
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn node_unstage_volume(&self, request: Request<csi::NodeUnstageVolumeRequest>) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        timed("node_unstage_volume", async move {
            let req = request.into_inner();

            let staging_path = req.staging_target_path.clone();
            let was_mounted = tokio::task::spawn_blocking({
                let staging_path = staging_path.clone();
                move || linux::is_mounted(&staging_path)
            })
            .await
            .map_err(|e| Status::internal(format!("is_mounted task panicked: {e}")))?
            .map_err(Status::from)?;

            // Resolved before unmounting: once the staging path is unmounted
            // there's no way left to recover what backed it (volume_context
            // isn't passed to NodeUnstageVolume by the CSI spec).
            let backing_source = {
                let staging_path = staging_path.clone();
                tokio::task::spawn_blocking(move || resolve_staged_device(&staging_path))
                    .await
                    .map_err(|e| Status::internal(format!("resolve device task panicked: {e}")))?
            };

            if was_mounted {
                tokio::task::spawn_blocking({
                    let staging_path = staging_path.clone();
                    move || linux::unmount(&staging_path)
                })
                .await
                .map_err(|e| Status::internal(format!("unmount task panicked: {e}")))?
                .map_err(Status::from)?;
            }

            match backing_source.as_deref() {
                Some(device) if device.starts_with("/dev/nvme") => {
                    let nqn = nvme::nqn_from_device(device).await.map_err(Status::from)?;
                    nvme::detach(&nqn).await.map_err(Status::from)?;
                }
                Some(source) => {
                    debug_teardown_skip(&req.volume_id, source);
                }
                None => {
                    warn!(volume_id = %req.volume_id, "node_unstage_volume: could not determine the backing device, assuming already torn down");
                }
            }

            Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
        })
        .await
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn node_publish_volume(&self, request: Request<csi::NodePublishVolumeRequest>) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        timed("node_publish_volume", async move {
            let req = request.into_inner();
            if req.target_path.is_empty() {
                return Err(Status::invalid_argument("target_path is required"));
            }

            let source = req.staging_target_path.clone();
            let target = req.target_path.clone();
            if Self::is_block(&req.volume_capability) {
                if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
                    if let Some(parent) = std::path::Path::new(&target).parent() {
                        tokio::fs::create_dir_all(parent).await.map_err(|e| Status::internal(format!("failed to create target directory: {e}")))?;
                    }
                    tokio::fs::File::create(&target).await.map_err(|e| Status::internal(format!("failed to create target file: {e}")))?;
                }
            }

            tokio::task::spawn_blocking(move || linux::bind_mount(&source, &target))
                .await
                .map_err(|e| Status::internal(format!("bind mount task panicked: {e}")))?
                .map_err(Status::from)?;

            Ok(Response::new(csi::NodePublishVolumeResponse {}))
        })
        .await
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn node_unpublish_volume(&self, request: Request<csi::NodeUnpublishVolumeRequest>) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        timed("node_unpublish_volume", async move {
            let req = request.into_inner();
            let target = req.target_path.clone();
            tokio::task::spawn_blocking(move || linux::unmount(&target))
                .await
                .map_err(|e| Status::internal(format!("unmount task panicked: {e}")))?
                .map_err(Status::from)?;
            Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
        })
        .await
    }

    async fn node_get_volume_stats(&self, _request: Request<csi::NodeGetVolumeStatsRequest>) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("NodeGetVolumeStats is not supported"))
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn node_expand_volume(&self, request: Request<csi::NodeExpandVolumeRequest>) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        timed("node_expand_volume", async move {
            let req = request.into_inner();
            let path = if !req.volume_path.is_empty() { req.volume_path.clone() } else { req.staging_target_path.clone() };

            let device = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || resolve_mounted_device(&path))
                    .await
                    .map_err(|e| Status::internal(format!("resolve device task panicked: {e}")))?
                    .ok_or_else(|| Status::failed_precondition(format!("could not resolve a device backing '{path}'")))?
            };

            let fs_type = detect_fs_type(&device).await?;
            resize_filesystem(&device, &fs_type).await.map_err(Status::from)?;

            let capacity_bytes = req.capacity_range.as_ref().map(|r| if r.required_bytes > 0 { r.required_bytes } else { r.limit_bytes }).unwrap_or(0);
            Ok(Response::new(csi::NodeExpandVolumeResponse { capacity_bytes }))
        })
        .await
    }

    async fn node_get_capabilities(&self, _request: Request<csi::NodeGetCapabilitiesRequest>) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::{rpc::Type as RpcType, Rpc, Type};

        let capabilities = [RpcType::StageUnstageVolume, RpcType::ExpandVolume]
            .into_iter()
            .map(|rpc| csi::NodeServiceCapability {
                r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
            })
            .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse { capabilities }))
    }

    async fn node_get_info(&self, _request: Request<csi::NodeGetInfoRequest>) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

async fn nfs_mount(share: &str, target: &str) -> Result<(), EngineError> {
    tokio::fs::create_dir_all(target).await.map_err(|e| EngineError::Internal(format!("failed to create mount target: {e}")))?;
    let output = run("mount", &["-t", "nfs", share, target], Duration::from_secs(30)).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already mounted") {
            return Ok(());
        }
        return Err(EngineError::Internal(format!("mount -t nfs {share} {target} failed: {stderr}")));
    }
    Ok(())
}

/// iSCSI/NFS teardown at unstage time is session-scoped rather than a
/// state machine (unlike NVMe-oF): the kernel/appliance drop the session
/// on its own once unmounted, so nothing further is required here.
fn debug_teardown_skip(volume_id: &str, source: &str) {
    debug!(volume_id, source, "node_unstage_volume: no NVMe-oF teardown needed for this backing source");
}

/// Best-effort NQN recovery for `NodeUnstageVolume` when the driver is
/// called without `volume_context` (CSI doesn't guarantee it is passed to
/// unstage). spec.md §4.4.2: resolve the backing device via `findmnt`
/// (filesystem mode) or the staging path itself being a device symlink
/// (block mode), then read the controller's sysfs `subsysnqn`.
fn resolve_staged_device(staging_path: &str) -> Option<String> {
    if let Ok(target) = std::fs::read_link(staging_path) {
        return Some(target.to_string_lossy().to_string());
    }
    findmnt_source(staging_path)
}

fn findmnt_source(path: &str) -> Option<String> {
    let output = std::process::Command::new("findmnt").args(["-n", "-o", "SOURCE", path]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let source = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if source.is_empty() {
        None
    } else {
        Some(source)
    }
}

fn resolve_mounted_device(path: &str) -> Option<String> {
    resolve_staged_device(path)
}

async fn detect_fs_type(device: &str) -> Result<String, Status> {
    let output = run("blkid", &["-o", "value", "-s", "TYPE", device], Duration::from_secs(5)).await.map_err(Status::from)?;
    let fs_type = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if fs_type.is_empty() {
        return Err(Status::failed_precondition(format!("could not determine filesystem type of '{device}'")));
    }
    Ok(fs_type)
}

async fn resize_filesystem(device: &str, fs_type: &str) -> Result<(), EngineError> {
    let output = match fs_type {
        "ext2" | "ext3" | "ext4" => run("resize2fs", &[device], Duration::from_secs(120)).await?,
        "xfs" => {
            let mountpoint = findmnt_target(device).ok_or_else(|| EngineError::FailedPrecondition(format!("'{device}' is not mounted, cannot grow xfs in place")))?;
            run("xfs_growfs", &[mountpoint.as_str()], Duration::from_secs(120)).await?
        }
        other => return Err(EngineError::FailedPrecondition(format!("filesystem '{other}' does not support online expansion"))),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EngineError::Internal(format!("filesystem resize failed: {stderr}")));
    }
    Ok(())
}

fn findmnt_target(device: &str) -> Option<String> {
    let output = std::process::Command::new("findmnt").args(["-n", "-o", "TARGET", device]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let target = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if target.is_empty() {
        None
    } else {
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::node_server::Node;

    fn service() -> NodeService {
        NodeService::new("node-1", 4)
    }

    #[test]
    fn protocol_requires_context_key() {
        let ctx = std::collections::HashMap::new();
        assert!(NodeService::protocol(&ctx).is_err());
    }

    #[test]
    fn protocol_parses_known_values() {
        let mut ctx = std::collections::HashMap::new();
        ctx.insert("protocol".to_string(), "nvmeof".to_string());
        assert_eq!(NodeService::protocol(&ctx).unwrap(), Protocol::Nvmeof);
    }

    #[test]
    fn is_block_detects_block_access_type() {
        let block = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(csi::volume_capability::BlockVolume {})),
            access_mode: None,
        });
        assert!(NodeService::is_block(&block));
        assert!(!NodeService::is_block(&None));
    }

    #[test]
    fn fs_type_falls_back_to_linux_default() {
        let mount = Some(csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(csi::volume_capability::MountVolume {
                fs_type: String::new(),
                mount_flags: vec![],
            })),
            access_mode: None,
        });
        assert_eq!(NodeService::fs_type(&mount), linux::default_fs_type());
    }

    #[tokio::test]
    async fn node_stage_volume_requires_staging_target_path() {
        let svc = service();
        let req = Request::new(csi::NodeStageVolumeRequest {
            volume_id: "vol1".to_string(),
            staging_target_path: String::new(),
            ..Default::default()
        });
        let err = Node::node_stage_volume(&svc, req).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn node_get_capabilities_reports_stage_and_expand() {
        let svc = service();
        let resp = Node::node_get_capabilities(&svc, Request::new(csi::NodeGetCapabilitiesRequest {})).await.unwrap();
        assert_eq!(resp.into_inner().capabilities.len(), 2);
    }

    #[tokio::test]
    async fn node_get_info_reports_configured_node_id() {
        let svc = service();
        let resp = Node::node_get_info(&svc, Request::new(csi::NodeGetInfoRequest {})).await.unwrap();
        assert_eq!(resp.into_inner().node_id, "node-1");
    }
}
