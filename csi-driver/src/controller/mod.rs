//! CSI Controller Service Implementation (component C).
//!
//! Handles volume and snapshot lifecycle operations against the remote
//! appliance over `appliance::Client`.

mod clone;
mod params;
mod provision;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use prost_types::Timestamp;
use tokio::sync::Mutex;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::appliance::{ApplianceError, Client, DatasetType};
use crate::csi;
use crate::error::{is_idempotent_delete_target, EngineError};
use crate::metrics::{self, OperationTimer};
use crate::retry::{self, RetryPolicy};
use crate::taxonomy::{CloneMode, ContentSourceType, DeleteStrategy, Protocol, SnapshotId, VolumeId, VolumeProperties, MANAGED_BY_SENTINEL};

use params::{SnapshotClassParams, VolumeClassParams};

const DEFAULT_VOLUME_SIZE: u64 = 1024 * 1024 * 1024;

/// Bounded retry for appliance calls on `Transport`/`Busy`, per spec.md §7.
const APPLIANCE_RETRY_POLICY: RetryPolicy = RetryPolicy::new(4, Duration::from_millis(200), 2.0, Duration::from_secs(5));

/// Wraps an appliance call with the controller engine's bounded backoff
/// retry, used anywhere a verb call can hit a transient `Unavailable`/`Busy`
/// appliance state (spec.md §7). Shared by `controller::provision` and
/// `controller::clone` as well as this module.
pub(super) async fn with_retry<T, F, Fut>(operation: &'static str, mut f: F) -> Result<T, ApplianceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApplianceError>>,
{
    let mut first_call = true;
    retry::retry(operation, APPLIANCE_RETRY_POLICY, ApplianceError::is_retryable, move || {
        if first_call {
            first_call = false;
        } else {
            metrics::record_retry(operation);
        }
        f()
    })
    .await
}

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

/// CSI Controller Service: volume and snapshot lifecycle against the
/// appliance.
pub struct ControllerService {
    appliance: Client,
    /// In-flight CreateSnapshot names, guarding against a second call
    /// racing the appliance's own post-query idempotency check (spec.md
    /// §9 open question on concurrent same-name CreateSnapshot calls).
    in_flight_snapshots: Mutex<HashSet<String>>,
}

impl ControllerService {
    pub fn new(appliance: Client) -> Self {
        Self {
            appliance,
            in_flight_snapshots: Mutex::new(HashSet::new()),
        }
    }

    fn dataset_type_for(protocol: Protocol) -> DatasetType {
        match protocol {
            Protocol::Nfs => DatasetType::Filesystem,
            Protocol::Nvmeof | Protocol::Iscsi => DatasetType::Volume,
        }
    }

    fn requested_capacity(range: &Option<csi::CapacityRange>) -> u64 {
        match range {
            Some(r) if r.required_bytes > 0 => r.required_bytes as u64,
            Some(r) if r.limit_bytes > 0 => r.limit_bytes as u64,
            _ => DEFAULT_VOLUME_SIZE,
        }
    }

    /// Resolves a `DeleteVolume`/`ControllerExpandVolume` request's
    /// `volume_id` to a canonical dataset path, following the legacy
    /// bare-name property search when the id isn't already canonical.
    /// spec.md §3, §9 "ID schemes".
    async fn resolve_volume_id(&self, volume_id: &str) -> Result<Option<String>, EngineError> {
        let id = VolumeId::new(volume_id.to_string());
        if id.is_canonical() {
            return Ok(with_retry("dataset_get", || self.appliance.dataset_get(id.as_str())).await?.map(|d| d.name));
        }

        let matches = with_retry("find_by_csi_name", || self.appliance.find_by_csi_name(volume_id)).await?;
        Ok(matches.into_iter().next())
    }

    /// Looks up a detached snapshot's actual ZFS location by the
    /// `csi:snapshot_id` property stamped on it at creation time, rather
    /// than reconstructing a path from the current storage class (which
    /// may not match the `detachedSnapshotsParentDataset` override that was
    /// in effect when the snapshot was made). spec.md §4.3.5, §4.3.1 step 4.
    async fn resolve_detached_snapshot_dataset(&self, id: &SnapshotId) -> Result<String, EngineError> {
        let encoded = id.encode()?;
        let matches = with_retry("find_by_property", || self.appliance.find_by_property("csi:snapshot_id", &encoded)).await?;
        matches.into_iter().next().ok_or_else(|| EngineError::NotFound(format!("detached snapshot '{encoded}' not found")))
    }

    fn volume_response(dataset: &str, capacity_bytes: u64, context: HashMap<String, String>, content_source: Option<csi::VolumeContentSource>) -> csi::Volume {
        csi::Volume {
            capacity_bytes: capacity_bytes as i64,
            volume_id: dataset.to_string(),
            volume_context: context,
            content_source,
            accessible_topology: Vec::new(),
        }
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    #[instrument(skip(self, request), fields(name = %request.get_ref().name))]
    async fn create_volume(&self, request: Request<csi::CreateVolumeRequest>) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        timed("create_volume", async move {
            let req = request.into_inner();
            if req.name.is_empty() {
                return Err(Status::invalid_argument("name is required"));
            }
            if req.volume_capabilities.is_empty() {
                return Err(Status::invalid_argument("volume_capabilities is required"));
            }

            let class = VolumeClassParams::parse(&req.parameters).map_err(Status::from)?;
            let parent = class.resolve_parent().map_err(Status::from)?;
            let dataset = format!("{parent}/{}", req.name);
            let capacity_bytes = Self::requested_capacity(&req.capacity_range);

            if let Some(existing) = with_retry("dataset_get", || self.appliance.dataset_get(&dataset))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?
            {
                let props = VolumeProperties::from_properties(&existing.properties).map_err(EngineError::from).map_err(Status::from)?;
                if !props.is_managed() || props.csi_volume_name != req.name {
                    return Err(Status::already_exists(format!("dataset '{dataset}' exists and is not owned by this request")));
                }

                let mut effective_capacity = props.capacity_bytes;
                if capacity_bytes > props.capacity_bytes {
                    match existing.dataset_type {
                        DatasetType::Volume => {
                            with_retry("dataset_update_volsize", || self.appliance.dataset_update_volsize(&dataset, capacity_bytes))
                                .await
                                .map_err(EngineError::from)
                                .map_err(Status::from)?;
                        }
                        DatasetType::Filesystem => {
                            with_retry("dataset_update_quota", || self.appliance.dataset_update_quota(&dataset, capacity_bytes, capacity_bytes))
                                .await
                                .map_err(EngineError::from)
                                .map_err(Status::from)?;
                        }
                    }
                    with_retry("property_set", || self.appliance.property_set(&dataset, "csi:capacity_bytes", &capacity_bytes.to_string()))
                        .await
                        .map_err(EngineError::from)
                        .map_err(Status::from)?;
                    effective_capacity = capacity_bytes;
                    info!(%dataset, old = props.capacity_bytes, new = capacity_bytes, "create_volume: idempotent replay, expanding in place");
                } else {
                    info!(%dataset, "create_volume: idempotent replay");
                }

                let mut context = provision::provision(&self.appliance, &dataset, &class).await.map_err(Status::from)?;
                context.insert("expectedCapacity".to_string(), effective_capacity.to_string());
                if !matches!(props.content_source_type, ContentSourceType::None) {
                    context.insert("clonedFromSnapshot".to_string(), "true".to_string());
                }
                return Ok(Response::new(csi::CreateVolumeResponse {
                    volume: Some(Self::volume_response(&dataset, effective_capacity, context, req.volume_content_source.clone())),
                }));
            }

            let (clone_mode, content_source_type, content_source_id, origin_snapshot) = match &req.volume_content_source {
                Some(csi::VolumeContentSource {
                    r#type: Some(csi::volume_content_source::Type::Snapshot(snap)),
                }) => {
                    let id = SnapshotId::decode(&snap.snapshot_id).map_err(EngineError::from).map_err(Status::from)?;
                    if id.protocol != class.protocol {
                        return Err(Status::invalid_argument("snapshot protocol does not match storage class protocol"));
                    }

                    let mode = if id.detached {
                        let detached_dataset = self.resolve_detached_snapshot_dataset(&id).await.map_err(Status::from)?;
                        clone::clone_from_detached_snapshot(&self.appliance, &detached_dataset, &dataset)
                            .await
                            .map_err(Status::from)?
                    } else {
                        clone::clone_from_snapshot(&self.appliance, id.source_volume_id.as_str(), &id.name, &dataset, &class)
                            .await
                            .map_err(Status::from)?
                    };
                    (mode, ContentSourceType::Snapshot, Some(snap.snapshot_id.clone()), Some(id.name.clone()))
                }
                Some(csi::VolumeContentSource {
                    r#type: Some(csi::volume_content_source::Type::Volume(vol)),
                }) => {
                    let source_dataset = self
                        .resolve_volume_id(&vol.volume_id)
                        .await
                        .map_err(Status::from)?
                        .ok_or_else(|| Status::not_found(format!("source volume '{}' not found", vol.volume_id)))?;
                    let mode = clone::clone_from_volume(&self.appliance, &source_dataset, &dataset, &class).await.map_err(Status::from)?;
                    (mode, ContentSourceType::Volume, Some(vol.volume_id.clone()), None)
                }
                _ => {
                    match Self::dataset_type_for(class.protocol) {
                        DatasetType::Filesystem => {
                            with_retry("dataset_create_filesystem", || self.appliance.dataset_create_filesystem(&dataset))
                                .await
                                .map_err(EngineError::from)
                                .map_err(Status::from)?;
                        }
                        DatasetType::Volume => {
                            with_retry("dataset_create_volume", || self.appliance.dataset_create_volume(&dataset, capacity_bytes, None))
                                .await
                                .map_err(EngineError::from)
                                .map_err(Status::from)?;
                        }
                    }
                    (CloneMode::Cow, ContentSourceType::None, None, None)
                }
            };

            let mut context = provision::provision(&self.appliance, &dataset, &class).await.map_err(Status::from)?;
            context.insert("expectedCapacity".to_string(), capacity_bytes.to_string());
            if !matches!(content_source_type, ContentSourceType::None) {
                context.insert("clonedFromSnapshot".to_string(), "true".to_string());
            }

            let mut props = VolumeProperties::new(req.name.clone(), class.protocol, capacity_bytes);
            props.content_source_type = content_source_type;
            props.content_source_id = content_source_id;
            props.origin_snapshot = origin_snapshot;
            if !matches!(content_source_type, ContentSourceType::None) {
                props.clone_mode = Some(clone_mode);
            }
            if let Some(nqn) = context.get("nqn") {
                props.nvme_subsystem_nqn = Some(nqn.clone());
            }
            if class.protocol == Protocol::Nfs {
                props.nfs_share_path = Some(provision::mountpoint_for(&dataset));
            }

            with_retry("property_set_all", || self.appliance.property_set_all(&dataset, &props.to_properties()))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?;

            Ok(Response::new(csi::CreateVolumeResponse {
                volume: Some(Self::volume_response(&dataset, capacity_bytes, context, req.volume_content_source)),
            }))
        })
        .await
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn delete_volume(&self, request: Request<csi::DeleteVolumeRequest>) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        timed("delete_volume", async move {
            let req = request.into_inner();

            let dataset = match self.resolve_volume_id(&req.volume_id).await.map_err(Status::from)? {
                Some(d) => d,
                None => {
                    debug!(volume_id = %req.volume_id, "delete_volume: already absent");
                    return Ok(Response::new(csi::DeleteVolumeResponse {}));
                }
            };

            let props = match with_retry("property_get_all", || self.appliance.property_get_all(&dataset))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?
            {
                props if !props.is_empty() => VolumeProperties::from_properties(&props).ok(),
                _ => None,
            };

            let Some(props) = props.filter(VolumeProperties::is_managed) else {
                warn!(%dataset, "delete_volume: dataset is not managed by this plugin");
                return Err(Status::from(EngineError::not_managed(&dataset)));
            };

            if props.delete_strategy == DeleteStrategy::Retain {
                info!(%dataset, "delete_volume: retain strategy, removing ownership properties only");
                with_retry("property_clear", || self.appliance.property_clear(&dataset, &["csi:managed_by"]))
                    .await
                    .map_err(EngineError::from)
                    .map_err(Status::from)?;
                return Ok(Response::new(csi::DeleteVolumeResponse {}));
            }

            if let Some(nqn) = &props.nvme_subsystem_nqn {
                provision::deprovision(&self.appliance, &dataset, props.protocol, Some(nqn)).await.map_err(Status::from)?;
            } else {
                provision::deprovision(&self.appliance, &dataset, props.protocol, None).await.map_err(Status::from)?;
            }

            with_retry("dataset_delete", || self.appliance.dataset_delete(&dataset, true, false))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?;

            Ok(Response::new(csi::DeleteVolumeResponse {}))
        })
        .await
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        timed("controller_publish_volume", async move {
            Ok(Response::new(csi::ControllerPublishVolumeResponse {
                publish_context: HashMap::new(),
            }))
        })
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        timed("controller_unpublish_volume", async move { Ok(Response::new(csi::ControllerUnpublishVolumeResponse {})) }).await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        timed("validate_volume_capabilities", async move {
            let req = request.into_inner();

            let Some(_) = self.resolve_volume_id(&req.volume_id).await.map_err(Status::from)? else {
                return Err(Status::not_found(format!("volume '{}' not found", req.volume_id)));
            };

            Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                }),
                message: String::new(),
            }))
        })
        .await
    }

    async fn list_volumes(&self, _request: Request<csi::ListVolumesRequest>) -> Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("ListVolumes is not supported"))
    }

    async fn get_capacity(&self, _request: Request<csi::GetCapacityRequest>) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("GetCapacity is not supported"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::{rpc::Type as RpcType, Rpc, Type};

        let rpcs = [
            RpcType::CreateDeleteVolume,
            RpcType::PublishUnpublishVolume,
            RpcType::ExpandVolume,
            RpcType::CreateDeleteSnapshot,
            RpcType::ListSnapshots,
            RpcType::GetVolume,
        ];

        let capabilities = rpcs
            .into_iter()
            .map(|rpc| csi::ControllerServiceCapability {
                r#type: Some(Type::Rpc(Rpc { r#type: rpc as i32 })),
            })
            .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse { capabilities }))
    }

    #[instrument(skip(self, request), fields(source_volume_id = %request.get_ref().source_volume_id, name = %request.get_ref().name))]
    async fn create_snapshot(&self, request: Request<csi::CreateSnapshotRequest>) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        timed("create_snapshot", async move {
            let req = request.into_inner();
            if req.name.is_empty() {
                return Err(Status::invalid_argument("name is required"));
            }

            {
                let mut in_flight = self.in_flight_snapshots.lock().await;
                if !in_flight.insert(req.name.clone()) {
                    return Err(Status::already_exists(format!("snapshot '{}' creation already in progress", req.name)));
                }
            }

            let result = self.create_snapshot_inner(&req).await;
            self.in_flight_snapshots.lock().await.remove(&req.name);

            result.map(|snapshot| Response::new(csi::CreateSnapshotResponse { snapshot: Some(snapshot) }))
        })
        .await
    }

    #[instrument(skip(self, request), fields(snapshot_id = %request.get_ref().snapshot_id))]
    async fn delete_snapshot(&self, request: Request<csi::DeleteSnapshotRequest>) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        timed("delete_snapshot", async move {
            let req = request.into_inner();
            if req.snapshot_id.is_empty() {
                return Ok(Response::new(csi::DeleteSnapshotResponse {}));
            }

            let id = match SnapshotId::decode(&req.snapshot_id) {
                Ok(id) => id,
                Err(_) => return Ok(Response::new(csi::DeleteSnapshotResponse {})),
            };

            if id.detached {
                match self.resolve_detached_snapshot_dataset(&id).await {
                    Ok(detached_dataset) => {
                        with_retry("dataset_delete", || self.appliance.dataset_delete(&detached_dataset, true, false))
                            .await
                            .map_err(EngineError::from)
                            .map_err(Status::from)?;
                    }
                    Err(e) if is_idempotent_delete_target(&e) => {
                        debug!(snapshot_id = %req.snapshot_id, "delete_snapshot: detached snapshot already absent");
                    }
                    Err(e) => return Err(Status::from(e)),
                }
            } else {
                let full_name = format!("{}@{}", id.source_volume_id.as_str(), id.name);
                with_retry("snapshot_delete", || self.appliance.snapshot_delete(&full_name))
                    .await
                    .map_err(EngineError::from)
                    .map_err(Status::from)?;
            }

            Ok(Response::new(csi::DeleteSnapshotResponse {}))
        })
        .await
    }

    #[instrument(skip(self, request))]
    async fn list_snapshots(&self, request: Request<csi::ListSnapshotsRequest>) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        timed("list_snapshots", async move {
            let req = request.into_inner();

            if !req.snapshot_id.is_empty() {
                let id = SnapshotId::decode(&req.snapshot_id).map_err(EngineError::from).map_err(Status::from)?;
                let snapshot = self
                    .snapshot_message(id.source_volume_id.as_str(), &id.name, id.source_volume_id.as_str(), id.detached)
                    .await;
                let entries = match snapshot {
                    Ok(s) => vec![csi::list_snapshots_response::Entry { snapshot: Some(s) }],
                    Err(_) => Vec::new(),
                };
                return Ok(Response::new(csi::ListSnapshotsResponse { entries, next_token: String::new() }));
            }

            if !req.source_volume_id.is_empty() {
                let source_dataset = self
                    .resolve_volume_id(&req.source_volume_id)
                    .await
                    .map_err(Status::from)?
                    .ok_or_else(|| Status::not_found(format!("source volume '{}' not found", req.source_volume_id)))?;
                let snaps = with_retry("snapshot_query_by_dataset", || self.appliance.snapshot_query_by_dataset(&source_dataset))
                    .await
                    .map_err(EngineError::from)
                    .map_err(Status::from)?;
                let protocol = self.source_protocol(&source_dataset).await;
                let entries = snaps
                    .into_iter()
                    .map(|s| csi::list_snapshots_response::Entry {
                        snapshot: Some(csi::Snapshot {
                            size_bytes: 0,
                            snapshot_id: SnapshotId {
                                detached: false,
                                protocol,
                                source_volume_id: VolumeId::new(source_dataset.clone()),
                                name: s.snapshot_name,
                            }
                            .encode()
                            .unwrap_or_default(),
                            source_volume_id: req.source_volume_id.clone(),
                            creation_time: Some(Timestamp::default()),
                            ready_to_use: true,
                        }),
                    })
                    .collect();
                return Ok(Response::new(csi::ListSnapshotsResponse { entries, next_token: String::new() }));
            }

            // Enumerate every CSI-managed dataset via property search, then
            // list each dataset's snapshots individually; there is no
            // single appliance verb for an unfiltered snapshot listing.
            // spec.md §4.3.5.
            let managed_datasets = with_retry("find_by_property", || self.appliance.find_by_property("csi:managed_by", MANAGED_BY_SENTINEL))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?;

            let mut entries = Vec::new();
            for dataset in managed_datasets {
                let protocol = self.source_protocol(&dataset).await;
                let snaps = with_retry("snapshot_query_by_dataset", || self.appliance.snapshot_query_by_dataset(&dataset))
                    .await
                    .map_err(EngineError::from)
                    .map_err(Status::from)?;
                entries.extend(snaps.into_iter().map(|s| csi::list_snapshots_response::Entry {
                    snapshot: Some(csi::Snapshot {
                        size_bytes: 0,
                        snapshot_id: SnapshotId {
                            detached: false,
                            protocol,
                            source_volume_id: VolumeId::new(dataset.clone()),
                            name: s.snapshot_name,
                        }
                        .encode()
                        .unwrap_or_default(),
                        source_volume_id: dataset.clone(),
                        creation_time: Some(Timestamp::default()),
                        ready_to_use: true,
                    }),
                }));
            }

            Ok(Response::new(csi::ListSnapshotsResponse { entries, next_token: String::new() }))
        })
        .await
    }

    #[instrument(skip(self, request), fields(volume_id = %request.get_ref().volume_id))]
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        timed("controller_expand_volume", async move {
            let req = request.into_inner();
            let dataset = self
                .resolve_volume_id(&req.volume_id)
                .await
                .map_err(Status::from)?
                .ok_or_else(|| Status::not_found(format!("volume '{}' not found", req.volume_id)))?;

            let capacity_bytes = Self::requested_capacity(&req.capacity_range);

            let existing = with_retry("dataset_get", || self.appliance.dataset_get(&dataset)).await.map_err(EngineError::from).map_err(Status::from)?;
            let Some(existing) = existing else {
                return Err(Status::not_found(format!("volume '{}' not found", req.volume_id)));
            };

            let node_expansion_required = match existing.dataset_type {
                DatasetType::Volume => {
                    with_retry("dataset_update_volsize", || self.appliance.dataset_update_volsize(&dataset, capacity_bytes))
                        .await
                        .map_err(EngineError::from)
                        .map_err(Status::from)?;
                    true
                }
                DatasetType::Filesystem => {
                    with_retry("dataset_update_quota", || self.appliance.dataset_update_quota(&dataset, capacity_bytes, capacity_bytes))
                        .await
                        .map_err(EngineError::from)
                        .map_err(Status::from)?;
                    false
                }
            };

            with_retry("property_set", || self.appliance.property_set(&dataset, "csi:capacity_bytes", &capacity_bytes.to_string()))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?;

            Ok(Response::new(csi::ControllerExpandVolumeResponse {
                capacity_bytes: capacity_bytes as i64,
                node_expansion_required,
            }))
        })
        .await
    }

    async fn controller_get_volume(&self, request: Request<csi::ControllerGetVolumeRequest>) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        timed("controller_get_volume", async move {
            let req = request.into_inner();
            let dataset = self
                .resolve_volume_id(&req.volume_id)
                .await
                .map_err(Status::from)?
                .ok_or_else(|| Status::not_found(format!("volume '{}' not found", req.volume_id)))?;

            let existing = with_retry("dataset_get", || self.appliance.dataset_get(&dataset))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?
                .ok_or_else(|| Status::not_found(format!("volume '{}' not found", req.volume_id)))?;

            let capacity_bytes = existing.volsize.unwrap_or(0);

            Ok(Response::new(csi::ControllerGetVolumeResponse {
                volume: Some(Self::volume_response(&dataset, capacity_bytes, HashMap::new(), None)),
                status: Some(csi::controller_get_volume_response::VolumeStatus {
                    published_node_ids: Vec::new(),
                    volume_condition: Some(csi::VolumeCondition {
                        abnormal: false,
                        message: String::new(),
                    }),
                }),
            }))
        })
        .await
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerModifyVolume is not supported"))
    }
}

impl ControllerService {
    async fn create_snapshot_inner(&self, req: &csi::CreateSnapshotRequest) -> Result<csi::Snapshot, Status> {
        let source_dataset = self
            .resolve_volume_id(&req.source_volume_id)
            .await
            .map_err(Status::from)?
            .ok_or_else(|| Status::not_found(format!("source volume '{}' not found", req.source_volume_id)))?;

        let existing = with_retry("snapshot_query_by_name", || self.appliance.snapshot_query_by_name(&req.name))
            .await
            .map_err(EngineError::from)
            .map_err(Status::from)?;
        if let Some(found) = existing.into_iter().next() {
            if found.dataset != source_dataset {
                return Err(Status::already_exists(format!("snapshot name '{}' already used on a different source volume", req.name)));
            }
            return self.snapshot_message(&source_dataset, &req.name, &req.source_volume_id, false).await.map_err(Status::from);
        }

        let snapshot_class = SnapshotClassParams::parse(&req.parameters);

        if snapshot_class.detached {
            let pool = snapshot_class
                .detached_parent_dataset
                .clone()
                .unwrap_or_else(|| source_dataset.split('/').next().unwrap_or(&source_dataset).to_string());
            let detached_dataset = format!("{pool}/csi-detached-snapshots/{}", req.name);
            with_retry("replication_run_onetime_and_wait", || {
                self.appliance
                    .replication_run_onetime_and_wait(&source_dataset, &detached_dataset, &req.name, crate::appliance::TransportMode::Local)
            })
            .await
            .map_err(EngineError::from)
            .map_err(Status::from)?;

            let protocol = self.source_protocol(&source_dataset).await;
            let snapshot_id = SnapshotId {
                detached: true,
                protocol,
                source_volume_id: VolumeId::new(source_dataset.clone()),
                name: req.name.clone(),
            }
            .encode()
            .map_err(EngineError::from)
            .map_err(Status::from)?;

            let mut props = HashMap::new();
            props.insert("csi:managed_by".to_string(), MANAGED_BY_SENTINEL.to_string());
            props.insert("csi:detached_snapshot".to_string(), "true".to_string());
            props.insert("csi:source_volume_id".to_string(), req.source_volume_id.clone());
            props.insert("csi:snapshot_id".to_string(), snapshot_id);
            with_retry("property_set_all", || self.appliance.property_set_all(&detached_dataset, &props))
                .await
                .map_err(EngineError::from)
                .map_err(Status::from)?;

            return self.snapshot_message(&source_dataset, &req.name, &req.source_volume_id, true).await.map_err(Status::from);
        }

        with_retry("snapshot_create", || self.appliance.snapshot_create(&source_dataset, &req.name))
            .await
            .map_err(EngineError::from)
            .map_err(Status::from)?;

        self.snapshot_message(&source_dataset, &req.name, &req.source_volume_id, false).await.map_err(Status::from)
    }

    /// Best-effort: a snapshot's own ZFS user properties inherit from its
    /// source dataset at creation time, so `csi:protocol` is readable on
    /// either. Falls back to NFS if the source is gone or unmanaged.
    async fn source_protocol(&self, source_dataset: &str) -> Protocol {
        with_retry("property_get", || self.appliance.property_get(source_dataset, "csi:protocol"))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse::<Protocol>().ok())
            .unwrap_or(Protocol::Nfs)
    }

    async fn snapshot_message(&self, source_dataset: &str, name: &str, source_volume_id: &str, detached: bool) -> Result<csi::Snapshot, EngineError> {
        let protocol = self.source_protocol(source_dataset).await;
        let snapshot_id = SnapshotId {
            detached,
            protocol,
            source_volume_id: VolumeId::new(source_dataset.to_string()),
            name: name.to_string(),
        }
        .encode()?;

        Ok(csi::Snapshot {
            size_bytes: 0,
            snapshot_id,
            source_volume_id: source_volume_id.to_string(),
            creation_time: Some(Timestamp::default()),
            ready_to_use: true,
        })
    }
}
