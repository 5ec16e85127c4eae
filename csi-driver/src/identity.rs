//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.
//! spec.md §6.

use tonic::{Request, Response, Status};

use crate::appliance::Client;
use crate::csi;

pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service: plugin identification, capability reporting, and
/// readiness probing.
///
/// `probe()` reports the appliance client's live connection state when one
/// is attached, so Kubernetes stops routing requests the moment the
/// websocket drops (spec.md §6, §9).
pub struct IdentityService {
    driver_name: String,
    appliance: Option<Client>,
}

impl IdentityService {
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            appliance: None,
        }
    }

    pub fn with_appliance(driver_name: impl Into<String>, appliance: Client) -> Self {
        Self {
            driver_name: driver_name.into(),
            appliance: Some(appliance),
        }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = vec![
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(csi::plugin_capability::Service {
                    r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                })),
            },
            csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::VolumeExpansion(csi::plugin_capability::VolumeExpansion {
                    r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                })),
            },
        ];

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(&self, _request: Request<csi::ProbeRequest>) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = match &self.appliance {
            Some(client) => client.is_connected(),
            None => true,
        };
        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::identity_server::Identity;

    #[tokio::test]
    async fn get_plugin_info_reports_configured_name() {
        let service = IdentityService::new("appliance.csi.example.com");
        let response = Identity::get_plugin_info(&service, Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap();
        let info = response.into_inner();
        assert_eq!(info.name, "appliance.csi.example.com");
        assert_eq!(info.vendor_version, DRIVER_VERSION);
    }

    #[tokio::test]
    async fn get_plugin_capabilities_reports_controller_and_expansion() {
        let service = IdentityService::new("appliance.csi.example.com");
        let response = Identity::get_plugin_capabilities(&service, Request::new(csi::GetPluginCapabilitiesRequest {}))
            .await
            .unwrap();
        assert_eq!(response.into_inner().capabilities.len(), 2);
    }

    #[tokio::test]
    async fn probe_without_appliance_client_is_always_ready() {
        let service = IdentityService::new("d");
        let response = Identity::probe(&service, Request::new(csi::ProbeRequest {})).await.unwrap();
        assert_eq!(response.into_inner().ready, Some(true));
    }
}
