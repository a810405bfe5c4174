//! CSI Identity Service Implementation
//!
//! Reports the plugin name, version and capabilities to the orchestrator.

use tonic::{Request, Response, Status};

use crate::csi;

pub const DRIVER_NAME: &str = "csi.spdk.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
pub struct IdentityService {
    driver_name: String,
    controller_enabled: bool,
}

impl IdentityService {
    pub fn new(driver_name: impl Into<String>, controller_enabled: bool) -> Self {
        Self {
            driver_name: driver_name.into(),
            controller_enabled,
        }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(DRIVER_NAME, true)
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

    /// Node-only deployments advertise volume expansion but not the
    /// controller service.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let mut capabilities = Vec::with_capacity(2);
        if self.controller_enabled {
            capabilities.push(csi::PluginCapability {
                r#type: Some(csi::plugin_capability::Type::Service(
                    csi::plugin_capability::Service {
                        r#type: csi::plugin_capability::service::Type::ControllerService as i32,
                    },
                )),
            });
        }
        capabilities.push(csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::VolumeExpansion(
                csi::plugin_capability::VolumeExpansion {
                    r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                },
            )),
        });

        Ok(Response::new(csi::GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
