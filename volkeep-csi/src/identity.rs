//! Identity service: who the plugin is and whether it can take requests.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{trace, warn};

use crate::context::CallContext;
use crate::csi;
use crate::csi::plugin_capability::service::Type as ServiceType;
use crate::driver::DriverState;

pub struct IdentityService {
    state: Arc<DriverState>,
}

impl IdentityService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }

    fn service_capability(service: ServiceType) -> csi::PluginCapability {
        csi::PluginCapability {
            r#type: Some(csi::plugin_capability::Type::Service(
                csi::plugin_capability::Service {
                    r#type: service as i32,
                },
            )),
        }
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let config = &self.state.config;
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: config.name.clone(),
            vendor_version: config.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: vec![Self::service_capability(ServiceType::ControllerService)],
        }))
    }

    /// Not ready while draining for shutdown or while the backend reports
    /// itself unhealthy.
    async fn probe(
        &self,
        request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = if !self.state.is_accepting() {
            false
        } else {
            let ctx = CallContext::from_metadata(request.metadata());
            match ctx.run("probe", "", self.state.backend().probe(&ctx)).await {
                Ok(()) => true,
                Err(status) => {
                    warn!(
                        code = ?status.code(),
                        message = status.message(),
                        "backend probe failed"
                    );
                    false
                }
            }
        };
        trace!(ready, "probe");
        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}
