//! CSI Controller service implementation.
//!
//! Requests are validated before anything else happens. CreateVolume,
//! DeleteVolume and ValidateVolumeCapabilities then hold the volume's lock
//! for the whole backend call, so the backend never sees two overlapping
//! calls for the same name.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::capability::{self, Confirmation};
use crate::context::CallContext;
use crate::csi;
use crate::driver::DriverState;
use crate::error::{Error, Require};

pub struct ControllerService {
    state: Arc<DriverState>,
}

impl ControllerService {
    pub fn new(state: Arc<DriverState>) -> Self {
        Self { state }
    }

    /// Minimum size to request from the backend. Zero leaves the choice to
    /// the backend.
    fn required_bytes(range: Option<&csi::CapacityRange>) -> Result<i64, Error> {
        let Some(range) = range else {
            return Ok(0);
        };
        if range.required_bytes < 0 || range.limit_bytes < 0 {
            return Err(Error::InvalidCapacity {
                reason: "byte counts must not be negative",
            });
        }
        if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
            return Err(Error::InvalidCapacity {
                reason: "required_bytes exceeds limit_bytes",
            });
        }
        Ok(range.required_bytes)
    }

    fn rpc_capability(
        t: csi::controller_service_capability::rpc::Type,
    ) -> csi::ControllerServiceCapability {
        csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        }
    }
}

/// Response for controller RPCs this plugin does not offer.
fn unsupported<T>(method: &'static str) -> Result<Response<T>, Status> {
    debug!(method, "unsupported controller RPC");
    Err(Status::unimplemented(format!("method {method} not implemented")))
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let ctx = CallContext::from_metadata(request.metadata());
        let req = request.into_inner();
        let name = req.name.require("Name")?;
        let caps = req.volume_capabilities.require("Volume Capabilities")?;

        capability::validate_for_create(&caps)?;
        if req.volume_content_source.is_some() {
            return Err(Status::unimplemented("snapshots not supported"));
        }
        let required_bytes = Self::required_bytes(req.capacity_range.as_ref())?;

        let capacity_bytes = {
            let _guard = self.state.lock_volume(&name, &ctx).await?;
            ctx.run(
                "create_volume",
                &name,
                self.state.backend().create_volume(&ctx, &name, required_bytes),
            )
            .await?
        };

        info!(volume = %name, capacity_bytes, "volume created");
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                capacity_bytes,
                volume_id: name,
                volume_context: Default::default(),
                content_source: None,
                accessible_topology: vec![],
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let ctx = CallContext::from_metadata(request.metadata());
        let volume_id = request.into_inner().volume_id.require("Volume ID")?;

        {
            let _guard = self.state.lock_volume(&volume_id, &ctx).await?;
            ctx.run(
                "delete_volume",
                &volume_id,
                self.state.backend().delete_volume(&ctx, &volume_id),
            )
            .await?;
        }

        info!(volume = %volume_id, "volume deleted");
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        unsupported("ControllerPublishVolume")
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        unsupported("ControllerUnpublishVolume")
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let ctx = CallContext::from_metadata(request.metadata());
        let req = request.into_inner();
        let volume_id = req.volume_id.require("Volume ID")?;
        let caps = req.volume_capabilities.require("Volume Capabilities")?;

        {
            let _guard = self.state.lock_volume(&volume_id, &ctx).await?;
            ctx.run(
                "check_volume_exists",
                &volume_id,
                self.state.backend().check_volume_exists(&ctx, &volume_id),
            )
            .await?;
        }

        let Confirmation {
            accepted,
            rejection,
        } = capability::confirm(&caps);

        if let Some(rejection) = rejection {
            debug!(volume = %volume_id, %rejection, "capabilities not confirmed");
            return Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: rejection.to_string(),
            }));
        }

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: accepted,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        unsupported("ListVolumes")
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        unsupported("GetCapacity")
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = self
            .state
            .capabilities()
            .iter()
            .copied()
            .map(Self::rpc_capability)
            .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        unsupported("CreateSnapshot")
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        unsupported("DeleteSnapshot")
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        unsupported("ListSnapshots")
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        unsupported("ControllerExpandVolume")
    }
}
