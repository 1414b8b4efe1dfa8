//! gRPC server that exposes the plugin's services on a Unix socket.
//!
//! The generated `csi.v1` service traits are implemented by thin adapters
//! over [`CsiIdentity`], [`CsiController`] and [`CsiNode`]: each converts the
//! request, calls the service and converts the result or error back.  A
//! plugin without a controller (or node) simply does not register that gRPC
//! service, and tonic answers its RPCs with `UNIMPLEMENTED`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, debug_span, info};

use super::convert::{bytes_to_wire, capabilities_from_wire};
use crate::controller::CsiController;
use crate::csi;
use crate::csi::controller_server::{Controller, ControllerServer};
use crate::csi::identity_server::{Identity, IdentityServer};
use crate::csi::node_server::{Node, NodeServer};
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::node::CsiNode;
use crate::types::{SnapshotId, VolumeId};

/// The services behind one socket.  Identity is always present; a plugin
/// runs the controller, the node service, or both.
#[derive(Clone)]
pub struct Services {
    identity: Arc<dyn CsiIdentity>,
    controller: Option<Arc<dyn CsiController>>,
    node: Option<Arc<dyn CsiNode>>,
}

impl Services {
    /// Services with only identity enabled.
    pub fn new(identity: Arc<dyn CsiIdentity>) -> Self {
        Self {
            identity,
            controller: None,
            node: None,
        }
    }

    /// Serve controller RPCs with `controller`.
    pub fn with_controller(mut self, controller: Arc<dyn CsiController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// Serve node RPCs with `node`.
    pub fn with_node(mut self, node: Arc<dyn CsiNode>) -> Self {
        self.node = Some(node);
        self
    }
}

// -- identity -------------------------------------------------------------------

struct IdentityRpc(Arc<dyn CsiIdentity>);

#[tonic::async_trait]
impl Identity for IdentityRpc {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let info = self.0.get_plugin_info().await?;
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: info.name,
            vendor_version: info.vendor_version,
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = self.0.get_plugin_capabilities().await?;
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = self.0.probe().await?;
        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}

// -- controller -----------------------------------------------------------------

struct ControllerRpc(Arc<dyn CsiController>);

#[tonic::async_trait]
impl Controller for ControllerRpc {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let volume = self.0.create_volume(request.into_inner().try_into()?).await?;
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some((&volume).into()),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let volume_id = VolumeId::from(request.into_inner().volume_id);
        self.0.delete_volume(&volume_id).await?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let publish_context = self.0.publish_volume(request.into_inner().try_into()?).await?;
        Ok(Response::new(csi::ControllerPublishVolumeResponse { publish_context }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.0
            .unpublish_volume(&req.volume_id.into(), &req.node_id.into())
            .await?;
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let capabilities = capabilities_from_wire(req.volume_capabilities)?;
        let result = self
            .0
            .validate_volume_capabilities(&req.volume_id.into(), &capabilities)
            .await?;
        let confirmed = result.confirmed.map(|caps| {
            csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: caps.iter().map(Into::into).collect(),
                parameters: req.parameters,
            }
        });
        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed,
            message: result.message,
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let page = self.0.list_volumes(request.into_inner().try_into()?).await?;
        Ok(Response::new(csi::ListVolumesResponse {
            entries: page.entries.iter().map(Into::into).collect(),
            next_token: page.next_token.unwrap_or_default(),
        }))
    }

    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let available = self.0.get_capacity(request.into_inner().into()).await?;
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: bytes_to_wire(available),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = self.0.get_capabilities().await?;
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let snapshot = self.0.create_snapshot(request.into_inner().into()).await?;
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some((&snapshot).into()),
        }))
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let snapshot_id = SnapshotId::from(request.into_inner().snapshot_id);
        self.0.delete_snapshot(&snapshot_id).await?;
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let expanded = self.0.expand_volume(request.into_inner().try_into()?).await?;
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: bytes_to_wire(expanded.capacity_bytes),
            node_expansion_required: expanded.node_expansion_required,
        }))
    }
}

// -- node -----------------------------------------------------------------------

struct NodeRpc(Arc<dyn CsiNode>);

#[tonic::async_trait]
impl Node for NodeRpc {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        self.0.stage_volume(request.into_inner().try_into()?).await?;
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        self.0
            .unstage_volume(&req.volume_id.into(), &req.staging_target_path)
            .await?;
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        self.0.publish_volume(request.into_inner().try_into()?).await?;
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.0
            .unpublish_volume(&req.volume_id.into(), &req.target_path)
            .await?;
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        let stats = self
            .0
            .get_volume_stats(&req.volume_id.into(), &req.volume_path)
            .await?;
        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: stats.usage.iter().map(Into::into).collect(),
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = self.0.get_capabilities().await?;
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        let info = self.0.get_info().await?;
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: info.node_id.to_string(),
            max_volumes_per_node: bytes_to_wire(info.max_volumes_per_node),
            accessible_topology: info.accessible_topology.as_ref().map(Into::into),
        }))
    }
}

// -- server ---------------------------------------------------------------------

/// A CSI gRPC server listening on a Unix domain socket.
pub struct CsiServer {
    listener: UnixListener,
    socket_path: PathBuf,
    services: Services,
}

impl CsiServer {
    /// Bind `socket_path`, replacing a stale socket left by a previous run.
    pub async fn bind(socket_path: impl AsRef<Path>, services: Services) -> Result<Self, CsiError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(CsiError::transport)?;
        }
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => debug!(path = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CsiError::transport(e)),
        }
        let listener = UnixListener::bind(&socket_path).map_err(CsiError::transport)?;
        info!(path = %socket_path.display(), "CSI server listening");
        Ok(Self {
            listener,
            socket_path,
            services,
        })
    }

    /// The socket this server listens on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown` resolves, then remove the socket.
    ///
    /// In-flight RPCs are allowed to finish before this returns.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), CsiError>
    where
        F: Future<Output = ()>,
    {
        let Services {
            identity,
            controller,
            node,
        } = self.services;
        let incoming = UnixListenerStream::new(self.listener);

        let served = Server::builder()
            .trace_fn(|req| debug_span!("csi", rpc = %req.uri().path()))
            .add_service(IdentityServer::new(IdentityRpc(identity)))
            .add_optional_service(controller.map(|c| ControllerServer::new(ControllerRpc(c))))
            .add_optional_service(node.map(|n| NodeServer::new(NodeRpc(n))))
            .serve_with_incoming_shutdown(incoming, shutdown)
            .await;

        info!(path = %self.socket_path.display(), "CSI server shutting down");
        let removed = match tokio::fs::remove_file(&self.socket_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::transport(e)),
        };
        served.map_err(CsiError::transport)?;
        removed
    }
}
