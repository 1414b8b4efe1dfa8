//! gRPC client for a plugin socket, used by tests and tooling.

use std::path::{Path, PathBuf};

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::debug;

use crate::csi::controller_client::ControllerClient;
use crate::csi::identity_client::IdentityClient;
use crate::csi::node_client::NodeClient;
use crate::error::CsiError;

/// One HTTP/2 connection to a plugin socket, shared by the three service
/// clients.
#[derive(Debug, Clone)]
pub struct CsiClient {
    channel: Channel,
    socket_path: PathBuf,
}

impl CsiClient {
    /// Connect to the server listening on `socket_path`.
    pub async fn connect(socket_path: impl AsRef<Path>) -> Result<Self, CsiError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let dial = socket_path.clone();
        // The authority is required by the endpoint but never resolved.
        let channel = Endpoint::try_from("http://[::]:50051")
            .map_err(CsiError::transport)?
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = dial.clone();
                async move { UnixStream::connect(path).await.map(TokioIo::new) }
            }))
            .await
            .map_err(CsiError::transport)?;
        debug!(path = %socket_path.display(), "connected to CSI socket");
        Ok(Self {
            channel,
            socket_path,
        })
    }

    /// The socket this client talks to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Identity RPCs.
    pub fn identity(&self) -> IdentityClient<Channel> {
        IdentityClient::new(self.channel.clone())
    }

    /// Controller RPCs.
    pub fn controller(&self) -> ControllerClient<Channel> {
        ControllerClient::new(self.channel.clone())
    }

    /// Node RPCs.
    pub fn node(&self) -> NodeClient<Channel> {
        NodeClient::new(self.channel.clone())
    }
}
