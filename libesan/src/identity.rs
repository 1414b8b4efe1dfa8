//! CSI Identity service.
//!
//! The Identity service allows callers to discover plugin metadata and check
//! plugin health.  Every CSI plugin must implement this service.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::backend::{BackendCapabilities, BackendClient};
use crate::capability;
use crate::context::DriverContext;
use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Readiness probe.  Returns `true` when the plugin can serve requests.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Advertise the capabilities supported by this plugin.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}

/// [`CsiIdentity`] for the e-SAN driver.
///
/// In controller mode readiness follows the array; a node-only plugin has no
/// array connection and is ready as soon as it serves.
pub struct IdentityService {
    ctx: Arc<DriverContext>,
    backend: Option<Arc<dyn BackendClient>>,
}

impl IdentityService {
    /// Identity for a plugin that runs the controller against `backend`.
    pub fn with_controller(ctx: Arc<DriverContext>, backend: Arc<dyn BackendClient>) -> Self {
        Self {
            ctx,
            backend: Some(backend),
        }
    }

    /// Identity for a node-only plugin.
    pub fn node_only(ctx: Arc<DriverContext>) -> Self {
        Self { ctx, backend: None }
    }
}

#[async_trait]
impl CsiIdentity for IdentityService {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.ctx.config.driver_name.clone(),
            vendor_version: self.ctx.config.driver_version.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn probe(&self) -> Result<bool, CsiError> {
        let Some(backend) = &self.backend else {
            return Ok(true);
        };
        match backend.probe().await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "array probe failed");
                Ok(false)
            }
        }
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        let backend_caps = self
            .backend
            .as_ref()
            .map(|b| b.capabilities())
            .unwrap_or_else(BackendCapabilities::default);
        Ok(capability::plugin_capabilities(
            backend_caps,
            self.backend.is_some(),
        ))
    }
}
