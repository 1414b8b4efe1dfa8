//! Shared driver state.

use std::future::Future;
use std::sync::Arc;

use crate::config::DriverConfig;
use crate::error::CsiError;
use crate::lock::OperationLockManager;
use crate::registry::VolumeRegistry;

/// Everything the services share, built once at startup and passed around
/// behind an [`Arc`].
#[derive(Debug)]
pub struct DriverContext {
    /// Validated configuration.
    pub config: DriverConfig,
    /// Per-resource operation locks.
    pub locks: OperationLockManager,
    /// Controller-side records.
    pub registry: VolumeRegistry,
}

impl DriverContext {
    /// Build the context for `config`.  The registry is persistent when the
    /// config names a state directory.
    pub fn new(config: DriverConfig) -> Arc<Self> {
        let locks = OperationLockManager::new(config.lock_timeout());
        let registry = match &config.state_dir {
            Some(dir) => VolumeRegistry::persistent(dir),
            None => VolumeRegistry::in_memory(),
        };
        Arc::new(Self {
            config,
            locks,
            registry,
        })
    }

    /// Build the context and reload persisted records.
    pub async fn recover(config: DriverConfig) -> Result<Arc<Self>, CsiError> {
        let ctx = Self::new(config);
        ctx.registry.recover().await?;
        Ok(ctx)
    }
}

/// Run `fut` to completion on its own task, even if the caller goes away.
///
/// Services move their lock guards into `fut`, so a cancelled request keeps
/// its keys until the backend or host mutation it started has finished.
pub(crate) async fn detached<T, F>(fut: F) -> Result<T, CsiError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, CsiError>> + Send + 'static,
{
    tokio::spawn(fut).await?
}
