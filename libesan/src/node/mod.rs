//! CSI Node service.
//!
//! The Node service runs on each worker node and makes a published volume
//! usable by Pods:
//!
//! 1. **Stage**: log in to the fabric target from the publish context and,
//!    for filesystem volumes, format the device and mount it at the global
//!    staging path.
//! 2. **Publish**: bind the staging mount (or the raw device) into the Pod.
//! 3. **Unpublish**: remove that bind mount.
//! 4. **Unstage**: unmount the staging path and log out of the target.
//!
//! Stage records are the only bookkeeping.  The mount table always wins over
//! them: a record whose mount vanished is discarded, and a mount found
//! without a record is adopted.  Each record is also written next to its
//! staging path so a restarted plugin still knows which target to log out
//! of.
//!
//! With a state directory configured, records are additionally indexed by
//! volume id (`<state_dir>/<volume-id>.stage.json`), so after a restart a
//! stage or publish naming a different staging path is still refused.
//! Without one, a restarted plugin only finds records beside the staging
//! path a request names.

pub mod fake;
pub mod host;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use host::{FsStats, HostOps, LinuxHost};

use crate::backend::TargetDescriptor;
use crate::capability::{self, TOPOLOGY_NODE_KEY, TOPOLOGY_ZONE_KEY};
use crate::context::{DriverContext, detached};
use crate::error::CsiError;
use crate::lock::{OpGuard, OpKey};
use crate::registry::sidecar_name;
use crate::types::{
    AccessType, NodeCapability, NodeId, NodeInfo, NodePublishVolumeRequest,
    NodeStageVolumeRequest, Topology, UsageUnit, VolumeCapability, VolumeId, VolumeStats,
    VolumeUsage,
};

const STAGE_METADATA_SUFFIX: &str = ".esan-stage.json";
const STAGE_INDEX_SUFFIX: &str = ".stage.json";

/// Node service: local attach and mount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Attach the volume and, in filesystem mode, mount it at the staging
    /// path.  Restaging with the same path and capability is a no-op.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unmount the staging path and detach the device.  Idempotent; refused
    /// while Pod targets remain published.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Bind the staged volume into `target_path`.  Idempotent.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Remove the bind mount at `target_path`.  Idempotent.
    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str)
    -> Result<(), CsiError>;

    /// Usage of a published or staged volume.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    /// Optional node RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}

/// Where a volume is in its node-side lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    /// No record on this node.
    Unstaged,
    /// Attached (and mounted in filesystem mode), no Pod targets.
    Staged,
    /// Bound into at least one Pod target.
    Published,
    /// Unstage got past the unmount but the detach failed; the next unstage
    /// retries the detach.
    Error,
}

/// Node-side bookkeeping for one staged volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The staged volume.
    pub volume_id: VolumeId,
    /// Global staging path.
    pub staging_path: PathBuf,
    /// Local block device.
    pub device: PathBuf,
    /// Fabric target the device came from; `None` for adopted mounts.
    #[serde(default)]
    pub target: Option<TargetDescriptor>,
    /// Capability the volume was staged with.
    pub capability: VolumeCapability,
    /// Pod targets bound to this stage.  Its size is the reference count.
    #[serde(default)]
    pub targets: BTreeSet<PathBuf>,
    /// Lifecycle state.
    pub state: StageState,
}

impl StageRecord {
    fn is_block(&self) -> bool {
        self.capability.access_type.is_block()
    }

    fn settle(&mut self) {
        self.state = if self.targets.is_empty() {
            StageState::Staged
        } else {
            StageState::Published
        };
    }
}

fn stage_metadata_path(staging: &Path) -> PathBuf {
    let mut name = staging.as_os_str().to_owned();
    name.push(STAGE_METADATA_SUFFIX);
    PathBuf::from(name)
}

fn require_path(what: &str, value: &str) -> Result<PathBuf, CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    let path = PathBuf::from(value);
    if !path.is_absolute() || path.parent().is_none() {
        return Err(CsiError::InvalidArgument(format!(
            "{what} must be an absolute path below /, got {value}"
        )));
    }
    Ok(path)
}

fn require_volume_id(volume_id: &VolumeId) -> Result<(), CsiError> {
    if volume_id.as_str().is_empty() {
        return Err(CsiError::InvalidArgument("volume_id is required".into()));
    }
    Ok(())
}

/// Same flavour (block vs. filesystem) and mode.
fn same_access(a: &VolumeCapability, b: &VolumeCapability) -> bool {
    a.access_mode == b.access_mode && a.access_type.is_block() == b.access_type.is_block()
}

/// [`CsiNode`] over a [`HostOps`] implementation.
pub struct NodeService<H> {
    host: Arc<H>,
    ctx: Arc<DriverContext>,
    stages: Arc<DashMap<VolumeId, StageRecord>>,
}

impl<H> Clone for NodeService<H> {
    fn clone(&self) -> Self {
        Self {
            host: Arc::clone(&self.host),
            ctx: Arc::clone(&self.ctx),
            stages: Arc::clone(&self.stages),
        }
    }
}

impl<H: HostOps> NodeService<H> {
    /// Build a node service on `host`.
    pub fn new(host: Arc<H>, ctx: Arc<DriverContext>) -> Self {
        Self {
            host,
            ctx,
            stages: Arc::new(DashMap::new()),
        }
    }

    /// The host this service drives.
    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    /// Current lifecycle state of `volume_id` on this node.
    pub fn stage_state(&self, volume_id: &VolumeId) -> StageState {
        self.stages
            .get(volume_id)
            .map_or(StageState::Unstaged, |r| r.state)
    }

    /// The stage record of `volume_id`, if any.
    pub fn stage_record(&self, volume_id: &VolumeId) -> Option<StageRecord> {
        self.stages.get(volume_id).map(|r| r.clone())
    }

    async fn lock_volume_path(
        &self,
        volume_id: &VolumeId,
        path: &Path,
    ) -> Result<(OpGuard, OpGuard), CsiError> {
        let volume = self
            .ctx
            .locks
            .acquire(OpKey::Volume(volume_id.clone()))
            .await?;
        let path = self
            .ctx
            .locks
            .acquire(OpKey::Path(path.to_string_lossy().into_owned()))
            .await?;
        Ok((volume, path))
    }

    async fn is_mounted(&self, path: &Path) -> Result<bool, CsiError> {
        Ok(self.host.mount_source(path).await?.is_some())
    }

    /// Per-volume copy of the stage record under the state directory.
    fn stage_index_path(&self, volume_id: &VolumeId) -> Option<PathBuf> {
        let dir = self.ctx.config.state_dir.as_ref()?;
        Some(dir.join(sidecar_name(volume_id.as_str(), STAGE_INDEX_SUFFIX)))
    }

    /// The record of `volume_id`.  After a restart it is reloaded from the
    /// per-volume index when there is one, else from beside `staging`.
    async fn load_record(
        &self,
        volume_id: &VolumeId,
        staging: &Path,
    ) -> Result<Option<StageRecord>, CsiError> {
        if let Some(record) = self.stages.get(volume_id) {
            return Ok(Some(record.clone()));
        }
        let mut sources = Vec::with_capacity(2);
        if let Some(index) = self.stage_index_path(volume_id) {
            sources.push(index);
        }
        sources.push(stage_metadata_path(staging));

        for path in sources {
            let Some(raw) = self.host.read_metadata(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<StageRecord>(&raw) {
                Ok(record) if record.volume_id == *volume_id => {
                    debug!(%volume_id, path = %path.display(), "reloaded stage record");
                    self.stages.insert(volume_id.clone(), record.clone());
                    return Ok(Some(record));
                }
                Ok(record) => {
                    warn!(
                        %volume_id,
                        found = %record.volume_id,
                        path = %path.display(),
                        "stage metadata belongs to another volume"
                    );
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable stage metadata");
                }
            }
        }
        Ok(None)
    }

    /// Write `record` beside its staging path and into the index, then
    /// publish it in memory.
    async fn save_record(&self, record: StageRecord) -> Result<(), CsiError> {
        let raw = serde_json::to_vec_pretty(&record).map_err(CsiError::internal)?;
        self.host
            .write_metadata(&stage_metadata_path(&record.staging_path), &raw)
            .await?;
        if let Some(index) = self.stage_index_path(&record.volume_id) {
            self.host.write_metadata(&index, &raw).await?;
        }
        self.stages.insert(record.volume_id.clone(), record);
        Ok(())
    }

    async fn forget_record(&self, record: &StageRecord) -> Result<(), CsiError> {
        self.host
            .remove_path(&stage_metadata_path(&record.staging_path))
            .await?;
        if let Some(index) = self.stage_index_path(&record.volume_id) {
            self.host.remove_path(&index).await?;
        }
        self.stages.remove(&record.volume_id);
        Ok(())
    }

    /// Whether the OS still shows what `record` claims.
    async fn still_staged(&self, record: &StageRecord) -> Result<bool, CsiError> {
        if record.state == StageState::Error {
            return Ok(false);
        }
        if record.is_block() {
            self.host.path_exists(&record.device).await
        } else {
            self.is_mounted(&record.staging_path).await
        }
    }

    // -- stage ----------------------------------------------------------------

    async fn stage_locked(
        &self,
        req: NodeStageVolumeRequest,
        staging: PathBuf,
        target: TargetDescriptor,
    ) -> Result<(), CsiError> {
        let volume_id = req.volume_id.clone();

        if let Some(record) = self.load_record(&volume_id, &staging).await? {
            if record.staging_path != staging {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {volume_id} is staged at {}",
                    record.staging_path.display()
                )));
            }
            if !same_access(&record.capability, &req.volume_capability) {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {volume_id} is staged with an incompatible capability"
                )));
            }
            if self.still_staged(&record).await? {
                debug!(%volume_id, "already staged");
                return Ok(());
            }
            warn!(%volume_id, state = ?record.state, "stage record no longer matches the host; restaging");
            self.stages.remove(&volume_id);
        }

        let block = req.volume_capability.access_type.is_block();
        if !block && let Some(source) = self.host.mount_source(&staging).await? {
            info!(%volume_id, %source, "adopting existing staging mount");
            return self
                .save_record(StageRecord {
                    volume_id,
                    staging_path: staging,
                    device: PathBuf::from(source),
                    target: Some(target),
                    capability: req.volume_capability,
                    targets: BTreeSet::new(),
                    state: StageState::Staged,
                })
                .await;
        }

        let max = self.ctx.config.max_volumes_per_node;
        if max > 0 && self.stages.len() as u64 >= max {
            return Err(CsiError::ResourceExhausted(format!(
                "node already hosts {max} volumes"
            )));
        }

        let device = self.host.attach_device(&target, &req.secrets).await?;
        if let AccessType::Mount {
            fs_type,
            mount_flags,
        } = &req.volume_capability.access_type
        {
            let fs_type = if fs_type.is_empty() {
                self.ctx.config.default_fs_type.as_str()
            } else {
                fs_type.as_str()
            };
            if let Err(e) = self
                .host
                .format_and_mount(&device, &staging, fs_type, mount_flags)
                .await
            {
                if let Err(detach) = self.host.detach_device(&device, Some(&target)).await {
                    warn!(%volume_id, error = %detach, "detach after failed mount also failed");
                }
                return Err(match e {
                    CsiError::MountFailed { .. } | CsiError::Internal(_) => e,
                    other => CsiError::Internal(other.to_string()),
                });
            }
        }

        info!(%volume_id, device = %device.display(), staging = %staging.display(), "volume staged");
        self.save_record(StageRecord {
            volume_id,
            staging_path: staging,
            device,
            target: Some(target),
            capability: req.volume_capability,
            targets: BTreeSet::new(),
            state: StageState::Staged,
        })
        .await
    }

    async fn unstage_locked(&self, volume_id: VolumeId, staging: PathBuf) -> Result<(), CsiError> {
        let Some(mut record) = self.load_record(&volume_id, &staging).await? else {
            if self.is_mounted(&staging).await? {
                info!(%volume_id, "unmounting unrecorded staging mount");
                self.host.unmount(&staging).await?;
            }
            return Ok(());
        };
        if record.staging_path != staging {
            debug!(%volume_id, staged_at = %record.staging_path.display(), "not staged at this path");
            return Ok(());
        }

        let mut live = BTreeSet::new();
        for target in &record.targets {
            if self.is_mounted(target).await? {
                live.insert(target.clone());
            } else {
                debug!(%volume_id, target = %target.display(), "dropping vanished target");
            }
        }
        if !live.is_empty() {
            record.targets = live;
            record.settle();
            let count = record.targets.len();
            self.save_record(record).await?;
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still published to {count} target(s)"
            )));
        }
        record.targets.clear();

        if self.is_mounted(&staging).await? {
            self.host.unmount(&staging).await?;
        }
        if let Err(e) = self
            .host
            .detach_device(&record.device, record.target.as_ref())
            .await
        {
            record.state = StageState::Error;
            self.save_record(record).await?;
            return Err(e);
        }
        self.forget_record(&record).await?;
        info!(%volume_id, "volume unstaged");
        Ok(())
    }

    // -- publish --------------------------------------------------------------

    async fn publish_locked(
        &self,
        req: NodePublishVolumeRequest,
        staging: PathBuf,
        target_path: PathBuf,
    ) -> Result<(), CsiError> {
        let volume_id = req.volume_id.clone();
        let block = req.volume_capability.access_type.is_block();

        let mut record = self.load_record(&volume_id, &staging).await?;
        if let Some(existing) = &record {
            if existing.staging_path != staging {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {volume_id} is staged at {}, not {}",
                    existing.staging_path.display(),
                    staging.display()
                )));
            }
            if !self.still_staged(existing).await? {
                warn!(%volume_id, "staging mount vanished; discarding stage record");
                self.stages.remove(&volume_id);
                record = None;
            }
        }
        let mut record = match record {
            Some(record) => record,
            None => match self.host.mount_source(&staging).await? {
                Some(source) if !block => {
                    info!(%volume_id, %source, "adopting staging mount for publish");
                    StageRecord {
                        volume_id: volume_id.clone(),
                        staging_path: staging.clone(),
                        device: PathBuf::from(source),
                        target: None,
                        capability: req.volume_capability.clone(),
                        targets: BTreeSet::new(),
                        state: StageState::Staged,
                    }
                }
                _ => {
                    return Err(CsiError::FailedPrecondition(format!(
                        "volume {volume_id} is not staged at {}",
                        staging.display()
                    )));
                }
            },
        };
        if record.is_block() != block {
            return Err(CsiError::InvalidArgument(format!(
                "volume {volume_id} is staged as {} but published as {}",
                if record.is_block() { "block" } else { "filesystem" },
                if block { "block" } else { "filesystem" },
            )));
        }

        if self.is_mounted(&target_path).await? {
            if record.targets.insert(target_path.clone()) {
                info!(%volume_id, target = %target_path.display(), "adopting existing target mount");
            } else {
                debug!(%volume_id, target = %target_path.display(), "already published");
            }
            record.settle();
            return self.save_record(record).await;
        }

        let readonly = req.read_only || req.volume_capability.access_mode.is_read_only();
        let source = if block {
            record.device.clone()
        } else {
            staging.clone()
        };
        self.host
            .bind_mount(&source, &target_path, readonly, block)
            .await?;
        record.targets.insert(target_path.clone());
        record.settle();
        info!(%volume_id, target = %target_path.display(), readonly, "volume published");
        self.save_record(record).await
    }

    async fn unpublish_locked(&self, volume_id: VolumeId, target_path: PathBuf) -> Result<(), CsiError> {
        if self.is_mounted(&target_path).await? {
            self.host.unmount(&target_path).await?;
        }
        self.host.remove_path(&target_path).await?;

        let record = self.stages.get(&volume_id).map(|r| r.clone());
        if let Some(mut record) = record
            && record.targets.remove(&target_path)
        {
            record.settle();
            self.save_record(record).await?;
        }
        info!(%volume_id, target = %target_path.display(), "volume unpublished");
        Ok(())
    }

    fn topology(&self) -> Topology {
        let mut segments = BTreeMap::from([(
            TOPOLOGY_NODE_KEY.to_owned(),
            self.ctx.config.node_id.clone(),
        )]);
        if let Some(zone) = &self.ctx.config.topology_zone {
            segments.insert(TOPOLOGY_ZONE_KEY.to_owned(), zone.clone());
        }
        Topology { segments }
    }
}

#[async_trait]
impl<H: HostOps> CsiNode for NodeService<H> {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, staging = %req.staging_target_path))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require_volume_id(&req.volume_id)?;
        let staging = require_path("staging_target_path", &req.staging_target_path)?;
        capability::check_capability(&self.ctx.config.access_policy, &req.volume_capability)?;
        let target = TargetDescriptor::from_publish_context(&req.publish_context)?;

        let guards = self.lock_volume_path(&req.volume_id, &staging).await?;
        let this = self.clone();
        detached(async move {
            let _guards = guards;
            this.stage_locked(req, staging, target).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require_volume_id(volume_id)?;
        let staging = require_path("staging_target_path", staging_target_path)?;

        let guards = self.lock_volume_path(volume_id, &staging).await?;
        let this = self.clone();
        let volume_id = volume_id.clone();
        detached(async move {
            let _guards = guards;
            this.unstage_locked(volume_id, staging).await
        })
        .await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require_volume_id(&req.volume_id)?;
        let staging = require_path("staging_target_path", &req.staging_target_path)?;
        let target_path = require_path("target_path", &req.target_path)?;
        if staging == target_path {
            return Err(CsiError::InvalidArgument(
                "target_path must differ from staging_target_path".into(),
            ));
        }
        capability::check_capability(&self.ctx.config.access_policy, &req.volume_capability)?;

        let guards = self.lock_volume_path(&req.volume_id, &target_path).await?;
        let this = self.clone();
        detached(async move {
            let _guards = guards;
            this.publish_locked(req, staging, target_path).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require_volume_id(volume_id)?;
        let target_path = require_path("target_path", target_path)?;

        let guards = self.lock_volume_path(volume_id, &target_path).await?;
        let this = self.clone();
        let volume_id = volume_id.clone();
        detached(async move {
            let _guards = guards;
            this.unpublish_locked(volume_id, target_path).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        require_volume_id(volume_id)?;
        let path = require_path("volume_path", volume_path)?;
        if !self.host.path_exists(&path).await? {
            return Err(CsiError::NotFound(format!("{volume_path} does not exist")));
        }

        let block_device = self
            .stages
            .get(volume_id)
            .filter(|r| r.is_block())
            .map(|r| r.device.clone());
        if let Some(device) = block_device {
            let size = self.host.device_size(&device).await?;
            return Ok(VolumeStats {
                usage: vec![VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total: size,
                    used: 0,
                    available: 0,
                }],
            });
        }

        if !self.is_mounted(&path).await? {
            return Err(CsiError::NotFound(format!(
                "volume {volume_id} is not mounted at {volume_path}"
            )));
        }
        let stats = self.host.filesystem_stats(&path).await?;
        Ok(VolumeStats {
            usage: vec![
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    available: stats.available_bytes,
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    available: stats.free_inodes,
                },
            ],
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(capability::node_capabilities())
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: NodeId::from(self.ctx.config.node_id.as_str()),
            max_volumes_per_node: self.ctx.config.max_volumes_per_node,
            accessible_topology: Some(self.topology()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeHost, HostOp};
    use super::*;
    use crate::config::DriverConfig;
    use crate::types::AccessMode;
    use std::collections::HashMap;

    const STAGING: &str = "/var/lib/kubelet/plugins/esan/pv-1/globalmount";
    const TARGET: &str = "/var/lib/kubelet/pods/p1/volumes/pv-1/mount";

    fn service_with(config: DriverConfig) -> NodeService<FakeHost> {
        NodeService::new(Arc::new(FakeHost::new()), DriverContext::new(config))
    }

    fn service() -> NodeService<FakeHost> {
        service_with(DriverConfig::default())
    }

    fn publish_context(lun: u32) -> HashMap<String, String> {
        TargetDescriptor::Iscsi {
            portals: vec!["192.0.2.10:3260".into()],
            iqn: "iqn.2024-01.io.esan:pool".into(),
            lun,
        }
        .to_publish_context()
    }

    fn stage_request(capability: VolumeCapability) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: "vol-1".into(),
            staging_target_path: STAGING.into(),
            volume_capability: capability,
            publish_context: publish_context(1),
            volume_context: HashMap::new(),
            secrets: HashMap::new(),
        }
    }

    fn publish_request(target: &str) -> NodePublishVolumeRequest {
        NodePublishVolumeRequest {
            volume_id: "vol-1".into(),
            staging_target_path: STAGING.into(),
            target_path: target.into(),
            volume_capability: VolumeCapability::mount(AccessMode::SingleNodeWriter),
            read_only: false,
        }
    }

    #[tokio::test]
    async fn stage_formats_and_mounts_once() {
        let svc = service();
        let req = stage_request(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        svc.stage_volume(req.clone()).await.unwrap();
        svc.stage_volume(req).await.unwrap();

        assert_eq!(svc.host().calls(HostOp::Attach), 1);
        assert_eq!(svc.host().calls(HostOp::FormatAndMount), 1);
        assert!(svc.host().mounted(STAGING).is_some());
        assert_eq!(svc.stage_state(&"vol-1".into()), StageState::Staged);
    }

    #[tokio::test]
    async fn stage_requires_publish_context() {
        let svc = service();
        let mut req = stage_request(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        req.publish_context.clear();
        let err = svc.stage_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));
        assert_eq!(svc.host().calls(HostOp::Attach), 0);
    }

    #[tokio::test]
    async fn stage_elsewhere_or_differently_is_refused() {
        let svc = service();
        svc.stage_volume(stage_request(VolumeCapability::mount(
            AccessMode::SingleNodeWriter,
        )))
        .await
        .unwrap();

        let mut moved = stage_request(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        moved.staging_target_path = "/var/lib/kubelet/plugins/esan/other/globalmount".into();
        assert!(matches!(
            svc.stage_volume(moved).await.unwrap_err(),
            CsiError::FailedPrecondition(_)
        ));

        let block = stage_request(VolumeCapability::block(AccessMode::SingleNodeWriter));
        assert!(matches!(
            svc.stage_volume(block).await.unwrap_err(),
            CsiError::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn failed_mount_detaches_and_leaves_no_record() {
        let svc = service();
        svc.host().fail_next(
            HostOp::FormatAndMount,
            CsiError::MountFailed {
                path: STAGING.into(),
                reason: "bad superblock".into(),
            },
        );
        let err = svc
            .stage_volume(stage_request(VolumeCapability::mount(
                AccessMode::SingleNodeWriter,
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::error::Code::Internal);
        assert_eq!(svc.stage_state(&"vol-1".into()), StageState::Unstaged);
        assert!(svc.host().attached_devices().is_empty());
    }

    #[tokio::test]
    async fn vanished_staging_mount_is_restaged() {
        let svc = service();
        let req = stage_request(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        svc.stage_volume(req.clone()).await.unwrap();
        svc.host().drop_mount(STAGING);

        svc.stage_volume(req).await.unwrap();
        assert_eq!(svc.host().calls(HostOp::FormatAndMount), 2);
        assert!(svc.host().mounted(STAGING).is_some());
    }

    #[tokio::test]
    async fn unrecorded_staging_mount_is_adopted() {
        let svc = service();
        svc.host().plant_mount(STAGING, "/dev/sdz");
        svc.stage_volume(stage_request(VolumeCapability::mount(
            AccessMode::SingleNodeWriter,
        )))
        .await
        .unwrap();
        assert_eq!(svc.host().calls(HostOp::Attach), 0);
        let record = svc.stage_record(&"vol-1".into()).unwrap();
        assert_eq!(record.device, PathBuf::from("/dev/sdz"));
    }

    #[tokio::test]
    async fn publish_counts_targets_and_blocks_unstage() {
        let svc = service();
        let vol: VolumeId = "vol-1".into();
        let second = "/var/lib/kubelet/pods/p2/volumes/pv-1/mount";
        svc.stage_volume(stage_request(VolumeCapability::mount(
            AccessMode::SingleNodeWriter,
        )))
        .await
        .unwrap();
        svc.publish_volume(publish_request(TARGET)).await.unwrap();
        svc.publish_volume(publish_request(TARGET)).await.unwrap();
        svc.publish_volume(publish_request(second)).await.unwrap();
        assert_eq!(svc.host().calls(HostOp::BindMount), 2);
        assert_eq!(svc.stage_record(&vol).unwrap().targets.len(), 2);
        assert_eq!(svc.stage_state(&vol), StageState::Published);

        let err = svc.unstage_volume(&vol, STAGING).await.unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));

        svc.unpublish_volume(&vol, TARGET).await.unwrap();
        svc.unpublish_volume(&vol, TARGET).await.unwrap();
        assert!(svc.unstage_volume(&vol, STAGING).await.is_err());
        svc.unpublish_volume(&vol, second).await.unwrap();
        assert_eq!(svc.stage_state(&vol), StageState::Staged);

        svc.unstage_volume(&vol, STAGING).await.unwrap();
        svc.unstage_volume(&vol, STAGING).await.unwrap();
        assert_eq!(svc.stage_state(&vol), StageState::Unstaged);
        assert_eq!(svc.host().mount_count(), 0);
        assert!(svc.host().attached_devices().is_empty());
    }

    #[tokio::test]
    async fn publish_without_stage_is_refused() {
        let svc = service();
        let err = svc.publish_volume(publish_request(TARGET)).await.unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn read_only_modes_publish_read_only() {
        let svc = service();
        svc.stage_volume(stage_request(VolumeCapability::mount(
            AccessMode::SingleNodeReaderOnly,
        )))
        .await
        .unwrap();
        let mut req = publish_request(TARGET);
        req.volume_capability = VolumeCapability::mount(AccessMode::SingleNodeReaderOnly);
        svc.publish_volume(req).await.unwrap();
        assert!(svc.host().is_readonly(TARGET));
    }

    #[tokio::test]
    async fn block_volume_binds_device() {
        let svc = service();
        let vol: VolumeId = "vol-1".into();
        svc.stage_volume(stage_request(VolumeCapability::block(
            AccessMode::SingleNodeWriter,
        )))
        .await
        .unwrap();
        assert_eq!(svc.host().calls(HostOp::FormatAndMount), 0);

        let mut req = publish_request("/var/lib/kubelet/pods/p1/volumeDevices/pv-1");
        req.volume_capability = VolumeCapability::block(AccessMode::SingleNodeWriter);
        svc.publish_volume(req).await.unwrap();

        let stats = svc
            .get_volume_stats(&vol, "/var/lib/kubelet/pods/p1/volumeDevices/pv-1")
            .await
            .unwrap();
        assert_eq!(stats.usage.len(), 1);
        assert_eq!(stats.usage[0].total, 1 << 30);
    }

    #[tokio::test]
    async fn stats_report_bytes_and_inodes() {
        let svc = service();
        let vol: VolumeId = "vol-1".into();
        svc.stage_volume(stage_request(VolumeCapability::mount(
            AccessMode::SingleNodeWriter,
        )))
        .await
        .unwrap();
        svc.publish_volume(publish_request(TARGET)).await.unwrap();

        let stats = svc.get_volume_stats(&vol, TARGET).await.unwrap();
        assert_eq!(stats.usage.len(), 2);
        assert_eq!(stats.usage[1].unit, UsageUnit::Inodes);

        let err = svc
            .get_volume_stats(&vol, "/var/lib/kubelet/pods/missing")
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::NotFound(_)));
    }

    #[tokio::test]
    async fn restarted_service_reloads_record_for_unstage() {
        let host = Arc::new(FakeHost::new());
        let ctx = DriverContext::new(DriverConfig::default());
        let vol: VolumeId = "vol-1".into();
        NodeService::new(Arc::clone(&host), Arc::clone(&ctx))
            .stage_volume(stage_request(VolumeCapability::mount(
                AccessMode::SingleNodeWriter,
            )))
            .await
            .unwrap();

        let restarted = NodeService::new(Arc::clone(&host), ctx);
        assert_eq!(restarted.stage_state(&vol), StageState::Unstaged);
        restarted.unstage_volume(&vol, STAGING).await.unwrap();
        assert!(host.attached_devices().is_empty());
        assert_eq!(host.calls(HostOp::Detach), 1);
    }

    #[tokio::test]
    async fn restarted_service_refuses_second_staging_path() {
        let host = Arc::new(FakeHost::new());
        let ctx = DriverContext::new(DriverConfig {
            state_dir: Some(PathBuf::from("/var/lib/esan-csi")),
            ..DriverConfig::default()
        });
        let vol: VolumeId = "vol-1".into();
        NodeService::new(Arc::clone(&host), Arc::clone(&ctx))
            .stage_volume(stage_request(VolumeCapability::mount(
                AccessMode::SingleNodeWriter,
            )))
            .await
            .unwrap();

        let restarted = NodeService::new(Arc::clone(&host), Arc::clone(&ctx));
        let mut moved = stage_request(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        moved.staging_target_path = "/var/lib/kubelet/plugins/esan/other/globalmount".into();
        assert!(matches!(
            restarted.stage_volume(moved).await.unwrap_err(),
            CsiError::FailedPrecondition(_)
        ));
        assert_eq!(host.calls(HostOp::Attach), 1);

        let restarted = NodeService::new(Arc::clone(&host), ctx);
        let mut elsewhere = publish_request(TARGET);
        elsewhere.staging_target_path = "/var/lib/kubelet/plugins/esan/other/globalmount".into();
        assert!(matches!(
            restarted.publish_volume(elsewhere).await.unwrap_err(),
            CsiError::FailedPrecondition(_)
        ));

        restarted.unstage_volume(&vol, STAGING).await.unwrap();
        let index = PathBuf::from("/var/lib/esan-csi/vol-1.stage.json");
        assert!(!host.path_exists(&index).await.unwrap());
    }

    #[tokio::test]
    async fn failed_detach_leaves_error_record_for_retry() {
        let svc = service();
        let vol: VolumeId = "vol-1".into();
        svc.stage_volume(stage_request(VolumeCapability::mount(
            AccessMode::SingleNodeWriter,
        )))
        .await
        .unwrap();
        svc.host()
            .fail_next(HostOp::Detach, CsiError::Internal("logout failed".into()));
        assert!(svc.unstage_volume(&vol, STAGING).await.is_err());
        assert_eq!(svc.stage_state(&vol), StageState::Error);

        svc.unstage_volume(&vol, STAGING).await.unwrap();
        assert_eq!(svc.stage_state(&vol), StageState::Unstaged);
    }

    #[tokio::test]
    async fn volume_limit_is_enforced() {
        let svc = service_with(DriverConfig {
            max_volumes_per_node: 1,
            ..DriverConfig::default()
        });
        svc.stage_volume(stage_request(VolumeCapability::mount(
            AccessMode::SingleNodeWriter,
        )))
        .await
        .unwrap();

        let mut second = stage_request(VolumeCapability::mount(AccessMode::SingleNodeWriter));
        second.volume_id = "vol-2".into();
        second.staging_target_path = "/var/lib/kubelet/plugins/esan/pv-2/globalmount".into();
        second.publish_context = publish_context(2);
        let err = svc.stage_volume(second).await.unwrap_err();
        assert!(matches!(err, CsiError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn node_info_carries_topology() {
        let svc = service_with(DriverConfig {
            node_id: "worker-1".into(),
            topology_zone: Some("zone-a".into()),
            ..DriverConfig::default()
        });
        let info = svc.get_info().await.unwrap();
        assert_eq!(info.node_id, NodeId::from("worker-1"));
        let topology = info.accessible_topology.unwrap();
        assert_eq!(topology.segments[TOPOLOGY_NODE_KEY], "worker-1");
        assert_eq!(topology.segments[TOPOLOGY_ZONE_KEY], "zone-a");
    }
}
