//! CSI Controller service.
//!
//! [`CsiController`] is the RPC surface; [`ControllerService`] implements it
//! on top of a [`BackendClient`] and the shared [`DriverContext`].
//!
//! Every mutating call follows the same shape:
//!
//! 1. validate the request (no locks, no backend calls);
//! 2. acquire the operation keys in `VolumeNode → Volume → Name` order;
//! 3. hand the guards to a detached task that performs the backend call and
//!    records the outcome in the registry.
//!
//! Step 3 means a caller that gives up (deadline, disconnect) only abandons
//! its wait.  The backend call still completes and the registry reflects
//! what really happened, so an identical retry finds a consistent record.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackendClient, BackendCreateRequest, BackendError, BackendVolume};
use crate::capability::{self, TOPOLOGY_ZONE_KEY};
use crate::context::{DriverContext, detached};
use crate::error::CsiError;
use crate::lock::{OpGuard, OpKey};
use crate::registry::{VolumeRecord, is_provisional, provisional_volume_id};
use crate::types::{
    AccessMode, CapacityRange, ControllerCapability, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, ControllerPublishVolumeRequest, CreateSnapshotRequest,
    CreateVolumeRequest, GetCapacityRequest, ListVolumesEntry, ListVolumesRequest,
    ListVolumesResponse, NodeId, PublishRecord, PublishState, Snapshot, SnapshotId, Topology,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability, VolumeContentSource, VolumeId,
    VolumeState,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume, or return the one already provisioned under the
    /// same name with compatible parameters.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Unknown ids succeed.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Map a volume to a node and return the publish context the node needs
    /// to find it.
    async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError>;

    /// Remove a node mapping.  Unknown pairs succeed.
    async fn unpublish_volume(&self, volume_id: &VolumeId, node_id: &NodeId)
    -> Result<(), CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// Grow a volume.
    async fn expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError>;

    /// One page of known volumes.
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError>;

    /// Available capacity in bytes for the pool the parameters select.
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<u64, CsiError>;

    /// Snapshot a volume, idempotent by name.
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError>;

    /// Delete a snapshot.  Unknown ids succeed.
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError>;

    /// Optional RPCs this controller implements.
    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}

/// Whether a failed backend call may still have changed array state.
fn outcome_uncertain(err: &BackendError) -> bool {
    matches!(err, BackendError::Unavailable(_) | BackendError::Internal(_))
}

fn require_id(what: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

/// [`CsiController`] backed by an e-SAN array.
pub struct ControllerService<B> {
    backend: Arc<B>,
    ctx: Arc<DriverContext>,
}

impl<B> Clone for ControllerService<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            ctx: Arc::clone(&self.ctx),
        }
    }
}

/// A validated `CreateVolume`.
#[derive(Debug, Clone)]
struct CreatePlan {
    template: Volume,
    range: Option<CapacityRange>,
    size_bytes: u64,
}

impl<B: BackendClient> ControllerService<B> {
    /// Build a controller over `backend`.
    pub fn new(backend: Arc<B>, ctx: Arc<DriverContext>) -> Self {
        Self { backend, ctx }
    }

    /// The array client.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    async fn lock(&self, key: OpKey) -> Result<OpGuard, CsiError> {
        self.ctx.locks.acquire(key).await
    }

    fn topology(&self) -> Vec<Topology> {
        match &self.ctx.config.topology_zone {
            Some(zone) => vec![Topology {
                segments: BTreeMap::from([(TOPOLOGY_ZONE_KEY.to_owned(), zone.clone())]),
            }],
            None => Vec::new(),
        }
    }

    // -- create ---------------------------------------------------------------

    fn plan_create(&self, req: &CreateVolumeRequest) -> Result<CreatePlan, CsiError> {
        require_id("name", &req.name)?;
        let config = &self.ctx.config;
        let access_modes =
            capability::access_modes_for_create(&config.access_policy, &req.volume_capabilities)?;
        let parameters = capability::filter_parameters(&config.allowed_parameters, &req.parameters)?;

        let range = req.capacity_range;
        let size_bytes = match range {
            Some(r) if r.required_bytes == 0 && r.limit_bytes == 0 => {
                return Err(CsiError::InvalidArgument(
                    "capacity_range must set required_bytes or limit_bytes".into(),
                ));
            }
            Some(r) if r.limit_bytes > 0 && r.required_bytes > r.limit_bytes => {
                return Err(CsiError::InvalidArgument(format!(
                    "required_bytes {} exceeds limit_bytes {}",
                    r.required_bytes, r.limit_bytes
                )));
            }
            Some(r) if r.target_bytes() > 0 => r.target_bytes(),
            _ => config.default_volume_size_bytes,
        };

        if let Some(source) = &req.content_source {
            if !self.backend.capabilities().clones {
                return Err(CsiError::Unimplemented(
                    "the array does not support volume content sources".into(),
                ));
            }
            match source {
                VolumeContentSource::Snapshot(id) => {
                    if self.ctx.registry.snapshot(id).is_none() {
                        return Err(CsiError::NotFound(format!("snapshot {id} not found")));
                    }
                }
                VolumeContentSource::Volume(id) => {
                    let ready = self
                        .ctx
                        .registry
                        .volume(id)
                        .is_some_and(|r| r.volume.state == VolumeState::Ready);
                    if !ready {
                        return Err(CsiError::volume_not_found(id));
                    }
                }
            }
        }

        Ok(CreatePlan {
            template: Volume {
                volume_id: VolumeId::default(),
                name: req.name.clone(),
                capacity_bytes: size_bytes,
                access_modes,
                parameters,
                volume_context: HashMap::new(),
                content_source: req.content_source.clone(),
                accessible_topology: self.topology(),
                state: VolumeState::Creating,
            },
            range,
            size_bytes,
        })
    }

    /// Whether `existing` was created by a request equivalent to `plan`.
    fn same_request(existing: &Volume, plan: &CreatePlan, check_capacity: bool) -> bool {
        let capacity_ok = !check_capacity
            || plan
                .range
                .is_none_or(|r| r.contains(existing.capacity_bytes));
        capacity_ok
            && existing.access_modes == plan.template.access_modes
            && existing.parameters == plan.template.parameters
            && existing.content_source == plan.template.content_source
    }

    async fn create_locked(&self, plan: CreatePlan) -> Result<Volume, CsiError> {
        let registry = &self.ctx.registry;
        let name = plan.template.name.clone();

        if let Some(existing) = registry.volume_by_name(&name) {
            match existing.volume.state {
                VolumeState::Ready => {
                    if Self::same_request(&existing.volume, &plan, true) {
                        debug!(%name, volume_id = %existing.volume.volume_id, "volume already exists");
                        return Ok(existing.volume);
                    }
                    return Err(CsiError::AlreadyExists(format!(
                        "volume {name} exists with different parameters"
                    )));
                }
                VolumeState::Deleting => {
                    return Err(CsiError::Aborted(format!(
                        "volume {name} is being deleted"
                    )));
                }
                VolumeState::Creating | VolumeState::Error => {
                    if !Self::same_request(&existing.volume, &plan, false) {
                        return Err(CsiError::AlreadyExists(format!(
                            "volume {name} is being created with different parameters"
                        )));
                    }
                    // A previous attempt never recorded its outcome.
                    let stale = existing.volume.volume_id;
                    match self.backend.lookup_volume(&name).await? {
                        Some(found) => {
                            info!(%name, volume_id = %found.id, "adopting volume found on array");
                            return self.finish_create(&stale, found, plan).await;
                        }
                        None => {
                            registry.remove_volume(&stale).await?;
                        }
                    }
                }
            }
        }

        let provisional = provisional_volume_id();
        let mut pending = plan.template.clone();
        pending.volume_id = provisional.clone();
        registry.put_volume(VolumeRecord::new(pending)).await?;

        let backend_req = BackendCreateRequest {
            name: name.clone(),
            size_bytes: plan.size_bytes,
            parameters: plan.template.parameters.clone(),
            content_source: plan.template.content_source.clone(),
        };
        match self.backend.create_volume(&backend_req).await {
            Ok(created) => self.finish_create(&provisional, created, plan).await,
            Err(BackendError::AlreadyExists(detail)) => {
                // Either a lost response for our own create, or a foreign
                // volume squatting on the name.
                let found = self.backend.lookup_volume(&name).await.ok().flatten();
                match found {
                    Some(found) if plan.range.is_none_or(|r| r.contains(found.size_bytes)) => {
                        self.finish_create(&provisional, found, plan).await
                    }
                    _ => {
                        registry.remove_volume(&provisional).await?;
                        Err(CsiError::AlreadyExists(detail))
                    }
                }
            }
            Err(err) => {
                if outcome_uncertain(&err) {
                    self.cleanup_partial_create(&name).await;
                }
                registry.remove_volume(&provisional).await?;
                Err(err.into())
            }
        }
    }

    /// Best-effort removal of a volume the array may have created before the
    /// call failed.
    async fn cleanup_partial_create(&self, name: &str) {
        match self.backend.lookup_volume(name).await {
            Ok(Some(orphan)) => {
                if let Err(e) = self.backend.delete_volume(&orphan.id).await {
                    warn!(%name, volume_id = %orphan.id, error = %e, "failed to delete half-created volume");
                } else {
                    info!(%name, volume_id = %orphan.id, "deleted half-created volume");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%name, error = %e, "could not check for half-created volume"),
        }
    }

    async fn finish_create(
        &self,
        provisional: &VolumeId,
        created: BackendVolume,
        plan: CreatePlan,
    ) -> Result<Volume, CsiError> {
        let registry = &self.ctx.registry;
        if let Some(range) = plan.range
            && !range.contains(created.size_bytes)
        {
            warn!(volume_id = %created.id, size = created.size_bytes, ?range, "array returned capacity outside the requested range");
            if let Err(e) = self.backend.delete_volume(&created.id).await {
                warn!(volume_id = %created.id, error = %e, "failed to delete out-of-range volume");
            }
            registry
                .transition(provisional, VolumeState::Error)
                .await?;
            registry.remove_volume(provisional).await?;
            return Err(CsiError::OutOfRange(format!(
                "array allocated {} bytes, outside [{}, {}]",
                created.size_bytes, range.required_bytes, range.limit_bytes
            )));
        }

        let volume = Volume {
            volume_id: created.id,
            capacity_bytes: created.size_bytes,
            volume_context: created.context,
            state: VolumeState::Ready,
            ..plan.template
        };
        registry.put_volume(VolumeRecord::new(volume.clone())).await?;
        registry.remove_volume(provisional).await?;
        info!(name = %volume.name, volume_id = %volume.volume_id, capacity = volume.capacity_bytes, "volume created");
        Ok(volume)
    }

    // -- delete ---------------------------------------------------------------

    async fn delete_locked(&self, volume_id: VolumeId) -> Result<(), CsiError> {
        let registry = &self.ctx.registry;
        let Some(record) = registry.volume(&volume_id) else {
            return Ok(());
        };
        let pinned: Vec<_> = record.active_publishes().map(|p| p.node_id.to_string()).collect();
        if !pinned.is_empty() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {volume_id} is still published to {}",
                pinned.join(", ")
            )));
        }
        if record.volume.state == VolumeState::Creating {
            return Err(CsiError::Aborted(format!(
                "volume {volume_id} is still being created"
            )));
        }

        registry
            .transition(&volume_id, VolumeState::Deleting)
            .await?;
        match self.backend.delete_volume(&volume_id).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        registry.remove_volume(&volume_id).await?;
        info!(%volume_id, "volume deleted");
        Ok(())
    }

    // -- publish --------------------------------------------------------------

    /// Record the outcome of an attach under the volume key.
    async fn commit_publish(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        outcome: Result<HashMap<String, String>, BackendError>,
    ) -> Result<HashMap<String, String>, CsiError> {
        let _volume_guard = self.lock(OpKey::Volume(volume_id.clone())).await?;
        match outcome {
            Ok(context) => {
                let ctx = context.clone();
                self.ctx
                    .registry
                    .update_volume(volume_id, |r| {
                        if let Some(p) = r.publishes.get_mut(node_id) {
                            p.state = PublishState::Published;
                            p.publish_context = ctx;
                        }
                    })
                    .await?;
                info!(%volume_id, %node_id, "volume published");
                Ok(context)
            }
            Err(err) if outcome_uncertain(&err) => {
                // The mapping may exist; keep the record pinned so a retry or
                // an unpublish can settle it.
                warn!(%volume_id, %node_id, error = %err, "attach outcome unknown");
                Err(err.into())
            }
            Err(err) => {
                self.ctx
                    .registry
                    .update_volume(volume_id, |r| {
                        r.publishes.remove(node_id);
                    })
                    .await?;
                Err(err.into())
            }
        }
    }

    fn exclusivity_conflict(
        &self,
        record: &VolumeRecord,
        node_id: &NodeId,
        mode: AccessMode,
        readonly: bool,
    ) -> Option<String> {
        let others: Vec<&PublishRecord> = record
            .active_publishes()
            .filter(|p| &p.node_id != node_id)
            .collect();
        let Some(first) = others.first() else {
            return None;
        };
        if !self
            .ctx
            .config
            .access_policy
            .permits_multi_attach(&record.volume.access_modes)
        {
            return Some(format!(
                "volume {} is already published to node {}",
                record.volume.volume_id, first.node_id
            ));
        }
        let writes = !readonly && !mode.is_read_only();
        let single_writer = record
            .volume
            .access_modes
            .iter()
            .all(|m| matches!(m, AccessMode::MultiNodeSingleWriter | AccessMode::MultiNodeReaderOnly));
        if writes
            && single_writer
            && let Some(writer) = others
                .iter()
                .find(|p| !p.readonly && !p.access_mode.is_read_only())
        {
            return Some(format!(
                "volume {} already has a writer on node {}",
                record.volume.volume_id, writer.node_id
            ));
        }
        None
    }

    // -- unpublish ------------------------------------------------------------

    async fn commit_unpublish(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
        outcome: Result<(), BackendError>,
    ) -> Result<(), CsiError> {
        match outcome {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let _volume_guard = self.lock(OpKey::Volume(volume_id.clone())).await?;
        if self.ctx.registry.volume(volume_id).is_some() {
            self.ctx
                .registry
                .update_volume(volume_id, |r| {
                    r.publishes.remove(node_id);
                })
                .await?;
        }
        info!(%volume_id, %node_id, "volume unpublished");
        Ok(())
    }

    // -- snapshots ------------------------------------------------------------

    async fn create_snapshot_locked(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        let registry = &self.ctx.registry;
        if let Some(existing) = registry.snapshot_by_name(&req.name) {
            if existing.source_volume_id == req.source_volume_id {
                return Ok(existing);
            }
            return Err(CsiError::AlreadyExists(format!(
                "snapshot {} exists for volume {}",
                req.name, existing.source_volume_id
            )));
        }
        let source_known = registry
            .volume(&req.source_volume_id)
            .is_some_and(|r| r.volume.state == VolumeState::Ready);
        if !source_known {
            return Err(CsiError::volume_not_found(&req.source_volume_id));
        }

        let created = self
            .backend
            .create_snapshot(&req.source_volume_id, &req.name)
            .await?;
        let created_at = if created.created_at.is_empty() {
            chrono::Utc::now().to_rfc3339()
        } else {
            created.created_at
        };
        let snapshot = Snapshot {
            snapshot_id: created.id,
            name: created.name,
            source_volume_id: created.source_volume_id,
            size_bytes: created.size_bytes,
            created_at,
            ready_to_use: created.ready_to_use,
        };
        registry.put_snapshot(snapshot.clone()).await?;
        info!(name = %snapshot.name, snapshot_id = %snapshot.snapshot_id, "snapshot created");
        Ok(snapshot)
    }
}

#[async_trait]
impl<B: BackendClient> CsiController for ControllerService<B> {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        let plan = self.plan_create(&req)?;
        let guard = self.lock(OpKey::Name(req.name.clone())).await?;
        let this = self.clone();
        detached(async move {
            let _guard = guard;
            this.create_locked(plan).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        require_id("volume_id", volume_id.as_str())?;
        if is_provisional(volume_id) {
            return Ok(());
        }
        let volume_guard = self.lock(OpKey::Volume(volume_id.clone())).await?;
        let Some(record) = self.ctx.registry.volume(volume_id) else {
            debug!(%volume_id, "delete of unknown volume");
            return Ok(());
        };
        let name_guard = self.lock(OpKey::Name(record.volume.name)).await?;
        let this = self.clone();
        let volume_id = volume_id.clone();
        detached(async move {
            let _guards = (volume_guard, name_guard);
            this.delete_locked(volume_id).await
        })
        .await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        require_id("volume_id", req.volume_id.as_str())?;
        require_id("node_id", req.node_id.as_str())?;
        capability::check_capability(&self.ctx.config.access_policy, &req.volume_capability)?;
        let mode = req.volume_capability.access_mode;
        let readonly = req.readonly;

        let pair_guard = self
            .lock(OpKey::VolumeNode(req.volume_id.clone(), req.node_id.clone()))
            .await?;
        let volume_guard = self.lock(OpKey::Volume(req.volume_id.clone())).await?;

        let registry = &self.ctx.registry;
        let record = registry
            .volume(&req.volume_id)
            .filter(|_| !is_provisional(&req.volume_id))
            .ok_or_else(|| CsiError::volume_not_found(&req.volume_id))?;
        if record.volume.state != VolumeState::Ready {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is {:?}",
                req.volume_id, record.volume.state
            )));
        }
        if !record.volume.access_modes.contains(&mode) {
            return Err(CsiError::InvalidArgument(format!(
                "volume {} was not created for access mode {mode:?}",
                req.volume_id
            )));
        }

        match record.publishes.get(&req.node_id) {
            Some(p) if p.state == PublishState::Published => {
                let same = p.access_mode == mode && p.readonly == readonly;
                let flexible = self
                    .ctx
                    .config
                    .access_policy
                    .permits_multi_attach(&record.volume.access_modes);
                if same || flexible {
                    return Ok(p.publish_context.clone());
                }
                return Err(CsiError::AlreadyExists(format!(
                    "volume {} is published to node {} with {:?} (readonly={})",
                    req.volume_id, req.node_id, p.access_mode, p.readonly
                )));
            }
            Some(p) if p.state == PublishState::Unpublishing => {
                return Err(CsiError::Aborted(format!(
                    "volume {} is being unpublished from node {}",
                    req.volume_id, req.node_id
                )));
            }
            Some(_) => {
                // Publishing left behind by an earlier attempt; attach again.
            }
            None => {
                if let Some(reason) =
                    self.exclusivity_conflict(&record, &req.node_id, mode, readonly)
                {
                    return Err(CsiError::FailedPrecondition(reason));
                }
            }
        }

        let pending = PublishRecord {
            node_id: req.node_id.clone(),
            access_mode: mode,
            readonly,
            state: PublishState::Publishing,
            publish_context: HashMap::new(),
        };
        registry
            .update_volume(&req.volume_id, |r| {
                r.publishes.insert(pending.node_id.clone(), pending);
            })
            .await?;
        drop(volume_guard);

        let this = self.clone();
        detached(async move {
            let _pair_guard = pair_guard;
            let outcome = this
                .backend
                .attach_volume(&req.volume_id, &req.node_id)
                .await
                .map(|target| target.to_publish_context());
            this.commit_publish(&req.volume_id, &req.node_id, outcome)
                .await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        node_id: &NodeId,
    ) -> Result<(), CsiError> {
        require_id("volume_id", volume_id.as_str())?;
        require_id("node_id", node_id.as_str())?;
        let pair_guard = self
            .lock(OpKey::VolumeNode(volume_id.clone(), node_id.clone()))
            .await?;
        let volume_guard = self.lock(OpKey::Volume(volume_id.clone())).await?;

        let registry = &self.ctx.registry;
        let Some(record) = registry.volume(volume_id) else {
            return Ok(());
        };
        if !record.publishes.contains_key(node_id) {
            return Ok(());
        }
        registry
            .update_volume(volume_id, |r| {
                if let Some(p) = r.publishes.get_mut(node_id) {
                    p.state = PublishState::Unpublishing;
                }
            })
            .await?;
        drop(volume_guard);

        let this = self.clone();
        let volume_id = volume_id.clone();
        let node_id = node_id.clone();
        detached(async move {
            let _pair_guard = pair_guard;
            let outcome = this.backend.detach_volume(&volume_id, &node_id).await;
            this.commit_unpublish(&volume_id, &node_id, outcome).await
        })
        .await
    }

    #[instrument(skip(self, capabilities))]
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        require_id("volume_id", volume_id.as_str())?;
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume_capabilities must not be empty".into(),
            ));
        }
        let record = self
            .ctx
            .registry
            .volume(volume_id)
            .filter(|r| r.volume.state != VolumeState::Creating)
            .ok_or_else(|| CsiError::volume_not_found(volume_id))?;
        let response = match capability::confirm_for_volume(
            &self.ctx.config.access_policy,
            &record.volume,
            capabilities,
        ) {
            Ok(()) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(capabilities.to_vec()),
                message: String::new(),
            },
            Err(message) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message,
            },
        };
        Ok(response)
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        require_id("volume_id", req.volume_id.as_str())?;
        let range = req.capacity_range;
        if range.required_bytes == 0 && range.limit_bytes == 0 {
            return Err(CsiError::InvalidArgument("capacity_range is required".into()));
        }
        if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
            return Err(CsiError::InvalidArgument(format!(
                "required_bytes {} exceeds limit_bytes {}",
                range.required_bytes, range.limit_bytes
            )));
        }
        let caps = self.backend.capabilities();
        if !caps.expansion {
            return Err(CsiError::Unimplemented(
                "the array does not support expansion".into(),
            ));
        }

        let guard = self.lock(OpKey::Volume(req.volume_id.clone())).await?;
        let record = self
            .ctx
            .registry
            .volume(&req.volume_id)
            .ok_or_else(|| CsiError::volume_not_found(&req.volume_id))?;
        if record.volume.state != VolumeState::Ready {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is {:?}",
                req.volume_id, record.volume.state
            )));
        }
        let current = record.volume.capacity_bytes;
        if range.limit_bytes > 0 && range.limit_bytes < current {
            return Err(CsiError::OutOfRange(format!(
                "volume {} is {current} bytes; shrinking to {} is not supported",
                req.volume_id, range.limit_bytes
            )));
        }
        if range.required_bytes <= current {
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: current,
                node_expansion_required: false,
            });
        }
        if !caps.online_expansion && record.active_publishes().next().is_some() {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} must be unpublished before it can grow",
                req.volume_id
            )));
        }

        let this = self.clone();
        detached(async move {
            let _guard = guard;
            let grown = this
                .backend
                .expand_volume(&req.volume_id, range.required_bytes)
                .await?;
            this.ctx
                .registry
                .update_volume(&req.volume_id, |r| r.volume.capacity_bytes = grown)
                .await?;
            if !range.contains(grown) {
                return Err(CsiError::OutOfRange(format!(
                    "array grew volume {} to {grown} bytes, outside the requested range",
                    req.volume_id
                )));
            }
            info!(volume_id = %req.volume_id, from = current, to = grown, "volume expanded");
            Ok(ControllerExpandVolumeResponse {
                capacity_bytes: grown,
                node_expansion_required: false,
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError> {
        let records: Vec<VolumeRecord> = self
            .ctx
            .registry
            .list_volumes()
            .into_iter()
            .filter(|r| matches!(r.volume.state, VolumeState::Ready | VolumeState::Deleting))
            .collect();

        let start = match req.starting_token.as_deref().filter(|t| !t.is_empty()) {
            None => 0,
            Some(token) => records
                .iter()
                .position(|r| r.volume.volume_id.as_str() == token)
                .ok_or_else(|| CsiError::Aborted(format!("invalid starting_token {token}")))?,
        };
        let page = if req.max_entries == 0 {
            records.len() - start
        } else {
            req.max_entries
        };
        let end = start.saturating_add(page).min(records.len());
        let next_token = records
            .get(end)
            .map(|r| r.volume.volume_id.to_string());
        let entries = records[start..end]
            .iter()
            .map(|r| ListVolumesEntry {
                published_node_ids: r.published_node_ids(),
                volume: r.volume.clone(),
            })
            .collect();
        Ok(ListVolumesResponse {
            entries,
            next_token,
        })
    }

    #[instrument(skip(self, req))]
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<u64, CsiError> {
        let parameters =
            capability::filter_parameters(&self.ctx.config.allowed_parameters, &req.parameters)?;
        Ok(self.backend.capacity(&parameters).await?)
    }

    #[instrument(skip(self, req), fields(name = %req.name, source = %req.source_volume_id))]
    async fn create_snapshot(&self, req: CreateSnapshotRequest) -> Result<Snapshot, CsiError> {
        require_id("name", &req.name)?;
        require_id("source_volume_id", req.source_volume_id.as_str())?;
        if !self.backend.capabilities().snapshots {
            return Err(CsiError::Unimplemented(
                "the array does not support snapshots".into(),
            ));
        }
        let guard = self.lock(OpKey::SnapshotName(req.name.clone())).await?;
        let this = self.clone();
        detached(async move {
            let _guard = guard;
            this.create_snapshot_locked(req).await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, snapshot_id: &SnapshotId) -> Result<(), CsiError> {
        require_id("snapshot_id", snapshot_id.as_str())?;
        let Some(snapshot) = self.ctx.registry.snapshot(snapshot_id) else {
            return Ok(());
        };
        let guard = self.lock(OpKey::SnapshotName(snapshot.name)).await?;
        let this = self.clone();
        let snapshot_id = snapshot_id.clone();
        detached(async move {
            let _guard = guard;
            if this.ctx.registry.snapshot(&snapshot_id).is_none() {
                return Ok(());
            }
            match this.backend.delete_snapshot(&snapshot_id).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            this.ctx.registry.remove_snapshot(&snapshot_id).await?;
            info!(%snapshot_id, "snapshot deleted");
            Ok(())
        })
        .await
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(capability::controller_capabilities(
            self.backend.capabilities(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FakeBackend, FakeOp};
    use crate::config::DriverConfig;

    fn service(backend: FakeBackend) -> ControllerService<FakeBackend> {
        ControllerService::new(Arc::new(backend), DriverContext::new(DriverConfig::default()))
    }

    fn request(name: &str, required: u64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: Some(CapacityRange::at_least(required)),
            volume_capabilities: vec![VolumeCapability::mount(AccessMode::SingleNodeWriter)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_records_ready_volume() {
        let svc = service(FakeBackend::new());
        let vol = svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap();
        assert_eq!(vol.state, VolumeState::Ready);
        assert!(!is_provisional(&vol.volume_id));
        assert_eq!(svc.ctx.registry.volume_count(), 1);
    }

    #[tokio::test]
    async fn failed_create_leaves_no_record() {
        let backend = FakeBackend::new();
        backend.fail_next(FakeOp::Create, BackendError::CapacityExhausted("pool".into()));
        let svc = service(backend);
        let err = svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap_err();
        assert!(matches!(err, CsiError::ResourceExhausted(_)));
        assert_eq!(svc.ctx.registry.volume_count(), 0);
    }

    #[tokio::test]
    async fn uncertain_create_cleans_up_array() {
        let backend = FakeBackend::new();
        backend.fail_next_create_after_commit(BackendError::Unavailable("timeout".into()));
        let svc = service(backend);
        let err = svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap_err();
        assert!(matches!(err, CsiError::Unavailable(_)));
        assert_eq!(svc.backend().volume_count(), 0);
        assert_eq!(svc.ctx.registry.volume_count(), 0);

        // The retry provisions cleanly.
        svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap();
        assert_eq!(svc.backend().volume_count(), 1);
    }

    #[tokio::test]
    async fn capacity_outside_limit_is_out_of_range() {
        let svc = service(FakeBackend::new());
        let mut req = request("pvc-1", 1);
        req.capacity_range = Some(CapacityRange {
            required_bytes: 1,
            limit_bytes: 1024,
        });
        // The fake rounds up to whole MiB.
        let err = svc.create_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::OutOfRange(_)));
        assert_eq!(svc.backend().volume_count(), 0);
        assert_eq!(svc.ctx.registry.volume_count(), 0);
    }

    #[tokio::test]
    async fn crash_left_creating_record_is_reconciled() {
        let svc = service(FakeBackend::new());
        let created = svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap();

        // Simulate a restart that lost the Ready record but kept the pending one.
        let registry = &svc.ctx.registry;
        registry.remove_volume(&created.volume_id).await.unwrap();
        let mut pending = created.clone();
        pending.volume_id = provisional_volume_id();
        pending.state = VolumeState::Creating;
        registry.put_volume(VolumeRecord::new(pending)).await.unwrap();

        let again = svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap();
        assert_eq!(again.volume_id, created.volume_id);
        assert_eq!(svc.backend().calls(FakeOp::Create), 1);
        assert_eq!(registry.volume_count(), 1);
    }

    #[tokio::test]
    async fn expand_grows_and_rejects_shrink() {
        let svc = service(FakeBackend::new());
        let vol = svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap();

        let grown = svc
            .expand_volume(ControllerExpandVolumeRequest {
                volume_id: vol.volume_id.clone(),
                capacity_range: CapacityRange::at_least(2 << 30),
            })
            .await
            .unwrap();
        assert_eq!(grown.capacity_bytes, 2 << 30);

        let noop = svc
            .expand_volume(ControllerExpandVolumeRequest {
                volume_id: vol.volume_id.clone(),
                capacity_range: CapacityRange::at_least(1 << 30),
            })
            .await
            .unwrap();
        assert_eq!(noop.capacity_bytes, 2 << 30);
        assert_eq!(svc.backend().calls(FakeOp::Expand), 1);

        let err = svc
            .expand_volume(ControllerExpandVolumeRequest {
                volume_id: vol.volume_id,
                capacity_range: CapacityRange {
                    required_bytes: 1 << 30,
                    limit_bytes: 1 << 30,
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::OutOfRange(_)));
    }

    #[tokio::test]
    async fn list_volumes_paginates() {
        let svc = service(FakeBackend::new());
        for i in 0..5 {
            svc.create_volume(request(&format!("pvc-{i}"), 1 << 20))
                .await
                .unwrap();
        }
        let first = svc
            .list_volumes(ListVolumesRequest {
                max_entries: 2,
                starting_token: None,
            })
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 2);
        let token = first.next_token.unwrap();

        let rest = svc
            .list_volumes(ListVolumesRequest {
                max_entries: 0,
                starting_token: Some(token),
            })
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 3);
        assert!(rest.next_token.is_none());

        let err = svc
            .list_volumes(ListVolumesRequest {
                max_entries: 1,
                starting_token: Some("bogus".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Aborted(_)));
    }

    #[tokio::test]
    async fn snapshots_are_idempotent_by_name() {
        let svc = service(FakeBackend::new());
        let vol = svc.create_volume(request("pvc-1", 1 << 30)).await.unwrap();
        let snap_req = CreateSnapshotRequest {
            name: "snap-1".into(),
            source_volume_id: vol.volume_id.clone(),
            ..Default::default()
        };
        let first = svc.create_snapshot(snap_req.clone()).await.unwrap();
        let second = svc.create_snapshot(snap_req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(svc.backend().calls(FakeOp::CreateSnapshot), 1);
        assert!(chrono::DateTime::parse_from_rfc3339(&first.created_at).is_ok());

        let err = svc
            .create_snapshot(CreateSnapshotRequest {
                name: "snap-1".into(),
                source_volume_id: "other".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)));

        svc.delete_snapshot(&first.snapshot_id).await.unwrap();
        svc.delete_snapshot(&first.snapshot_id).await.unwrap();
        assert_eq!(svc.backend().calls(FakeOp::DeleteSnapshot), 1);
    }

    #[tokio::test]
    async fn snapshot_without_capability_is_unimplemented() {
        let svc = service(FakeBackend::new().with_capabilities(Default::default()));
        let err = svc
            .create_snapshot(CreateSnapshotRequest {
                name: "snap".into(),
                source_volume_id: "vol".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Unimplemented(_)));
        assert!(
            !svc.get_capabilities()
                .await
                .unwrap()
                .contains(&ControllerCapability::CreateDeleteSnapshot)
        );
    }
}
