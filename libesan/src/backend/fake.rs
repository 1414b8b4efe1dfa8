//! In-memory array used by unit and integration tests.
//!
//! [`FakeBackend`] behaves like an idempotent e-SAN array: names are unique,
//! sizes round up to an allocation unit, attachments hand out LUNs, and pool
//! capacity is finite.  Tests can count calls per operation, inject failures
//! and add latency to provoke races.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{
    BackendCapabilities, BackendClient, BackendCreateRequest, BackendError, BackendSnapshot,
    BackendVolume, TargetDescriptor,
};
use crate::types::{NodeId, SnapshotId, VolumeContentSource, VolumeId};

const ALLOCATION_UNIT: u64 = 1 << 20; // 1 MiB
const FAKE_PORTAL: &str = "192.0.2.10:3260";

/// Backend operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    /// `create_volume`
    Create,
    /// `lookup_volume`
    Lookup,
    /// `delete_volume`
    Delete,
    /// `attach_volume`
    Attach,
    /// `detach_volume`
    Detach,
    /// `expand_volume`
    Expand,
    /// `create_snapshot`
    CreateSnapshot,
    /// `delete_snapshot`
    DeleteSnapshot,
    /// `capacity`
    Capacity,
    /// `probe`
    Probe,
}

const OPS: usize = 10;

impl FakeOp {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
struct FakeVolume {
    volume: BackendVolume,
    attachments: HashMap<NodeId, u32>,
}

#[derive(Debug, Default)]
struct FakeState {
    volumes: HashMap<VolumeId, FakeVolume>,
    snapshots: HashMap<SnapshotId, BackendSnapshot>,
    next_lun: u32,
    next_id: u64,
}

impl FakeState {
    fn used_bytes(&self) -> u64 {
        self.volumes.values().map(|v| v.volume.size_bytes).sum()
    }

    fn allocate_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:06}", self.next_id)
    }
}

/// Deterministic in-memory array.
#[derive(Debug)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    failures: Mutex<HashMap<FakeOp, VecDeque<BackendError>>>,
    partial_create: Mutex<Option<BackendError>>,
    calls: [AtomicUsize; OPS],
    capabilities: BackendCapabilities,
    pool_bytes: u64,
    latency: Duration,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    /// An array with every optional capability and a 1 TiB pool.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            failures: Mutex::new(HashMap::new()),
            partial_create: Mutex::new(None),
            calls: Default::default(),
            capabilities: BackendCapabilities {
                snapshots: true,
                clones: true,
                expansion: true,
                online_expansion: true,
            },
            pool_bytes: 1 << 40,
            latency: Duration::ZERO,
        }
    }

    /// Replace the advertised capabilities.
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Limit the pool size.
    pub fn with_pool_bytes(mut self, pool_bytes: u64) -> Self {
        self.pool_bytes = pool_bytes;
        self
    }

    /// Sleep this long inside every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next call of `op` fail with `err` without side effects.
    pub fn fail_next(&self, op: FakeOp, err: BackendError) {
        lock(&self.failures).entry(op).or_default().push_back(err);
    }

    /// Make the next create allocate the volume and then report `err`, as an
    /// array does when it fails after committing.
    pub fn fail_next_create_after_commit(&self, err: BackendError) {
        *lock(&self.partial_create) = Some(err);
    }

    /// How many times `op` has been called.
    pub fn calls(&self, op: FakeOp) -> usize {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    /// Number of volumes on the array.
    pub fn volume_count(&self) -> usize {
        lock(&self.state).volumes.len()
    }

    /// A volume by id.
    pub fn volume(&self, id: &VolumeId) -> Option<BackendVolume> {
        lock(&self.state).volumes.get(id).map(|v| v.volume.clone())
    }

    /// Hosts a volume is mapped to.
    pub fn attachments(&self, id: &VolumeId) -> Vec<NodeId> {
        let state = lock(&self.state);
        let mut hosts: Vec<NodeId> = state
            .volumes
            .get(id)
            .map(|v| v.attachments.keys().cloned().collect())
            .unwrap_or_default();
        hosts.sort();
        hosts
    }

    async fn enter(&self, op: FakeOp) -> Result<(), BackendError> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match lock(&self.failures).get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => {
                debug!(?op, %err, "fake backend injecting failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn round_up(size: u64) -> u64 {
    size.div_ceil(ALLOCATION_UNIT).max(1) * ALLOCATION_UNIT
}

#[async_trait]
impl BackendClient for FakeBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    async fn create_volume(
        &self,
        req: &BackendCreateRequest,
    ) -> Result<BackendVolume, BackendError> {
        self.enter(FakeOp::Create).await?;
        let size = round_up(req.size_bytes);
        let mut state = lock(&self.state);

        if let Some(existing) = state.volumes.values().find(|v| v.volume.name == req.name) {
            if existing.volume.size_bytes == size {
                return Ok(existing.volume.clone());
            }
            return Err(BackendError::AlreadyExists(format!(
                "volume name {} with size {}",
                req.name, existing.volume.size_bytes
            )));
        }

        match &req.content_source {
            Some(VolumeContentSource::Snapshot(id)) if !state.snapshots.contains_key(id) => {
                return Err(BackendError::NotFound(format!("snapshot {id}")));
            }
            Some(VolumeContentSource::Volume(id)) if !state.volumes.contains_key(id) => {
                return Err(BackendError::NotFound(format!("volume {id}")));
            }
            _ => {}
        }

        if state.used_bytes() + size > self.pool_bytes {
            return Err(BackendError::CapacityExhausted(format!(
                "pool has {} bytes free, {size} requested",
                self.pool_bytes - state.used_bytes()
            )));
        }

        let id = VolumeId(state.allocate_id("esan-vol"));
        let volume = BackendVolume {
            id: id.clone(),
            name: req.name.clone(),
            size_bytes: size,
            context: HashMap::from([("wwn".to_owned(), format!("naa.6000{}", id.as_str()))]),
        };
        state.volumes.insert(
            id,
            FakeVolume {
                volume: volume.clone(),
                attachments: HashMap::new(),
            },
        );

        if let Some(err) = lock(&self.partial_create).take() {
            return Err(err);
        }
        Ok(volume)
    }

    async fn lookup_volume(&self, name: &str) -> Result<Option<BackendVolume>, BackendError> {
        self.enter(FakeOp::Lookup).await?;
        Ok(lock(&self.state)
            .volumes
            .values()
            .find(|v| v.volume.name == name)
            .map(|v| v.volume.clone()))
    }

    async fn delete_volume(&self, id: &VolumeId) -> Result<(), BackendError> {
        self.enter(FakeOp::Delete).await?;
        let mut state = lock(&self.state);
        let Some(volume) = state.volumes.get(id) else {
            return Err(BackendError::NotFound(format!("volume {id}")));
        };
        if !volume.attachments.is_empty() {
            return Err(BackendError::Rejected(format!(
                "volume {id} still has host mappings"
            )));
        }
        state.volumes.remove(id);
        Ok(())
    }

    async fn attach_volume(
        &self,
        id: &VolumeId,
        host: &NodeId,
    ) -> Result<TargetDescriptor, BackendError> {
        self.enter(FakeOp::Attach).await?;
        let mut state = lock(&self.state);
        let next_lun = state.next_lun;
        let Some(volume) = state.volumes.get_mut(id) else {
            return Err(BackendError::NotFound(format!("volume {id}")));
        };
        let mut allocated = false;
        let lun = *volume.attachments.entry(host.clone()).or_insert_with(|| {
            allocated = true;
            next_lun
        });
        if allocated {
            state.next_lun += 1;
        }
        Ok(TargetDescriptor::Iscsi {
            portals: vec![FAKE_PORTAL.to_owned()],
            iqn: format!("iqn.2024-01.io.esan.fake:{id}"),
            lun,
        })
    }

    async fn detach_volume(&self, id: &VolumeId, host: &NodeId) -> Result<(), BackendError> {
        self.enter(FakeOp::Detach).await?;
        let mut state = lock(&self.state);
        let Some(volume) = state.volumes.get_mut(id) else {
            return Err(BackendError::NotFound(format!("volume {id}")));
        };
        match volume.attachments.remove(host) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!(
                "mapping of volume {id} to host {host}"
            ))),
        }
    }

    async fn expand_volume(&self, id: &VolumeId, size_bytes: u64) -> Result<u64, BackendError> {
        self.enter(FakeOp::Expand).await?;
        if !self.capabilities.expansion {
            return Err(BackendError::Unsupported("volume expansion".into()));
        }
        let size = round_up(size_bytes);
        let mut state = lock(&self.state);
        let used = state.used_bytes();
        let Some(volume) = state.volumes.get_mut(id) else {
            return Err(BackendError::NotFound(format!("volume {id}")));
        };
        if size < volume.volume.size_bytes {
            return Err(BackendError::Rejected(format!(
                "cannot shrink volume {id} from {} to {size}",
                volume.volume.size_bytes
            )));
        }
        let growth = size - volume.volume.size_bytes;
        if used + growth > self.pool_bytes {
            return Err(BackendError::CapacityExhausted(format!(
                "pool cannot grow volume {id} by {growth} bytes"
            )));
        }
        volume.volume.size_bytes = size;
        Ok(size)
    }

    async fn create_snapshot(
        &self,
        source: &VolumeId,
        name: &str,
    ) -> Result<BackendSnapshot, BackendError> {
        self.enter(FakeOp::CreateSnapshot).await?;
        if !self.capabilities.snapshots {
            return Err(BackendError::Unsupported("snapshots".into()));
        }
        let mut state = lock(&self.state);
        if let Some(existing) = state.snapshots.values().find(|s| s.name == name) {
            if &existing.source_volume_id == source {
                return Ok(existing.clone());
            }
            return Err(BackendError::AlreadyExists(format!(
                "snapshot name {name} taken by volume {}",
                existing.source_volume_id
            )));
        }
        let Some(size_bytes) = state.volumes.get(source).map(|v| v.volume.size_bytes) else {
            return Err(BackendError::NotFound(format!("volume {source}")));
        };
        let snapshot = BackendSnapshot {
            id: SnapshotId(state.allocate_id("esan-snap")),
            name: name.to_owned(),
            source_volume_id: source.clone(),
            size_bytes,
            created_at: chrono::Utc::now().to_rfc3339(),
            ready_to_use: true,
        };
        state
            .snapshots
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), BackendError> {
        self.enter(FakeOp::DeleteSnapshot).await?;
        match lock(&self.state).snapshots.remove(id) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!("snapshot {id}"))),
        }
    }

    async fn capacity(&self, _parameters: &BTreeMap<String, String>) -> Result<u64, BackendError> {
        self.enter(FakeOp::Capacity).await?;
        Ok(self.pool_bytes - lock(&self.state).used_bytes())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.enter(FakeOp::Probe).await
    }
}
