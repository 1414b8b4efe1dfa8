//! Volume, publish and snapshot records.
//!
//! The registry is the controller's source of truth between calls.  When a
//! state directory is configured every record is mirrored to a JSON sidecar
//! before the in-memory maps change:
//!
//! ```text
//! <state_dir>/
//!   <volume-id>.volume.json     # volume + its publish records
//!   <snapshot-id>.snapshot.json
//! ```
//!
//! Ids are percent-encoded into file names (`vol/2` is stored as
//! `vol%2F2.volume.json`); the id itself is read back from the file contents.
//!
//! Callers must hold the owning operation lock while mutating a record; the
//! registry itself only guarantees that each individual map update is atomic.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CsiError;
use crate::types::{
    NodeId, PublishRecord, PublishState, Snapshot, SnapshotId, Volume, VolumeId, VolumeState,
};

const VOLUME_SUFFIX: &str = ".volume.json";
const SNAPSHOT_SUFFIX: &str = ".snapshot.json";
const PROVISIONAL_PREFIX: &str = "pending-";

/// A volume together with its controller publications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeRecord {
    /// Volume metadata.
    pub volume: Volume,
    /// Publications keyed by node.
    #[serde(default)]
    pub publishes: BTreeMap<NodeId, PublishRecord>,
}

impl VolumeRecord {
    /// Wrap a volume with no publications.
    pub fn new(volume: Volume) -> Self {
        Self {
            volume,
            publishes: BTreeMap::new(),
        }
    }

    /// Publications that still pin the volume.
    pub fn active_publishes(&self) -> impl Iterator<Item = &PublishRecord> {
        self.publishes.values().filter(|p| p.state.is_active())
    }

    /// Nodes holding a completed publication.
    pub fn published_node_ids(&self) -> Vec<NodeId> {
        self.publishes
            .values()
            .filter(|p| p.state == PublishState::Published)
            .map(|p| p.node_id.clone())
            .collect()
    }
}

/// A fresh id for a volume whose backend create has not returned yet.
pub fn provisional_volume_id() -> VolumeId {
    VolumeId(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4()))
}

/// Whether `id` was handed out by [`provisional_volume_id`].
pub fn is_provisional(id: &VolumeId) -> bool {
    id.as_str().starts_with(PROVISIONAL_PREFIX)
}

/// Concurrent record store with optional on-disk mirroring.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: DashMap<VolumeId, VolumeRecord>,
    names: DashMap<String, VolumeId>,
    snapshots: DashMap<SnapshotId, Snapshot>,
    snapshot_names: DashMap<String, SnapshotId>,
    state_dir: Option<PathBuf>,
}

impl VolumeRegistry {
    /// An in-memory registry.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A registry persisted under `state_dir`.
    pub fn persistent(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            ..Self::default()
        }
    }

    /// Where sidecars live, if anywhere.
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_dir.as_deref()
    }

    // -- volumes --------------------------------------------------------------

    /// Copy of the record for `id`.
    pub fn volume(&self, id: &VolumeId) -> Option<VolumeRecord> {
        self.volumes.get(id).map(|r| r.value().clone())
    }

    /// Copy of the record registered under `name`.
    pub fn volume_by_name(&self, name: &str) -> Option<VolumeRecord> {
        let id = self.names.get(name).map(|r| r.value().clone())?;
        self.volume(&id)
    }

    /// Insert or replace a record.
    pub async fn put_volume(&self, record: VolumeRecord) -> Result<(), CsiError> {
        let id = record.volume.volume_id.clone();
        self.persist(&sidecar_name(id.as_str(), VOLUME_SUFFIX), &record)
            .await?;
        self.names.insert(record.volume.name.clone(), id.clone());
        self.volumes.insert(id, record);
        Ok(())
    }

    /// Apply `f` to a copy of the record, persist it, then publish the copy.
    pub async fn update_volume<F>(&self, id: &VolumeId, f: F) -> Result<VolumeRecord, CsiError>
    where
        F: FnOnce(&mut VolumeRecord),
    {
        let mut record = self
            .volume(id)
            .ok_or_else(|| CsiError::volume_not_found(id))?;
        f(&mut record);
        self.put_volume(record.clone()).await?;
        Ok(record)
    }

    /// Move a volume to `next`, refusing backward edges.
    pub async fn transition(&self, id: &VolumeId, next: VolumeState) -> Result<VolumeRecord, CsiError> {
        let current = self
            .volume(id)
            .ok_or_else(|| CsiError::volume_not_found(id))?
            .volume
            .state;
        if current == next {
            return self.volume(id).ok_or_else(|| CsiError::volume_not_found(id));
        }
        if !current.can_transition_to(next) {
            return Err(CsiError::Internal(format!(
                "illegal volume state transition {current:?} -> {next:?} for {id}"
            )));
        }
        debug!(volume_id = %id, from = ?current, to = ?next, "volume state transition");
        self.update_volume(id, |r| r.volume.state = next).await
    }

    /// Drop a record and its sidecar.  Returns the removed record.
    pub async fn remove_volume(&self, id: &VolumeId) -> Result<Option<VolumeRecord>, CsiError> {
        self.unpersist(&sidecar_name(id.as_str(), VOLUME_SUFFIX))
            .await?;
        let removed = self.volumes.remove(id).map(|(_, r)| r);
        if let Some(record) = &removed {
            self.names
                .remove_if(&record.volume.name, |_, mapped| mapped == id);
        }
        Ok(removed)
    }

    /// Every record, sorted by id.
    pub fn list_volumes(&self) -> Vec<VolumeRecord> {
        let mut records: Vec<_> = self.volumes.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.volume.volume_id.cmp(&b.volume.volume_id));
        records
    }

    /// Number of volume records.
    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    // -- snapshots ------------------------------------------------------------

    /// Copy of the snapshot `id`.
    pub fn snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.snapshots.get(id).map(|r| r.value().clone())
    }

    /// Copy of the snapshot registered under `name`.
    pub fn snapshot_by_name(&self, name: &str) -> Option<Snapshot> {
        let id = self.snapshot_names.get(name).map(|r| r.value().clone())?;
        self.snapshot(&id)
    }

    /// Insert or replace a snapshot.
    pub async fn put_snapshot(&self, snapshot: Snapshot) -> Result<(), CsiError> {
        let id = snapshot.snapshot_id.clone();
        self.persist(&sidecar_name(id.as_str(), SNAPSHOT_SUFFIX), &snapshot)
            .await?;
        self.snapshot_names.insert(snapshot.name.clone(), id.clone());
        self.snapshots.insert(id, snapshot);
        Ok(())
    }

    /// Drop a snapshot and its sidecar.
    pub async fn remove_snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>, CsiError> {
        self.unpersist(&sidecar_name(id.as_str(), SNAPSHOT_SUFFIX))
            .await?;
        let removed = self.snapshots.remove(id).map(|(_, s)| s);
        if let Some(snapshot) = &removed {
            self.snapshot_names
                .remove_if(&snapshot.name, |_, mapped| mapped == id);
        }
        Ok(removed)
    }

    // -- persistence ----------------------------------------------------------

    /// Rebuild the maps from the state directory.
    ///
    /// Unreadable or malformed sidecars are skipped with a warning.  A missing
    /// directory is an empty registry.  Returns the number of records loaded.
    pub async fn recover(&self) -> Result<usize, CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(0);
        };
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CsiError::Internal(format!(
                    "read_dir {}: {e}",
                    dir.display()
                )));
            }
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await.map_err(CsiError::internal)? {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if file_name.ends_with(VOLUME_SUFFIX) {
                let Some(record) = read_sidecar::<VolumeRecord>(&path).await else {
                    continue;
                };
                let name_taken = self
                    .names
                    .get(&record.volume.name)
                    .is_some_and(|id| !is_provisional(&id));
                if !name_taken {
                    self.names
                        .insert(record.volume.name.clone(), record.volume.volume_id.clone());
                }
                self.volumes
                    .insert(record.volume.volume_id.clone(), record);
                loaded += 1;
            } else if file_name.ends_with(SNAPSHOT_SUFFIX) {
                let Some(snapshot) = read_sidecar::<Snapshot>(&path).await else {
                    continue;
                };
                self.snapshot_names
                    .insert(snapshot.name.clone(), snapshot.snapshot_id.clone());
                self.snapshots
                    .insert(snapshot.snapshot_id.clone(), snapshot);
                loaded += 1;
            }
        }

        // A crash between storing the real record and dropping the
        // provisional one leaves both behind; the real one wins.
        let superseded: Vec<VolumeId> = self
            .volumes
            .iter()
            .filter(|r| {
                is_provisional(r.key())
                    && self
                        .names
                        .get(&r.volume.name)
                        .is_some_and(|id| *id != *r.key())
            })
            .map(|r| r.key().clone())
            .collect();
        for id in superseded {
            debug!(volume_id = %id, "dropping superseded provisional record");
            self.remove_volume(&id).await?;
            loaded -= 1;
        }

        info!(
            state_dir = %dir.display(),
            volumes = self.volumes.len(),
            snapshots = self.snapshots.len(),
            "registry recovered",
        );
        Ok(loaded)
    }

    async fn persist<T: Serialize>(&self, file_name: &str, value: &T) -> Result<(), CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CsiError::Internal(format!("create {}: {e}", dir.display())))?;
        let json = serde_json::to_vec_pretty(value).map_err(CsiError::internal)?;

        // Write-then-rename so a crash never leaves a truncated sidecar.
        let tmp = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
        let path = dir.join(file_name);
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| CsiError::Internal(format!("write {}: {e}", tmp.display())))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CsiError::Internal(format!(
                "rename {}: {e}",
                path.display()
            )));
        }
        Ok(())
    }

    async fn unpersist(&self, file_name: &str) -> Result<(), CsiError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        let path = dir.join(file_name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CsiError::Internal(format!(
                "remove {}: {e}",
                path.display()
            ))),
        }
    }
}

/// File name for an id. Bytes outside `[A-Za-z0-9._-]` (including `%`) are
/// written as `%XX`, so distinct ids never share a file.
pub(crate) fn sidecar_name(id: &str, suffix: &str) -> String {
    let mut name = String::with_capacity(id.len() + suffix.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name.push_str(suffix);
    name
}

async fn read_sidecar<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read sidecar, skipping");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse sidecar, skipping");
            None
        }
    }
}
