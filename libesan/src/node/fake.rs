//! In-memory host used by node tests.
//!
//! [`FakeHost`] keeps a mount table, the set of attached fabric devices and
//! the filesystem on each device.  Tests can make mounts vanish behind the
//! node service's back, plant mounts it does not know about, count calls and
//! inject failures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::host::{FsStats, HostOps};
use crate::backend::TargetDescriptor;
use crate::error::CsiError;

const DEFAULT_DEVICE_BYTES: u64 = 1 << 30;
const BYTES_PER_INODE: u64 = 16 << 10;

/// Host operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    /// `attach_device`
    Attach,
    /// `detach_device`
    Detach,
    /// `format_and_mount`
    FormatAndMount,
    /// `bind_mount`
    BindMount,
    /// `unmount`
    Unmount,
}

#[derive(Debug, Clone)]
struct FakeMount {
    source: String,
    readonly: bool,
}

#[derive(Debug, Default)]
struct HostState {
    mounts: BTreeMap<PathBuf, FakeMount>,
    paths: HashSet<PathBuf>,
    devices: BTreeMap<PathBuf, u64>,
    filesystems: HashMap<PathBuf, String>,
    metadata: HashMap<PathBuf, Vec<u8>>,
    failures: HashMap<HostOp, VecDeque<CsiError>>,
    calls: HashMap<HostOp, usize>,
}

impl HostState {
    fn enter(&mut self, op: HostOp) -> Result<(), CsiError> {
        *self.calls.entry(op).or_default() += 1;
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Deterministic in-memory host.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
    device_bytes: u64,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(m: &Mutex<HostState>) -> MutexGuard<'_, HostState> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn device_for(target: &TargetDescriptor) -> PathBuf {
    let name = match target {
        TargetDescriptor::Iscsi { iqn, lun, .. } => format!("iscsi-{iqn}-{lun}"),
        TargetDescriptor::Fc { wwns, lun } => format!("fc-{}-{lun}", wwns.join("_")),
        TargetDescriptor::Nvme { nqn, lun, .. } => format!("nvme-{nqn}-{lun}"),
    };
    Path::new("/dev/fake").join(name.replace(['/', ':'], "_"))
}

impl FakeHost {
    /// A host whose attached devices are 1 GiB.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
            device_bytes: DEFAULT_DEVICE_BYTES,
        }
    }

    /// Size of every device attached from now on.
    pub fn with_device_bytes(mut self, device_bytes: u64) -> Self {
        self.device_bytes = device_bytes;
        self
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: HostOp, err: CsiError) {
        lock(&self.state)
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// How many times `op` has been called.
    pub fn calls(&self, op: HostOp) -> usize {
        lock(&self.state).calls.get(&op).copied().unwrap_or(0)
    }

    /// Source of the mount at `path`.
    pub fn mounted(&self, path: impl AsRef<Path>) -> Option<String> {
        lock(&self.state)
            .mounts
            .get(path.as_ref())
            .map(|m| m.source.clone())
    }

    /// Whether the mount at `path` is read-only.
    pub fn is_readonly(&self, path: impl AsRef<Path>) -> bool {
        lock(&self.state)
            .mounts
            .get(path.as_ref())
            .is_some_and(|m| m.readonly)
    }

    /// Number of mounts.
    pub fn mount_count(&self) -> usize {
        lock(&self.state).mounts.len()
    }

    /// Devices currently attached.
    pub fn attached_devices(&self) -> Vec<PathBuf> {
        lock(&self.state).devices.keys().cloned().collect()
    }

    /// Remove a mount without telling the node service.
    pub fn drop_mount(&self, path: impl AsRef<Path>) {
        lock(&self.state).mounts.remove(path.as_ref());
    }

    /// Plant a mount the node service did not make.
    pub fn plant_mount(&self, path: impl AsRef<Path>, source: &str) {
        let mut state = lock(&self.state);
        state.paths.insert(path.as_ref().to_path_buf());
        state.mounts.insert(
            path.as_ref().to_path_buf(),
            FakeMount {
                source: source.to_owned(),
                readonly: false,
            },
        );
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn mount_source(&self, path: &Path) -> Result<Option<String>, CsiError> {
        Ok(self.mounted(path))
    }

    async fn path_exists(&self, path: &Path) -> Result<bool, CsiError> {
        let state = lock(&self.state);
        Ok(state.paths.contains(path)
            || state.mounts.contains_key(path)
            || state.devices.contains_key(path)
            || state.metadata.contains_key(path))
    }

    async fn attach_device(
        &self,
        target: &TargetDescriptor,
        _secrets: &HashMap<String, String>,
    ) -> Result<PathBuf, CsiError> {
        let mut state = lock(&self.state);
        state.enter(HostOp::Attach)?;
        let device = device_for(target);
        state.devices.entry(device.clone()).or_insert(self.device_bytes);
        Ok(device)
    }

    async fn detach_device(
        &self,
        device: &Path,
        _target: Option<&TargetDescriptor>,
    ) -> Result<(), CsiError> {
        let mut state = lock(&self.state);
        state.enter(HostOp::Detach)?;
        let source = device.to_string_lossy();
        if state.mounts.values().any(|m| m.source == source) {
            return Err(CsiError::Internal(format!(
                "{} is still mounted",
                device.display()
            )));
        }
        state.devices.remove(device);
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        staging: &Path,
        fs_type: &str,
        mount_flags: &[String],
    ) -> Result<(), CsiError> {
        let mut state = lock(&self.state);
        state.enter(HostOp::FormatAndMount)?;
        if !state.devices.contains_key(device) {
            return Err(CsiError::Internal(format!(
                "no such device {}",
                device.display()
            )));
        }
        let existing = state
            .filesystems
            .entry(device.to_path_buf())
            .or_insert_with(|| fs_type.to_owned());
        if existing != fs_type {
            return Err(CsiError::MountFailed {
                path: staging.display().to_string(),
                reason: format!("device holds {existing}, not {fs_type}"),
            });
        }
        state.paths.insert(staging.to_path_buf());
        state.mounts.insert(
            staging.to_path_buf(),
            FakeMount {
                source: device.to_string_lossy().into_owned(),
                readonly: mount_flags.iter().any(|f| f == "ro"),
            },
        );
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
        _file_target: bool,
    ) -> Result<(), CsiError> {
        let mut state = lock(&self.state);
        state.enter(HostOp::BindMount)?;
        let origin = match state.mounts.get(source) {
            Some(mount) => mount.source.clone(),
            None if state.devices.contains_key(source) => source.to_string_lossy().into_owned(),
            None => {
                return Err(CsiError::MountFailed {
                    path: target.display().to_string(),
                    reason: format!("{} is neither mounted nor a device", source.display()),
                });
            }
        };
        state.paths.insert(target.to_path_buf());
        state.mounts.insert(
            target.to_path_buf(),
            FakeMount {
                source: origin,
                readonly,
            },
        );
        Ok(())
    }

    async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
        let mut state = lock(&self.state);
        state.enter(HostOp::Unmount)?;
        state.mounts.remove(path);
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> Result<(), CsiError> {
        let mut state = lock(&self.state);
        if state.mounts.contains_key(path) {
            return Err(CsiError::Internal(format!(
                "{} is busy",
                path.display()
            )));
        }
        state.paths.remove(path);
        state.metadata.remove(path);
        Ok(())
    }

    async fn filesystem_stats(&self, path: &Path) -> Result<FsStats, CsiError> {
        let state = lock(&self.state);
        let mount = state
            .mounts
            .get(path)
            .ok_or_else(|| CsiError::NotFound(format!("{} is not mounted", path.display())))?;
        let total_bytes = state
            .devices
            .get(Path::new(&mount.source))
            .copied()
            .unwrap_or(self.device_bytes);
        let used_bytes = total_bytes / 4;
        let total_inodes = total_bytes / BYTES_PER_INODE;
        let used_inodes = total_inodes / 8;
        Ok(FsStats {
            total_bytes,
            available_bytes: total_bytes - used_bytes,
            used_bytes,
            total_inodes,
            free_inodes: total_inodes - used_inodes,
            used_inodes,
        })
    }

    async fn device_size(&self, device: &Path) -> Result<u64, CsiError> {
        lock(&self.state)
            .devices
            .get(device)
            .copied()
            .ok_or_else(|| CsiError::NotFound(format!("no such device {}", device.display())))
    }

    async fn write_metadata(&self, path: &Path, contents: &[u8]) -> Result<(), CsiError> {
        lock(&self.state)
            .metadata
            .insert(path.to_path_buf(), contents.to_vec());
        Ok(())
    }

    async fn read_metadata(&self, path: &Path) -> Result<Option<Vec<u8>>, CsiError> {
        Ok(lock(&self.state).metadata.get(path).cloned())
    }
}
