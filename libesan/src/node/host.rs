//! Host operations used by the node service.
//!
//! [`HostOps`] is everything the node state machine needs from the OS: the
//! mount table, fabric logins, filesystems and bind mounts.  [`LinuxHost`]
//! does it for real with `nix` syscalls and the usual userspace tools
//! (`iscsiadm`, `nvme`, `blkid`, `mkfs.*`, `blockdev`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backend::TargetDescriptor;
use crate::error::CsiError;

const PROC_MOUNTS: &str = "/proc/self/mounts";
const DISK_BY_PATH: &str = "/dev/disk/by-path";
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// `iscsiadm` exit status for "session already exists".
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// `iscsiadm` exit status for "no matching sessions".
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;
/// `blkid -p` exit status when the device carries no recognizable signature.
const BLKID_NOT_FOUND: i32 = 2;

/// Usage of a mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    /// Size in bytes.
    pub total_bytes: u64,
    /// Bytes available to unprivileged users.
    pub available_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
    /// Inode count.
    pub total_inodes: u64,
    /// Free inodes.
    pub free_inodes: u64,
    /// Inodes in use.
    pub used_inodes: u64,
}

/// OS-level operations behind the node state machine.
#[async_trait]
pub trait HostOps: Send + Sync + 'static {
    /// Source of the mount at `path`, or `None` when nothing is mounted there.
    async fn mount_source(&self, path: &Path) -> Result<Option<String>, CsiError>;

    /// Whether `path` exists.
    async fn path_exists(&self, path: &Path) -> Result<bool, CsiError>;

    /// Log in to the fabric target and return the local block device.
    async fn attach_device(
        &self,
        target: &TargetDescriptor,
        secrets: &HashMap<String, String>,
    ) -> Result<PathBuf, CsiError>;

    /// Flush and release a block device; `target` is `None` when only the
    /// device path is known.
    async fn detach_device(
        &self,
        device: &Path,
        target: Option<&TargetDescriptor>,
    ) -> Result<(), CsiError>;

    /// Create `fs_type` on `device` if it has no filesystem, then mount it at
    /// `staging`.
    async fn format_and_mount(
        &self,
        device: &Path,
        staging: &Path,
        fs_type: &str,
        mount_flags: &[String],
    ) -> Result<(), CsiError>;

    /// Bind `source` onto `target`, creating `target` as a file when
    /// `file_target` is set (raw block) and as a directory otherwise.
    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
        file_target: bool,
    ) -> Result<(), CsiError>;

    /// Unmount `path`; not being mounted is success.
    async fn unmount(&self, path: &Path) -> Result<(), CsiError>;

    /// Remove an empty directory or a file; absence is success.
    async fn remove_path(&self, path: &Path) -> Result<(), CsiError>;

    /// `statvfs` of a mounted filesystem.
    async fn filesystem_stats(&self, path: &Path) -> Result<FsStats, CsiError>;

    /// Size of a block device in bytes.
    async fn device_size(&self, device: &Path) -> Result<u64, CsiError>;

    /// Write a small metadata file.
    async fn write_metadata(&self, path: &Path, contents: &[u8]) -> Result<(), CsiError>;

    /// Read a metadata file written by [`HostOps::write_metadata`].
    async fn read_metadata(&self, path: &Path) -> Result<Option<Vec<u8>>, CsiError>;
}

/// Find the source of the mount at `path` in `/proc/self/mounts` contents.
///
/// Mount points are octal-escaped in the table (`\040` for space).
pub(crate) fn find_mount_source(table: &str, path: &Path) -> Option<String> {
    let wanted = path.to_str()?;
    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = fields.next()?;
        let mountpoint = fields.next()?;
        (unescape_mount_field(mountpoint) == wanted).then(|| unescape_mount_field(source))
    })
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = ((bytes[i + 1] - b'0') << 6)
                | ((bytes[i + 2] - b'0') << 3)
                | (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split CSI mount flags into kernel flags and filesystem data.
pub(crate) fn parse_mount_flags(flags: &[String]) -> (MsFlags, Option<String>) {
    let mut ms = MsFlags::empty();
    let mut data = Vec::new();
    for flag in flags.iter().flat_map(|f| f.split(',')) {
        match flag.trim() {
            "" | "defaults" | "rw" => {}
            "ro" => ms |= MsFlags::MS_RDONLY,
            "noatime" => ms |= MsFlags::MS_NOATIME,
            "nodiratime" => ms |= MsFlags::MS_NODIRATIME,
            "relatime" => ms |= MsFlags::MS_RELATIME,
            "nosuid" => ms |= MsFlags::MS_NOSUID,
            "nodev" => ms |= MsFlags::MS_NODEV,
            "noexec" => ms |= MsFlags::MS_NOEXEC,
            "sync" => ms |= MsFlags::MS_SYNCHRONOUS,
            other => data.push(other.to_owned()),
        }
    }
    let data = (!data.is_empty()).then(|| data.join(","));
    (ms, data)
}

/// [`HostOps`] for a Linux worker node.
#[derive(Debug, Clone)]
pub struct LinuxHost {
    device_timeout: Duration,
}

impl Default for LinuxHost {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl LinuxHost {
    /// A host that waits up to `device_timeout` for a device to appear after
    /// a fabric login.
    pub fn new(device_timeout: Duration) -> Self {
        Self { device_timeout }
    }

    async fn run(program: &str, args: &[&str]) -> Result<Output, CsiError> {
        debug!(program, ?args, "running host command");
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| CsiError::Internal(format!("spawn {program}: {e}")))
    }

    async fn run_ok(program: &str, args: &[&str], tolerated: &[i32]) -> Result<(), CsiError> {
        let output = Self::run(program, args).await?;
        match output.status.code() {
            Some(0) => Ok(()),
            Some(code) if tolerated.contains(&code) => Ok(()),
            _ => Err(CsiError::Internal(format!(
                "{program} {} failed ({}): {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    /// Poll `probe` until it yields a device or the timeout elapses.
    async fn wait_for_device<F, Fut>(&self, what: &str, mut probe: F) -> Result<PathBuf, CsiError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Option<PathBuf>>,
    {
        let deadline = tokio::time::Instant::now() + self.device_timeout;
        loop {
            if let Some(link) = probe().await {
                return tokio::fs::canonicalize(&link)
                    .await
                    .map_err(|e| CsiError::Internal(format!("resolve {}: {e}", link.display())));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CsiError::Internal(format!(
                    "device for {what} did not appear within {:?}",
                    self.device_timeout
                )));
            }
            tokio::time::sleep(DEVICE_POLL_INTERVAL).await;
        }
    }

    async fn attach_iscsi(
        &self,
        portals: &[String],
        iqn: &str,
        lun: u32,
        secrets: &HashMap<String, String>,
    ) -> Result<PathBuf, CsiError> {
        let chap = secrets
            .get("node.session.auth.username")
            .zip(secrets.get("node.session.auth.password"));
        for portal in portals {
            Self::run_ok(
                "iscsiadm",
                &["-m", "node", "-T", iqn, "-p", portal, "-o", "new"],
                &[],
            )
            .await?;
            if let Some((user, password)) = chap {
                for (name, value) in [
                    ("node.session.auth.authmethod", "CHAP"),
                    ("node.session.auth.username", user.as_str()),
                    ("node.session.auth.password", password.as_str()),
                ] {
                    Self::run_ok(
                        "iscsiadm",
                        &[
                            "-m", "node", "-T", iqn, "-p", portal, "-o", "update", "-n", name,
                            "-v", value,
                        ],
                        &[],
                    )
                    .await?;
                }
            }
            Self::run_ok(
                "iscsiadm",
                &["-m", "node", "-T", iqn, "-p", portal, "--login"],
                &[ISCSI_ERR_SESS_EXISTS],
            )
            .await?;
        }

        let links: Vec<PathBuf> = portals
            .iter()
            .map(|portal| {
                Path::new(DISK_BY_PATH).join(format!("ip-{portal}-iscsi-{iqn}-lun-{lun}"))
            })
            .collect();
        self.wait_for_device(iqn, || {
            let links = links.clone();
            async move {
                for link in links {
                    if tokio::fs::try_exists(&link).await.unwrap_or(false) {
                        return Some(link);
                    }
                }
                None
            }
        })
        .await
    }

    async fn attach_fc(&self, wwns: &[String], lun: u32) -> Result<PathBuf, CsiError> {
        rescan_scsi_hosts().await;
        let suffixes: Vec<String> = wwns
            .iter()
            .map(|wwn| format!("-fc-0x{}-lun-{lun}", wwn.trim_start_matches("0x")))
            .collect();
        self.wait_for_device("fc target", || {
            let suffixes = suffixes.clone();
            async move { find_by_path(|name| suffixes.iter().any(|s| name.ends_with(s))).await }
        })
        .await
    }

    async fn attach_nvme(&self, nqn: &str, address: &str, lun: u32) -> Result<PathBuf, CsiError> {
        let (transport, rest) = address.split_once("://").unwrap_or(("tcp", address));
        let (host, port) = rest.rsplit_once(':').unwrap_or((rest, "4420"));
        let connected = Self::run(
            "nvme",
            &["connect", "-t", transport, "-a", host, "-s", port, "-n", nqn],
        )
        .await?;
        if !connected.status.success() {
            // Already-connected subsystems fail the connect; the device
            // lookup below decides.
            warn!(
                nqn,
                stderr = %String::from_utf8_lossy(&connected.stderr).trim(),
                "nvme connect reported an error"
            );
        }
        let owned = nqn.to_owned();
        self.wait_for_device(nqn, || {
            let nqn = owned.clone();
            async move { find_nvme_namespace(&nqn, lun).await }
        })
        .await
    }
}

async fn rescan_scsi_hosts() {
    let Ok(mut hosts) = tokio::fs::read_dir("/sys/class/scsi_host").await else {
        return;
    };
    while let Ok(Some(host)) = hosts.next_entry().await {
        if let Err(e) = tokio::fs::write(host.path().join("scan"), b"- - -").await {
            debug!(host = %host.path().display(), error = %e, "scsi rescan failed");
        }
    }
}

async fn find_by_path<F: Fn(&str) -> bool>(matches: F) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(DISK_BY_PATH).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_str().is_some_and(&matches) {
            return Some(entry.path());
        }
    }
    None
}

async fn find_nvme_namespace(nqn: &str, nsid: u32) -> Option<PathBuf> {
    let mut subsystems = tokio::fs::read_dir("/sys/class/nvme-subsystem").await.ok()?;
    while let Ok(Some(subsystem)) = subsystems.next_entry().await {
        let Ok(found) = tokio::fs::read_to_string(subsystem.path().join("subsysnqn")).await else {
            continue;
        };
        if found.trim() != nqn {
            continue;
        }
        let mut children = tokio::fs::read_dir(subsystem.path()).await.ok()?;
        while let Ok(Some(child)) = children.next_entry().await {
            let name = child.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with("nvme") && name.ends_with(&format!("n{nsid}")) {
                return Some(Path::new("/dev").join(name));
            }
        }
    }
    None
}

fn io_error(action: &str, path: &Path, e: impl std::fmt::Display) -> CsiError {
    CsiError::Internal(format!("{action} {}: {e}", path.display()))
}

#[async_trait]
impl HostOps for LinuxHost {
    async fn mount_source(&self, path: &Path) -> Result<Option<String>, CsiError> {
        let table = tokio::fs::read_to_string(PROC_MOUNTS)
            .await
            .map_err(|e| CsiError::Internal(format!("read {PROC_MOUNTS}: {e}")))?;
        Ok(find_mount_source(&table, path))
    }

    async fn path_exists(&self, path: &Path) -> Result<bool, CsiError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| io_error("stat", path, e))
    }

    async fn attach_device(
        &self,
        target: &TargetDescriptor,
        secrets: &HashMap<String, String>,
    ) -> Result<PathBuf, CsiError> {
        let device = match target {
            TargetDescriptor::Iscsi { portals, iqn, lun } => {
                self.attach_iscsi(portals, iqn, *lun, secrets).await?
            }
            TargetDescriptor::Fc { wwns, lun } => self.attach_fc(wwns, *lun).await?,
            TargetDescriptor::Nvme { nqn, address, lun } => {
                self.attach_nvme(nqn, address, *lun).await?
            }
        };
        info!(device = %device.display(), "fabric device attached");
        Ok(device)
    }

    async fn detach_device(
        &self,
        device: &Path,
        target: Option<&TargetDescriptor>,
    ) -> Result<(), CsiError> {
        let device_str = device.to_string_lossy();
        if tokio::fs::try_exists(device).await.unwrap_or(false) {
            Self::run_ok("blockdev", &["--flushbufs", &device_str], &[]).await?;
        }
        match target {
            Some(TargetDescriptor::Iscsi { portals, iqn, .. }) => {
                for portal in portals {
                    Self::run_ok(
                        "iscsiadm",
                        &["-m", "node", "-T", iqn, "-p", portal, "--logout"],
                        &[ISCSI_ERR_NO_OBJS_FOUND],
                    )
                    .await?;
                }
            }
            Some(TargetDescriptor::Nvme { nqn, .. }) => {
                Self::run_ok("nvme", &["disconnect", "-n", nqn], &[]).await?;
            }
            Some(TargetDescriptor::Fc { .. }) | None => {
                if let Some(name) = device.file_name() {
                    let delete = Path::new("/sys/block").join(name).join("device/delete");
                    if let Err(e) = tokio::fs::write(&delete, b"1").await
                        && e.kind() != std::io::ErrorKind::NotFound
                    {
                        return Err(io_error("write", &delete, e));
                    }
                }
            }
        }
        info!(device = %device.display(), "fabric device detached");
        Ok(())
    }

    async fn format_and_mount(
        &self,
        device: &Path,
        staging: &Path,
        fs_type: &str,
        mount_flags: &[String],
    ) -> Result<(), CsiError> {
        let device_str = device.to_string_lossy().into_owned();
        let probe = Self::run("blkid", &["-p", "-s", "TYPE", "-o", "value", &device_str]).await?;
        match probe.status.code() {
            Some(0) => {
                let existing = String::from_utf8_lossy(&probe.stdout).trim().to_owned();
                if !existing.is_empty() && existing != fs_type {
                    return Err(CsiError::MountFailed {
                        path: staging.display().to_string(),
                        reason: format!("{device_str} already holds {existing}, not {fs_type}"),
                    });
                }
            }
            Some(BLKID_NOT_FOUND) => {
                info!(device = %device_str, fs_type, "creating filesystem");
                let force = if fs_type == "xfs" { "-f" } else { "-F" };
                Self::run_ok(&format!("mkfs.{fs_type}"), &[force, &device_str], &[]).await?;
            }
            _ => {
                return Err(CsiError::Internal(format!(
                    "blkid {device_str} failed: {}",
                    String::from_utf8_lossy(&probe.stderr).trim()
                )));
            }
        }

        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| io_error("create", staging, e))?;
        let (flags, data) = parse_mount_flags(mount_flags);
        let source = device.to_path_buf();
        let target = staging.to_path_buf();
        let fs = fs_type.to_owned();
        tokio::task::spawn_blocking(move || {
            nix::mount::mount(
                Some(source.as_path()),
                target.as_path(),
                Some(fs.as_str()),
                flags,
                data.as_deref(),
            )
        })
        .await?
        .map_err(|e| CsiError::MountFailed {
            path: staging.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        readonly: bool,
        file_target: bool,
    ) -> Result<(), CsiError> {
        if file_target {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error("create", parent, e))?;
            }
            tokio::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(target)
                .await
                .map_err(|e| io_error("create", target, e))?;
        } else {
            tokio::fs::create_dir_all(target)
                .await
                .map_err(|e| io_error("create", target, e))?;
        }

        let source = source.to_path_buf();
        let dest = target.to_path_buf();
        tokio::task::spawn_blocking(move || -> nix::Result<()> {
            nix::mount::mount::<_, _, str, str>(
                Some(source.as_path()),
                dest.as_path(),
                None,
                MsFlags::MS_BIND,
                None,
            )?;
            if readonly {
                // MS_RDONLY is ignored on the initial bind; it needs a remount.
                nix::mount::mount::<str, _, str, str>(
                    None,
                    dest.as_path(),
                    None,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None,
                )?;
            }
            Ok(())
        })
        .await?
        .map_err(|e| CsiError::MountFailed {
            path: target.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn unmount(&self, path: &Path) -> Result<(), CsiError> {
        let target = path.to_path_buf();
        let result =
            tokio::task::spawn_blocking(move || nix::mount::umount2(target.as_path(), MntFlags::empty()))
                .await?;
        match result {
            Ok(()) | Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(CsiError::UnmountFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove_path(&self, path: &Path) -> Result<(), CsiError> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error("stat", path, e)),
        };
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", path, e)),
        }
    }

    async fn filesystem_stats(&self, path: &Path) -> Result<FsStats, CsiError> {
        let target = path.to_path_buf();
        let stat = tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(target.as_path()))
            .await?
            .map_err(|e| io_error("statvfs", path, e))?;
        let fragment = stat.fragment_size() as u64;
        let total_bytes = stat.blocks() as u64 * fragment;
        let free_bytes = stat.blocks_free() as u64 * fragment;
        let total_inodes = stat.files() as u64;
        let free_inodes = stat.files_free() as u64;
        Ok(FsStats {
            total_bytes,
            available_bytes: stat.blocks_available() as u64 * fragment,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            total_inodes,
            free_inodes,
            used_inodes: total_inodes.saturating_sub(free_inodes),
        })
    }

    async fn device_size(&self, device: &Path) -> Result<u64, CsiError> {
        let output = Self::run("blockdev", &["--getsize64", &device.to_string_lossy()]).await?;
        if !output.status.success() {
            return Err(CsiError::Internal(format!(
                "blockdev --getsize64 {}: {}",
                device.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|e| io_error("parse size of", device, e))
    }

    async fn write_metadata(&self, path: &Path, contents: &[u8]) -> Result<(), CsiError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create", parent, e))?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| io_error("write", path, e))
    }

    async fn read_metadata(&self, path: &Path) -> Result<Option<Vec<u8>>, CsiError> {
        match tokio::fs::read(path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", path, e)),
        }
    }
}
