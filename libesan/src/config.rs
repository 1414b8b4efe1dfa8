//! Driver configuration.
//!
//! A [`DriverConfig`] is built once at startup and handed to every service
//! through the [`DriverContext`](crate::context::DriverContext).  Sources are
//! layered: built-in defaults, then an optional YAML file, then environment
//! variables, then whatever CLI flags the binary applies on top.
//!
//! Environment variables:
//! - `ESAN_CSI_ENDPOINT`: socket endpoint, e.g. `unix:///run/csi/csi.sock`.
//! - `ESAN_CSI_NODE_ID`: node identifier reported by `NodeGetInfo`.
//! - `ESAN_CSI_BACKEND_URL`: base URL of the array management API.
//! - `ESAN_CSI_BACKEND_TOKEN`: bearer token for the array API.
//! - `ESAN_CSI_STATE_DIR`: directory for registry sidecars.
//! - `ESAN_CSI_LOCK_TIMEOUT_MS`: bound on waiting for a busy resource.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AccessMode;

const DEFAULT_DRIVER_NAME: &str = "esan.csi.io";
const DEFAULT_ENDPOINT: &str = "unix:///var/lib/kubelet/plugins/esan.csi.io/csi.sock";
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_VOLUME_SIZE: u64 = 1 << 30; // 1 GiB

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("read config {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The config file is not valid YAML for [`DriverConfig`].
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// An environment override could not be parsed.
    #[error("invalid value for {key}: {value}")]
    Env {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
    /// A field violates a constraint.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which access modes the driver accepts and whether multi-node modes may
/// attach to several nodes at once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccessPolicy {
    /// Modes accepted by `CreateVolume` and `ValidateVolumeCapabilities`.
    pub supported_modes: BTreeSet<AccessMode>,
    /// Allow a volume created with a multi-node mode to be published to more
    /// than one node.
    pub allow_multi_attach: bool,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            supported_modes: BTreeSet::from([
                AccessMode::SingleNodeWriter,
                AccessMode::SingleNodeReaderOnly,
                AccessMode::SingleNodeSingleWriter,
                AccessMode::SingleNodeMultiWriter,
            ]),
            allow_multi_attach: false,
        }
    }
}

impl AccessPolicy {
    /// Whether `mode` may be requested at all.
    pub fn supports(&self, mode: AccessMode) -> bool {
        self.supported_modes.contains(&mode)
    }

    /// Whether a volume created with `modes` may be published to several
    /// nodes concurrently.
    pub fn permits_multi_attach(&self, modes: &BTreeSet<AccessMode>) -> bool {
        self.allow_multi_attach && modes.iter().any(|m| m.is_multi_node())
    }
}

/// Connection settings for the array management API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `https://esan-mgmt.example:8443`.
    pub url: String,
    /// Bearer token; `None` disables the header.
    pub token: Option<String>,
    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Attempts for idempotent reads on transient failures.
    pub read_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BACKEND_URL.to_owned(),
            token: None,
            request_timeout_ms: 30_000,
            read_retries: 3,
        }
    }
}

impl BackendConfig {
    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Name reported by `GetPluginInfo`.
    pub driver_name: String,
    /// Version reported by `GetPluginInfo`.
    pub driver_version: String,
    /// Socket endpoint (`unix://` prefix optional).
    pub endpoint: String,
    /// Node identifier for the node service.
    pub node_id: String,
    /// Optional zone label added to topology segments.
    pub topology_zone: Option<String>,
    /// How long an operation waits for a busy resource before `Aborted`.
    pub lock_timeout_ms: u64,
    /// Where registry sidecars live; `None` keeps the registry in memory.
    pub state_dir: Option<PathBuf>,
    /// Size used when `CreateVolume` carries no capacity range.
    pub default_volume_size_bytes: u64,
    /// Filesystem used when a mount capability names none.
    pub default_fs_type: String,
    /// Reported by `NodeGetInfo`.
    pub max_volumes_per_node: u64,
    /// Provisioning parameters accepted from storage classes.
    pub allowed_parameters: BTreeSet<String>,
    /// Access-mode policy.
    pub access_policy: AccessPolicy,
    /// Array API settings.
    pub backend: BackendConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            driver_version: env!("CARGO_PKG_VERSION").to_owned(),
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            node_id: default_node_id(),
            topology_zone: None,
            lock_timeout_ms: 30_000,
            state_dir: None,
            default_volume_size_bytes: DEFAULT_VOLUME_SIZE,
            default_fs_type: "ext4".to_owned(),
            max_volumes_per_node: 256,
            allowed_parameters: [
                "pool",
                "protocol",
                "thinProvisioning",
                "compression",
                "qosPolicy",
                "fsType",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            access_policy: AccessPolicy::default(),
            backend: BackendConfig::default(),
        }
    }
}

fn default_node_id() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

impl DriverConfig {
    /// Load from an optional YAML file, then apply process environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse a YAML document.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `ESAN_CSI_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ESAN_CSI_ENDPOINT") {
            self.endpoint = v;
        }
        if let Some(v) = lookup("ESAN_CSI_NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = lookup("ESAN_CSI_BACKEND_URL") {
            self.backend.url = v;
        }
        if let Some(v) = lookup("ESAN_CSI_BACKEND_TOKEN") {
            self.backend.token = Some(v);
        }
        if let Some(v) = lookup("ESAN_CSI_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ESAN_CSI_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = v.parse().map_err(|_| ConfigError::Env {
                key: "ESAN_CSI_LOCK_TIMEOUT_MS",
                value: v.clone(),
            })?;
        }
        Ok(())
    }

    /// Reject configurations the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.driver_name.is_empty() {
            return Err(ConfigError::Invalid("driver_name must not be empty".into()));
        }
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid("lock_timeout_ms must be positive".into()));
        }
        if self.default_volume_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "default_volume_size_bytes must be positive".into(),
            ));
        }
        if self.access_policy.supported_modes.is_empty() {
            return Err(ConfigError::Invalid(
                "access_policy.supported_modes must not be empty".into(),
            ));
        }
        self.socket_path()?;
        Ok(())
    }

    /// Operation lock wait bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Filesystem path of the listening socket.
    pub fn socket_path(&self) -> Result<PathBuf, ConfigError> {
        let path = match self.endpoint.split_once("://") {
            Some(("unix", rest)) => rest,
            Some((scheme, _)) => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported endpoint scheme {scheme}"
                )));
            }
            None => self.endpoint.as_str(),
        };
        if !path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "endpoint must be an absolute socket path: {}",
                self.endpoint
            )));
        }
        Ok(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let mut config = DriverConfig::default();
        config.node_id = "node-1".into();
        config.validate().expect("defaults are valid");
        assert_eq!(
            config.socket_path().unwrap(),
            PathBuf::from("/var/lib/kubelet/plugins/esan.csi.io/csi.sock")
        );
        assert!(!config.access_policy.allow_multi_attach);
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let config = DriverConfig::from_yaml(
            r#"
driver_name: test.esan.io
lock_timeout_ms: 500
access_policy:
  supported_modes: [SingleNodeWriter, MultiNodeMultiWriter]
  allow_multi_attach: true
backend:
  url: https://array:8443
"#,
        )
        .unwrap();
        assert_eq!(config.driver_name, "test.esan.io");
        assert_eq!(config.lock_timeout(), Duration::from_millis(500));
        assert_eq!(config.backend.url, "https://array:8443");
        assert_eq!(config.backend.read_retries, 3);
        assert!(
            config
                .access_policy
                .permits_multi_attach(&BTreeSet::from([AccessMode::MultiNodeMultiWriter]))
        );
        assert!(
            !config
                .access_policy
                .permits_multi_attach(&BTreeSet::from([AccessMode::SingleNodeWriter]))
        );
    }

    #[test]
    fn env_overrides() {
        let env = HashMap::from([
            ("ESAN_CSI_ENDPOINT", "unix:///tmp/x.sock"),
            ("ESAN_CSI_NODE_ID", "worker-7"),
            ("ESAN_CSI_LOCK_TIMEOUT_MS", "250"),
        ]);
        let mut config = DriverConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| (*v).to_owned()))
            .unwrap();
        assert_eq!(config.node_id, "worker-7");
        assert_eq!(config.socket_path().unwrap(), PathBuf::from("/tmp/x.sock"));
        assert_eq!(config.lock_timeout_ms, 250);

        let bad = HashMap::from([("ESAN_CSI_LOCK_TIMEOUT_MS", "soon")]);
        let err = config
            .apply_env(|k| bad.get(k).map(|v| (*v).to_owned()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn rejects_non_unix_endpoint() {
        let mut config = DriverConfig::default();
        config.endpoint = "tcp://0.0.0.0:10000".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
