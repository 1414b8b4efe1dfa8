//! Storage array backends.
//!
//! [`BackendClient`] is the capability set the controller needs from an
//! e-SAN array.  [`esan::EsanClient`] talks to the array management API over
//! HTTP; [`fake::FakeBackend`] is an in-memory array for tests.
//!
//! Backend errors are typed so the controller can tell an authoritative
//! rejection ("name exists with other parameters") from a transient one
//! ("array unreachable") before mapping either onto [`CsiError`].

pub mod esan;
pub mod fake;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CsiError;
use crate::types::{NodeId, SnapshotId, VolumeContentSource, VolumeId};

/// Publish-context key naming the fabric protocol.
pub const CTX_PROTOCOL: &str = "protocol";
/// Publish-context key for the logical unit number.
pub const CTX_LUN: &str = "lun";
/// Publish-context key for comma-separated iSCSI portals.
pub const CTX_ISCSI_PORTALS: &str = "iscsiPortals";
/// Publish-context key for the iSCSI target IQN.
pub const CTX_ISCSI_IQN: &str = "iscsiIqn";
/// Publish-context key for comma-separated FC target WWNs.
pub const CTX_FC_WWNS: &str = "fcTargetWwns";
/// Publish-context key for the NVMe subsystem NQN.
pub const CTX_NVME_NQN: &str = "nvmeNqn";
/// Publish-context key for the NVMe transport address.
pub const CTX_NVME_ADDRESS: &str = "nvmeAddress";

/// Failures reported by an array backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The name is taken by an object with different parameters.
    #[error("already exists on array: {0}")]
    AlreadyExists(String),
    /// The referenced object does not exist on the array.
    #[error("not found on array: {0}")]
    NotFound(String),
    /// Pool capacity or quota exhausted.
    #[error("array capacity exhausted: {0}")]
    CapacityExhausted(String),
    /// The array refused the request as malformed or disallowed.
    #[error("array rejected request: {0}")]
    Rejected(String),
    /// The array does not implement the operation.
    #[error("unsupported by array: {0}")]
    Unsupported(String),
    /// Network or array-side transient failure.
    #[error("array unavailable: {0}")]
    Unavailable(String),
    /// Anything else.
    #[error("array error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<BackendError> for CsiError {
    fn from(e: BackendError) -> Self {
        let detail = e.to_string();
        match e {
            BackendError::AlreadyExists(_) => CsiError::AlreadyExists(detail),
            BackendError::NotFound(_) => CsiError::NotFound(detail),
            BackendError::CapacityExhausted(_) => CsiError::ResourceExhausted(detail),
            BackendError::Rejected(_) => CsiError::InvalidArgument(detail),
            BackendError::Unsupported(_) => CsiError::Unimplemented(detail),
            BackendError::Unavailable(_) => CsiError::Unavailable(detail),
            BackendError::Internal(_) => CsiError::Internal(detail),
        }
    }
}

/// Optional features of an array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// `create_snapshot` / `delete_snapshot` work.
    pub snapshots: bool,
    /// Volumes can be created from a volume or snapshot source.
    pub clones: bool,
    /// `expand_volume` works.
    pub expansion: bool,
    /// Expansion works while the volume is attached.
    pub online_expansion: bool,
}

/// Parameters of a backend create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCreateRequest {
    /// Idempotency name, used to find the volume again after a lost response.
    pub name: String,
    /// Requested size; the array may round up.
    pub size_bytes: u64,
    /// Filtered provisioning parameters.
    pub parameters: BTreeMap<String, String>,
    /// Content source for clones and restores.
    pub content_source: Option<VolumeContentSource>,
}

/// A volume as the array reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendVolume {
    /// Array-assigned id.
    pub id: VolumeId,
    /// Name given at creation.
    pub name: String,
    /// Actual allocated size.
    pub size_bytes: u64,
    /// Array-specific attributes forwarded as volume context.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

/// A snapshot as the array reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSnapshot {
    /// Array-assigned id.
    pub id: SnapshotId,
    /// Name given at creation.
    pub name: String,
    /// Volume it was taken from.
    pub source_volume_id: VolumeId,
    /// Size in bytes.
    pub size_bytes: u64,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// Whether the copy is complete.
    pub ready_to_use: bool,
}

/// Where a node finds the volume on the storage fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TargetDescriptor {
    /// iSCSI target.
    Iscsi {
        /// `host:port` portals.
        portals: Vec<String>,
        /// Target IQN.
        iqn: String,
        /// Logical unit number.
        lun: u32,
    },
    /// Fibre Channel target.
    Fc {
        /// Target port WWNs.
        wwns: Vec<String>,
        /// Logical unit number.
        lun: u32,
    },
    /// NVMe over fabrics subsystem.
    Nvme {
        /// Subsystem NQN.
        nqn: String,
        /// Transport address (`tcp://host:port`).
        address: String,
        /// Namespace id.
        lun: u32,
    },
}

impl TargetDescriptor {
    /// Flatten into the string map carried by the publish context.
    pub fn to_publish_context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        match self {
            Self::Iscsi { portals, iqn, lun } => {
                ctx.insert(CTX_PROTOCOL.to_owned(), "iscsi".to_owned());
                ctx.insert(CTX_ISCSI_PORTALS.to_owned(), portals.join(","));
                ctx.insert(CTX_ISCSI_IQN.to_owned(), iqn.clone());
                ctx.insert(CTX_LUN.to_owned(), lun.to_string());
            }
            Self::Fc { wwns, lun } => {
                ctx.insert(CTX_PROTOCOL.to_owned(), "fc".to_owned());
                ctx.insert(CTX_FC_WWNS.to_owned(), wwns.join(","));
                ctx.insert(CTX_LUN.to_owned(), lun.to_string());
            }
            Self::Nvme { nqn, address, lun } => {
                ctx.insert(CTX_PROTOCOL.to_owned(), "nvme".to_owned());
                ctx.insert(CTX_NVME_NQN.to_owned(), nqn.clone());
                ctx.insert(CTX_NVME_ADDRESS.to_owned(), address.clone());
                ctx.insert(CTX_LUN.to_owned(), lun.to_string());
            }
        }
        ctx
    }

    /// Rebuild from a publish context received by the node service.
    ///
    /// A context without a protocol means the controller never published
    /// the volume to this node.
    pub fn from_publish_context(ctx: &HashMap<String, String>) -> Result<Self, CsiError> {
        let field = |key: &str| {
            ctx.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| CsiError::InvalidArgument(format!("publish context lacks {key}")))
        };
        let list = |key: &str| -> Result<Vec<String>, CsiError> {
            Ok(field(key)?.split(',').map(str::to_owned).collect())
        };

        let Some(protocol) = ctx.get(CTX_PROTOCOL) else {
            return Err(CsiError::FailedPrecondition(
                "publish context is empty; the volume is not published to this node".into(),
            ));
        };
        let lun = field(CTX_LUN)?
            .parse::<u32>()
            .map_err(|e| CsiError::InvalidArgument(format!("publish context lun: {e}")))?;

        match protocol.as_str() {
            "iscsi" => Ok(Self::Iscsi {
                portals: list(CTX_ISCSI_PORTALS)?,
                iqn: field(CTX_ISCSI_IQN)?,
                lun,
            }),
            "fc" => Ok(Self::Fc {
                wwns: list(CTX_FC_WWNS)?,
                lun,
            }),
            "nvme" => Ok(Self::Nvme {
                nqn: field(CTX_NVME_NQN)?,
                address: field(CTX_NVME_ADDRESS)?,
                lun,
            }),
            other => Err(CsiError::InvalidArgument(format!(
                "unsupported fabric protocol {other}"
            ))),
        }
    }
}

/// Operations the controller needs from a storage array.
///
/// Every mutation must be idempotent on the array side where the array
/// allows it: attaching an attached volume returns the existing mapping,
/// detaching or deleting something absent reports [`BackendError::NotFound`].
#[async_trait]
pub trait BackendClient: Send + Sync + 'static {
    /// Optional features this array supports.
    fn capabilities(&self) -> BackendCapabilities;

    /// Provision a volume.
    async fn create_volume(&self, req: &BackendCreateRequest)
    -> Result<BackendVolume, BackendError>;

    /// Find a volume by its creation name; used to reconcile after a lost
    /// create response.
    async fn lookup_volume(&self, name: &str) -> Result<Option<BackendVolume>, BackendError>;

    /// Destroy a volume.
    async fn delete_volume(&self, id: &VolumeId) -> Result<(), BackendError>;

    /// Map a volume to a host and return where the host finds it.
    async fn attach_volume(
        &self,
        id: &VolumeId,
        host: &NodeId,
    ) -> Result<TargetDescriptor, BackendError>;

    /// Remove a host mapping.
    async fn detach_volume(&self, id: &VolumeId, host: &NodeId) -> Result<(), BackendError>;

    /// Grow a volume; returns the new allocated size.
    async fn expand_volume(&self, id: &VolumeId, size_bytes: u64) -> Result<u64, BackendError>;

    /// Take a snapshot.
    async fn create_snapshot(
        &self,
        source: &VolumeId,
        name: &str,
    ) -> Result<BackendSnapshot, BackendError>;

    /// Remove a snapshot.
    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), BackendError>;

    /// Free capacity of the pool selected by `parameters`.
    async fn capacity(&self, parameters: &BTreeMap<String, String>) -> Result<u64, BackendError>;

    /// Reachability check.
    async fn probe(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_context_roundtrip() {
        let target = TargetDescriptor::Iscsi {
            portals: vec!["10.0.0.1:3260".into(), "10.0.0.2:3260".into()],
            iqn: "iqn.2024-01.io.esan:vol-1".into(),
            lun: 3,
        };
        let ctx = target.to_publish_context();
        assert_eq!(ctx[CTX_PROTOCOL], "iscsi");
        assert_eq!(ctx[CTX_ISCSI_PORTALS], "10.0.0.1:3260,10.0.0.2:3260");
        assert_eq!(TargetDescriptor::from_publish_context(&ctx).unwrap(), target);
    }

    #[test]
    fn empty_context_means_not_published() {
        let err = TargetDescriptor::from_publish_context(&HashMap::new()).unwrap_err();
        assert!(matches!(err, CsiError::FailedPrecondition(_)));

        let ctx = HashMap::from([(CTX_PROTOCOL.to_owned(), "fc".to_owned())]);
        let err = TargetDescriptor::from_publish_context(&ctx).unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[test]
    fn backend_errors_map_to_taxonomy() {
        let cases = [
            (BackendError::AlreadyExists("a".into()), crate::error::Code::AlreadyExists),
            (BackendError::NotFound("a".into()), crate::error::Code::NotFound),
            (
                BackendError::CapacityExhausted("a".into()),
                crate::error::Code::ResourceExhausted,
            ),
            (BackendError::Rejected("a".into()), crate::error::Code::InvalidArgument),
            (BackendError::Unavailable("a".into()), crate::error::Code::Unavailable),
            (BackendError::Internal("a".into()), crate::error::Code::Internal),
        ];
        for (backend, code) in cases {
            let transient = backend.is_transient();
            let err = CsiError::from(backend);
            assert_eq!(err.code(), code);
            assert_eq!(transient, code == crate::error::Code::Unavailable);
            assert!(err.to_string().contains("array"));
        }
    }
}
