//! Core CSI types: volumes, capabilities, publications, requests, topology.
//!
//! These types form the data model shared by the CSI traits, the registry
//! and backend implementations; the gRPC transport converts to and from the
//! generated `csi.v1` messages at the socket.  They are
//! [`Serialize`]/[`Deserialize`] so records can be persisted as JSON
//! sidecars.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
        )]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the raw identifier.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Opaque, unique identifier for a volume, assigned by the array.
    VolumeId
);
string_id!(
    /// Identifier of a worker node as reported by `NodeGetInfo`.
    NodeId
);
string_id!(
    /// Opaque, unique identifier for a snapshot, assigned by the array.
    SnapshotId
);

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed, mirroring the CSI access mode enum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessMode {
    /// Read-write on a single node.
    SingleNodeWriter,
    /// Read-only on a single node.
    SingleNodeReaderOnly,
    /// Read-write by a single workload on a single node.
    SingleNodeSingleWriter,
    /// Read-write by many workloads on a single node.
    SingleNodeMultiWriter,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Read-only on many nodes, read-write on at most one.
    MultiNodeSingleWriter,
    /// Read-write on many nodes.
    MultiNodeMultiWriter,
}

impl AccessMode {
    /// Whether the mode allows the volume to be published to more than one node.
    pub fn is_multi_node(self) -> bool {
        matches!(
            self,
            Self::MultiNodeReaderOnly | Self::MultiNodeSingleWriter | Self::MultiNodeMultiWriter
        )
    }

    /// Whether the mode forbids writes altogether.
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::SingleNodeReaderOnly | Self::MultiNodeReaderOnly)
    }
}

/// How the workload consumes the volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AccessType {
    /// Raw block device.
    Block,
    /// Mounted filesystem.
    Mount {
        /// Filesystem type; empty selects the driver default.
        #[serde(default)]
        fs_type: String,
        /// Additional mount flags (e.g. `"noatime"`).
        #[serde(default)]
        mount_flags: Vec<String>,
    },
}

impl AccessType {
    /// Whether this is the raw block flavour.
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block)
    }
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Block or filesystem access.
    pub access_type: AccessType,
    /// Requested access mode.
    pub access_mode: AccessMode,
}

impl VolumeCapability {
    /// A filesystem capability with the given mode and the driver default fs.
    pub fn mount(access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
            access_mode,
        }
    }

    /// A raw block capability with the given mode.
    pub fn block(access_mode: AccessMode) -> Self {
        Self {
            access_type: AccessType::Block,
            access_mode,
        }
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount(AccessMode::SingleNodeWriter)
    }
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

/// Requested size bounds. A zero field means "unset".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    /// Volume must be at least this big.
    #[serde(default)]
    pub required_bytes: u64,
    /// Volume must not be bigger than this.
    #[serde(default)]
    pub limit_bytes: u64,
}

impl CapacityRange {
    /// Range with only a lower bound.
    pub fn at_least(required_bytes: u64) -> Self {
        Self {
            required_bytes,
            limit_bytes: 0,
        }
    }

    /// Whether `size` satisfies both bounds.
    pub fn contains(&self, size: u64) -> bool {
        size >= self.required_bytes && (self.limit_bytes == 0 || size <= self.limit_bytes)
    }

    /// The size to ask the array for: the lower bound, or the limit when only
    /// the limit is set.
    pub fn target_bytes(&self) -> u64 {
        if self.required_bytes > 0 {
            self.required_bytes
        } else {
            self.limit_bytes
        }
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Provenance of a pre-populated volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeContentSource {
    /// Restore from a snapshot.
    Snapshot(SnapshotId),
    /// Clone an existing volume.
    Volume(VolumeId),
}

/// Lifecycle state of a volume in the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum VolumeState {
    /// The backend create call has been issued but not confirmed.
    Creating,
    /// The volume exists on the array and may be published.
    Ready,
    /// Deletion started; the record disappears when the array confirms.
    Deleting,
    /// Creation failed in a way that needs cleanup.
    Error,
}

impl VolumeState {
    /// Forward-only transition table.
    pub fn can_transition_to(self, next: VolumeState) -> bool {
        matches!(
            (self, next),
            (Self::Creating, Self::Ready)
                | (Self::Creating, Self::Error)
                | (Self::Ready, Self::Deleting)
                | (Self::Error, Self::Deleting)
        )
    }
}

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Caller-supplied idempotency key.
    pub name: String,
    /// Provisioned capacity in bytes.
    pub capacity_bytes: u64,
    /// Access modes the volume was created for.
    #[serde(default)]
    pub access_modes: BTreeSet<AccessMode>,
    /// Filtered provisioning parameters, fixed at creation.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Where the initial content came from, if anywhere.
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
    /// Topology constraints (e.g. array zone).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
    /// Lifecycle state.
    pub state: VolumeState,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.esan.csi.io/node": "node-01"}`.
    #[serde(default)]
    pub segments: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Publications and snapshots
// ---------------------------------------------------------------------------

/// Controller-side attachment state for one `(volume, node)` pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PublishState {
    /// No fabric mapping exists.
    Unpublished,
    /// The attach call is in flight.
    Publishing,
    /// The array mapped the volume to the node.
    Published,
    /// The detach call is in flight.
    Unpublishing,
}

impl PublishState {
    /// Whether the record still pins the volume (blocks deletion, counts
    /// against exclusivity).
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Unpublished)
    }
}

/// A controller publication of a volume to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRecord {
    /// Node the volume is mapped to.
    pub node_id: NodeId,
    /// Access mode requested by the publish call.
    pub access_mode: AccessMode,
    /// Whether the publication is read-only.
    pub readonly: bool,
    /// Current state.
    pub state: PublishState,
    /// Target descriptor returned to the caller (IQN, LUN, ...).
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

/// A point-in-time copy of a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Unique snapshot identifier.
    pub snapshot_id: SnapshotId,
    /// Caller-supplied idempotency key.
    pub name: String,
    /// Volume the snapshot was taken from.
    pub source_volume_id: VolumeId,
    /// Size of the snapshot in bytes.
    pub size_bytes: u64,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Whether the snapshot can be used as a content source.
    pub ready_to_use: bool,
}

// ---------------------------------------------------------------------------
// Controller requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Idempotency key.
    pub name: String,
    /// Desired size bounds; `None` selects the configured default size.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Arbitrary parameters forwarded to the backend.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Credentials for the array, never logged or stored.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Optional snapshot or volume to pre-populate from.
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
}

/// Request to map a volume to a node at the fabric level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// Node to publish to.
    pub node_id: NodeId,
    /// Capability the node will use.
    pub volume_capability: VolumeCapability,
    /// Whether the publication is read-only.
    #[serde(default)]
    pub readonly: bool,
    /// Context returned by `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to grow a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    /// Volume to grow.
    pub volume_id: VolumeId,
    /// New size bounds.
    pub capacity_range: CapacityRange,
}

/// Result of a successful expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerExpandVolumeResponse {
    /// Capacity after expansion.
    pub capacity_bytes: u64,
    /// Whether the node must grow the filesystem afterwards.
    pub node_expansion_required: bool,
}

/// Result of `ValidateVolumeCapabilities`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// The capabilities, echoed back when every one is supported.
    pub confirmed: Option<Vec<VolumeCapability>>,
    /// Why confirmation was withheld.
    #[serde(default)]
    pub message: String,
}

/// Paginated listing request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Page size; zero means unlimited.
    #[serde(default)]
    pub max_entries: usize,
    /// Token returned by the previous page.
    #[serde(default)]
    pub starting_token: Option<String>,
}

/// One listed volume with the nodes it is published to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVolumesEntry {
    /// Volume metadata.
    pub volume: Volume,
    /// Nodes holding an active publication.
    pub published_node_ids: Vec<NodeId>,
}

/// One page of volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    /// Volumes in id order.
    pub entries: Vec<ListVolumesEntry>,
    /// Token for the next page, if any.
    pub next_token: Option<String>,
}

/// Request for available capacity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    /// Storage-class parameters selecting the pool.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to snapshot a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    /// Idempotency key.
    pub name: String,
    /// Volume to snapshot.
    pub source_volume_id: VolumeId,
    /// Snapshot-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

/// Request to stage (attach and globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging path,
    /// e.g. `/var/lib/kubelet/plugins/kubernetes.io/csi/esan.csi.io/<hash>/globalmount`.
    pub staging_target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Target descriptor returned by `ControllerPublishVolume`.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Credentials (e.g. CHAP), never logged or stored.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a Pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The staging path (source of the bind mount).
    pub staging_target_path: String,
    /// Target path inside the Pod's volume directory.
    pub target_path: String,
    /// Requested capability.
    pub volume_capability: VolumeCapability,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Unit of a [`VolumeUsage`] entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    /// Byte counts.
    Bytes,
    /// Inode counts.
    Inodes,
}

/// Usage figures for one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    /// What is counted.
    pub unit: UsageUnit,
    /// Total.
    pub total: u64,
    /// Used.
    pub used: u64,
    /// Available.
    pub available: u64,
}

/// Result of `NodeGetVolumeStats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeStats {
    /// Byte and (for filesystems) inode usage.
    pub usage: Vec<VolumeUsage>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"esan.csi.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
    /// Volumes can grow while published.
    OnlineVolumeExpansion,
}

/// Controller RPCs the plugin implements beyond the mandatory set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    /// `CreateVolume` / `DeleteVolume`.
    CreateDeleteVolume,
    /// `ControllerPublishVolume` / `ControllerUnpublishVolume`.
    PublishUnpublishVolume,
    /// `ListVolumes`.
    ListVolumes,
    /// `ListVolumes` reports published nodes.
    ListVolumesPublishedNodes,
    /// `GetCapacity`.
    GetCapacity,
    /// `CreateSnapshot` / `DeleteSnapshot`.
    CreateDeleteSnapshot,
    /// Volume content source of type volume.
    CloneVolume,
    /// `ControllerExpandVolume`.
    ExpandVolume,
    /// Publications may be read-only.
    PublishReadonly,
}

/// Node RPCs the plugin implements beyond the mandatory set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// `NodeStageVolume` / `NodeUnstageVolume`.
    StageUnstageVolume,
    /// `NodeGetVolumeStats`.
    GetVolumeStats,
    /// The single-node multi-writer access modes.
    SingleNodeMultiWriter,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: NodeId,
    /// Maximum number of volumes the node can host.
    pub max_volumes_per_node: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}
