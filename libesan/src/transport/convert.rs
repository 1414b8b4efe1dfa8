//! Conversions between the generated `csi.v1` messages and the domain types.
//!
//! Incoming messages are checked here for what protobuf cannot express:
//! negative sizes, unknown enum values and missing required sub-messages all
//! become [`CsiError::InvalidArgument`].  Semantic validation (empty ids,
//! supported modes, ...) stays with the services.

use prost_types::Timestamp;

use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::error::CsiError;
use crate::types::{
    AccessMode, AccessType, CapacityRange, ControllerCapability, ControllerExpandVolumeRequest,
    ControllerPublishVolumeRequest, CreateSnapshotRequest, CreateVolumeRequest,
    GetCapacityRequest, ListVolumesEntry, ListVolumesRequest, NodeCapability,
    NodePublishVolumeRequest, NodeStageVolumeRequest, PluginCapability, Snapshot, Topology,
    UsageUnit, Volume, VolumeCapability, VolumeContentSource, VolumeUsage,
};

/// A wire size, rejecting negative values.
pub(crate) fn bytes_from_wire(field: &str, value: i64) -> Result<u64, CsiError> {
    u64::try_from(value).map_err(|_| {
        CsiError::InvalidArgument(format!("{field} must not be negative, got {value}"))
    })
}

/// A size for the wire, saturating at `i64::MAX`.
pub(crate) fn bytes_to_wire(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn access_mode_from_wire(mode: i32) -> Result<AccessMode, CsiError> {
    match Mode::try_from(mode) {
        Ok(Mode::SingleNodeWriter) => Ok(AccessMode::SingleNodeWriter),
        Ok(Mode::SingleNodeReaderOnly) => Ok(AccessMode::SingleNodeReaderOnly),
        Ok(Mode::SingleNodeSingleWriter) => Ok(AccessMode::SingleNodeSingleWriter),
        Ok(Mode::SingleNodeMultiWriter) => Ok(AccessMode::SingleNodeMultiWriter),
        Ok(Mode::MultiNodeReaderOnly) => Ok(AccessMode::MultiNodeReaderOnly),
        Ok(Mode::MultiNodeSingleWriter) => Ok(AccessMode::MultiNodeSingleWriter),
        Ok(Mode::MultiNodeMultiWriter) => Ok(AccessMode::MultiNodeMultiWriter),
        Ok(Mode::Unknown) | Err(_) => Err(CsiError::InvalidArgument(format!(
            "unsupported access mode {mode}"
        ))),
    }
}

fn access_mode_to_wire(mode: AccessMode) -> Mode {
    match mode {
        AccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
        AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
        AccessMode::SingleNodeSingleWriter => Mode::SingleNodeSingleWriter,
        AccessMode::SingleNodeMultiWriter => Mode::SingleNodeMultiWriter,
        AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
        AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
        AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
    }
}

impl TryFrom<csi::VolumeCapability> for VolumeCapability {
    type Error = CsiError;

    fn try_from(cap: csi::VolumeCapability) -> Result<Self, Self::Error> {
        use csi::volume_capability::AccessType as Wire;

        let mode = cap.access_mode.ok_or_else(|| {
            CsiError::InvalidArgument("volume capability has no access_mode".into())
        })?;
        let access_type = match cap.access_type {
            Some(Wire::Block(_)) => AccessType::Block,
            Some(Wire::Mount(mount)) => AccessType::Mount {
                fs_type: mount.fs_type,
                mount_flags: mount.mount_flags,
            },
            None => {
                return Err(CsiError::InvalidArgument(
                    "volume capability has no access_type".into(),
                ));
            }
        };
        Ok(Self {
            access_type,
            access_mode: access_mode_from_wire(mode.mode)?,
        })
    }
}

impl From<&VolumeCapability> for csi::VolumeCapability {
    fn from(cap: &VolumeCapability) -> Self {
        use csi::volume_capability::{AccessType as Wire, BlockVolume, MountVolume};

        let access_type = match &cap.access_type {
            AccessType::Block => Wire::Block(BlockVolume {}),
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => Wire::Mount(MountVolume {
                fs_type: fs_type.clone(),
                mount_flags: mount_flags.clone(),
            }),
        };
        Self {
            access_type: Some(access_type),
            access_mode: Some(csi::volume_capability::AccessMode {
                mode: access_mode_to_wire(cap.access_mode).into(),
            }),
        }
    }
}

/// The one capability a request must carry.
pub(crate) fn required_capability(
    cap: Option<csi::VolumeCapability>,
) -> Result<VolumeCapability, CsiError> {
    cap.ok_or_else(|| CsiError::InvalidArgument("volume_capability is required".into()))?
        .try_into()
}

pub(crate) fn capabilities_from_wire(
    caps: Vec<csi::VolumeCapability>,
) -> Result<Vec<VolumeCapability>, CsiError> {
    caps.into_iter().map(VolumeCapability::try_from).collect()
}

impl TryFrom<csi::CapacityRange> for CapacityRange {
    type Error = CsiError;

    fn try_from(range: csi::CapacityRange) -> Result<Self, Self::Error> {
        Ok(Self {
            required_bytes: bytes_from_wire("required_bytes", range.required_bytes)?,
            limit_bytes: bytes_from_wire("limit_bytes", range.limit_bytes)?,
        })
    }
}

fn content_source_from_wire(
    source: Option<csi::VolumeContentSource>,
) -> Result<Option<VolumeContentSource>, CsiError> {
    use csi::volume_content_source::Type;

    let Some(source) = source else {
        return Ok(None);
    };
    match source.r#type {
        Some(Type::Snapshot(s)) => Ok(Some(VolumeContentSource::Snapshot(s.snapshot_id.into()))),
        Some(Type::Volume(v)) => Ok(Some(VolumeContentSource::Volume(v.volume_id.into()))),
        None => Err(CsiError::InvalidArgument(
            "volume_content_source names neither a snapshot nor a volume".into(),
        )),
    }
}

impl From<&VolumeContentSource> for csi::VolumeContentSource {
    fn from(source: &VolumeContentSource) -> Self {
        use csi::volume_content_source::{SnapshotSource, Type, VolumeSource};

        let r#type = match source {
            VolumeContentSource::Snapshot(id) => Type::Snapshot(SnapshotSource {
                snapshot_id: id.to_string(),
            }),
            VolumeContentSource::Volume(id) => Type::Volume(VolumeSource {
                volume_id: id.to_string(),
            }),
        };
        Self {
            r#type: Some(r#type),
        }
    }
}

impl From<&Topology> for csi::Topology {
    fn from(topology: &Topology) -> Self {
        Self {
            segments: topology
                .segments
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl From<&Volume> for csi::Volume {
    fn from(volume: &Volume) -> Self {
        Self {
            capacity_bytes: bytes_to_wire(volume.capacity_bytes),
            volume_id: volume.volume_id.to_string(),
            volume_context: volume.volume_context.clone(),
            content_source: volume.content_source.as_ref().map(Into::into),
            accessible_topology: volume.accessible_topology.iter().map(Into::into).collect(),
        }
    }
}

/// `created_at` as a protobuf timestamp; `None` when it is not RFC 3339.
fn creation_time(created_at: &str) -> Option<Timestamp> {
    let parsed = chrono::DateTime::parse_from_rfc3339(created_at).ok()?;
    Some(Timestamp {
        seconds: parsed.timestamp(),
        nanos: i32::try_from(parsed.timestamp_subsec_nanos()).unwrap_or(0),
    })
}

impl From<&Snapshot> for csi::Snapshot {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            size_bytes: bytes_to_wire(snapshot.size_bytes),
            snapshot_id: snapshot.snapshot_id.to_string(),
            source_volume_id: snapshot.source_volume_id.to_string(),
            creation_time: creation_time(&snapshot.created_at),
            ready_to_use: snapshot.ready_to_use,
        }
    }
}

impl From<&ListVolumesEntry> for csi::list_volumes_response::Entry {
    fn from(entry: &ListVolumesEntry) -> Self {
        Self {
            volume: Some((&entry.volume).into()),
            status: Some(csi::list_volumes_response::VolumeStatus {
                published_node_ids: entry.published_node_ids.iter().map(ToString::to_string).collect(),
            }),
        }
    }
}

impl From<PluginCapability> for csi::PluginCapability {
    fn from(cap: PluginCapability) -> Self {
        use csi::plugin_capability::{Service, Type, VolumeExpansion, service, volume_expansion};

        let r#type = match cap {
            PluginCapability::ControllerService => Type::Service(Service {
                r#type: service::Type::ControllerService.into(),
            }),
            PluginCapability::VolumeAccessibilityConstraints => Type::Service(Service {
                r#type: service::Type::VolumeAccessibilityConstraints.into(),
            }),
            PluginCapability::OnlineVolumeExpansion => Type::VolumeExpansion(VolumeExpansion {
                r#type: volume_expansion::Type::Online.into(),
            }),
        };
        Self {
            r#type: Some(r#type),
        }
    }
}

impl From<ControllerCapability> for csi::ControllerServiceCapability {
    fn from(cap: ControllerCapability) -> Self {
        use csi::controller_service_capability::{Rpc, Type, rpc::Type as Kind};

        let kind = match cap {
            ControllerCapability::CreateDeleteVolume => Kind::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume => Kind::PublishUnpublishVolume,
            ControllerCapability::ListVolumes => Kind::ListVolumes,
            ControllerCapability::ListVolumesPublishedNodes => Kind::ListVolumesPublishedNodes,
            ControllerCapability::GetCapacity => Kind::GetCapacity,
            ControllerCapability::CreateDeleteSnapshot => Kind::CreateDeleteSnapshot,
            ControllerCapability::CloneVolume => Kind::CloneVolume,
            ControllerCapability::ExpandVolume => Kind::ExpandVolume,
            ControllerCapability::PublishReadonly => Kind::PublishReadonly,
        };
        Self {
            r#type: Some(Type::Rpc(Rpc {
                r#type: kind.into(),
            })),
        }
    }
}

impl From<NodeCapability> for csi::NodeServiceCapability {
    fn from(cap: NodeCapability) -> Self {
        use csi::node_service_capability::{Rpc, Type, rpc::Type as Kind};

        let kind = match cap {
            NodeCapability::StageUnstageVolume => Kind::StageUnstageVolume,
            NodeCapability::GetVolumeStats => Kind::GetVolumeStats,
            NodeCapability::SingleNodeMultiWriter => Kind::SingleNodeMultiWriter,
        };
        Self {
            r#type: Some(Type::Rpc(Rpc {
                r#type: kind.into(),
            })),
        }
    }
}

impl From<&VolumeUsage> for csi::VolumeUsage {
    fn from(usage: &VolumeUsage) -> Self {
        use csi::volume_usage::Unit;

        let unit = match usage.unit {
            UsageUnit::Bytes => Unit::Bytes,
            UsageUnit::Inodes => Unit::Inodes,
        };
        Self {
            available: bytes_to_wire(usage.available),
            total: bytes_to_wire(usage.total),
            used: bytes_to_wire(usage.used),
            unit: unit.into(),
        }
    }
}

// -- requests -----------------------------------------------------------------

impl TryFrom<csi::CreateVolumeRequest> for CreateVolumeRequest {
    type Error = CsiError;

    fn try_from(req: csi::CreateVolumeRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            name: req.name,
            capacity_range: req.capacity_range.map(TryInto::try_into).transpose()?,
            volume_capabilities: capabilities_from_wire(req.volume_capabilities)?,
            parameters: req.parameters,
            secrets: req.secrets,
            content_source: content_source_from_wire(req.volume_content_source)?,
        })
    }
}

impl TryFrom<csi::ControllerPublishVolumeRequest> for ControllerPublishVolumeRequest {
    type Error = CsiError;

    fn try_from(req: csi::ControllerPublishVolumeRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            volume_id: req.volume_id.into(),
            node_id: req.node_id.into(),
            volume_capability: required_capability(req.volume_capability)?,
            readonly: req.readonly,
            volume_context: req.volume_context,
        })
    }
}

impl TryFrom<csi::ControllerExpandVolumeRequest> for ControllerExpandVolumeRequest {
    type Error = CsiError;

    fn try_from(req: csi::ControllerExpandVolumeRequest) -> Result<Self, Self::Error> {
        let range = req
            .capacity_range
            .ok_or_else(|| CsiError::InvalidArgument("capacity_range is required".into()))?;
        Ok(Self {
            volume_id: req.volume_id.into(),
            capacity_range: range.try_into()?,
        })
    }
}

impl TryFrom<csi::ListVolumesRequest> for ListVolumesRequest {
    type Error = CsiError;

    fn try_from(req: csi::ListVolumesRequest) -> Result<Self, Self::Error> {
        let max_entries = usize::try_from(req.max_entries).map_err(|_| {
            CsiError::InvalidArgument(format!(
                "max_entries must not be negative, got {}",
                req.max_entries
            ))
        })?;
        Ok(Self {
            max_entries,
            starting_token: Some(req.starting_token).filter(|t| !t.is_empty()),
        })
    }
}

impl From<csi::GetCapacityRequest> for GetCapacityRequest {
    fn from(req: csi::GetCapacityRequest) -> Self {
        Self {
            parameters: req.parameters,
        }
    }
}

impl From<csi::CreateSnapshotRequest> for CreateSnapshotRequest {
    fn from(req: csi::CreateSnapshotRequest) -> Self {
        Self {
            name: req.name,
            source_volume_id: req.source_volume_id.into(),
            parameters: req.parameters,
        }
    }
}

impl TryFrom<csi::NodeStageVolumeRequest> for NodeStageVolumeRequest {
    type Error = CsiError;

    fn try_from(req: csi::NodeStageVolumeRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            volume_id: req.volume_id.into(),
            staging_target_path: req.staging_target_path,
            volume_capability: required_capability(req.volume_capability)?,
            publish_context: req.publish_context,
            volume_context: req.volume_context,
            secrets: req.secrets,
        })
    }
}

impl TryFrom<csi::NodePublishVolumeRequest> for NodePublishVolumeRequest {
    type Error = CsiError;

    fn try_from(req: csi::NodePublishVolumeRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            volume_id: req.volume_id.into(),
            staging_target_path: req.staging_target_path,
            target_path: req.target_path,
            volume_capability: required_capability(req.volume_capability)?,
            read_only: req.readonly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_mount(mode: Mode) -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: "xfs".into(),
                    mount_flags: vec!["noatime".into()],
                },
            )),
            access_mode: Some(csi::volume_capability::AccessMode { mode: mode.into() }),
        }
    }

    #[test]
    fn capability_keeps_mode_and_mount_options() {
        let cap = VolumeCapability::try_from(wire_mount(Mode::MultiNodeReaderOnly)).unwrap();
        assert_eq!(cap.access_mode, AccessMode::MultiNodeReaderOnly);
        assert_eq!(
            cap.access_type,
            AccessType::Mount {
                fs_type: "xfs".into(),
                mount_flags: vec!["noatime".into()],
            }
        );
        assert_eq!(csi::VolumeCapability::from(&cap), wire_mount(Mode::MultiNodeReaderOnly));
    }

    #[test]
    fn incomplete_capabilities_are_invalid() {
        let mut no_mode = wire_mount(Mode::SingleNodeWriter);
        no_mode.access_mode = None;
        let mut no_type = wire_mount(Mode::SingleNodeWriter);
        no_type.access_type = None;
        let unknown = wire_mount(Mode::Unknown);
        let mut out_of_range = wire_mount(Mode::SingleNodeWriter);
        out_of_range.access_mode = Some(csi::volume_capability::AccessMode { mode: 42 });

        for cap in [no_mode, no_type, unknown, out_of_range] {
            let err = VolumeCapability::try_from(cap).unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "{err}");
        }
        assert!(matches!(
            required_capability(None),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[test]
    fn negative_sizes_are_rejected() {
        let err = CapacityRange::try_from(csi::CapacityRange {
            required_bytes: -1,
            limit_bytes: 0,
        })
        .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(
            ListVolumesRequest::try_from(csi::ListVolumesRequest {
                max_entries: -5,
                starting_token: String::new(),
            })
            .is_err()
        );
        assert_eq!(bytes_to_wire(u64::MAX), i64::MAX);
    }

    #[test]
    fn empty_token_means_first_page() {
        let req = ListVolumesRequest::try_from(csi::ListVolumesRequest {
            max_entries: 10,
            starting_token: String::new(),
        })
        .unwrap();
        assert_eq!(req.max_entries, 10);
        assert!(req.starting_token.is_none());
    }

    #[test]
    fn snapshot_creation_time_is_a_timestamp() {
        let snapshot = Snapshot {
            snapshot_id: "snap-1".into(),
            name: "snap-a".into(),
            source_volume_id: "vol-1".into(),
            size_bytes: 1 << 30,
            created_at: "2024-01-01T00:00:01.5Z".into(),
            ready_to_use: true,
        };
        let wire = csi::Snapshot::from(&snapshot);
        assert_eq!(
            wire.creation_time,
            Some(Timestamp {
                seconds: 1_704_067_201,
                nanos: 500_000_000,
            })
        );
        assert_eq!(wire.size_bytes, 1 << 30);

        let unparsable = Snapshot {
            created_at: "yesterday".into(),
            ..snapshot
        };
        assert!(csi::Snapshot::from(&unparsable).creation_time.is_none());
    }

    #[test]
    fn expansion_is_advertised_as_online() {
        let wire = csi::PluginCapability::from(PluginCapability::OnlineVolumeExpansion);
        let Some(csi::plugin_capability::Type::VolumeExpansion(expansion)) = wire.r#type else {
            panic!("expected a volume expansion capability");
        };
        assert_eq!(
            expansion.r#type,
            i32::from(csi::plugin_capability::volume_expansion::Type::Online)
        );
    }
}
