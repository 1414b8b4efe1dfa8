//! Capability negotiation.
//!
//! Decides which access modes and parameters a request may carry, and which
//! optional RPCs the plugin advertises given what the array supports.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::backend::BackendCapabilities;
use crate::config::AccessPolicy;
use crate::error::CsiError;
use crate::types::{
    AccessMode, AccessType, ControllerCapability, NodeCapability, PluginCapability, Volume,
    VolumeCapability,
};

/// Prefix of keys injected by the provisioner sidecar (PVC name, namespace).
pub const SIDECAR_PARAMETER_PREFIX: &str = "csi.storage.k8s.io/";

/// Topology segment naming the node a volume is reachable from.
pub const TOPOLOGY_NODE_KEY: &str = "topology.esan.csi.io/node";

/// Topology segment naming the array zone.
pub const TOPOLOGY_ZONE_KEY: &str = "topology.esan.csi.io/zone";

/// Filesystems the node service knows how to create.
pub const SUPPORTED_FS_TYPES: &[&str] = &["ext4", "ext3", "xfs"];

/// Plugin-level capabilities.
pub fn plugin_capabilities(
    backend: BackendCapabilities,
    controller_enabled: bool,
) -> Vec<PluginCapability> {
    let mut caps = Vec::new();
    if controller_enabled {
        caps.push(PluginCapability::ControllerService);
    }
    caps.push(PluginCapability::VolumeAccessibilityConstraints);
    if backend.expansion && backend.online_expansion {
        caps.push(PluginCapability::OnlineVolumeExpansion);
    }
    caps
}

/// Controller RPCs advertised for an array with `backend` features.
pub fn controller_capabilities(backend: BackendCapabilities) -> Vec<ControllerCapability> {
    let mut caps = vec![
        ControllerCapability::CreateDeleteVolume,
        ControllerCapability::PublishUnpublishVolume,
        ControllerCapability::ListVolumes,
        ControllerCapability::ListVolumesPublishedNodes,
        ControllerCapability::GetCapacity,
        ControllerCapability::PublishReadonly,
    ];
    if backend.snapshots {
        caps.push(ControllerCapability::CreateDeleteSnapshot);
    }
    if backend.clones {
        caps.push(ControllerCapability::CloneVolume);
    }
    if backend.expansion {
        caps.push(ControllerCapability::ExpandVolume);
    }
    caps
}

/// Node RPCs advertised by the node service.
pub fn node_capabilities() -> Vec<NodeCapability> {
    vec![
        NodeCapability::StageUnstageVolume,
        NodeCapability::GetVolumeStats,
        NodeCapability::SingleNodeMultiWriter,
    ]
}

/// Why `cap` is unacceptable under `policy`, if it is.
fn capability_problem(policy: &AccessPolicy, cap: &VolumeCapability) -> Option<String> {
    if !policy.supports(cap.access_mode) {
        return Some(format!("access mode {:?} is not supported", cap.access_mode));
    }
    if let AccessType::Mount { fs_type, .. } = &cap.access_type
        && !fs_type.is_empty()
        && !SUPPORTED_FS_TYPES.contains(&fs_type.as_str())
    {
        return Some(format!("filesystem type {fs_type} is not supported"));
    }
    None
}

/// Validate the capabilities of a `CreateVolume` and return the mode set the
/// volume is created for.
pub fn access_modes_for_create(
    policy: &AccessPolicy,
    caps: &[VolumeCapability],
) -> Result<BTreeSet<AccessMode>, CsiError> {
    if caps.is_empty() {
        return Err(CsiError::InvalidArgument(
            "volume_capabilities must not be empty".into(),
        ));
    }
    caps.iter()
        .map(|cap| match capability_problem(policy, cap) {
            Some(problem) => Err(CsiError::InvalidArgument(problem)),
            None => Ok(cap.access_mode),
        })
        .collect()
}

/// Validate a single capability for publish or stage.
pub fn check_capability(policy: &AccessPolicy, cap: &VolumeCapability) -> Result<(), CsiError> {
    match capability_problem(policy, cap) {
        Some(problem) => Err(CsiError::InvalidArgument(problem)),
        None => Ok(()),
    }
}

/// `ValidateVolumeCapabilities` verdict for an existing volume: `Ok` when
/// every capability is confirmed, otherwise the reason.
pub fn confirm_for_volume(
    policy: &AccessPolicy,
    volume: &Volume,
    caps: &[VolumeCapability],
) -> Result<(), String> {
    if caps.is_empty() {
        return Err("no capabilities given".into());
    }
    for cap in caps {
        if let Some(problem) = capability_problem(policy, cap) {
            return Err(problem);
        }
        if !volume.access_modes.contains(&cap.access_mode) {
            return Err(format!(
                "volume {} was not created for access mode {:?}",
                volume.volume_id, cap.access_mode
            ));
        }
    }
    Ok(())
}

/// Strip sidecar keys and reject anything outside `allowed`.
pub fn filter_parameters(
    allowed: &BTreeSet<String>,
    params: &HashMap<String, String>,
) -> Result<BTreeMap<String, String>, CsiError> {
    let mut filtered = BTreeMap::new();
    for (key, value) in params {
        if key.starts_with(SIDECAR_PARAMETER_PREFIX) {
            continue;
        }
        if !allowed.contains(key) {
            return Err(CsiError::InvalidArgument(format!(
                "unknown parameter {key}"
            )));
        }
        filtered.insert(key.clone(), value.clone());
    }
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VolumeState;

    fn allowed() -> BTreeSet<String> {
        ["pool", "protocol"].into_iter().map(String::from).collect()
    }

    #[test]
    fn sidecar_keys_are_stripped() {
        let params = HashMap::from([
            ("pool".to_owned(), "gold".to_owned()),
            ("csi.storage.k8s.io/pvc/name".to_owned(), "data".to_owned()),
        ]);
        let filtered = filter_parameters(&allowed(), &params).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered["pool"], "gold");
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let params = HashMap::from([("replicas".to_owned(), "3".to_owned())]);
        let err = filter_parameters(&allowed(), &params).unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(m) if m.contains("replicas")));
    }

    #[test]
    fn create_rejects_unsupported_modes() {
        let policy = AccessPolicy::default();
        let err = access_modes_for_create(
            &policy,
            &[VolumeCapability::mount(AccessMode::MultiNodeMultiWriter)],
        )
        .unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(access_modes_for_create(&policy, &[]).is_err());

        let modes = access_modes_for_create(
            &policy,
            &[
                VolumeCapability::mount(AccessMode::SingleNodeWriter),
                VolumeCapability::block(AccessMode::SingleNodeReaderOnly),
            ],
        )
        .unwrap();
        assert_eq!(modes.len(), 2);
    }

    #[test]
    fn unknown_filesystem_is_rejected() {
        let cap = VolumeCapability {
            access_type: AccessType::Mount {
                fs_type: "zfs".into(),
                mount_flags: Vec::new(),
            },
            access_mode: AccessMode::SingleNodeWriter,
        };
        assert!(check_capability(&AccessPolicy::default(), &cap).is_err());
    }

    #[test]
    fn confirm_requires_mode_from_creation() {
        let volume = Volume {
            volume_id: "vol-1".into(),
            name: "pvc".into(),
            capacity_bytes: 1,
            access_modes: [AccessMode::SingleNodeWriter].into(),
            parameters: Default::default(),
            volume_context: Default::default(),
            content_source: None,
            accessible_topology: Vec::new(),
            state: VolumeState::Ready,
        };
        let policy = AccessPolicy::default();
        assert!(
            confirm_for_volume(
                &policy,
                &volume,
                &[VolumeCapability::block(AccessMode::SingleNodeWriter)]
            )
            .is_ok()
        );
        assert!(
            confirm_for_volume(
                &policy,
                &volume,
                &[VolumeCapability::mount(AccessMode::SingleNodeReaderOnly)]
            )
            .is_err()
        );
    }

    #[test]
    fn advertised_capabilities_follow_backend() {
        let none = controller_capabilities(BackendCapabilities::default());
        assert!(!none.contains(&ControllerCapability::CreateDeleteSnapshot));
        assert!(!none.contains(&ControllerCapability::ExpandVolume));

        let all = BackendCapabilities {
            snapshots: true,
            clones: true,
            expansion: true,
            online_expansion: true,
        };
        assert!(controller_capabilities(all).contains(&ControllerCapability::CloneVolume));
        assert!(plugin_capabilities(all, true).contains(&PluginCapability::OnlineVolumeExpansion));
        assert!(
            !plugin_capabilities(all, false).contains(&PluginCapability::ControllerService)
        );
    }
}
