use std::path::PathBuf;
use std::sync::Arc;

use libesan::backend::fake::FakeBackend;
use libesan::config::DriverConfig;
use libesan::context::DriverContext;
use libesan::csi;
use libesan::csi::volume_capability::access_mode::Mode;
use libesan::node::fake::FakeHost;
use libesan::transport::client::CsiClient;
use libesan::transport::server::{CsiServer, Services};
use libesan::{ControllerService, CsiError, IdentityService, NodeService};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::Code;

const STAGING: &str = "/var/lib/kubelet/plugins/kubernetes.io/csi/esan.csi.io/pv-1/globalmount";
const TARGET: &str = "/var/lib/kubelet/pods/pod-1/volumes/kubernetes.io~csi/pv-1/mount";

struct Plugin {
    _dir: TempDir,
    socket: PathBuf,
    host: Arc<FakeHost>,
    stop: oneshot::Sender<()>,
    server: JoinHandle<Result<(), CsiError>>,
}

impl Plugin {
    async fn start(controller: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("plugin/csi.sock");
        let config = DriverConfig {
            node_id: "worker-1".into(),
            ..DriverConfig::default()
        };
        let ctx = DriverContext::new(config);
        let host = Arc::new(FakeHost::new());
        let node = Arc::new(NodeService::new(Arc::clone(&host), Arc::clone(&ctx)));

        let services = if controller {
            let backend = Arc::new(FakeBackend::new());
            Services::new(Arc::new(IdentityService::with_controller(
                Arc::clone(&ctx),
                backend.clone(),
            )))
            .with_controller(Arc::new(ControllerService::new(backend, Arc::clone(&ctx))))
            .with_node(node)
        } else {
            Services::new(Arc::new(IdentityService::node_only(Arc::clone(&ctx)))).with_node(node)
        };

        let server = CsiServer::bind(&socket, services).await.unwrap();
        let (stop, stopped) = oneshot::channel();
        let server = tokio::spawn(server.serve_until(async {
            let _ = stopped.await;
        }));
        Self {
            _dir: dir,
            socket,
            host,
            stop,
            server,
        }
    }

    async fn client(&self) -> CsiClient {
        CsiClient::connect(&self.socket).await.unwrap()
    }

    async fn shutdown(self) {
        let socket = self.socket.clone();
        self.stop.send(()).unwrap();
        self.server.await.unwrap().unwrap();
        assert!(!socket.exists());
    }
}

fn mount_capability(mode: Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode.into() }),
    }
}

fn create_request(name: &str) -> csi::CreateVolumeRequest {
    csi::CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(csi::CapacityRange {
            required_bytes: 1 << 30,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
        ..Default::default()
    }
}

#[tokio::test]
async fn full_volume_lifecycle_over_socket() {
    let plugin = Plugin::start(true).await;
    let client = plugin.client().await;
    let mut identity = client.identity();
    let mut controller = client.controller();
    let mut node = client.node();

    let probe = identity.probe(csi::ProbeRequest {}).await.unwrap().into_inner();
    assert_eq!(probe.ready, Some(true));
    let info = identity
        .get_plugin_info(csi::GetPluginInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.name, DriverConfig::default().driver_name);

    let volume = controller
        .create_volume(create_request("pvc-socket"))
        .await
        .unwrap()
        .into_inner()
        .volume
        .unwrap();
    assert!(volume.capacity_bytes >= 1 << 30);

    let publish_context = controller
        .controller_publish_volume(csi::ControllerPublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: "worker-1".into(),
            volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
            volume_context: volume.volume_context.clone(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner()
        .publish_context;

    node.node_stage_volume(csi::NodeStageVolumeRequest {
        volume_id: volume.volume_id.clone(),
        publish_context: publish_context.clone(),
        staging_target_path: STAGING.into(),
        volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
        volume_context: volume.volume_context.clone(),
        ..Default::default()
    })
    .await
    .unwrap();
    node.node_publish_volume(csi::NodePublishVolumeRequest {
        volume_id: volume.volume_id.clone(),
        publish_context,
        staging_target_path: STAGING.into(),
        target_path: TARGET.into(),
        volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
        ..Default::default()
    })
    .await
    .unwrap();
    assert!(plugin.host.mounted(TARGET).is_some());

    let stats = node
        .node_get_volume_stats(csi::NodeGetVolumeStatsRequest {
            volume_id: volume.volume_id.clone(),
            volume_path: TARGET.into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert!(
        stats
            .usage
            .iter()
            .any(|u| u.unit == i32::from(csi::volume_usage::Unit::Inodes))
    );

    let listed = controller
        .list_volumes(csi::ListVolumesRequest::default())
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.entries.len(), 1);
    assert_eq!(
        listed.entries[0].status.as_ref().unwrap().published_node_ids,
        vec!["worker-1".to_owned()]
    );
    assert!(listed.next_token.is_empty());

    // Deletion is refused while the volume is still published.
    let status = controller
        .delete_volume(csi::DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);

    node.node_unpublish_volume(csi::NodeUnpublishVolumeRequest {
        volume_id: volume.volume_id.clone(),
        target_path: TARGET.into(),
    })
    .await
    .unwrap();
    node.node_unstage_volume(csi::NodeUnstageVolumeRequest {
        volume_id: volume.volume_id.clone(),
        staging_target_path: STAGING.into(),
    })
    .await
    .unwrap();
    controller
        .controller_unpublish_volume(csi::ControllerUnpublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: "worker-1".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    controller
        .delete_volume(csi::DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(plugin.host.mount_count(), 0);
    assert!(plugin.host.attached_devices().is_empty());

    drop((identity, controller, node, client));
    plugin.shutdown().await;
}

#[tokio::test]
async fn node_only_plugin_leaves_controller_unimplemented() {
    let plugin = Plugin::start(false).await;
    let client = plugin.client().await;

    let status = client
        .controller()
        .create_volume(create_request("pvc"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);

    let capabilities = client
        .identity()
        .get_plugin_capabilities(csi::GetPluginCapabilitiesRequest {})
        .await
        .unwrap()
        .into_inner()
        .capabilities;
    let advertises_controller = capabilities.iter().any(|c| {
        matches!(
            &c.r#type,
            Some(csi::plugin_capability::Type::Service(s))
                if s.r#type == i32::from(csi::plugin_capability::service::Type::ControllerService)
        )
    });
    assert!(!advertises_controller);

    let info = client
        .node()
        .node_get_info(csi::NodeGetInfoRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(info.node_id, "worker-1");

    drop(client);
    plugin.shutdown().await;
}

#[tokio::test]
async fn malformed_requests_are_invalid_arguments() {
    let plugin = Plugin::start(true).await;
    let client = plugin.client().await;
    let mut controller = client.controller();

    let mut no_mode = create_request("pvc-no-mode");
    no_mode.volume_capabilities[0].access_mode = None;
    let mut negative = create_request("pvc-negative");
    negative.capacity_range = Some(csi::CapacityRange {
        required_bytes: -1,
        limit_bytes: 0,
    });
    let mut empty_range = create_request("pvc-empty-range");
    empty_range.capacity_range = Some(csi::CapacityRange::default());
    let mut unknown_mode = create_request("pvc-unknown-mode");
    unknown_mode.volume_capabilities = vec![mount_capability(Mode::Unknown)];

    for req in [no_mode, negative, empty_range, unknown_mode] {
        let status = controller.create_volume(req).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument, "{status:?}");
    }
    let listed = controller
        .list_volumes(csi::ListVolumesRequest::default())
        .await
        .unwrap()
        .into_inner();
    assert!(listed.entries.is_empty());

    let status = controller
        .controller_expand_volume(csi::ControllerExpandVolumeRequest {
            volume_id: "esan-vol-404".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = client
        .node()
        .node_stage_volume(csi::NodeStageVolumeRequest {
            volume_id: "esan-vol-404".into(),
            staging_target_path: STAGING.into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    drop((controller, client));
    plugin.shutdown().await;
}
