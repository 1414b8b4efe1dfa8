use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use libesan::backend::fake::{FakeBackend, FakeOp};
use libesan::config::{AccessPolicy, DriverConfig};
use libesan::context::DriverContext;
use libesan::{
    AccessMode, CapacityRange, Code, ControllerExpandVolumeRequest,
    ControllerPublishVolumeRequest, ControllerService, CreateVolumeRequest, CsiController,
    CsiError, NodeId, VolumeCapability, VolumeId,
};

fn controller(backend: FakeBackend, config: DriverConfig) -> ControllerService<FakeBackend> {
    ControllerService::new(Arc::new(backend), DriverContext::new(config))
}

fn create_request(name: &str, mode: AccessMode, required: u64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.into(),
        capacity_range: Some(CapacityRange::at_least(required)),
        volume_capabilities: vec![VolumeCapability::mount(mode)],
        parameters: HashMap::from([("pool".to_owned(), "gold".to_owned())]),
        ..Default::default()
    }
}

fn publish_request(volume_id: &VolumeId, node: &str, mode: AccessMode) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest {
        volume_id: volume_id.clone(),
        node_id: node.into(),
        volume_capability: VolumeCapability::mount(mode),
        readonly: false,
        volume_context: HashMap::new(),
    }
}

fn config_with_pool_parameter() -> DriverConfig {
    let mut config = DriverConfig::default();
    config.allowed_parameters.insert("pool".to_owned());
    config
}

#[tokio::test]
async fn repeated_create_calls_backend_once() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    let req = create_request("pvc-idem", AccessMode::SingleNodeWriter, 1 << 30);

    let first = svc.create_volume(req.clone()).await.unwrap();
    let second = svc.create_volume(req).await.unwrap();

    assert_eq!(first.volume_id, second.volume_id);
    assert_eq!(first.capacity_bytes, second.capacity_bytes);
    assert_eq!(svc.backend().calls(FakeOp::Create), 1);
}

#[tokio::test]
async fn conflicting_create_never_reaches_backend() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    svc.create_volume(create_request("pvc-x", AccessMode::SingleNodeWriter, 1 << 30))
        .await
        .unwrap();

    let mut other_params = create_request("pvc-x", AccessMode::SingleNodeWriter, 1 << 30);
    other_params
        .parameters
        .insert("pool".to_owned(), "silver".to_owned());
    let bigger = create_request("pvc-x", AccessMode::SingleNodeWriter, 4 << 30);
    let other_mode = create_request("pvc-x", AccessMode::SingleNodeReaderOnly, 1 << 30);

    for req in [other_params, bigger, other_mode] {
        let err = svc.create_volume(req).await.unwrap_err();
        assert!(matches!(err, CsiError::AlreadyExists(_)), "{err}");
    }
    assert_eq!(svc.backend().calls(FakeOp::Create), 1);
}

#[tokio::test]
async fn deleting_unknown_volume_succeeds() {
    let svc = controller(FakeBackend::new(), DriverConfig::default());
    svc.delete_volume(&"esan-vol-999999".into()).await.unwrap();
    svc.delete_volume(&"esan-vol-999999".into()).await.unwrap();
    assert_eq!(svc.backend().calls(FakeOp::Delete), 0);
}

#[tokio::test]
async fn single_node_volume_publishes_to_one_node() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    let vol = svc
        .create_volume(create_request("pvc-rwo", AccessMode::SingleNodeWriter, 1 << 30))
        .await
        .unwrap();

    let ctx = svc
        .publish_volume(publish_request(&vol.volume_id, "node-a", AccessMode::SingleNodeWriter))
        .await
        .unwrap();
    let again = svc
        .publish_volume(publish_request(&vol.volume_id, "node-a", AccessMode::SingleNodeWriter))
        .await
        .unwrap();
    assert_eq!(ctx, again);
    assert_eq!(svc.backend().calls(FakeOp::Attach), 1);

    let err = svc
        .publish_volume(publish_request(&vol.volume_id, "node-b", AccessMode::SingleNodeWriter))
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::FailedPrecondition(_)), "{err}");
    assert_eq!(
        svc.backend().attachments(&vol.volume_id),
        vec![NodeId::from("node-a")]
    );

    svc.unpublish_volume(&vol.volume_id, &"node-a".into())
        .await
        .unwrap();
    svc.publish_volume(publish_request(&vol.volume_id, "node-b", AccessMode::SingleNodeWriter))
        .await
        .unwrap();
}

#[tokio::test]
async fn multi_attach_policy_allows_readers_everywhere() {
    let mut config = config_with_pool_parameter();
    config.access_policy = AccessPolicy {
        supported_modes: [AccessMode::SingleNodeWriter, AccessMode::MultiNodeReaderOnly].into(),
        allow_multi_attach: true,
    };
    let svc = controller(FakeBackend::new(), config);
    let vol = svc
        .create_volume(create_request("pvc-rox", AccessMode::MultiNodeReaderOnly, 1 << 30))
        .await
        .unwrap();

    for node in ["node-a", "node-b", "node-c"] {
        svc.publish_volume(publish_request(&vol.volume_id, node, AccessMode::MultiNodeReaderOnly))
            .await
            .unwrap();
    }
    assert_eq!(svc.backend().attachments(&vol.volume_id).len(), 3);
}

#[tokio::test]
async fn delete_waits_for_unpublish() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    let vol = svc
        .create_volume(create_request("pvc-del", AccessMode::SingleNodeWriter, 1 << 30))
        .await
        .unwrap();
    svc.publish_volume(publish_request(&vol.volume_id, "node-a", AccessMode::SingleNodeWriter))
        .await
        .unwrap();

    let err = svc.delete_volume(&vol.volume_id).await.unwrap_err();
    assert!(matches!(err, CsiError::FailedPrecondition(_)), "{err}");
    assert_eq!(svc.backend().volume_count(), 1);

    svc.unpublish_volume(&vol.volume_id, &"node-a".into())
        .await
        .unwrap();
    svc.unpublish_volume(&vol.volume_id, &"node-a".into())
        .await
        .unwrap();
    svc.delete_volume(&vol.volume_id).await.unwrap();
    assert_eq!(svc.backend().volume_count(), 0);
}

#[tokio::test]
async fn concurrent_creates_with_one_name_share_one_volume() {
    let svc = controller(
        FakeBackend::new().with_latency(Duration::from_millis(20)),
        config_with_pool_parameter(),
    );

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let svc = svc.clone();
        tasks.push(tokio::spawn(async move {
            svc.create_volume(create_request(
                "pvc-race",
                AccessMode::SingleNodeWriter,
                1 << 30,
            ))
            .await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().volume_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(svc.backend().calls(FakeOp::Create), 1);
    assert_eq!(svc.backend().volume_count(), 1);
}

#[tokio::test]
async fn cancelled_create_still_records_the_volume() {
    let svc = controller(
        FakeBackend::new().with_latency(Duration::from_millis(50)),
        config_with_pool_parameter(),
    );
    let req = create_request("pvc-cancel", AccessMode::SingleNodeWriter, 1 << 30);

    let abandoned = tokio::time::timeout(Duration::from_millis(10), svc.create_volume(req.clone())).await;
    assert!(abandoned.is_err());

    let vol = svc.create_volume(req).await.unwrap();
    assert_eq!(svc.backend().calls(FakeOp::Create), 1);
    assert_eq!(svc.backend().volume(&vol.volume_id).unwrap().name, "pvc-cancel");
}

#[tokio::test]
async fn publish_of_unknown_volume_is_not_found() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    let err = svc
        .publish_volume(publish_request(
            &"esan-vol-404".into(),
            "node-a",
            AccessMode::SingleNodeWriter,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound, "{err}");
    assert_eq!(svc.backend().calls(FakeOp::Create), 0);
    assert_eq!(svc.backend().calls(FakeOp::Attach), 0);
}

#[tokio::test]
async fn expand_of_unknown_volume_is_not_found() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    let err = svc
        .expand_volume(ControllerExpandVolumeRequest {
            volume_id: "esan-vol-404".into(),
            capacity_range: CapacityRange::at_least(2 << 30),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound, "{err}");
    assert_eq!(svc.backend().calls(FakeOp::Create), 0);
}

#[tokio::test]
async fn create_without_name_is_rejected() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    let err = svc
        .create_volume(create_request("", AccessMode::SingleNodeWriter, 1 << 30))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument, "{err}");
    assert_eq!(svc.backend().calls(FakeOp::Create), 0);
}

#[tokio::test]
async fn create_with_empty_capacity_range_is_rejected() {
    let svc = controller(FakeBackend::new(), config_with_pool_parameter());
    let mut req = create_request("pvc-zero", AccessMode::SingleNodeWriter, 0);
    req.capacity_range = Some(CapacityRange {
        required_bytes: 0,
        limit_bytes: 0,
    });

    let err = svc.create_volume(req.clone()).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument, "{err}");
    assert_eq!(svc.backend().calls(FakeOp::Create), 0);

    req.capacity_range = None;
    let vol = svc.create_volume(req).await.unwrap();
    assert!(vol.capacity_bytes >= DriverConfig::default().default_volume_size_bytes);
    assert_eq!(svc.backend().calls(FakeOp::Create), 1);
}
