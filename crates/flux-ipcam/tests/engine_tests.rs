mod common;

use common::{eventually, fast_config, idle_transcoder, wait_for, MockCamera};
use flux_config::GlobalConfig;
use flux_ipcam::{
    AlarmKind, Brand, CameraCommand, CameraEngine, CameraError, ConnectionState, Device,
    DeviceEvent, ErrorCategory, Method, VendorReply,
};
use std::time::Duration;
use tokio_test::assert_ok;

const DEVICE_INFO: &str = "/ISAPI/System/deviceInfo";
const MOTION: &str = "/ISAPI/System/Video/inputs/channels/101/motionDetection";
const ALERT_STREAM: &str = "/ISAPI/Event/notification/alertStream";

fn hikvision() -> Device {
    Device::new("front", Brand::Hikvision, "10.0.0.64").with_credentials("admin", "secret")
}

fn setup(camera: &std::sync::Arc<MockCamera>) -> (CameraEngine, tempfile::TempDir) {
    setup_with(camera, |_, _| {})
}

fn setup_with<F>(camera: &std::sync::Arc<MockCamera>, tweak: F) -> (CameraEngine, tempfile::TempDir)
where
    F: FnOnce(&mut GlobalConfig, &std::path::Path),
{
    let media_root = tempfile::tempdir().unwrap();
    let mut config = fast_config(media_root.path());
    tweak(&mut config, media_root.path());
    let engine = CameraEngine::with_transport_factory(config, camera.factory());
    (engine, media_root)
}

fn is_status(event: &DeviceEvent, expected: &ConnectionState) -> bool {
    matches!(event, DeviceEvent::Status { state, .. } if state == expected)
}

fn is_error(event: &DeviceEvent, expected: ErrorCategory) -> bool {
    matches!(
        event,
        DeviceEvent::Status { state: ConnectionState::Error { category, .. }, .. } if *category == expected
    )
}

fn error_detail(event: DeviceEvent) -> String {
    match event {
        DeviceEvent::Status {
            state: ConnectionState::Error { detail, .. },
            ..
        } => detail,
        other => panic!("unexpected event {:?}", other),
    }
}

fn motion_reply(enabled: bool) -> VendorReply {
    VendorReply::ok(format!(
        "<MotionDetection version=\"2.0\"><enabled>{}</enabled><sensitivityLevel>60</sensitivityLevel></MotionDetection>",
        enabled
    ))
}

async fn start_online(engine: &CameraEngine, device: Device) {
    let mut events = engine.subscribe();
    engine.add_device(device.clone()).await.unwrap();
    engine.start_device(&device.id).await.unwrap();
    wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;
}

#[tokio::test]
async fn test_handshake_brings_device_online() {
    let camera = MockCamera::new();
    camera.respond(MOTION, motion_reply(true));
    let (engine, _media) = setup(&camera);
    let mut events = engine.subscribe();

    engine.add_device(hikvision()).await.unwrap();
    assert_eq!(engine.device_state("front").await.unwrap(), ConnectionState::Offline);
    engine.start_device("front").await.unwrap();

    wait_for(&mut events, |event| is_status(event, &ConnectionState::Connecting)).await;
    wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;
    let attribute = wait_for(&mut events, |event| matches!(event, DeviceEvent::Attribute { .. })).await;
    match attribute {
        DeviceEvent::Attribute { name, value, .. } => {
            assert_eq!(name, "enable_motion_alarm");
            assert_eq!(value, serde_json::json!(true));
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(camera.count(DEVICE_INFO), 1);
    eventually(|| camera.stream_open(ALERT_STREAM)).await;
    assert_eq!(engine.device_state("front").await.unwrap(), ConnectionState::Online);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_camera_keeps_retrying() {
    let camera = MockCamera::new();
    camera.set_unreachable(true);
    let (engine, _media) = setup(&camera);
    engine.add_device(hikvision()).await.unwrap();
    engine.start_device("front").await.unwrap();

    eventually(|| camera.count(DEVICE_INFO) >= 3).await;
    let state = engine.device_state("front").await.unwrap();
    assert!(!state.is_online());
    assert!(!state.is_suspended());

    let mut events = engine.subscribe();
    camera.set_unreachable(false);
    wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_credentials_suspend_retries() {
    let camera = MockCamera::new();
    camera.set_unauthorized(true);
    let (engine, _media) = setup(&camera);
    let mut events = engine.subscribe();
    engine.add_device(hikvision()).await.unwrap();
    engine.start_device("front").await.unwrap();

    wait_for(&mut events, |event| {
        matches!(event, DeviceEvent::Status { state, .. } if state.needs_credentials())
    })
    .await;
    let attempts = camera.count(DEVICE_INFO);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(camera.count(DEVICE_INFO), attempts);

    // 新凭据触发重连
    camera.set_unauthorized(false);
    let updated = hikvision().with_credentials("admin", "correct");
    engine.update_device(updated).await.unwrap();
    wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;
    assert!(camera.count(DEVICE_INFO) > attempts);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_alarm_stream_pulse_is_debounced() {
    let camera = MockCamera::new();
    let (engine, _media) = setup(&camera);
    let mut events = engine.subscribe();
    start_online(&engine, hikvision()).await;
    eventually(|| camera.stream_open(ALERT_STREAM)).await;

    camera
        .push(
            ALERT_STREAM,
            "--boundary\r\nContent-Type: application/xml\r\n\r\n<EventNotificationAlert version=\"2.0\">\r\n<channelID>1</channelID>\r\n<eventType>VMD</eventType>\r\n",
        )
        .await;
    camera
        .push(ALERT_STREAM, "<eventState>active</eventState>\r\n</EventNotificationAlert>\r\n")
        .await;

    let active = wait_for(&mut events, |event| matches!(event, DeviceEvent::Alarm(_))).await;
    let DeviceEvent::Alarm(active) = active else { unreachable!() };
    assert_eq!(active.kind, AlarmKind::Motion);
    assert!(active.active);

    // 计数器在维护周期中衰减到 0 才结束
    let inactive = wait_for(&mut events, |event| matches!(event, DeviceEvent::Alarm(_))).await;
    let DeviceEvent::Alarm(inactive) = inactive else { unreachable!() };
    assert_eq!(inactive.kind, AlarmKind::Motion);
    assert!(!inactive.active);
    assert!(inactive.at >= active.at);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_command_patches_cached_settings() {
    let camera = MockCamera::new();
    camera.respond(MOTION, motion_reply(true));
    let (engine, _media) = setup(&camera);
    start_online(&engine, hikvision()).await;
    eventually(|| camera.count(MOTION) >= 1).await;

    engine
        .send_command("front", CameraCommand::EnableMotionAlarm(false))
        .await
        .unwrap();

    let put = camera
        .requests()
        .into_iter()
        .find(|request| request.method == Method::Put && request.target == MOTION)
        .expect("settings were not written back");
    let body = put.body.unwrap();
    assert!(body.contains("<enabled>false</enabled>"));
    assert!(body.contains("<sensitivityLevel>60</sensitivityLevel>"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_command_errors() {
    let camera = MockCamera::new();
    camera.set_unreachable(true);
    let (engine, _media) = setup(&camera);
    engine.add_device(hikvision()).await.unwrap();

    let err = engine
        .send_command("front", CameraCommand::EnableMotionAlarm(true))
        .await
        .unwrap_err();
    assert!(matches!(err, CameraError::NotFound(_)));

    engine.start_device("front").await.unwrap();
    let err = engine
        .send_command("front", CameraCommand::EnableMotionAlarm(true))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transport);

    camera.set_unreachable(false);
    eventually(|| camera.count(DEVICE_INFO) >= 2).await;
    let mut events = engine.subscribe();
    if engine.device_state("front").await.unwrap() != ConnectionState::Online {
        wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;
    }
    let err = engine
        .send_command("front", CameraCommand::OpenDoor(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CameraError::Unsupported(_)));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_from_vendor_url() {
    let camera = MockCamera::new();
    camera.set_image(b"\xff\xd8jpeg\xff\xd9");
    let (engine, _media) = setup(&camera);
    engine.add_device(hikvision()).await.unwrap();
    engine.start_device("front").await.unwrap();

    let image = engine.request_snapshot("front").await.unwrap();
    assert_eq!(&image[..], b"\xff\xd8jpeg\xff\xd9");
    assert!(camera
        .requests()
        .iter()
        .any(|request| request.target == "http://10.0.0.64:80/ISAPI/Streaming/channels/101/picture"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_lifecycle_is_idempotent() {
    let camera = MockCamera::new();
    let (engine, media) = setup(&camera);

    let mut invalid = hikvision();
    invalid.motion_threshold = 150;
    let err = engine.add_device(invalid).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    engine.add_device(hikvision()).await.unwrap();
    assert!(engine.add_device(hikvision()).await.is_err());
    engine.start_device("front").await.unwrap();
    engine.start_device("front").await.unwrap();

    assert_ok!(engine.stop_device("front").await);
    assert_ok!(engine.stop_device("front").await);
    assert_eq!(engine.device_state("front").await.unwrap(), ConnectionState::Offline);

    let artifacts = media.path().join("front");
    std::fs::create_dir_all(artifacts.join("hls")).unwrap();
    std::fs::write(artifacts.join("ipcamera.gif"), b"GIF89a").unwrap();

    engine.remove_device("front").await.unwrap();
    assert!(!artifacts.exists());
    assert_ok!(engine.remove_device("front").await);
    assert!(engine.device_state("front").await.is_err());
    assert!(engine.device_ids().await.is_empty());
}

#[tokio::test]
async fn test_threshold_changes_update_device() {
    let camera = MockCamera::new();
    let (engine, _media) = setup_with(&camera, |config, root| {
        config.ffmpeg.path = idle_transcoder(root);
    });
    start_online(&engine, hikvision()).await;

    engine.set_motion_threshold("front", 40).await.unwrap();
    engine.set_audio_threshold("front", 0).await.unwrap();
    let device = engine.device("front").await.unwrap();
    assert_eq!(device.motion_threshold, 40);
    assert_eq!(device.audio_threshold, 0);
    assert!(engine.set_motion_threshold("front", 101).await.is_err());

    // 阈值变化不重建会话
    assert_eq!(camera.count(DEVICE_INFO), 1);
    assert_eq!(engine.device_state("front").await.unwrap(), ConnectionState::Online);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_repeated_garbled_replies_demote_device() {
    let camera = MockCamera::new();
    camera.respond("/ISAPI", VendorReply::ok("\u{0}\u{1}garbage-not-xml"));
    let (engine, _media) = setup_with(&camera, |config, _| {
        config.engine.max_malformed_replies = 3;
    });
    let mut events = engine.subscribe();
    engine.add_device(hikvision()).await.unwrap();
    engine.start_device("front").await.unwrap();

    wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;
    let demoted = wait_for(&mut events, |event| is_error(event, ErrorCategory::Protocol)).await;
    assert!(error_detail(demoted).contains("unrecognised replies"));

    // 协议错误不暂停重试
    let state = engine.device_state("front").await.unwrap();
    assert!(!state.is_suspended());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sporadic_garbled_reply_keeps_device_online() {
    let camera = MockCamera::new();
    camera.respond(MOTION, VendorReply::ok("\u{0}\u{1}garbage-not-xml"));
    let (engine, _media) = setup_with(&camera, |config, _| {
        config.engine.max_malformed_replies = 3;
    });
    let mut events = engine.subscribe();
    start_online(&engine, hikvision()).await;

    // 其它回复（空内容）会清零计数
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(engine.device_state("front").await.unwrap(), ConnectionState::Online);
    while let Ok(event) = events.try_recv() {
        assert!(!is_error(&event, ErrorCategory::Protocol), "unexpected {:?}", event);
    }

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_missing_transcoder_is_reported_as_process_error() {
    let camera = MockCamera::new();
    let (engine, _media) = setup(&camera);
    let mut events = engine.subscribe();

    let mut device = hikvision();
    device.motion_threshold = 40;
    engine.add_device(device).await.unwrap();
    engine.start_device("front").await.unwrap();

    wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;
    let failed = wait_for(&mut events, |event| is_error(event, ErrorCategory::Process)).await;
    let detail = error_detail(failed);
    assert!(detail.contains("alarm detection failed to start"), "{}", detail);
    assert!(detail.contains("/nonexistent/ffmpeg"), "{}", detail);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_starts_share_one_supervisor() {
    let camera = MockCamera::new();
    let (engine, _media) = setup(&camera);
    let mut events = engine.subscribe();
    engine.add_device(hikvision()).await.unwrap();

    let (first, second) = tokio::join!(engine.start_device("front"), engine.start_device("front"));
    assert_ok!(first);
    assert_ok!(second);

    wait_for(&mut events, |event| is_status(event, &ConnectionState::Online)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(camera.count(DEVICE_INFO), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_media_server_start_leaves_device_stopped() {
    let camera = MockCamera::new();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let (engine, _media) = setup_with(&camera, |config, _| {
        config.server.bind_host = "127.0.0.1".to_string();
    });

    let mut device = hikvision();
    device.server_port = Some(port);
    engine.add_device(device).await.unwrap();
    engine.add_device(Device::new("back", Brand::Dahua, "10.0.0.65")).await.unwrap();
    engine.start_device("back").await.unwrap();

    let err = engine.start_device("front").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert_eq!(engine.device_state("front").await.unwrap(), ConnectionState::Offline);
    assert!(engine.device("back").await.is_some());

    // 端口释放后可以再次启动
    drop(occupied);
    assert_ok!(engine.start_device("front").await);
    let mut events = engine.subscribe();
    if engine.device_state("front").await.unwrap() != ConnectionState::Online {
        wait_for(&mut events, |event| {
            matches!(event, DeviceEvent::Status { device_id, state: ConnectionState::Online, .. } if device_id == "front")
        })
        .await;
    }

    engine.shutdown().await.unwrap();
}
