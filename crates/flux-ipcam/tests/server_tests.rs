mod common;

use axum::{
    body::{to_bytes, Body},
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
    Router,
};
use common::{fast_config, idle_transcoder, wait_for, MockCamera};
use flux_config::GlobalConfig;
use flux_ipcam::{
    create_router, AlarmKind, Brand, ConnectionState, Device, DeviceEvent, DeviceHandle,
    ErrorCategory, MediaState, Supervisor, SupervisorDeps,
};
use flux_stream::{JobKey, ManagerConfig, Purpose, TranscodeManager};
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower::ServiceExt;

struct Harness {
    app: Router,
    handle: DeviceHandle,
    state: MediaState,
    events: broadcast::Receiver<DeviceEvent>,
    _media: tempfile::TempDir,
}

fn harness(device: Device, camera: &Arc<MockCamera>) -> Harness {
    harness_with(device, camera, |_, _| {})
}

fn harness_with<F>(device: Device, camera: &Arc<MockCamera>, tweak: F) -> Harness
where
    F: FnOnce(&mut GlobalConfig, &std::path::Path),
{
    let media = tempfile::tempdir().unwrap();
    let mut config: GlobalConfig = fast_config(media.path());
    tweak(&mut config, media.path());
    let transcoder = TranscodeManager::new(ManagerConfig::from_ffmpeg(&config.ffmpeg));
    let (events, rx) = broadcast::channel(64);

    let deps = SupervisorDeps {
        transport_factory: camera.factory(),
        transcoder: transcoder.clone(),
        events,
        engine: config.engine.clone(),
        ffmpeg: config.ffmpeg.clone(),
        host_ip: Some("192.168.1.5".to_string()),
        mjpeg_capacity: 4,
    };
    let ip = device.ip.clone();
    let (handle, _task) = Supervisor::spawn(device, deps).unwrap();

    let mut server = config.server.clone();
    server.host_ip = Some("192.168.1.5".to_string());
    let state = MediaState::new(
        handle.clone(),
        transcoder,
        config.ffmpeg.clone(),
        config.media.clone(),
        &server,
        &ip,
        8091,
    );

    Harness {
        app: create_router(state.clone()),
        handle,
        state,
        events: rx,
        _media: media,
    }
}

fn hikvision() -> Device {
    Device::new("front", Brand::Hikvision, "10.0.0.64").with_credentials("admin", "secret")
}

fn request(method: &str, uri: &str, from: [u8; 4], body: Body) -> Request<Body> {
    let mut request = Request::builder().method(method).uri(uri).body(body).unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((from, 40000))));
    request
}

fn get(uri: &str) -> Request<Body> {
    request("GET", uri, [127, 0, 0, 1], Body::empty())
}

#[tokio::test]
async fn test_health_endpoint() {
    let camera = MockCamera::new();
    let h = harness(hikvision(), &camera);

    let response = h.app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CACHE_CONTROL)
        .unwrap()
        .to_str()
        .unwrap()
        .contains("no-cache"));
}

#[tokio::test]
async fn test_allow_list() {
    let camera = MockCamera::new();
    let h = harness(hikvision(), &camera);

    let outsider = request("GET", "/health", [10, 9, 9, 9], Body::empty());
    let response = h.app.clone().oneshot(outsider).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    for allowed in [[192, 168, 1, 5], [10, 0, 0, 64]] {
        let response = h
            .app
            .clone()
            .oneshot(request("GET", "/health", allowed, Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    // 没有来源地址的请求一律拒绝
    let anonymous = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = h.app.oneshot(anonymous).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_pushed_snapshot_replaces_current() {
    let camera = MockCamera::new();
    let h = harness(hikvision(), &camera);
    assert!(h.handle.snapshot().latest().is_none());

    let mut upload = request("POST", "/snapshot.jpg", [127, 0, 0, 1], Body::from("JPEGDATA"));
    upload
        .headers_mut()
        .insert(header::CONTENT_LENGTH, "8".parse().unwrap());
    let response = h.app.clone().oneshot(upload).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.handle.snapshot().latest().unwrap(), "JPEGDATA");

    // 长度不符的上传被丢弃
    let mut truncated = request("POST", "/snapshot.jpg", [127, 0, 0, 1], Body::from("JPEG"));
    truncated
        .headers_mut()
        .insert(header::CONTENT_LENGTH, "8".parse().unwrap());
    let response = h.app.oneshot(truncated).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(h.handle.snapshot().latest().unwrap(), "JPEGDATA");
}

#[tokio::test]
async fn test_snapshot_endpoint() {
    let camera = MockCamera::new();
    let h = harness(hikvision(), &camera);

    // 抓取失败且没有缓存
    let response = h.app.clone().oneshot(get("/ipcamera.jpg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    camera.set_image(b"FRESH");
    let response = h.app.clone().oneshot(get("/ipcamera.jpg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"FRESH");

    // 摄像头不可达时返回最近一张
    camera.set_unreachable(true);
    let response = h.app.oneshot(get("/ipcamera.jpg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"FRESH");
}

#[tokio::test]
async fn test_pushed_frames_reach_viewers() {
    let camera = MockCamera::new();
    let h = harness(hikvision(), &camera);
    let mut frames = h.handle.mjpeg().subscribe();

    let response = h
        .app
        .oneshot(request("POST", "/ipvideo.jpg", [127, 0, 0, 1], Body::from("FRAME1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(frames.recv().await.unwrap(), "FRAME1");
}

#[tokio::test]
async fn test_files_and_segments() {
    let camera = MockCamera::new();
    let h = harness(hikvision(), &camera);
    let paths = h.state.paths.clone();

    let response = h.app.clone().oneshot(get("/ipcamera.gif")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    std::fs::create_dir_all(&paths.hls).unwrap();
    std::fs::write(&paths.gif, b"GIF89a").unwrap();
    std::fs::write(paths.hls.join("ipcamera_01.ts"), b"TS").unwrap();

    let response = h.app.clone().oneshot(get("/ipcamera.gif")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/gif");

    let response = h.app.clone().oneshot(get("/ipcamera_01.ts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"TS");

    let response = h.app.clone().oneshot(get("/%2e%2e%2fsecret.ts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = h.app.oneshot(get("/ipcamera_02.ts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_live_output_unavailable_without_transcoder() {
    let camera = MockCamera::new();
    let mut h = harness(hikvision(), &camera);

    let response = h.app.clone().oneshot(get("/ipcamera.m3u8")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // 启动失败同时反映到设备状态
    let failed = wait_for(&mut h.events, |event| {
        matches!(
            event,
            DeviceEvent::Status { state: ConnectionState::Error { category: ErrorCategory::Process, .. }, .. }
        )
    })
    .await;
    match failed {
        DeviceEvent::Status {
            state: ConnectionState::Error { detail, .. },
            ..
        } => assert!(detail.contains("hls output failed to start"), "{}", detail),
        other => panic!("unexpected event {:?}", other),
    }

    let response = h.app.clone().oneshot(get("/ipcamera.mjpeg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let key = JobKey::new("front", Purpose::Mjpeg);
    wait_subscribers(&h.state.transcoder, &key, 0).await;
}

/// 轮询直到任务的订阅者数达到预期
async fn wait_subscribers(transcoder: &TranscodeManager, key: &JobKey, expected: usize) {
    tokio::time::timeout(Duration::from_secs(8), async {
        while transcoder.subscriber_count(key).await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscriber count not reached in time")
}

async fn wait_stopped(transcoder: &TranscodeManager, key: &JobKey) {
    tokio::time::timeout(Duration::from_secs(8), async {
        while transcoder.is_alive(key).await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job still running")
}

#[tokio::test]
async fn test_mjpeg_viewers_share_one_job_until_grace_expires() {
    let camera = MockCamera::new();
    let mut h = harness_with(hikvision(), &camera, |config, root| {
        config.ffmpeg.path = idle_transcoder(root);
        config.ffmpeg.keep_alive_secs = 2;
    });
    wait_for(&mut h.events, |event| {
        matches!(event, DeviceEvent::Status { state: ConnectionState::Online, .. })
    })
    .await;
    let transcoder = h.state.transcoder.clone();
    let key = JobKey::new("front", Purpose::Mjpeg);

    let first = h.app.clone().oneshot(get("/ipcamera.mjpeg")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let job = transcoder.get(&key).await.expect("mjpeg job started");

    let second = h.app.clone().oneshot(get("/ipcamera.mjpeg")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert!(Arc::ptr_eq(&job, &transcoder.get(&key).await.unwrap()));
    assert_eq!(transcoder.subscriber_count(&key).await, 2);
    assert_eq!(
        transcoder.list().await.iter().filter(|k| k.purpose == Purpose::Mjpeg).count(),
        1
    );

    // 两个观看者都离开后进程仍保留到保活期结束
    drop(first);
    drop(second);
    wait_subscribers(&transcoder, &key, 0).await;
    let left_at = std::time::Instant::now();
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(transcoder.is_alive(&key).await);

    wait_stopped(&transcoder, &key).await;
    assert!(left_at.elapsed() >= Duration::from_millis(1500));
}

#[tokio::test]
async fn test_snapshot_viewers_share_fetches() {
    let camera = MockCamera::new();
    camera.set_image(b"\xff\xd8jpeg\xff\xd9");
    let h = harness_with(hikvision(), &camera, |config, _| {
        config.media.snapshots_mjpeg_interval_ms = 200;
    });

    const VIEWERS: usize = 3;
    const FRAMES: usize = 3;
    let received = Arc::new(AtomicUsize::new(0));
    let mut viewers = Vec::new();
    for _ in 0..VIEWERS {
        let response = h.app.clone().oneshot(get("/snapshots.mjpeg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let received = received.clone();
        viewers.push(tokio::spawn(async move {
            let mut body = response.into_body().into_data_stream();
            for _ in 0..FRAMES {
                let frame = body.next().await.unwrap().unwrap();
                assert!(frame.starts_with(b"--thisMjpegStream"));
                received.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for viewer in viewers {
        tokio::time::timeout(Duration::from_secs(8), viewer)
            .await
            .expect("viewer did not receive frames")
            .unwrap();
    }

    assert_eq!(received.load(Ordering::SeqCst), VIEWERS * FRAMES);
    // 每个周期最多抓取一次，而不是每个观看者各抓一次
    let fetches = camera.count("/picture");
    assert!(fetches >= 1);
    assert!(fetches < VIEWERS * FRAMES, "{} fetches", fetches);
}

#[tokio::test]
async fn test_alarm_callback() {
    let camera = MockCamera::new();
    let device = Device::new("porch", Brand::Instar, "10.0.0.14");
    let mut h = harness(device, &camera);

    let callback = request("GET", "/instar?&active=5", [10, 0, 0, 14], Body::empty());
    let response = h.app.oneshot(callback).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut kinds = Vec::new();
    for _ in 0..2 {
        match wait_for(&mut h.events, |event| matches!(event, DeviceEvent::Alarm(_))).await {
            DeviceEvent::Alarm(alarm) => {
                assert!(alarm.active);
                kinds.push(alarm.kind);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(kinds, vec![AlarmKind::Pir, AlarmKind::Motion]);
}
