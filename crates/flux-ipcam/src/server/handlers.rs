use super::mjpeg::{self, SubscriberGuard};
use super::snapshot::FrameAssembler;
use super::state::MediaState;
use axum::{
    body::Body,
    extract::{ConnectInfo, Path, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use flux_stream::{FfmpegCommand, InputSpec, JobKey, JobSpec, Purpose};
use futures::StreamExt;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const M3U8_TYPE: &str = "application/vnd.apple.mpegurl";
const MPD_TYPE: &str = "application/dash+xml";

/// GET /ipcamera.m3u8
pub async fn hls_playlist(State(state): State<MediaState>) -> Result<Response, StatusCode> {
    let playlist = state.paths.hls.join("ipcamera.m3u8");
    serve_live(&state, Purpose::Hls, playlist, M3U8_TYPE).await
}

/// GET /ipcamera.mpd
pub async fn dash_manifest(State(state): State<MediaState>) -> Result<Response, StatusCode> {
    let manifest = state.paths.dash.join("ipcamera.mpd");
    serve_live(&state, Purpose::Dash, manifest, MPD_TYPE).await
}

/// 按需启动直播任务，清单首次生成前等待一段时间
async fn serve_live(
    state: &MediaState,
    purpose: Purpose,
    manifest: PathBuf,
    content_type: &'static str,
) -> Result<Response, StatusCode> {
    let device_id = state.device.device_id().to_string();
    let key = JobKey::new(&device_id, purpose);

    if !state.transcoder.is_alive(&key).await {
        let spec = live_spec(state, purpose).await?;
        info!(target: "ipcam_media", device_id = %device_id, purpose = %purpose, "Starting live output on demand");
        start_job(state, key.clone(), spec).await?;
    }
    state.transcoder.touch(&key).await;

    if tokio::fs::metadata(&manifest).await.is_err() {
        debug!(target: "ipcam_media", device_id = %device_id, "Waiting for first {} segments", purpose);
        tokio::time::sleep(state.startup_delay()).await;
    }

    match tokio::fs::read(&manifest).await {
        Ok(content) => Ok(media_response(content_type, content)),
        Err(_) => {
            warn!(target: "ipcam_media", device_id = %device_id, "{} output not ready yet", purpose);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// 启动转码任务；进程无法启动时同时把错误报告给设备
async fn start_job(state: &MediaState, key: JobKey, spec: JobSpec) -> Result<(), StatusCode> {
    let purpose = key.purpose;
    let Err(e) = state.transcoder.ensure(key, spec).await else {
        return Ok(());
    };

    let device_id = state.device.device_id();
    error!(target: "ipcam_media", device_id = %device_id, "Failed to start {} output: {}", purpose, e);
    if e.is_start_failure() {
        let detail = format!("{} output failed to start: {}", purpose, e);
        if let Err(e) = state.device.process_failed(detail).await {
            debug!(target: "ipcam_media", device_id = %device_id, "Could not report process failure: {}", e);
        }
    }
    Err(StatusCode::SERVICE_UNAVAILABLE)
}

async fn live_spec(state: &MediaState, purpose: Purpose) -> Result<JobSpec, StatusCode> {
    let input = ffmpeg_input(state).await?;
    let options = state.hls_options().await;
    let dir = match purpose {
        Purpose::Dash => &state.paths.dash,
        _ => &state.paths.hls,
    };
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        error!(target: "ipcam_media", "Failed to create {}: {}", dir.display(), e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let program = &state.ffmpeg.path;
    Ok(match purpose {
        Purpose::Dash => FfmpegCommand::dash(program, input, &options, dir, state.grace()),
        _ => FfmpegCommand::hls(program, input, &options, dir, state.grace()),
    })
}

async fn ffmpeg_input(state: &MediaState) -> Result<InputSpec, StatusCode> {
    match state.device.sources().await.ffmpeg_input {
        Some(input) => Ok(InputSpec::new(input)),
        None => {
            warn!(target: "ipcam_media", device_id = %state.device.device_id(), "No ffmpeg input configured");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// GET /:segment
pub async fn segment(
    State(state): State<MediaState>,
    Path(name): Path<String>,
) -> Result<Response, StatusCode> {
    let path = state.paths.segment(&name).ok_or(StatusCode::NOT_FOUND)?;
    let (purpose, content_type) = if name.ends_with(".ts") {
        (Purpose::Hls, "video/mp2t")
    } else {
        (Purpose::Dash, "video/iso.segment")
    };

    let content = tokio::fs::read(&path).await.map_err(|_| StatusCode::NOT_FOUND)?;
    state
        .transcoder
        .touch(&JobKey::new(state.device.device_id(), purpose))
        .await;
    Ok(media_response(content_type, content))
}

/// GET /ipcamera.jpg：优先抓取新快照，失败时返回最近一张
pub async fn snapshot(State(state): State<MediaState>) -> Result<Response, StatusCode> {
    match state.device.request_snapshot().await {
        Ok(image) => Ok(media_response("image/jpeg", image)),
        Err(e) => {
            debug!(target: "ipcam_media", device_id = %state.device.device_id(), "Snapshot request failed: {}", e);
            state
                .device
                .snapshot()
                .latest()
                .map(|image| media_response("image/jpeg", image))
                .ok_or(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// GET /ipcamera.mjpeg：所有观看者共享一个转码任务
pub async fn mjpeg_stream(
    State(state): State<MediaState>,
    remote: Option<ConnectInfo<SocketAddr>>,
) -> Result<Response, StatusCode> {
    let device_id = state.device.device_id().to_string();
    let key = JobKey::new(&device_id, Purpose::Mjpeg);
    let subscriber_id = Uuid::new_v4().to_string();

    let frames = state.device.mjpeg().subscribe();
    let viewers = state
        .transcoder
        .attach(&key, &subscriber_id, remote.map(|ConnectInfo(addr)| addr.to_string()))
        .await;
    let guard = SubscriberGuard::new(state.transcoder.clone(), key.clone(), subscriber_id);

    if !state.transcoder.is_alive(&key).await {
        let input = ffmpeg_input(&state).await?;
        let spec = FfmpegCommand::mjpeg(
            &state.ffmpeg.path,
            input,
            &state.sink_url("/ipvideo.jpg"),
            state.grace(),
        );
        start_job(&state, key, spec).await?;
    }

    info!(target: "ipcam_media", device_id = %device_id, viewers, "MJPEG viewer connected");
    Ok(stream_response(Body::from_stream(mjpeg::frame_stream(frames, guard))))
}

/// GET /snapshots.mjpeg：按固定间隔推送快照，每个周期最多抓取一次，其余观看者读取当前快照
pub async fn snapshots_mjpeg(State(state): State<MediaState>) -> Response {
    let interval = std::time::Duration::from_millis(state.media.snapshots_mjpeg_interval_ms.max(1));
    let device = state.device.clone();

    let stream = async_stream::stream! {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let image = if device.snapshot().claim_refresh(interval) {
                match device.request_snapshot().await {
                    Ok(image) => Some(image),
                    Err(_) => device.snapshot().latest(),
                }
            } else {
                device.snapshot().latest()
            };
            if let Some(image) = image {
                yield Ok::<Bytes, std::io::Error>(mjpeg::encode_frame(&image));
            }
        }
    };
    stream_response(Body::from_stream(stream))
}

/// GET /ipcamera.gif
pub async fn gif(State(state): State<MediaState>) -> Result<Response, StatusCode> {
    serve_file(&state.paths.gif, "image/gif").await
}

/// GET /ipcamera.mp4
pub async fn mp4(State(state): State<MediaState>) -> Result<Response, StatusCode> {
    serve_file(&state.paths.mp4, "video/mp4").await
}

async fn serve_file(path: &std::path::Path, content_type: &'static str) -> Result<Response, StatusCode> {
    let content = tokio::fs::read(path).await.map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(media_response(content_type, content))
}

/// POST /snapshot.jpg：ffmpeg 快照推送
pub async fn receive_snapshot(
    State(state): State<MediaState>,
    headers: HeaderMap,
    body: Body,
) -> StatusCode {
    match assemble(&state, &headers, body).await {
        Ok(image) => {
            debug!(target: "ipcam_media", device_id = %state.device.device_id(), size = image.len(), "Snapshot received");
            state.device.snapshot().publish(image);
            StatusCode::OK
        }
        Err(status) => status,
    }
}

/// POST /ipvideo.jpg：ffmpeg MJPEG 帧推送，广播给观看者
pub async fn receive_frame(
    State(state): State<MediaState>,
    headers: HeaderMap,
    body: Body,
) -> StatusCode {
    match assemble(&state, &headers, body).await {
        Ok(frame) => {
            // 没有观看者时发送失败，丢弃即可
            let _ = state.device.mjpeg().send(frame);
            StatusCode::OK
        }
        Err(status) => status,
    }
}

async fn assemble(state: &MediaState, headers: &HeaderMap, body: Body) -> Result<Bytes, StatusCode> {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());
    let mut frame = FrameAssembler::new(content_length, state.media.snapshot_buffer_default);

    let mut chunks = body.into_data_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| {
            debug!(target: "ipcam_media", "Image upload interrupted: {}", e);
            StatusCode::BAD_REQUEST
        })?;
        if !frame.push(&chunk) {
            warn!(target: "ipcam_media", device_id = %state.device.device_id(), "Image upload exceeds buffer");
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }
    frame.finish().ok_or(StatusCode::BAD_REQUEST)
}

/// GET /instar：摄像头报警回调
pub async fn alarm_callback(
    State(state): State<MediaState>,
    RawQuery(query): RawQuery,
) -> StatusCode {
    let query = query.unwrap_or_default();
    debug!(target: "ipcam_media", device_id = %state.device.device_id(), "Alarm callback {}", query);
    match state.device.alarm_pushed(query).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn media_response(content_type: &'static str, body: impl Into<Body>) -> Response {
    ([(header::CONTENT_TYPE, content_type)], body.into()).into_response()
}

fn stream_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, mjpeg::content_type()),
            (header::CONNECTION, "keep-alive".to_string()),
        ],
        body,
    )
        .into_response()
}
