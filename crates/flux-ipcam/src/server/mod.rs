//! 内嵌媒体服务器
//!
//! 每个配置了 `server_port` 的设备一个 HTTP 服务，只接受白名单来源。
//! 直播输出按需启动转码任务，ffmpeg 把快照和 MJPEG 帧以 POST 推回本服务。

mod handlers;
pub mod mjpeg;
pub mod snapshot;
pub mod state;

pub use snapshot::{FrameAssembler, SnapshotBuffer};
pub use state::{DevicePaths, MediaState};

use crate::error::{CameraError, Result};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::{info, warn};

/// 创建媒体路由
pub fn create_router(state: MediaState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // 直播
        .route("/ipcamera.m3u8", get(handlers::hls_playlist))
        .route("/ipcamera.mpd", get(handlers::dash_manifest))
        .route("/ipcamera.mjpeg", get(handlers::mjpeg_stream))
        .route("/snapshots.mjpeg", get(handlers::snapshots_mjpeg))
        .route("/:segment", get(handlers::segment))
        // 图片与录制产物
        .route("/ipcamera.jpg", get(handlers::snapshot))
        .route("/ipcamera.gif", get(handlers::gif))
        .route("/ipcamera.mp4", get(handlers::mp4))
        // ffmpeg 推送
        .route("/snapshot.jpg", post(handlers::receive_snapshot))
        .route("/ipvideo.jpg", post(handlers::receive_frame))
        // 摄像头报警回调
        .route("/instar", get(handlers::alarm_callback))
        .layer(middleware::from_fn_with_state(state.clone(), allow_list))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 健康检查
async fn health_check() -> &'static str {
    "OK"
}

/// 来源白名单；取不到来源地址时拒绝
async fn allow_list(State(state): State<MediaState>, request: Request, next: Next) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match remote {
        Some(ip) if state.is_allowed(ip) => next.run(request).await,
        _ => {
            warn!(
                target: "ipcam_media",
                device_id = %state.device.device_id(),
                remote = ?remote,
                path = %request.uri().path(),
                "Rejected request from address outside the allow-list"
            );
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// 运行中的媒体服务器
pub struct MediaServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MediaServer {
    /// 绑定端口并开始服务
    pub async fn start(state: MediaState, bind_host: &str, port: u16) -> Result<Self> {
        let device_id = state.device.device_id().to_string();
        let listener = TcpListener::bind((bind_host, port))
            .await
            .map_err(|e| CameraError::config(format!("failed to bind {}:{}: {}", bind_host, port, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CameraError::config(format!("failed to read bound address: {}", e)))?;

        let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();

        info!(target: "ipcam_media", device_id = %device_id, "Media server listening on {}", addr);
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                warn!(target: "ipcam_media", device_id = %device_id, "Media server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// 停止接受新连接；长连接的观看者直接断开
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        // MJPEG 流不会自行结束，优雅关闭等待过久时直接终止
        if tokio::time::timeout(std::time::Duration::from_secs(2), &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
        info!(target: "ipcam_media", "Media server on {} stopped", self.addr);
    }
}
