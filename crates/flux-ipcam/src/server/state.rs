use crate::supervisor::DeviceHandle;
use flux_config::{FfmpegGlobalConfig, MediaConfig, ServerConfig};
use flux_stream::{HlsOptions, TranscodeManager};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// 设备的输出文件布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    pub root: PathBuf,
    pub hls: PathBuf,
    pub dash: PathBuf,
    pub gif: PathBuf,
    pub mp4: PathBuf,
}

impl DevicePaths {
    pub fn new(media_root: &Path, device_id: &str) -> Self {
        let root = media_root.join(device_id);
        Self {
            hls: root.join("hls"),
            dash: root.join("dash"),
            gif: root.join("ipcamera.gif"),
            mp4: root.join("ipcamera.mp4"),
            root,
        }
    }

    /// 分片文件路径；名称只能包含字母数字、`_`、`-` 和 `.`，不能跳出输出目录
    pub fn segment(&self, name: &str) -> Option<PathBuf> {
        let valid = !name.is_empty()
            && !name.contains("..")
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return None;
        }

        if name.ends_with(".ts") {
            Some(self.hls.join(name))
        } else if name.ends_with(".m4s") {
            Some(self.dash.join(name))
        } else {
            None
        }
    }
}

/// 媒体服务器共享状态
#[derive(Clone)]
pub struct MediaState {
    pub device: DeviceHandle,
    pub transcoder: TranscodeManager,
    pub ffmpeg: Arc<FfmpegGlobalConfig>,
    pub media: Arc<MediaConfig>,
    pub paths: Arc<DevicePaths>,
    /// 本机推送接口使用的端口
    pub port: u16,
    allowed: Arc<Vec<IpAddr>>,
}

impl MediaState {
    pub fn new(
        device: DeviceHandle,
        transcoder: TranscodeManager,
        ffmpeg: FfmpegGlobalConfig,
        media: MediaConfig,
        server: &ServerConfig,
        camera_ip: &str,
        port: u16,
    ) -> Self {
        let mut allowed: Vec<IpAddr> = Vec::new();
        for entry in server.allow_list().iter().map(String::as_str).chain([camera_ip]) {
            match entry.parse::<IpAddr>() {
                Ok(ip) if !allowed.contains(&ip) => allowed.push(ip),
                Ok(_) => {}
                Err(_) => warn!(
                    target: "ipcam_media",
                    device_id = %device.device_id(),
                    "Ignoring allow-list entry {:?}, not an IP address",
                    entry
                ),
            }
        }

        let paths = DevicePaths::new(&media.root_dir, device.device_id());
        Self {
            device,
            transcoder,
            ffmpeg: Arc::new(ffmpeg),
            media: Arc::new(media),
            paths: Arc::new(paths),
            port,
            allowed: Arc::new(allowed),
        }
    }

    /// 回环地址总是允许
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        ip.is_loopback() || self.allowed.contains(&ip)
    }

    /// 直播任务无订阅者后的保活时长
    pub fn grace(&self) -> Duration {
        self.transcoder.config().keep_alive
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.media.hls_startup_delay_ms)
    }

    pub async fn hls_options(&self) -> HlsOptions {
        let device = self.device.device().await;
        HlsOptions {
            video_codec: device.hls_video_codec,
            audio_codec: device.hls_audio_codec,
            scale: device.hls_scale,
            ..HlsOptions::from_media(&self.media)
        }
    }

    /// ffmpeg 推送接口地址
    pub fn sink_url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }
}
