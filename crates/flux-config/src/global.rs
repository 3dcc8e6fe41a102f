use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 全局配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub system: SystemConfig,
    pub engine: EngineConfig,
    pub ffmpeg: FfmpegGlobalConfig,
    pub media: MediaConfig,
    pub server: ServerConfig,
}

/// 系统配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub version: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "FLUX IP Camera Engine".to_string(),
            version: "1.0.0".to_string(),
        }
    }
}

/// 连接监督配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 重连间隔（秒）
    pub reconnect_interval_secs: u64,
    /// 首次连接前的延迟（秒）
    pub initial_delay_secs: u64,
    /// 在线时的维护周期（秒）
    pub housekeeping_interval_secs: u64,
    /// 单个 HTTP 请求超时（秒）
    pub request_timeout_secs: u64,
    /// 同时打开的连接上限，超过后清理未被追踪的连接
    pub max_open_channels: usize,
    /// 长连接空闲超时（秒）
    pub idle_timeout_secs: u64,
    /// 设备事件广播容量
    pub event_capacity: usize,
    /// 在线设备连续收到多少个无法识别的回复后降级
    pub max_malformed_replies: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: 30,
            initial_delay_secs: 4,
            housekeeping_interval_secs: 8,
            request_timeout_secs: 10,
            max_open_channels: 18,
            idle_timeout_secs: 18,
            event_capacity: 256,
            max_malformed_replies: 5,
        }
    }
}

impl EngineConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// FFmpeg 进程配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FfmpegGlobalConfig {
    /// ffmpeg 可执行文件路径
    pub path: PathBuf,
    /// 最后一个观看者离开后保持进程的时间（秒）
    pub keep_alive_secs: u64,
    pub restart_backoff_initial_ms: u64,
    pub restart_backoff_max_ms: u64,
    /// 启动后在此时间内退出视为快速失败（秒）
    pub rapid_exit_secs: u64,
    /// 一次性任务结束后等待文件落盘的时间（毫秒）
    pub output_ready_delay_ms: u64,
}

impl Default for FfmpegGlobalConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ffmpeg"),
            keep_alive_secs: 64,
            restart_backoff_initial_ms: 1000,
            restart_backoff_max_ms: 60_000,
            rapid_exit_secs: 5,
            output_ready_delay_ms: 800,
        }
    }
}

/// 媒体输出配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    /// 每个设备的输出目录位于 `<root_dir>/<device_id>/`
    pub root_dir: PathBuf,
    pub hls_list_size: u32,
    pub hls_time: u32,
    /// 首次请求 HLS 时等待初始分片生成的时间（毫秒）
    pub hls_startup_delay_ms: u64,
    /// 快照上传未携带 Content-Length 时的缓冲区大小
    pub snapshot_buffer_default: usize,
    pub snapshots_mjpeg_interval_ms: u64,
    pub mjpeg_channel_capacity: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./data/ipcam"),
            hls_list_size: 4,
            hls_time: 2,
            hls_startup_delay_ms: 4500,
            snapshot_buffer_default: 768_000,
            snapshots_mjpeg_interval_ms: 1000,
            mjpeg_channel_capacity: 16,
        }
    }
}

/// 内嵌媒体服务器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    /// 允许访问的来源地址
    pub allowed_ips: Vec<String>,
    /// 本机地址，自动加入白名单
    pub host_ip: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            allowed_ips: vec!["127.0.0.1".to_string()],
            host_ip: None,
        }
    }
}

impl ServerConfig {
    /// 白名单（含本机地址）
    pub fn allow_list(&self) -> Vec<String> {
        let mut list = self.allowed_ips.clone();
        if let Some(host) = &self.host_ip {
            if !list.contains(host) {
                list.push(host.clone());
            }
        }
        list
    }
}

impl GlobalConfig {
    /// 序列化为 TOML 文本
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_global_config() {
        let config = GlobalConfig::default();
        assert_eq!(config.system.name, "FLUX IP Camera Engine");
        assert_eq!(config.engine.reconnect_interval_secs, 30);
        assert_eq!(config.engine.housekeeping_interval_secs, 8);
        assert_eq!(config.engine.max_open_channels, 18);
        assert_eq!(config.engine.max_malformed_replies, 5);
        assert_eq!(config.media.snapshot_buffer_default, 768_000);
    }

    #[test]
    fn test_allow_list_includes_host_ip() {
        let mut server = ServerConfig::default();
        server.host_ip = Some("192.168.1.20".to_string());
        assert_eq!(server.allow_list(), vec!["127.0.0.1", "192.168.1.20"]);

        server.host_ip = Some("127.0.0.1".to_string());
        assert_eq!(server.allow_list(), vec!["127.0.0.1"]);
    }

    #[test]
    fn test_to_toml_contains_sections() {
        let text = GlobalConfig::default().to_toml().unwrap();
        assert!(text.contains("[engine]"));
        assert!(text.contains("reconnect_interval_secs = 30"));
    }
}
