use crate::error::{CameraError, ErrorCategory, Result};
use chrono::{DateTime, Utc};
use flux_stream::Purpose;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// 摄像头厂商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Brand {
    Onvif,
    Hikvision,
    Dahua,
    Amcrest,
    Foscam,
    Instar,
    Reolink,
    Doorbird,
    /// 仅有流地址，无厂商 API
    Generic,
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Brand::Onvif => "onvif",
            Brand::Hikvision => "hikvision",
            Brand::Dahua => "dahua",
            Brand::Amcrest => "amcrest",
            Brand::Foscam => "foscam",
            Brand::Instar => "instar",
            Brand::Reolink => "reolink",
            Brand::Doorbird => "doorbird",
            Brand::Generic => "generic",
        };
        f.write_str(name)
    }
}

fn default_http_port() -> u16 {
    80
}

fn default_onvif_port() -> u16 {
    8000
}

fn default_nvr_channel() -> u32 {
    1
}

fn default_video_codec() -> String {
    "copy".to_string()
}

fn default_gif_seconds() -> u32 {
    5
}

fn default_mp4_seconds() -> u32 {
    10
}

/// 摄像头设备（对应 cameras.toml 中的一条 `[[cameras]]`）
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub brand: Brand,
    pub ip: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_onvif_port")]
    pub onvif_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// NVR 通道号
    #[serde(default = "default_nvr_channel")]
    pub nvr_channel: u32,
    /// 内嵌媒体服务端口，未配置时不启动
    #[serde(default)]
    pub server_port: Option<u16>,
    /// 0-100，0 表示关闭 ffmpeg 运动探测
    #[serde(default)]
    pub motion_threshold: u8,
    /// 0-100，0 表示关闭 ffmpeg 声音探测
    #[serde(default)]
    pub audio_threshold: u8,

    /// 覆盖默认 RTSP 输入
    #[serde(default)]
    pub ffmpeg_input: Option<String>,
    #[serde(default)]
    pub snapshot_url: Option<String>,
    #[serde(default)]
    pub mjpeg_url: Option<String>,
    /// 报警探测使用的输入，缺省与 ffmpeg_input 相同
    #[serde(default)]
    pub alarm_input_url: Option<String>,

    #[serde(default = "default_video_codec")]
    pub hls_video_codec: String,
    #[serde(default)]
    pub hls_audio_codec: Option<String>,
    #[serde(default)]
    pub hls_scale: Option<String>,
    #[serde(default = "default_gif_seconds")]
    pub gif_seconds: u32,
    #[serde(default = "default_mp4_seconds")]
    pub mp4_seconds: u32,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("brand", &self.brand)
            .field("ip", &self.ip)
            .field("http_port", &self.http_port)
            .field("username", &self.username)
            .field("password", &"*****")
            .field("nvr_channel", &self.nvr_channel)
            .field("server_port", &self.server_port)
            .finish_non_exhaustive()
    }
}

impl Device {
    pub fn new(id: impl Into<String>, brand: Brand, ip: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            brand,
            ip: ip.into(),
            http_port: default_http_port(),
            onvif_port: default_onvif_port(),
            username: String::new(),
            password: String::new(),
            nvr_channel: default_nvr_channel(),
            server_port: None,
            motion_threshold: 0,
            audio_threshold: 0,
            ffmpeg_input: None,
            snapshot_url: None,
            mjpeg_url: None,
            alarm_input_url: None,
            hls_video_codec: default_video_codec(),
            hls_audio_codec: None,
            hls_scale: None,
            gif_seconds: default_gif_seconds(),
            mp4_seconds: default_mp4_seconds(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.ip, self.http_port)
    }

    /// 相对路径拼接为设备 HTTP 地址，绝对地址原样返回
    pub fn resolve_url(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else if target.starts_with('/') {
            format!("{}{}", self.http_base(), target)
        } else {
            format!("{}/{}", self.http_base(), target)
        }
    }

    /// 凭据或地址变化需要重建会话
    pub fn connection_changed(&self, other: &Device) -> bool {
        self.ip != other.ip
            || self.http_port != other.http_port
            || self.onvif_port != other.onvif_port
            || self.username != other.username
            || self.password != other.password
            || self.brand != other.brand
            || self.nvr_channel != other.nvr_channel
    }

    /// 校验配置，失败属于配置错误
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CameraError::config("device id is empty"));
        }
        if self.id.contains(['/', '\\']) || self.id.contains("..") {
            return Err(CameraError::config(format!(
                "device id '{}' must not contain path separators",
                self.id
            )));
        }
        if self.ip.trim().is_empty() || self.ip.contains(char::is_whitespace) {
            return Err(CameraError::config(format!(
                "device {} has an invalid address '{}'",
                self.id, self.ip
            )));
        }
        if self.http_port == 0 {
            return Err(CameraError::config(format!("device {} has http_port 0", self.id)));
        }
        if self.motion_threshold > 100 || self.audio_threshold > 100 {
            return Err(CameraError::config(format!(
                "device {} thresholds must be within 0-100",
                self.id
            )));
        }
        if let Some(input) = &self.ffmpeg_input {
            if !input.contains("://") && !input.starts_with('/') {
                return Err(CameraError::config(format!(
                    "device {} ffmpeg_input '{}' is not a URL or path",
                    self.id, input
                )));
            }
        }
        if self.brand == Brand::Generic && self.ffmpeg_input.is_none() && self.snapshot_url.is_none()
        {
            return Err(CameraError::config(format!(
                "generic device {} needs ffmpeg_input or snapshot_url",
                self.id
            )));
        }
        Ok(())
    }
}

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Offline,
    Connecting,
    Online,
    Error {
        category: ErrorCategory,
        detail: String,
    },
}

impl ConnectionState {
    pub fn error(err: &CameraError) -> Self {
        ConnectionState::Error {
            category: err.category(),
            detail: err.to_string(),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ConnectionState::Online)
    }

    /// 需要重新提供凭据
    pub fn needs_credentials(&self) -> bool {
        matches!(
            self,
            ConnectionState::Error {
                category: ErrorCategory::Authentication,
                ..
            }
        )
    }

    /// 不会自动重试的状态
    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            ConnectionState::Error {
                category: ErrorCategory::Authentication | ErrorCategory::Configuration,
                ..
            }
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Offline => f.write_str("offline"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Online => f.write_str("online"),
            ConnectionState::Error { category, detail } => {
                write!(f, "error({}): {}", category, detail)
            }
        }
    }
}

/// 报警类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    Motion,
    Audio,
    LineCrossing,
    FieldDetection,
    Pir,
    FaceDetected,
    ItemLeft,
    ItemTaken,
    Car,
    Human,
    Doorbell,
    ExternalInput,
    ExternalInput2,
    TooDark,
    TooBlurry,
    SceneChange,
    Parking,
}

impl AlarmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmKind::Motion => "motion",
            AlarmKind::Audio => "audio",
            AlarmKind::LineCrossing => "line_crossing",
            AlarmKind::FieldDetection => "field_detection",
            AlarmKind::Pir => "pir",
            AlarmKind::FaceDetected => "face_detected",
            AlarmKind::ItemLeft => "item_left",
            AlarmKind::ItemTaken => "item_taken",
            AlarmKind::Car => "car",
            AlarmKind::Human => "human",
            AlarmKind::Doorbell => "doorbell",
            AlarmKind::ExternalInput => "external_input",
            AlarmKind::ExternalInput2 => "external_input2",
            AlarmKind::TooDark => "too_dark",
            AlarmKind::TooBlurry => "too_blurry",
            AlarmKind::SceneChange => "scene_change",
            AlarmKind::Parking => "parking",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 报警事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub device_id: String,
    pub kind: AlarmKind,
    pub active: bool,
    pub at: DateTime<Utc>,
}

/// 对外发布的设备事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    Status {
        device_id: String,
        state: ConnectionState,
        at: DateTime<Utc>,
    },
    Alarm(AlarmEvent),
    /// 缓存的厂商属性变化（开关状态、阈值、文字叠加等）
    Attribute {
        device_id: String,
        name: String,
        value: serde_json::Value,
    },
    /// 一次性转码产物就绪
    OutputReady {
        device_id: String,
        purpose: Purpose,
        path: Option<PathBuf>,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Status { device_id, .. }
            | DeviceEvent::Attribute { device_id, .. }
            | DeviceEvent::OutputReady { device_id, .. } => device_id,
            DeviceEvent::Alarm(alarm) => &alarm.device_id,
        }
    }
}

/// 云台坐标或速度，ONVIF 通用空间内取值
///
/// 水平、垂直范围为 -1..=1；绝对定位时变焦为 0..=1。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PtzVector {
    #[serde(default)]
    pub pan: f32,
    #[serde(default)]
    pub tilt: f32,
    #[serde(default)]
    pub zoom: f32,
}

impl PtzVector {
    pub fn new(pan: f32, tilt: f32, zoom: f32) -> Self {
        Self { pan, tilt, zoom }
    }
}

/// 厂商命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum CameraCommand {
    EnableMotionAlarm(bool),
    EnableAudioAlarm(bool),
    SetMotionThreshold(u8),
    SetAudioThreshold(u8),
    EnableLineCrossing(bool),
    EnableFieldDetection(bool),
    EnablePirAlarm(bool),
    EnableExternalAlarmInput(bool),
    TriggerExternalAlarmInput(bool),
    EnablePrivacyMode(bool),
    ActivateAlarmOutput(bool),
    ActivateAlarmOutput2(bool),
    EnableIrLed(bool),
    AutoIrLed(bool),
    TextOverlay(String),
    GotoPreset(u32),
    /// 按速度持续转动，直到 `StopPtz`
    ContinuousMove(PtzVector),
    /// 相对当前位置移动
    RelativeMove(PtzVector),
    AbsoluteMove(PtzVector),
    StopPtz,
    /// 门铃开门继电器
    OpenDoor(u8),
    EnableLight(bool),
    /// 按端点表修改设置（Reolink）
    SetSetting {
        endpoint: String,
        value: serde_json::Value,
    },
}

impl CameraCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CameraCommand::EnableMotionAlarm(_) => "enable_motion_alarm",
            CameraCommand::EnableAudioAlarm(_) => "enable_audio_alarm",
            CameraCommand::SetMotionThreshold(_) => "set_motion_threshold",
            CameraCommand::SetAudioThreshold(_) => "set_audio_threshold",
            CameraCommand::EnableLineCrossing(_) => "enable_line_crossing",
            CameraCommand::EnableFieldDetection(_) => "enable_field_detection",
            CameraCommand::EnablePirAlarm(_) => "enable_pir_alarm",
            CameraCommand::EnableExternalAlarmInput(_) => "enable_external_alarm_input",
            CameraCommand::TriggerExternalAlarmInput(_) => "trigger_external_alarm_input",
            CameraCommand::EnablePrivacyMode(_) => "enable_privacy_mode",
            CameraCommand::ActivateAlarmOutput(_) => "activate_alarm_output",
            CameraCommand::ActivateAlarmOutput2(_) => "activate_alarm_output2",
            CameraCommand::EnableIrLed(_) => "enable_ir_led",
            CameraCommand::AutoIrLed(_) => "auto_ir_led",
            CameraCommand::TextOverlay(_) => "text_overlay",
            CameraCommand::GotoPreset(_) => "goto_preset",
            CameraCommand::ContinuousMove(_) => "continuous_move",
            CameraCommand::RelativeMove(_) => "relative_move",
            CameraCommand::AbsoluteMove(_) => "absolute_move",
            CameraCommand::StopPtz => "stop_ptz",
            CameraCommand::OpenDoor(_) => "open_door",
            CameraCommand::EnableLight(_) => "enable_light",
            CameraCommand::SetSetting { .. } => "set_setting",
        }
    }
}
