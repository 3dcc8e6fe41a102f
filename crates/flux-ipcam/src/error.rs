use flux_stream::StreamError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 错误分类，决定设备状态和重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 超时、连接重置，按固定间隔重试
    Transport,
    /// 无法识别的厂商回复，记录后丢弃
    Protocol,
    /// 401 或会话失效，暂停重试直到凭据更新
    Authentication,
    /// 配置错误，不自动重试
    Configuration,
    /// 外部转码进程启动失败或异常退出
    Process,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transport => "transport",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Process => "process",
        };
        f.write_str(name)
    }
}

/// 摄像头引擎错误类型
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transcode process error: {0}")]
    Process(String),

    /// 厂商拒绝了命令（非 2xx 或厂商错误码），可恢复
    #[error("Command rejected by camera: {detail}")]
    Rejected { detail: String },

    #[error("Device not found: {0}")]
    NotFound(String),

    /// 同类一次性任务正在进行
    #[error("Busy: {0}")]
    Busy(String),

    #[error("Command not supported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CameraError>;

impl CameraError {
    pub fn transport(msg: impl Into<String>) -> Self {
        CameraError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        CameraError::Protocol(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        CameraError::Authentication(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CameraError::Configuration(msg.into())
    }

    pub fn rejected(detail: impl Into<String>) -> Self {
        CameraError::Rejected {
            detail: detail.into(),
        }
    }

    /// 映射到错误分类
    pub fn category(&self) -> ErrorCategory {
        match self {
            CameraError::Transport(_) => ErrorCategory::Transport,
            CameraError::Protocol(_) | CameraError::Rejected { .. } => ErrorCategory::Protocol,
            CameraError::Authentication(_) => ErrorCategory::Authentication,
            CameraError::Configuration(_)
            | CameraError::NotFound(_)
            | CameraError::Unsupported(_) => ErrorCategory::Configuration,
            CameraError::Process(_) | CameraError::Busy(_) => ErrorCategory::Process,
            CameraError::Other(_) => ErrorCategory::Transport,
        }
    }
}

impl From<reqwest::Error> for CameraError {
    fn from(err: reqwest::Error) -> Self {
        // URL 中可能带有凭据
        let err = err.without_url();
        if err.is_builder() {
            CameraError::Configuration(err.to_string())
        } else {
            CameraError::Transport(err.to_string())
        }
    }
}

impl From<StreamError> for CameraError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Busy(key) => CameraError::Busy(key),
            StreamError::NotFound(key) => CameraError::NotFound(key),
            other => CameraError::Process(other.to_string()),
        }
    }
}
