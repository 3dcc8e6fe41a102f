use thiserror::Error;

/// 转码进程管理错误
#[derive(Error, Debug)]
pub enum StreamError {
    /// 外部进程启动失败（程序不存在、参数错误等）
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// 同一任务已在运行
    #[error("Job already running: {0}")]
    Busy(String),

    /// 任务不存在
    #[error("Job not found: {0}")]
    NotFound(String),

    /// 进程反复快速退出，重启被推迟
    #[error("Restart of {key} delayed by backoff, retry in {remaining_ms} ms")]
    Backoff { key: String, remaining_ms: u64 },

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        StreamError::InvalidSpec(msg.into())
    }

    /// 进程根本没能启动（程序缺失或参数无效），重试不会自行恢复
    pub fn is_start_failure(&self) -> bool {
        matches!(self, StreamError::Spawn { .. } | StreamError::InvalidSpec(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_failures() {
        let spawn = StreamError::Spawn {
            program: "/nonexistent/ffmpeg".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(spawn.is_start_failure());
        assert!(StreamError::invalid_spec("empty args").is_start_failure());
        assert!(!StreamError::Busy("cam/mjpeg".to_string()).is_start_failure());
        assert!(!StreamError::Backoff {
            key: "cam/hls".to_string(),
            remaining_ms: 500
        }
        .is_start_failure());
    }
}
