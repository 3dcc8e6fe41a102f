use crate::error::{Result, StreamError};
use crate::job::{JobKey, JobSpec};
use crate::processor::command::mask_password;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// 进程退出信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub success: bool,
    /// 由 stop() 主动结束
    pub killed: bool,
}

/// 外部转码进程
///
/// 子进程由后台任务持有并等待退出，`stop()` 通过信号通知该任务结束进程。
pub struct TranscodeProcess {
    key: JobKey,
    pid: Option<u32>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl TranscodeProcess {
    /// 启动进程
    ///
    /// `stderr_tx` 存在时 stderr 的每一行都会被转发，否则只记录 debug 日志
    pub fn spawn(
        key: &JobKey,
        spec: &JobSpec,
        stderr_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Self> {
        info!(
            job = %key,
            program = %spec.program.display(),
            args = %mask_password(&spec.args.join(" ")),
            "Starting transcode process"
        );

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!(job = %key, error = %e, "Failed to spawn transcode process");
            StreamError::Spawn {
                program: spec.program.display().to_string(),
                source: e,
            }
        })?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            let key = key.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match &stderr_tx {
                        Some(tx) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        None => debug!(job = %key, "{}", line),
                    }
                }
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        let wait_key = key.clone();
        tokio::spawn(async move {
            let stopped = tokio::select! {
                status = child.wait() => Some(status),
                _ = stop_rx => None,
            };

            let (status, killed) = match stopped {
                Some(status) => (status, false),
                None => {
                    if let Err(e) = child.start_kill() {
                        warn!(job = %wait_key, error = %e, "Failed to kill transcode process");
                    }
                    (child.wait().await, true)
                }
            };

            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                    success: status.success(),
                    killed,
                },
                Err(e) => {
                    error!(job = %wait_key, error = %e, "Failed to wait for transcode process");
                    ProcessExit {
                        code: None,
                        success: false,
                        killed,
                    }
                }
            };

            debug!(job = %wait_key, code = ?exit.code, killed = exit.killed, "Transcode process exited");
            exit_tx.send_replace(Some(exit));
        });

        Ok(Self {
            key: key.clone(),
            pid,
            stop_tx: Mutex::new(Some(stop_tx)),
            exit_rx,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// 检查进程是否运行
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// 停止进程（幂等）
    pub fn stop(&self) {
        let sender = self.stop_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = sender {
            info!(job = %self.key, "Stopping transcode process");
            let _ = tx.send(());
        }
    }

    /// 等待进程退出
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit.unwrap_or(ProcessExit {
            code: None,
            success: false,
            killed: false,
        })
    }
}

impl Drop for TranscodeProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Purpose;

    #[tokio::test]
    async fn test_process_runs_to_completion() {
        let key = JobKey::new("cam", Purpose::Snapshot);
        let spec = JobSpec::new("true", vec![]);
        let process = TranscodeProcess::spawn(&key, &spec, None).unwrap();

        let exit = process.wait().await;
        assert!(exit.success);
        assert!(!exit.killed);
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_process_stop_kills_child() {
        let key = JobKey::new("cam", Purpose::Hls);
        let spec = JobSpec::new("sleep", vec!["30".to_string()]);
        let process = TranscodeProcess::spawn(&key, &spec, None).unwrap();
        assert!(process.is_running());
        assert!(process.pid().is_some());

        process.stop();
        let exit = process.wait().await;
        assert!(exit.killed);
        assert!(!process.is_running());

        // 再次停止不应出错
        process.stop();
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let key = JobKey::new("cam", Purpose::Hls);
        let spec = JobSpec::new("/nonexistent/ffmpeg-binary", vec![]);
        let result = TranscodeProcess::spawn(&key, &spec, None);
        assert!(matches!(result, Err(StreamError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_stderr_forwarding() {
        let key = JobKey::new("cam", Purpose::AlarmProbe);
        let spec = JobSpec::new(
            "sh",
            vec!["-c".to_string(), "echo silence_end >&2".to_string()],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let process = TranscodeProcess::spawn(&key, &spec, Some(tx)).unwrap();

        let line = rx.recv().await.unwrap();
        assert_eq!(line, "silence_end");
        process.wait().await;
    }
}
