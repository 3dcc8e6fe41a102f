use crate::context::JobContext;
use crate::processor::TranscodeProcess;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// 转码输出用途
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    Hls,
    Dash,
    Mjpeg,
    Snapshot,
    Gif,
    Record,
    AlarmProbe,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Hls => "hls",
            Purpose::Dash => "dash",
            Purpose::Mjpeg => "mjpeg",
            Purpose::Snapshot => "snapshot",
            Purpose::Gif => "gif",
            Purpose::Record => "record",
            Purpose::AlarmProbe => "alarm_probe",
        }
    }

    /// 面向观看者的直播输出，受保活规则约束
    pub fn is_live(&self) -> bool {
        matches!(self, Purpose::Hls | Purpose::Dash | Purpose::Mjpeg)
    }

    /// 运行到结束的一次性任务
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Purpose::Snapshot | Purpose::Gif | Purpose::Record)
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务键：每个 (设备, 用途) 最多一个存活任务
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub device_id: String,
    pub purpose: Purpose,
}

impl JobKey {
    pub fn new(device_id: impl Into<String>, purpose: Purpose) -> Self {
        Self {
            device_id: device_id.into(),
            purpose,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.purpose)
    }
}

/// 保活策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    /// 无订阅者持续该时长后停止
    Grace(Duration),
    /// 一直运行，意外退出后自动重启
    Forever,
    /// 运行到进程自行结束
    UntilExit,
}

/// 任务销毁时的清理动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleanup {
    None,
    /// 删除目录中的所有文件，保留目录本身
    ClearDir(PathBuf),
    /// 删除整个目录
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
}

/// 外部进程的完整启动描述
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub keep_alive: KeepAlive,
    pub cleanup: Cleanup,
    /// 启动前先执行一次清理（例如清掉上次残留的 HLS 分片）
    pub clean_before_start: bool,
    /// 一次性任务完成后可供下载的产物
    pub artifact: Option<PathBuf>,
    /// 将 stderr 行作为事件转发（报警探测使用）
    pub forward_stderr: bool,
}

impl JobSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            keep_alive: KeepAlive::UntilExit,
            cleanup: Cleanup::None,
            clean_before_start: false,
            artifact: None,
            forward_stderr: false,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_cleanup(mut self, cleanup: Cleanup, before_start: bool) -> Self {
        self.cleanup = cleanup;
        self.clean_before_start = before_start;
        self
    }

    pub fn with_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact = Some(path.into());
        self
    }

    pub fn forwarding_stderr(mut self) -> Self {
        self.forward_stderr = true;
        self
    }
}

/// 一个正在运行的外部转码进程
pub struct TranscodeJob {
    key: JobKey,
    spec: JobSpec,
    started_at: Instant,
    process: TranscodeProcess,
    context: JobContext,
    deadline: Mutex<Option<Instant>>,
    stop_requested: AtomicBool,
    finished_tx: watch::Sender<bool>,
}

impl TranscodeJob {
    pub(crate) fn new(
        key: JobKey,
        spec: JobSpec,
        process: TranscodeProcess,
        context: JobContext,
    ) -> Self {
        let (finished_tx, _) = watch::channel(false);
        Self {
            key,
            spec,
            started_at: Instant::now(),
            process,
            context,
            deadline: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            finished_tx,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    /// 进程是否仍在运行且未被要求停止
    pub fn is_alive(&self) -> bool {
        self.process.is_running() && !self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// 刷新保活截止时间（仅对 Grace 策略生效）
    pub fn refresh_keep_alive(&self) {
        if let KeepAlive::Grace(grace) = self.spec.keep_alive {
            self.set_deadline(Some(Instant::now() + grace));
        }
    }

    /// 取消保活倒计时
    pub fn cancel_keep_alive(&self) {
        self.set_deadline(None);
    }

    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        self.deadline.lock().map(|d| *d).unwrap_or(None)
    }

    /// 保活已到期
    pub fn keep_alive_expired(&self, now: Instant) -> bool {
        matches!(self.keep_alive_deadline(), Some(deadline) if deadline <= now)
    }

    /// 等待进程退出且清理完成
    pub async fn finished(&self) {
        let mut rx = self.finished_tx.subscribe();
        // 已完成时立即返回
        let _ = rx.wait_for(|done| *done).await;
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.process.stop();
    }

    pub(crate) fn process(&self) -> &TranscodeProcess {
        &self.process
    }

    pub(crate) fn mark_finished(&self) {
        self.finished_tx.send_replace(true);
    }

    fn set_deadline(&self, value: Option<Instant>) {
        if let Ok(mut deadline) = self.deadline.lock() {
            *deadline = value;
        }
    }
}

impl fmt::Debug for TranscodeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranscodeJob")
            .field("key", &self.key)
            .field("pid", &self.pid())
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_classification() {
        assert!(Purpose::Hls.is_live());
        assert!(Purpose::Mjpeg.is_live());
        assert!(!Purpose::AlarmProbe.is_live());
        assert!(!Purpose::AlarmProbe.is_one_shot());
        assert!(Purpose::Gif.is_one_shot());
        assert!(Purpose::Record.is_one_shot());
        assert!(Purpose::Snapshot.is_one_shot());
    }

    #[test]
    fn test_job_key_display() {
        let key = JobKey::new("front-door", Purpose::AlarmProbe);
        assert_eq!(key.to_string(), "front-door/alarm_probe");
    }

    #[test]
    fn test_job_spec_builder() {
        let spec = JobSpec::new("ffmpeg", vec!["-version".to_string()])
            .with_keep_alive(KeepAlive::Forever)
            .with_cleanup(Cleanup::ClearDir(PathBuf::from("/tmp/hls")), true)
            .forwarding_stderr();

        assert_eq!(spec.keep_alive, KeepAlive::Forever);
        assert!(spec.clean_before_start);
        assert!(spec.forward_stderr);
        assert!(spec.artifact.is_none());
    }
}
