use crate::backoff::RestartBackoff;
use crate::context::{JobContext, SubscriberInfo};
use crate::error::{Result, StreamError};
use crate::job::{Cleanup, JobKey, JobSpec, KeepAlive, TranscodeJob};
use crate::processor::TranscodeProcess;
use flux_config::FfmpegGlobalConfig;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const CLEANUP_WORKERS: usize = 4;
const EVENT_CAPACITY: usize = 256;

/// 转码管理器配置
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// 直播任务无订阅者后的保活时长
    pub keep_alive: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// 运行时间短于该值的退出视为快速失败
    pub rapid_exit: Duration,
    /// 一次性任务结束后等待输出文件落盘的时间
    pub output_ready_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_ffmpeg(&FfmpegGlobalConfig::default())
    }
}

impl ManagerConfig {
    pub fn from_ffmpeg(config: &FfmpegGlobalConfig) -> Self {
        Self {
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            backoff_initial: Duration::from_millis(config.restart_backoff_initial_ms),
            backoff_max: Duration::from_millis(config.restart_backoff_max_ms),
            rapid_exit: Duration::from_secs(config.rapid_exit_secs),
            output_ready_delay: Duration::from_millis(config.output_ready_delay_ms),
        }
    }
}

/// 转码事件
#[derive(Debug, Clone)]
pub enum TranscodeEvent {
    Started {
        key: JobKey,
        pid: Option<u32>,
    },
    Exited {
        key: JobKey,
        code: Option<i32>,
        requested: bool,
    },
    /// 一次性任务完成，产物可用
    OutputReady {
        key: JobKey,
        path: Option<PathBuf>,
    },
    /// 转发的 stderr 行（报警探测）
    ProbeLine {
        key: JobKey,
        line: String,
    },
    Failed {
        key: JobKey,
        reason: String,
    },
}

/// 转码进程管理器
///
/// 保证每个 (设备, 用途) 最多一个存活进程，负责保活、重启退避和产物清理
#[derive(Clone)]
pub struct TranscodeManager {
    config: ManagerConfig,
    jobs: Arc<RwLock<HashMap<JobKey, Arc<TranscodeJob>>>>,
    contexts: Arc<RwLock<HashMap<JobKey, JobContext>>>,
    backoffs: Arc<Mutex<HashMap<JobKey, RestartBackoff>>>,
    pending_restarts: Arc<Mutex<HashMap<JobKey, AbortHandle>>>,
    cleanup_permits: Arc<Semaphore>,
    event_tx: broadcast::Sender<TranscodeEvent>,
}

impl TranscodeManager {
    pub fn new(config: ManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            contexts: Arc::new(RwLock::new(HashMap::new())),
            backoffs: Arc::new(Mutex::new(HashMap::new())),
            pending_restarts: Arc::new(Mutex::new(HashMap::new())),
            cleanup_permits: Arc::new(Semaphore::new(CLEANUP_WORKERS)),
            event_tx,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// 订阅转码事件
    pub fn subscribe(&self) -> broadcast::Receiver<TranscodeEvent> {
        self.event_tx.subscribe()
    }

    /// 确保任务在运行（幂等）
    ///
    /// 已有存活任务时直接返回，无订阅者的直播任务会刷新保活
    pub async fn ensure(&self, key: JobKey, spec: JobSpec) -> Result<Arc<TranscodeJob>> {
        if let Some(job) = self.live_job(&key).await {
            if job.context().get_client_count().await == 0 {
                job.refresh_keep_alive();
            }
            debug!(job = %key, "Reusing running transcode job");
            return Ok(job);
        }

        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get(&key) {
            if job.is_alive() {
                return Ok(job.clone());
            }
        }

        self.check_backoff(&key)?;
        self.start_locked(&mut jobs, key, spec).await
    }

    /// 启动一次性任务，同一键已有存活任务时拒绝
    pub async fn run_once(&self, key: JobKey, spec: JobSpec) -> Result<Arc<TranscodeJob>> {
        if self.live_job(&key).await.is_some() {
            warn!(job = %key, "One-shot job already running");
            return Err(StreamError::Busy(key.to_string()));
        }

        let mut jobs = self.jobs.write().await;
        if matches!(jobs.get(&key), Some(job) if job.is_alive()) {
            return Err(StreamError::Busy(key.to_string()));
        }

        self.start_locked(&mut jobs, key, spec).await
    }

    /// 停止任务（幂等），返回是否确实停止了一个任务
    pub async fn stop(&self, key: &JobKey) -> Result<bool> {
        self.cancel_pending_restart(key);

        let job = {
            let mut jobs = self.jobs.write().await;
            jobs.remove(key)
        };

        let Some(job) = job else {
            return Ok(false);
        };

        job.request_stop();
        if tokio::time::timeout(STOP_TIMEOUT, job.finished()).await.is_err() {
            warn!(job = %key, "Timed out waiting for transcode process to exit");
        }

        info!(job = %key, "Transcode job stopped");
        Ok(true)
    }

    /// 停止设备的全部任务并丢弃其订阅者与退避状态
    pub async fn stop_device(&self, device_id: &str) -> Result<usize> {
        let keys: Vec<JobKey> = {
            let jobs = self.jobs.read().await;
            jobs.keys()
                .filter(|key| key.device_id == device_id)
                .cloned()
                .collect()
        };

        if let Ok(mut pending) = self.pending_restarts.lock() {
            pending.retain(|key, handle| {
                if key.device_id == device_id {
                    handle.abort();
                    false
                } else {
                    true
                }
            });
        }

        let mut stopped = 0;
        for key in &keys {
            if self.stop(key).await? {
                stopped += 1;
            }
        }

        self.contexts
            .write()
            .await
            .retain(|key, _| key.device_id != device_id);
        if let Ok(mut backoffs) = self.backoffs.lock() {
            backoffs.retain(|key, _| key.device_id != device_id);
        }

        info!(device_id = %device_id, stopped, "Device transcode jobs stopped");
        Ok(stopped)
    }

    /// 停止所有任务
    pub async fn stop_all(&self) -> Result<()> {
        if let Ok(mut pending) = self.pending_restarts.lock() {
            for (_, handle) in pending.drain() {
                handle.abort();
            }
        }

        let keys: Vec<JobKey> = self.jobs.read().await.keys().cloned().collect();
        for key in &keys {
            self.stop(key).await?;
        }
        Ok(())
    }

    /// 添加订阅者，取消保活倒计时
    pub async fn attach(
        &self,
        key: &JobKey,
        subscriber_id: &str,
        remote_addr: Option<String>,
    ) -> usize {
        let context = self.context_for(key).await;
        let count = context
            .add_client(SubscriberInfo::new(subscriber_id, remote_addr))
            .await;

        if let Some(job) = self.get(key).await {
            job.cancel_keep_alive();
        }

        debug!(job = %key, subscriber = %subscriber_id, count, "Subscriber attached");
        count
    }

    /// 移除订阅者，最后一个离开时开始保活倒计时
    pub async fn detach(&self, key: &JobKey, subscriber_id: &str) -> usize {
        let context = self.context_for(key).await;
        let count = context.remove_client(subscriber_id).await;

        if count == 0 {
            if let Some(job) = self.get(key).await {
                job.refresh_keep_alive();
                info!(job = %key, "Last subscriber left, keep-alive armed");
            }
        }

        debug!(job = %key, subscriber = %subscriber_id, count, "Subscriber detached");
        count
    }

    /// 记录一次活动（例如播放列表请求），刷新无订阅者任务的保活
    pub async fn touch(&self, key: &JobKey) -> bool {
        let Some(job) = self.get(key).await else {
            return false;
        };
        if job.context().get_client_count().await == 0 {
            job.refresh_keep_alive();
        }
        true
    }

    pub async fn subscriber_count(&self, key: &JobKey) -> usize {
        match self.contexts.read().await.get(key) {
            Some(context) => context.get_client_count().await,
            None => 0,
        }
    }

    /// 停止保活到期的任务，返回被停止的键
    pub async fn check_keep_alive(&self) -> Vec<JobKey> {
        self.sweep_expired(|_| true).await
    }

    /// 只检查某个设备的任务
    pub async fn check_device_keep_alive(&self, device_id: &str) -> Vec<JobKey> {
        self.sweep_expired(|key| key.device_id == device_id).await
    }

    pub async fn get(&self, key: &JobKey) -> Option<Arc<TranscodeJob>> {
        self.jobs.read().await.get(key).cloned()
    }

    pub async fn is_alive(&self, key: &JobKey) -> bool {
        matches!(self.get(key).await, Some(job) if job.is_alive())
    }

    pub async fn list(&self) -> Vec<JobKey> {
        self.jobs.read().await.keys().cloned().collect()
    }

    async fn sweep_expired<F>(&self, filter: F) -> Vec<JobKey>
    where
        F: Fn(&JobKey) -> bool,
    {
        let now = Instant::now();
        let candidates: Vec<Arc<TranscodeJob>> = {
            let jobs = self.jobs.read().await;
            jobs.iter()
                .filter(|(key, job)| filter(*key) && job.keep_alive_expired(now))
                .map(|(_, job)| job.clone())
                .collect()
        };

        let mut stopped = Vec::new();
        for job in candidates {
            if job.context().get_client_count().await > 0 {
                job.cancel_keep_alive();
                continue;
            }
            let key = job.key().clone();
            info!(job = %key, "Keep-alive expired, stopping idle transcode job");
            match self.stop(&key).await {
                Ok(true) => stopped.push(key),
                Ok(false) => {}
                Err(e) => warn!(job = %key, error = %e, "Failed to stop idle job"),
            }
        }
        stopped
    }

    /// 返回存活任务；已退出但尚未清理完的旧任务会先等待其清理结束
    async fn live_job(&self, key: &JobKey) -> Option<Arc<TranscodeJob>> {
        let job = self.get(key).await?;
        if job.is_alive() {
            return Some(job);
        }
        if tokio::time::timeout(STOP_TIMEOUT, job.finished()).await.is_err() {
            warn!(job = %key, "Previous transcode job did not finish in time");
        }
        None
    }

    async fn context_for(&self, key: &JobKey) -> JobContext {
        let mut contexts = self.contexts.write().await;
        contexts
            .entry(key.clone())
            .or_insert_with(|| JobContext::new(key.clone()))
            .clone()
    }

    fn check_backoff(&self, key: &JobKey) -> Result<()> {
        let remaining = self
            .backoffs
            .lock()
            .ok()
            .and_then(|backoffs| backoffs.get(key).and_then(|b| b.remaining()));

        match remaining {
            Some(remaining) => Err(StreamError::Backoff {
                key: key.to_string(),
                remaining_ms: remaining.as_millis() as u64,
            }),
            None => Ok(()),
        }
    }

    fn cancel_pending_restart(&self, key: &JobKey) {
        if let Ok(mut pending) = self.pending_restarts.lock() {
            if let Some(handle) = pending.remove(key) {
                handle.abort();
                debug!(job = %key, "Pending restart cancelled");
            }
        }
    }

    async fn start_locked(
        &self,
        jobs: &mut HashMap<JobKey, Arc<TranscodeJob>>,
        key: JobKey,
        spec: JobSpec,
    ) -> Result<Arc<TranscodeJob>> {
        if spec.clean_before_start {
            self.run_cleanup(&key, &spec.cleanup).await;
        }
        prepare_dirs(&spec).await?;

        let context = self.context_for(&key).await;

        let (stderr_tx, stderr_rx) = if spec.forward_stderr {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let process = TranscodeProcess::spawn(&key, &spec, stderr_tx)?;
        let job = Arc::new(TranscodeJob::new(key.clone(), spec, process, context));

        if job.context().get_client_count().await == 0 {
            job.refresh_keep_alive();
        }

        jobs.insert(key.clone(), job.clone());

        info!(job = %key, pid = ?job.pid(), "Transcode job started");
        let _ = self.event_tx.send(TranscodeEvent::Started {
            key: key.clone(),
            pid: job.pid(),
        });

        if let Some(mut rx) = stderr_rx {
            let event_tx = self.event_tx.clone();
            let key = key.clone();
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let _ = event_tx.send(TranscodeEvent::ProbeLine {
                        key: key.clone(),
                        line,
                    });
                }
            });
        }

        tokio::spawn(self.clone().watch(job.clone()));
        Ok(job)
    }

    /// 进程看门狗：退出后清理，并按策略发出事件或安排重启
    fn watch(self, job: Arc<TranscodeJob>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let exit = job.process().wait().await;
            let key = job.key().clone();

            {
                let mut jobs = self.jobs.write().await;
                if matches!(jobs.get(&key), Some(current) if Arc::ptr_eq(current, &job)) {
                    jobs.remove(&key);
                }
            }

            self.run_cleanup(&key, &job.spec().cleanup).await;
            job.mark_finished();

            if job.stop_requested() {
                let _ = self.event_tx.send(TranscodeEvent::Exited {
                    key,
                    code: exit.code,
                    requested: true,
                });
                return;
            }

            if job.spec().keep_alive == KeepAlive::UntilExit {
                self.finish_one_shot(key, &job, exit.success, exit.code).await;
                return;
            }

            warn!(job = %key, code = ?exit.code, uptime_ms = job.uptime().as_millis() as u64, "Transcode process exited unexpectedly");
            let delay = self.record_exit(&key, job.uptime());
            let _ = self.event_tx.send(TranscodeEvent::Exited {
                key: key.clone(),
                code: exit.code,
                requested: false,
            });

            let wants_restart = match job.spec().keep_alive {
                KeepAlive::Forever => true,
                KeepAlive::Grace(_) => job.context().get_client_count().await > 0,
                KeepAlive::UntilExit => false,
            };
            if wants_restart {
                self.schedule_restart(key, job.spec().clone(), delay);
            }
        })
    }

    async fn finish_one_shot(
        &self,
        key: JobKey,
        job: &TranscodeJob,
        success: bool,
        code: Option<i32>,
    ) {
        if success {
            tokio::time::sleep(self.config.output_ready_delay).await;
            info!(job = %key, "One-shot transcode finished");
            let _ = self.event_tx.send(TranscodeEvent::OutputReady {
                key,
                path: job.spec().artifact.clone(),
            });
        } else {
            error!(job = %key, code = ?code, "One-shot transcode failed");
            let _ = self.event_tx.send(TranscodeEvent::Failed {
                key,
                reason: format!("process exited with code {:?}", code),
            });
        }
    }

    fn record_exit(&self, key: &JobKey, uptime: Duration) -> Duration {
        let Ok(mut backoffs) = self.backoffs.lock() else {
            return self.config.backoff_initial;
        };
        let backoff = backoffs.entry(key.clone()).or_insert_with(|| {
            RestartBackoff::new(self.config.backoff_initial, self.config.backoff_max)
        });

        if uptime < self.config.rapid_exit {
            let delay = backoff.record_failure();
            warn!(job = %key, failures = backoff.failures(), delay_ms = delay.as_millis() as u64, "Rapid exit, restart delayed");
            delay
        } else {
            backoff.reset();
            Duration::ZERO
        }
    }

    fn schedule_restart(&self, key: JobKey, spec: JobSpec, delay: Duration) {
        let Ok(mut pending) = self.pending_restarts.lock() else {
            return;
        };

        let manager = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Ok(mut pending) = manager.pending_restarts.lock() {
                pending.remove(&task_key);
            }

            let mut jobs = manager.jobs.write().await;
            if jobs.contains_key(&task_key) {
                return;
            }
            info!(job = %task_key, "Restarting transcode job");
            if let Err(e) = manager.start_locked(&mut jobs, task_key.clone(), spec).await {
                error!(job = %task_key, error = %e, "Failed to restart transcode job");
                let _ = manager.event_tx.send(TranscodeEvent::Failed {
                    key: task_key,
                    reason: e.to_string(),
                });
            }
        });

        if let Some(previous) = pending.insert(key, handle.abort_handle()) {
            previous.abort();
        }
    }

    async fn run_cleanup(&self, key: &JobKey, cleanup: &Cleanup) {
        if *cleanup == Cleanup::None {
            return;
        }

        let Ok(_permit) = self.cleanup_permits.acquire().await else {
            return;
        };
        let cleanup = cleanup.clone();
        let result = tokio::task::spawn_blocking(move || apply_cleanup(&cleanup)).await;

        match result {
            Ok(Ok(())) => debug!(job = %key, "Artifacts cleaned up"),
            Ok(Err(e)) => warn!(job = %key, error = %e, "Artifact cleanup failed"),
            Err(e) => warn!(job = %key, error = %e, "Cleanup task panicked"),
        }
    }
}

async fn prepare_dirs(spec: &JobSpec) -> Result<()> {
    let mut dirs: Vec<&Path> = Vec::new();
    if let Some(dir) = &spec.working_dir {
        dirs.push(dir);
    }
    match &spec.cleanup {
        Cleanup::ClearDir(dir) | Cleanup::RemoveDir(dir) => dirs.push(dir),
        _ => {}
    }
    if let Some(parent) = spec.artifact.as_deref().and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            dirs.push(parent);
        }
    }

    for dir in dirs {
        tokio::fs::create_dir_all(dir).await?;
    }
    Ok(())
}

fn apply_cleanup(cleanup: &Cleanup) -> std::io::Result<()> {
    match cleanup {
        Cleanup::None => Ok(()),
        Cleanup::ClearDir(dir) => {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            };
            for entry in entries {
                let path = entry?.path();
                if path.is_file() {
                    std::fs::remove_file(&path)?;
                }
            }
            Ok(())
        }
        Cleanup::RemoveDir(dir) => match std::fs::remove_dir_all(dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
        Cleanup::RemoveFile(path) => match std::fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Purpose;

    #[test]
    fn test_config_from_ffmpeg_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.keep_alive, Duration::from_secs(64));
        assert_eq!(config.backoff_initial, Duration::from_secs(1));
        assert_eq!(config.output_ready_delay, Duration::from_millis(800));
    }

    #[test]
    fn test_clear_dir_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ipcamera_01.ts"), b"ts").unwrap();
        std::fs::write(dir.path().join("ipcamera.m3u8"), b"#EXTM3U").unwrap();

        apply_cleanup(&Cleanup::ClearDir(dir.path().to_path_buf())).unwrap();

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cleanup_missing_paths_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        apply_cleanup(&Cleanup::ClearDir(missing.clone())).unwrap();
        apply_cleanup(&Cleanup::RemoveDir(missing.clone())).unwrap();
        apply_cleanup(&Cleanup::RemoveFile(missing)).unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_job_is_noop() {
        let manager = TranscodeManager::new(ManagerConfig::default());
        let key = JobKey::new("cam", Purpose::Hls);
        assert!(!manager.stop(&key).await.unwrap());
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_attach_without_job_tracks_subscribers() {
        let manager = TranscodeManager::new(ManagerConfig::default());
        let key = JobKey::new("cam", Purpose::Mjpeg);

        assert_eq!(manager.attach(&key, "viewer-1", None).await, 1);
        assert_eq!(manager.attach(&key, "viewer-2", None).await, 2);
        assert_eq!(manager.detach(&key, "viewer-1").await, 1);
        assert_eq!(manager.subscriber_count(&key).await, 1);
        assert!(!manager.touch(&key).await);
    }
}
