use crate::error::{CameraError, Result};
use crate::model::{CameraCommand, ConnectionState, Device, DeviceEvent};
use crate::server::{DevicePaths, MediaServer, MediaState};
use crate::supervisor::{DeviceHandle, Supervisor, SupervisorDeps};
use crate::transport::{http_transport_factory, TransportFactory};
use bytes::Bytes;
use flux_config::GlobalConfig;
use flux_stream::{FfmpegCommand, InputSpec, JobKey, ManagerConfig, Purpose, TranscodeManager};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 监督任务退出的最长等待时间
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

struct RunningDevice {
    handle: DeviceHandle,
    task: JoinHandle<()>,
    server: Option<MediaServer>,
}

struct DeviceEntry {
    device: Device,
    running: Option<RunningDevice>,
    /// 启动进行中（监督任务和媒体服务器在锁外创建）
    starting: bool,
}

/// 摄像头引擎
///
/// 对外的统一入口：登记设备、启停监督任务和媒体服务器、转发命令，
/// 并把所有设备的事件汇总到一个广播通道。
pub struct CameraEngine {
    config: GlobalConfig,
    transcoder: TranscodeManager,
    transport_factory: TransportFactory,
    events: broadcast::Sender<DeviceEvent>,
    devices: RwLock<HashMap<String, DeviceEntry>>,
}

impl CameraEngine {
    pub fn new(config: GlobalConfig) -> Self {
        let factory = http_transport_factory(
            config.engine.request_timeout(),
            config.engine.idle_timeout(),
        );
        Self::with_transport_factory(config, factory)
    }

    /// 使用自定义传输层（测试中注入模拟摄像头）
    pub fn with_transport_factory(config: GlobalConfig, transport_factory: TransportFactory) -> Self {
        let transcoder = TranscodeManager::new(ManagerConfig::from_ffmpeg(&config.ffmpeg));
        let (events, _) = broadcast::channel(config.engine.event_capacity.max(1));
        info!("Camera engine created");

        Self {
            config,
            transcoder,
            transport_factory,
            events,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// 订阅全部设备事件
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn transcoder(&self) -> &TranscodeManager {
        &self.transcoder
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    // ========== 设备登记 ==========

    /// 登记设备，不会自动启动
    pub async fn add_device(&self, device: Device) -> Result<()> {
        device.validate()?;
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.id) {
            return Err(CameraError::config(format!(
                "device {} is already registered",
                device.id
            )));
        }

        info!(device_id = %device.id, brand = %device.brand, "Device registered");
        devices.insert(
            device.id.clone(),
            DeviceEntry {
                device,
                running: None,
                starting: false,
            },
        );
        Ok(())
    }

    pub async fn device(&self, device_id: &str) -> Option<Device> {
        self.devices
            .read()
            .await
            .get(device_id)
            .map(|entry| entry.device.clone())
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 启动监督任务和媒体服务器，已在运行或正在启动时无操作
    ///
    /// 设备表只在认领和登记时短暂加锁，启动过程中其它设备的查询和命令不受影响。
    pub async fn start_device(&self, device_id: &str) -> Result<()> {
        let device = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .get_mut(device_id)
                .ok_or_else(|| not_found(device_id))?;
            if entry.running.is_some() || entry.starting {
                return Ok(());
            }
            entry.starting = true;
            entry.device.clone()
        };

        let running = match self.spawn_running(&device).await {
            Ok(running) => running,
            Err(e) => {
                if let Some(entry) = self.devices.write().await.get_mut(device_id) {
                    entry.starting = false;
                }
                return Err(e);
            }
        };

        let (cancelled, update) = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(device_id) {
                Some(entry) if entry.starting => {
                    entry.starting = false;
                    // 启动期间配置被修改
                    let update = (entry.device != device).then(|| entry.device.clone());
                    let handle = running.handle.clone();
                    entry.running = Some(running);
                    (None, update.map(|device| (handle, device)))
                }
                // 启动期间被停止或删除
                _ => (Some(running), None),
            }
        };

        if let Some(running) = cancelled {
            debug!(device_id = %device_id, "Device start cancelled");
            shutdown_running(device_id, running).await;
            return Ok(());
        }
        if let Some((handle, device)) = update {
            handle.update(device).await?;
        }
        info!(device_id = %device_id, "Device started");
        Ok(())
    }

    async fn spawn_running(&self, device: &Device) -> Result<RunningDevice> {
        let (handle, task) = Supervisor::spawn(device.clone(), self.supervisor_deps())?;

        let server = match device.server_port {
            Some(port) => {
                let state = MediaState::new(
                    handle.clone(),
                    self.transcoder.clone(),
                    self.config.ffmpeg.clone(),
                    self.config.media.clone(),
                    &self.config.server,
                    &device.ip,
                    port,
                );
                match MediaServer::start(state, &self.config.server.bind_host, port).await {
                    Ok(server) => Some(server),
                    Err(e) => {
                        handle.stop().await;
                        let _ = tokio::time::timeout(STOP_TIMEOUT, task).await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        Ok(RunningDevice {
            handle,
            task,
            server,
        })
    }

    /// 停止设备，可重复调用
    pub async fn stop_device(&self, device_id: &str) -> Result<()> {
        let running = {
            let mut devices = self.devices.write().await;
            devices.get_mut(device_id).and_then(|entry| {
                entry.starting = false;
                entry.running.take()
            })
        };

        if let Some(running) = running {
            shutdown_running(device_id, running).await;
            info!(device_id = %device_id, "Device stopped");
        }
        Ok(())
    }

    /// 停止并删除设备及其输出目录
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let entry = self.devices.write().await.remove(device_id);
        let Some(mut entry) = entry else {
            return Ok(());
        };

        if let Some(running) = entry.running.take() {
            shutdown_running(device_id, running).await;
        }

        let paths = DevicePaths::new(&self.config.media.root_dir, device_id);
        match tokio::fs::remove_dir_all(&paths.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(device_id = %device_id, "Failed to remove {}: {}", paths.root.display(), e),
        }
        info!(device_id = %device_id, "Device removed");
        Ok(())
    }

    /// 更新设备配置；运行中的设备按需重建会话，媒体端口变化时重启
    pub async fn update_device(&self, device: Device) -> Result<()> {
        device.validate()?;
        let device_id = device.id.clone();

        let (handle, restart) = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .get_mut(&device_id)
                .ok_or_else(|| not_found(&device_id))?;
            let restart = entry.device.server_port != device.server_port;
            entry.device = device.clone();
            (entry.running.as_ref().map(|running| running.handle.clone()), restart)
        };

        match handle {
            Some(_) if restart => {
                info!(device_id = %device_id, "Media server port changed, restarting device");
                self.stop_device(&device_id).await?;
                self.start_device(&device_id).await
            }
            Some(handle) => handle.update(device).await,
            None => Ok(()),
        }
    }

    pub async fn device_state(&self, device_id: &str) -> Result<ConnectionState> {
        match self.handle(device_id).await {
            Ok(handle) => Ok(handle.state().await),
            Err(e) => {
                if self.devices.read().await.contains_key(device_id) {
                    Ok(ConnectionState::Offline)
                } else {
                    Err(e)
                }
            }
        }
    }

    // ========== 命令与媒体 ==========

    pub async fn send_command(&self, device_id: &str, command: CameraCommand) -> Result<()> {
        self.handle(device_id).await?.send_command(command).await
    }

    pub async fn request_snapshot(&self, device_id: &str) -> Result<Bytes> {
        self.handle(device_id).await?.request_snapshot().await
    }

    /// 录制 MP4，时长缺省取设备配置；完成后发布 `OutputReady`
    pub async fn request_recording(&self, device_id: &str, seconds: Option<u32>) -> Result<PathBuf> {
        self.request_clip(device_id, Purpose::Record, seconds).await
    }

    /// 录制 GIF，完成后发布 `OutputReady`
    pub async fn request_gif(&self, device_id: &str, seconds: Option<u32>) -> Result<PathBuf> {
        self.request_clip(device_id, Purpose::Gif, seconds).await
    }

    async fn request_clip(&self, device_id: &str, purpose: Purpose, seconds: Option<u32>) -> Result<PathBuf> {
        let handle = self.handle(device_id).await?;
        let device = handle.device().await;
        let input = handle.sources().await.ffmpeg_input.ok_or_else(|| {
            CameraError::config(format!("device {} has no ffmpeg input", device_id))
        })?;

        let paths = DevicePaths::new(&self.config.media.root_dir, device_id);
        tokio::fs::create_dir_all(&paths.root)
            .await
            .map_err(|e| CameraError::Process(format!("failed to create {}: {}", paths.root.display(), e)))?;

        let program = &self.config.ffmpeg.path;
        let (spec, output) = match purpose {
            Purpose::Gif => {
                let seconds = seconds.unwrap_or(device.gif_seconds).max(1);
                (FfmpegCommand::gif(program, InputSpec::new(input), seconds, &paths.gif), paths.gif)
            }
            _ => {
                let seconds = seconds.unwrap_or(device.mp4_seconds).max(1);
                (FfmpegCommand::record(program, InputSpec::new(input), seconds, &paths.mp4), paths.mp4)
            }
        };

        self.transcoder
            .run_once(JobKey::new(device_id, purpose), spec)
            .await?;
        info!(device_id = %device_id, purpose = %purpose, "Recording started");
        Ok(output)
    }

    /// 0 关闭 ffmpeg 运动探测
    pub async fn set_motion_threshold(&self, device_id: &str, threshold: u8) -> Result<()> {
        let mut device = self.device(device_id).await.ok_or_else(|| not_found(device_id))?;
        device.motion_threshold = threshold;
        self.update_device(device).await
    }

    /// 0 关闭 ffmpeg 声音探测
    pub async fn set_audio_threshold(&self, device_id: &str, threshold: u8) -> Result<()> {
        let mut device = self.device(device_id).await.ok_or_else(|| not_found(device_id))?;
        device.audio_threshold = threshold;
        self.update_device(device).await
    }

    /// 停止所有设备和转码任务
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down camera engine");
        for device_id in self.device_ids().await {
            self.stop_device(&device_id).await?;
        }
        self.transcoder.stop_all().await?;
        info!("Camera engine stopped");
        Ok(())
    }

    async fn handle(&self, device_id: &str) -> Result<DeviceHandle> {
        let devices = self.devices.read().await;
        let entry = devices.get(device_id).ok_or_else(|| not_found(device_id))?;
        entry
            .running
            .as_ref()
            .map(|running| running.handle.clone())
            .ok_or_else(|| CameraError::NotFound(format!("device {} is not running", device_id)))
    }

    fn supervisor_deps(&self) -> SupervisorDeps {
        SupervisorDeps {
            transport_factory: self.transport_factory.clone(),
            transcoder: self.transcoder.clone(),
            events: self.events.clone(),
            engine: self.config.engine.clone(),
            ffmpeg: self.config.ffmpeg.clone(),
            host_ip: self.config.server.host_ip.clone(),
            mjpeg_capacity: self.config.media.mjpeg_channel_capacity,
        }
    }
}

fn not_found(device_id: &str) -> CameraError {
    CameraError::NotFound(format!("device {} is not registered", device_id))
}

async fn shutdown_running(device_id: &str, running: RunningDevice) {
    if let Some(server) = running.server {
        server.stop().await;
    }
    running.handle.stop().await;

    let mut task = running.task;
    if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
        warn!(device_id = %device_id, "Supervisor did not stop in time, aborting");
        task.abort();
    }
}
