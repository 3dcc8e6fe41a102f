//! 设备连接监督
//!
//! 每个设备一个 actor，独占适配器、请求追踪器和缓存的报警/属性状态。
//! 厂商回复、长连接片段、命令、报警回调和转码事件都经同一个邮箱串行处理，
//! 适配器内部状态因此不需要加锁。只有快照缓冲区同时被服务端读写。

use crate::brand::{create_adapter, AdapterContext, AdapterOutput, BrandAdapter};
use crate::error::{CameraError, ErrorCategory, Result};
use crate::model::{AlarmEvent, AlarmKind, CameraCommand, ConnectionState, Device, DeviceEvent};
use crate::server::SnapshotBuffer;
use crate::tracker::RequestTracker;
use crate::transport::{redact_query, CameraTransport, TransportFactory, VendorReply, VendorRequest};
use bytes::Bytes;
use chrono::Utc;
use flux_config::{EngineConfig, FfmpegGlobalConfig};
use flux_stream::{
    inject_credentials, mask_password, AlarmProbeParser, FfmpegCommand, InputSpec, JobKey,
    ProbeSignal, Purpose, StreamError, TranscodeEvent, TranscodeManager,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MAILBOX_CAPACITY: usize = 256;
/// 一条命令最多跟随的请求数（读-改-写、重新登录后重发）
const MAX_COMMAND_STEPS: usize = 8;

/// 设备的媒体来源，按设备覆盖项优先、适配器默认值其次解析
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaSources {
    /// 已注入凭据的转码输入
    pub ffmpeg_input: Option<String>,
    /// 绝对地址
    pub snapshot_url: Option<String>,
    pub mjpeg_url: Option<String>,
    pub alarm_input: Option<String>,
}

impl MediaSources {
    pub fn resolve(device: &Device, adapter: &dyn BrandAdapter) -> Self {
        let with_credentials = |url: String| inject_credentials(&url, &device.username, &device.password);

        let ffmpeg_input = device
            .ffmpeg_input
            .clone()
            .or_else(|| adapter.ffmpeg_input(device))
            .map(with_credentials);
        let alarm_input = device
            .alarm_input_url
            .clone()
            .map(with_credentials)
            .or_else(|| ffmpeg_input.clone());

        Self {
            snapshot_url: device
                .snapshot_url
                .clone()
                .or_else(|| adapter.snapshot_url(device))
                .map(|url| device.resolve_url(&url)),
            mjpeg_url: device
                .mjpeg_url
                .clone()
                .or_else(|| adapter.mjpeg_url(device))
                .map(|url| device.resolve_url(&url)),
            ffmpeg_input,
            alarm_input,
        }
    }
}

/// 邮箱消息；带 `generation` 的消息来自某次会话，会话重建后丢弃
pub(crate) enum DeviceMessage {
    Handshake {
        generation: u64,
        result: Result<VendorReply>,
    },
    Reply {
        generation: u64,
        target: String,
        result: Result<VendorReply>,
    },
    StreamChunk {
        generation: u64,
        target: String,
        chunk: String,
    },
    StreamClosed {
        generation: u64,
        target: String,
        error: Option<CameraError>,
    },
    Command {
        command: CameraCommand,
        reply: oneshot::Sender<Result<()>>,
    },
    AlarmPush(String),
    Snapshot(oneshot::Sender<Result<Bytes>>),
    /// 媒体服务器按需启动转码进程失败
    ProcessFailed(String),
    Update(Box<Device>),
    Stop,
}

/// 监督者与媒体服务器共享的设备状态
#[derive(Debug)]
struct DeviceShared {
    device_id: String,
    device: RwLock<Device>,
    state: RwLock<ConnectionState>,
    sources: RwLock<MediaSources>,
    snapshot: SnapshotBuffer,
    mjpeg: broadcast::Sender<Bytes>,
}

/// 设备句柄，向监督者投递消息
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<DeviceShared>,
    mailbox: mpsc::Sender<DeviceMessage>,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub async fn device(&self) -> Device {
        self.shared.device.read().await.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.state.read().await.clone()
    }

    pub async fn sources(&self) -> MediaSources {
        self.shared.sources.read().await.clone()
    }

    pub fn snapshot(&self) -> &SnapshotBuffer {
        &self.shared.snapshot
    }

    /// MJPEG 帧广播
    pub fn mjpeg(&self) -> &broadcast::Sender<Bytes> {
        &self.shared.mjpeg
    }

    /// 在设备上下文中执行命令
    pub async fn send_command(&self, command: CameraCommand) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(DeviceMessage::Command { command, reply }).await?;
        rx.await.map_err(|_| self.stopped())?
    }

    /// 抓取一张快照并更新当前快照
    pub async fn request_snapshot(&self) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.post(DeviceMessage::Snapshot(reply)).await?;
        rx.await.map_err(|_| self.stopped())?
    }

    /// 摄像头推送的报警回调
    pub async fn alarm_pushed(&self, query: String) -> Result<()> {
        self.post(DeviceMessage::AlarmPush(query)).await
    }

    /// 转码进程无法启动，设备进入进程错误状态
    pub async fn process_failed(&self, detail: String) -> Result<()> {
        self.post(DeviceMessage::ProcessFailed(detail)).await
    }

    pub(crate) async fn update(&self, device: Device) -> Result<()> {
        self.post(DeviceMessage::Update(Box::new(device))).await
    }

    pub(crate) async fn stop(&self) {
        let _ = self.mailbox.send(DeviceMessage::Stop).await;
    }

    async fn post(&self, message: DeviceMessage) -> Result<()> {
        self.mailbox.send(message).await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> CameraError {
        CameraError::NotFound(format!("device {} is stopped", self.shared.device_id))
    }
}

/// 监督者依赖
#[derive(Clone)]
pub struct SupervisorDeps {
    pub transport_factory: TransportFactory,
    pub transcoder: TranscodeManager,
    pub events: broadcast::Sender<DeviceEvent>,
    pub engine: EngineConfig,
    pub ffmpeg: FfmpegGlobalConfig,
    /// 本机地址，用于摄像头报警回调
    pub host_ip: Option<String>,
    pub mjpeg_capacity: usize,
}

enum Flow {
    Continue,
    Reconnect,
    Stop,
}

/// 单个设备的连接状态机
pub struct Supervisor {
    device: Device,
    adapter: Box<dyn BrandAdapter>,
    transport: Arc<dyn CameraTransport>,
    tracker: Arc<RequestTracker>,
    shared: Arc<DeviceShared>,
    mailbox: mpsc::WeakSender<DeviceMessage>,
    rx: mpsc::Receiver<DeviceMessage>,
    deps: SupervisorDeps,
    state: ConnectionState,
    generation: u64,
    handshake_in_flight: bool,
    alarms: HashMap<AlarmKind, bool>,
    attributes: HashMap<String, serde_json::Value>,
    refresh_cursor: usize,
    /// 连续无法识别的回复数
    malformed_replies: u32,
    probe: AlarmProbeParser,
    probe_thresholds: Option<(u8, u8)>,
}

impl Supervisor {
    /// 校验设备并启动监督任务
    pub fn spawn(device: Device, deps: SupervisorDeps) -> Result<(DeviceHandle, JoinHandle<()>)> {
        device.validate()?;
        let transport = (deps.transport_factory)(&device)?;

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (mjpeg, _) = broadcast::channel(deps.mjpeg_capacity.max(1));
        let adapter = create_adapter(&device);
        let shared = Arc::new(DeviceShared {
            device_id: device.id.clone(),
            device: RwLock::new(device.clone()),
            state: RwLock::new(ConnectionState::Offline),
            sources: RwLock::new(MediaSources::resolve(&device, adapter.as_ref())),
            snapshot: SnapshotBuffer::new(),
            mjpeg,
        });

        let supervisor = Supervisor {
            device,
            adapter,
            transport,
            tracker: Arc::new(RequestTracker::new()),
            shared: shared.clone(),
            mailbox: tx.downgrade(),
            rx,
            deps,
            state: ConnectionState::Offline,
            generation: 0,
            handshake_in_flight: false,
            alarms: HashMap::new(),
            attributes: HashMap::new(),
            refresh_cursor: 0,
            malformed_replies: 0,
            probe: AlarmProbeParser::new(),
            probe_thresholds: None,
        };

        let task = tokio::spawn(supervisor.run());
        Ok((DeviceHandle { shared, mailbox: tx }, task))
    }

    async fn run(mut self) {
        let mut transcode_events = self.deps.transcoder.subscribe();
        let initial_delay = self.deps.engine.initial_delay();
        let reconnect_interval = self.deps.engine.reconnect_interval();
        let housekeeping_interval = self.deps.engine.housekeeping_interval();

        let mut reconnect = interval_at(Instant::now() + initial_delay, reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval_at(Instant::now() + housekeeping_interval, housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            device_id = %self.device.id,
            brand = %self.device.brand,
            ip = %self.device.ip,
            "Connection supervisor started"
        );

        loop {
            let was_online = self.state.is_online();
            tokio::select! {
                _ = reconnect.tick(), if self.should_connect() => self.connect().await,
                _ = housekeeping.tick(), if self.state.is_online() => self.housekeeping().await,
                message = self.rx.recv() => {
                    let Some(message) = message else { break };
                    match self.handle_message(message).await {
                        Flow::Continue => {}
                        Flow::Reconnect => reconnect.reset_immediately(),
                        Flow::Stop => break,
                    }
                }
                event = transcode_events.recv() => match event {
                    Ok(event) => self.on_transcode_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(device_id = %self.device.id, skipped, "Transcode events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
            if !was_online && self.state.is_online() {
                housekeeping.reset();
            }
        }

        self.teardown().await;
    }

    fn should_connect(&self) -> bool {
        !self.state.is_online() && !self.state.is_suspended() && !self.handshake_in_flight
    }

    async fn handle_message(&mut self, message: DeviceMessage) -> Flow {
        let current = self.generation;
        match message {
            DeviceMessage::Handshake { generation, result } if generation == current => {
                self.on_handshake(result).await;
            }
            DeviceMessage::Reply {
                generation,
                target,
                result,
            } if generation == current => self.on_reply(target, result).await,
            DeviceMessage::StreamChunk {
                generation,
                target,
                chunk,
            } if generation == current => {
                let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
                self.adapter.ingest_stream(&target, &chunk, &mut ctx);
                let output = ctx.into_output();
                self.dispatch(output).await;
            }
            DeviceMessage::StreamClosed {
                generation,
                target,
                error,
            } if generation == current => {
                debug!(device_id = %self.device.id, "Long-lived connection {} closed", redact_query(&target));
                if let Some(e) = error {
                    if e.category() == ErrorCategory::Authentication {
                        self.fail(e).await;
                    }
                }
            }
            DeviceMessage::Command { command, reply } => {
                let result = self.execute_command(&command).await;
                if let Err(e) = &result {
                    warn!(device_id = %self.device.id, command = command.name(), "Command failed: {}", e);
                }
                let _ = reply.send(result);
            }
            DeviceMessage::AlarmPush(query) => {
                let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
                self.adapter.alarm_pushed(&query, &mut ctx);
                let output = ctx.into_output();
                self.dispatch(output).await;
            }
            DeviceMessage::Snapshot(reply) => self.snapshot(reply).await,
            DeviceMessage::ProcessFailed(detail) => self.fail(CameraError::Process(detail)).await,
            DeviceMessage::Update(device) => return self.update(*device).await,
            DeviceMessage::Stop => return Flow::Stop,
            _ => debug!(device_id = %self.device.id, "Dropping message from previous session"),
        }
        Flow::Continue
    }

    fn callback(&self) -> Option<(String, u16)> {
        match (&self.deps.host_ip, self.device.server_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }

    async fn connect(&mut self) {
        if self.state != ConnectionState::Connecting {
            self.set_state(ConnectionState::Connecting).await;
        }

        let Some(request) = self.adapter.handshake(&self.device) else {
            self.go_online().await;
            return;
        };

        debug!(device_id = %self.device.id, "Sending handshake {}", request);
        self.handshake_in_flight = true;
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = transport.execute(&request).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(DeviceMessage::Handshake { generation, result }).await;
            }
        });
    }

    async fn on_handshake(&mut self, result: Result<VendorReply>) {
        self.handshake_in_flight = false;
        if self.state.is_online() {
            return;
        }

        let verified = match result {
            Ok(reply) => {
                let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
                let verdict = self.adapter.verify_handshake(&reply, &mut ctx);
                verdict.map(|_| ctx.into_output())
            }
            Err(e) => Err(e),
        };

        match verified {
            Ok(output) => {
                self.go_online().await;
                self.dispatch(output).await;
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn go_online(&mut self) {
        self.malformed_replies = 0;
        self.set_state(ConnectionState::Online).await;
        self.publish_sources().await;

        let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
        self.adapter.on_connected(&mut ctx);
        let output = ctx.into_output();
        self.dispatch(output).await;

        self.ensure_alarm_probe().await;
    }

    /// 按错误分类降级：传输错误回到离线并继续重试，认证和配置错误暂停重试
    async fn fail(&mut self, err: CameraError) {
        let state = match err.category() {
            ErrorCategory::Transport => {
                warn!(device_id = %self.device.id, "Camera unreachable: {}", err);
                ConnectionState::Offline
            }
            ErrorCategory::Authentication => {
                warn!(device_id = %self.device.id, "Camera rejected credentials, waiting for new ones: {}", err);
                ConnectionState::error(&err)
            }
            ErrorCategory::Configuration => {
                error!(device_id = %self.device.id, "Device misconfigured: {}", err);
                ConnectionState::error(&err)
            }
            _ => {
                warn!(device_id = %self.device.id, "Camera session failed: {}", err);
                ConnectionState::error(&err)
            }
        };

        if self.state.is_online() {
            self.generation += 1;
            self.tracker.close_all();
        }
        self.handshake_in_flight = false;
        self.malformed_replies = 0;
        self.set_state(state).await;
        // 离线后只会停止探测任务，不会再失败
        if let Err(e) = self.sync_alarm_detection().await {
            debug!(device_id = %self.device.id, "Alarm detection not updated: {}", e);
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!(device_id = %self.device.id, from = %self.state, to = %state, "Connection state changed");
        self.state = state.clone();
        *self.shared.state.write().await = state.clone();
        self.emit(DeviceEvent::Status {
            device_id: self.device.id.clone(),
            state,
            at: Utc::now(),
        });
    }

    fn emit(&self, event: DeviceEvent) {
        let _ = self.deps.events.send(event);
    }

    /// 只在状态变化时发布报警；从未激活过的类型不发布结束事件
    fn emit_alarm(&mut self, kind: AlarmKind, active: bool) {
        let previous = self.alarms.insert(kind, active);
        if previous == Some(active) || (previous.is_none() && !active) {
            return;
        }
        info!(device_id = %self.device.id, alarm = %kind, active, "Alarm state changed");
        self.emit(DeviceEvent::Alarm(AlarmEvent {
            device_id: self.device.id.clone(),
            kind,
            active,
            at: Utc::now(),
        }));
    }

    /// 执行适配器输出，返回厂商拒绝的原因
    async fn dispatch(&mut self, output: AdapterOutput) -> Option<String> {
        for (kind, active) in output.alarms {
            self.emit_alarm(kind, active);
        }

        let mut sources_changed = false;
        for (name, value) in output.attributes {
            if self.attributes.get(&name) == Some(&value) {
                continue;
            }
            sources_changed |= name == "stream_uri" || name == "snapshot_uri";
            self.attributes.insert(name.clone(), value.clone());
            self.emit(DeviceEvent::Attribute {
                device_id: self.device.id.clone(),
                name,
                value,
            });
        }
        if sources_changed {
            self.publish_sources().await;
            self.ensure_alarm_probe().await;
        }

        for request in output.requests {
            self.spawn_request(request);
        }
        for request in output.streams {
            self.spawn_stream(request);
        }
        output.rejection
    }

    /// 命令产生的请求进入命令队列，其余照常执行
    async fn dispatch_into(&mut self, mut output: AdapterOutput, queue: &mut VecDeque<VendorRequest>) -> Option<String> {
        queue.extend(output.requests.drain(..));
        self.dispatch(output).await
    }

    fn spawn_request(&self, request: VendorRequest) {
        self.tracker.track(&request.target, None);
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = transport.execute(&request).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx
                    .send(DeviceMessage::Reply {
                        generation,
                        target: request.target,
                        result,
                    })
                    .await;
            }
        });
    }

    /// 打开长连接；同一地址已有打开的连接时跳过
    fn spawn_stream(&self, request: VendorRequest) {
        if !self.tracker.is_stopped(&request.target) {
            debug!(device_id = %self.device.id, "Connection {} already open", request);
            return;
        }

        let (id, guard) = self.tracker.open_channel(&request.target);
        let transport = self.transport.clone();
        let mailbox = self.mailbox.clone();
        let generation = self.generation;
        let device_id = self.device.id.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            let target = request.target.clone();
            let error = match transport.open_stream(&request).await {
                Ok(mut chunks) => {
                    while let Some(chunk) = chunks.recv().await {
                        let Some(tx) = mailbox.upgrade() else { return };
                        let message = DeviceMessage::StreamChunk {
                            generation,
                            target: target.clone(),
                            chunk,
                        };
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    None
                }
                Err(e) => {
                    debug!(device_id = %device_id, "Failed to open {}: {}", request, e);
                    Some(e)
                }
            };
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx
                    .send(DeviceMessage::StreamClosed {
                        generation,
                        target,
                        error,
                    })
                    .await;
            }
        });
        self.tracker.bind_task(id, task.abort_handle());
    }

    async fn on_reply(&mut self, target: String, result: Result<VendorReply>) {
        match result {
            Ok(reply) => {
                if reply.is_success() {
                    self.tracker.store_reply(&target, reply.body.clone());
                } else {
                    debug!(
                        device_id = %self.device.id,
                        status = reply.status,
                        "Camera answered {} with an error status",
                        redact_query(&target)
                    );
                }
                let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
                self.adapter.ingest(&target, &reply.body, &mut ctx);
                let mut output = ctx.into_output();
                let malformed = output.malformed.take();
                if let Some(detail) = self.dispatch(output).await {
                    warn!(device_id = %self.device.id, "Camera rejected {}: {}", redact_query(&target), detail);
                }
                if reply.is_success() {
                    self.count_malformed(&target, malformed).await;
                }
            }
            Err(e) => match e.category() {
                ErrorCategory::Transport | ErrorCategory::Authentication if self.state.is_online() => {
                    self.fail(e).await;
                }
                _ => debug!(device_id = %self.device.id, "Request {} failed: {}", redact_query(&target), e),
            },
        }
    }

    /// 在线设备连续收到无法识别的回复时降级为协议错误
    async fn count_malformed(&mut self, target: &str, malformed: Option<String>) {
        let Some(detail) = malformed else {
            self.malformed_replies = 0;
            return;
        };
        if !self.state.is_online() {
            return;
        }

        self.malformed_replies += 1;
        debug!(
            device_id = %self.device.id,
            count = self.malformed_replies,
            "Unrecognised reply for {}: {}",
            redact_query(target),
            detail
        );
        let limit = self.deps.engine.max_malformed_replies.max(1);
        if self.malformed_replies >= limit {
            let err = CameraError::protocol(format!(
                "{} consecutive unrecognised replies, last from {}: {}",
                self.malformed_replies,
                redact_query(target),
                detail
            ));
            self.fail(err).await;
        }
    }

    async fn execute_command(&mut self, command: &CameraCommand) -> Result<()> {
        if !self.state.is_online() {
            return Err(CameraError::transport(format!(
                "device {} is {}",
                self.device.id, self.state
            )));
        }

        let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
        self.adapter.build_command(command, &mut ctx)?;
        let output = ctx.into_output();
        info!(device_id = %self.device.id, command = command.name(), "Executing command");

        let mut queue = VecDeque::new();
        if let Some(detail) = self.dispatch_into(output, &mut queue).await {
            return Err(CameraError::rejected(detail));
        }

        let mut steps = 0;
        while let Some(request) = queue.pop_front() {
            steps += 1;
            if steps > MAX_COMMAND_STEPS {
                return Err(CameraError::protocol(format!(
                    "command {} did not settle after {} requests",
                    command.name(),
                    MAX_COMMAND_STEPS
                )));
            }

            self.tracker.track(&request.target, None);
            let reply = match self.transport.execute(&request).await {
                Ok(reply) => reply,
                Err(e) => {
                    if e.category() == ErrorCategory::Authentication {
                        self.fail(CameraError::auth(e.to_string())).await;
                    }
                    return Err(e);
                }
            };
            if reply.is_success() {
                self.tracker.store_reply(&request.target, reply.body.clone());
            }

            let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
            self.adapter.ingest(&request.target, &reply.body, &mut ctx);
            let output = ctx.into_output();
            if let Some(detail) = self.dispatch_into(output, &mut queue).await {
                return Err(CameraError::rejected(detail));
            }
            if !reply.is_success() {
                return Err(CameraError::rejected(format!(
                    "{} returned status {}",
                    request, reply.status
                )));
            }
        }
        Ok(())
    }

    /// 厂商快照地址直接抓取，否则用一次性转码任务推送到媒体服务器
    async fn snapshot(&mut self, reply: oneshot::Sender<Result<Bytes>>) {
        let sources = self.shared.sources.read().await.clone();
        let shared = self.shared.clone();
        let timeout = self.deps.engine.request_timeout();

        if let Some(url) = sources.snapshot_url {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let result = transport.fetch_bytes(&VendorRequest::get(url)).await;
                if let Ok(image) = &result {
                    shared.snapshot.publish(image.clone());
                }
                let _ = reply.send(result);
            });
            return;
        }

        let (Some(input), Some(port)) = (sources.ffmpeg_input, self.device.server_port) else {
            let _ = reply.send(Err(CameraError::config(format!(
                "device {} has no snapshot source",
                self.device.id
            ))));
            return;
        };

        let spec = FfmpegCommand::snapshot(
            &self.deps.ffmpeg.path,
            InputSpec::new(input),
            &format!("http://127.0.0.1:{}/snapshot.jpg", port),
        );
        let key = JobKey::new(&self.device.id, Purpose::Snapshot);
        let transcoder = self.deps.transcoder.clone();
        tokio::spawn(async move {
            let updates = shared.snapshot.subscribe();
            match transcoder.run_once(key, spec).await {
                Ok(_) | Err(StreamError::Busy(_)) => {}
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                    return;
                }
            }
            let result = shared
                .snapshot
                .wait_next(updates, timeout)
                .await
                .ok_or_else(|| CameraError::transport("timed out waiting for snapshot"));
            let _ = reply.send(result);
        });
    }

    async fn update(&mut self, device: Device) -> Flow {
        let reconnect = device.connection_changed(&self.device) || self.state.is_suspended();
        *self.shared.device.write().await = device.clone();
        self.device = device;

        if !reconnect {
            debug!(device_id = %self.device.id, "Device settings updated");
            self.publish_sources().await;
            self.ensure_alarm_probe().await;
            return Flow::Continue;
        }

        info!(device_id = %self.device.id, "Connection settings changed, rebuilding session");
        self.generation += 1;
        self.handshake_in_flight = false;
        self.tracker.close_all();
        self.tracker = Arc::new(RequestTracker::new());
        self.alarms.clear();
        self.attributes.clear();
        self.refresh_cursor = 0;
        self.adapter = create_adapter(&self.device);

        match (self.deps.transport_factory)(&self.device) {
            Ok(transport) => self.transport = transport,
            Err(e) => {
                self.fail(e).await;
                return Flow::Continue;
            }
        }

        self.set_state(ConnectionState::Offline).await;
        self.publish_sources().await;
        self.ensure_alarm_probe().await;
        Flow::Reconnect
    }

    async fn housekeeping(&mut self) {
        let mut ctx = AdapterContext::new(&self.device, &self.tracker).with_callback(self.callback());
        self.adapter.poll_camera(&mut ctx);
        self.adapter.tick(&mut ctx);
        let output = ctx.into_output();
        self.dispatch(output).await;

        let refresh = self.adapter.refresh_requests(&self.device);
        if !refresh.is_empty() {
            if let Some(request) = refresh.get(self.refresh_cursor % refresh.len()).cloned() {
                self.spawn_request(request);
            }
            self.refresh_cursor = self.refresh_cursor.wrapping_add(1);
        }

        let report = self.tracker.sweep(self.deps.engine.max_open_channels);
        if report.reaped > 0 || report.closed > 0 {
            debug!(
                device_id = %self.device.id,
                reaped = report.reaped,
                closed = report.closed,
                "Request tracker swept"
            );
        }

        for key in self.deps.transcoder.check_device_keep_alive(&self.device.id).await {
            debug!(job = %key, "Idle transcode job released");
        }
        self.ensure_alarm_probe().await;
    }

    /// 同步报警探测进程；进程无法启动时设备进入进程错误状态
    async fn ensure_alarm_probe(&mut self) {
        match self.sync_alarm_detection().await {
            Ok(()) => {}
            Err(e) if e.is_start_failure() => {
                error!(device_id = %self.device.id, "Alarm detection failed to start: {}", e);
                self.fail(CameraError::Process(format!(
                    "alarm detection failed to start: {}",
                    mask_password(&e.to_string())
                )))
                .await;
            }
            Err(e) => debug!(device_id = %self.device.id, "Alarm detection not started: {}", e),
        }
    }

    /// 阈值大于 0 且在线时保持报警探测进程运行；阈值变化时重启
    async fn sync_alarm_detection(&mut self) -> std::result::Result<(), StreamError> {
        let key = JobKey::new(&self.device.id, Purpose::AlarmProbe);
        let thresholds = (self.device.motion_threshold, self.device.audio_threshold);

        if thresholds == (0, 0) || !self.state.is_online() {
            if self.probe_thresholds.take().is_some() {
                let _ = self.deps.transcoder.stop(&key).await;
            }
            return Ok(());
        }

        match self.probe_thresholds {
            Some(running) if running == thresholds => {
                if self.deps.transcoder.is_alive(&key).await {
                    return Ok(());
                }
            }
            Some(_) => {
                info!(device_id = %self.device.id, "Alarm thresholds changed, restarting probe");
                let _ = self.deps.transcoder.stop(&key).await;
                self.probe_thresholds = None;
            }
            None => {}
        }

        let Some(input) = self.shared.sources.read().await.alarm_input.clone() else {
            return Ok(());
        };
        let Some(spec) = FfmpegCommand::alarm_probe(
            &self.deps.ffmpeg.path,
            InputSpec::new(input),
            thresholds.0 as u32,
            thresholds.1 as u32,
        ) else {
            return Ok(());
        };

        self.deps.transcoder.ensure(key, spec).await?;
        if self.probe_thresholds.is_none() {
            self.probe = AlarmProbeParser::new();
        }
        self.probe_thresholds = Some(thresholds);
        Ok(())
    }

    async fn on_transcode_event(&mut self, event: TranscodeEvent) {
        match event {
            TranscodeEvent::ProbeLine { key, line } if key.device_id == self.device.id => {
                match self.probe.parse_line(&line) {
                    Some(ProbeSignal::Motion(active)) => self.emit_alarm(AlarmKind::Motion, active),
                    Some(ProbeSignal::Audio(active)) => self.emit_alarm(AlarmKind::Audio, active),
                    None => {}
                }
            }
            TranscodeEvent::OutputReady { key, path } if key.device_id == self.device.id => {
                info!(job = %key, "Transcode output ready");
                self.emit(DeviceEvent::OutputReady {
                    device_id: key.device_id,
                    purpose: key.purpose,
                    path,
                });
            }
            TranscodeEvent::Failed { key, reason } if key.device_id == self.device.id => {
                let reason = mask_password(&reason);
                error!(job = %key, "Transcode process failed: {}", reason);
                self.fail(CameraError::Process(format!("{} transcode failed: {}", key.purpose, reason)))
                    .await;
            }
            TranscodeEvent::Started { key, pid } if key.device_id == self.device.id => {
                debug!(job = %key, pid = ?pid, "Transcode process started");
            }
            TranscodeEvent::Exited { key, code, requested } if key.device_id == self.device.id => {
                debug!(job = %key, code = ?code, requested, "Transcode process exited");
            }
            _ => {}
        }
    }

    async fn publish_sources(&mut self) {
        let sources = MediaSources::resolve(&self.device, self.adapter.as_ref());
        debug!(
            device_id = %self.device.id,
            input = ?sources.ffmpeg_input.as_deref().map(mask_password),
            "Media sources resolved"
        );
        *self.shared.sources.write().await = sources;
    }

    /// 停止会话和全部转码任务，可重复调用
    async fn teardown(&mut self) {
        self.generation += 1;
        self.tracker.close_all();
        if let Err(e) = self.deps.transcoder.stop_device(&self.device.id).await {
            warn!(device_id = %self.device.id, "Failed to stop transcode jobs: {}", e);
        }
        self.probe_thresholds = None;
        self.set_state(ConnectionState::Offline).await;
        info!(device_id = %self.device.id, "Connection supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Brand;

    #[test]
    fn test_sources_prefer_overrides() {
        let mut device = Device::new("front", Brand::Hikvision, "10.0.0.64").with_credentials("admin", "pw");
        let adapter = create_adapter(&device);

        let sources = MediaSources::resolve(&device, adapter.as_ref());
        assert_eq!(
            sources.ffmpeg_input.as_deref(),
            Some("rtsp://admin:pw@10.0.0.64:554/ISAPI/Streaming/channels/101")
        );
        assert_eq!(sources.alarm_input, sources.ffmpeg_input);
        assert_eq!(
            sources.snapshot_url.as_deref(),
            Some("http://10.0.0.64:80/ISAPI/Streaming/channels/101/picture")
        );

        device.ffmpeg_input = Some("rtsp://10.0.0.64/custom".to_string());
        device.snapshot_url = Some("/snap.jpg".to_string());
        let sources = MediaSources::resolve(&device, adapter.as_ref());
        assert_eq!(sources.ffmpeg_input.as_deref(), Some("rtsp://admin:pw@10.0.0.64/custom"));
        assert_eq!(sources.snapshot_url.as_deref(), Some("http://10.0.0.64:80/snap.jpg"));
    }
}
