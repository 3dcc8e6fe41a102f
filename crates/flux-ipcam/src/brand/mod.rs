//! 厂商协议适配
//!
//! 每个厂商一个实现，按 `Brand` 分发。适配器只在所属设备的 actor 中被调用，
//! 因此缓存状态和防抖计数器不需要额外加锁。

mod amcrest;
mod dahua;
mod doorbird;
mod foscam;
mod generic;
mod hikvision;
mod instar;
mod onvif;
mod reolink;

pub use amcrest::AmcrestAdapter;
pub use dahua::DahuaAdapter;
pub use doorbird::DoorbirdAdapter;
pub use foscam::FoscamAdapter;
pub use generic::GenericAdapter;
pub use hikvision::HikvisionAdapter;
pub use instar::InstarAdapter;
pub use onvif::OnvifAdapter;
pub use reolink::ReolinkAdapter;

use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::tracker::RequestTracker;
use crate::transport::{VendorReply, VendorRequest};
use std::collections::HashMap;
use url::form_urlencoded;

/// 适配器一次调用产生的输出，由监督者统一执行
pub struct AdapterContext<'a> {
    pub device: &'a Device,
    pub tracker: &'a RequestTracker,
    /// 摄像头主动推送报警的回调地址（本机地址, 媒体服务端口）
    pub callback: Option<(String, u16)>,
    requests: Vec<VendorRequest>,
    streams: Vec<VendorRequest>,
    alarms: Vec<(AlarmKind, bool)>,
    attributes: Vec<(String, serde_json::Value)>,
    rejection: Option<String>,
    malformed: Option<String>,
}

/// 上下文排空后的结果
#[derive(Debug, Default)]
pub struct AdapterOutput {
    pub requests: Vec<VendorRequest>,
    pub streams: Vec<VendorRequest>,
    pub alarms: Vec<(AlarmKind, bool)>,
    pub attributes: Vec<(String, serde_json::Value)>,
    pub rejection: Option<String>,
    /// 回复无法识别（非空但格式不对）
    pub malformed: Option<String>,
}

impl<'a> AdapterContext<'a> {
    pub fn new(device: &'a Device, tracker: &'a RequestTracker) -> Self {
        Self {
            device,
            tracker,
            callback: None,
            requests: Vec::new(),
            streams: Vec::new(),
            alarms: Vec::new(),
            attributes: Vec::new(),
            rejection: None,
            malformed: None,
        }
    }

    pub fn with_callback(mut self, callback: Option<(String, u16)>) -> Self {
        self.callback = callback;
        self
    }

    pub fn send(&mut self, request: VendorRequest) {
        self.requests.push(request);
    }

    pub fn get(&mut self, target: impl Into<String>) {
        self.send(VendorRequest::get(target));
    }

    /// 打开（或重新打开）长连接
    pub fn open_stream(&mut self, request: VendorRequest) {
        self.streams.push(request);
    }

    pub fn alarm(&mut self, kind: AlarmKind, active: bool) {
        self.alarms.push((kind, active));
    }

    pub fn attribute(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.attributes.push((name.to_string(), value.into()));
    }

    /// 厂商拒绝了命令
    pub fn reject(&mut self, detail: impl Into<String>) {
        self.rejection = Some(detail.into());
    }

    /// 回复无法解析；监督者累计连续次数，超过上限后降级设备
    pub fn malformed(&mut self, detail: impl Into<String>) {
        self.malformed = Some(detail.into());
    }

    pub fn channel(&self) -> u32 {
        self.device.nvr_channel
    }

    pub fn into_output(self) -> AdapterOutput {
        AdapterOutput {
            requests: self.requests,
            streams: self.streams,
            alarms: self.alarms,
            attributes: self.attributes,
            rejection: self.rejection,
            malformed: self.malformed,
        }
    }
}

/// 厂商协议能力接口
pub trait BrandAdapter: Send {
    fn brand(&self) -> Brand;

    /// 握手请求，成功回复后设备进入在线状态；`None` 表示无需握手
    fn handshake(&self, device: &Device) -> Option<VendorRequest>;

    /// 校验握手回复
    fn verify_handshake(&mut self, reply: &VendorReply, _ctx: &mut AdapterContext<'_>) -> Result<()> {
        if reply.is_success() {
            Ok(())
        } else {
            Err(CameraError::protocol(format!(
                "handshake returned status {}",
                reply.status
            )))
        }
    }

    /// 进入在线状态后读取当前配置
    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>);

    /// 维护周期内的保活：重开断开的报警长连接，或主动轮询报警状态
    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>);

    /// 解析普通回复，无法识别的内容记录后丢弃
    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>);

    /// 解析长连接推送的片段
    fn ingest_stream(&mut self, target: &str, chunk: &str, ctx: &mut AdapterContext<'_>) {
        self.ingest(target, chunk, ctx);
    }

    /// 把命令转换成厂商请求
    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()>;

    /// 低优先级的状态刷新请求，监督者每个周期轮流发送一个
    fn refresh_requests(&self, _device: &Device) -> Vec<VendorRequest> {
        Vec::new()
    }

    /// 每个维护周期调用一次，用于防抖计数衰减和会话续期
    fn tick(&mut self, _ctx: &mut AdapterContext<'_>) {}

    /// 摄像头主动推送的报警（媒体服务器收到的回调）
    fn alarm_pushed(&mut self, _query: &str, _ctx: &mut AdapterContext<'_>) {}

    fn snapshot_url(&self, _device: &Device) -> Option<String> {
        None
    }

    fn mjpeg_url(&self, _device: &Device) -> Option<String> {
        None
    }

    fn ffmpeg_input(&self, _device: &Device) -> Option<String> {
        None
    }
}

/// 按厂商创建适配器
pub fn create_adapter(device: &Device) -> Box<dyn BrandAdapter> {
    match device.brand {
        Brand::Onvif => Box::new(OnvifAdapter::new()),
        Brand::Hikvision => Box::new(HikvisionAdapter::new()),
        Brand::Dahua => Box::new(DahuaAdapter::new()),
        Brand::Amcrest => Box::new(AmcrestAdapter::new()),
        Brand::Foscam => Box::new(FoscamAdapter::new()),
        Brand::Instar => Box::new(InstarAdapter::new()),
        Brand::Reolink => Box::new(ReolinkAdapter::new()),
        Brand::Doorbird => Box::new(DoorbirdAdapter::new()),
        Brand::Generic => Box::new(GenericAdapter::new()),
    }
}

/// 默认 RTSP 地址
pub(crate) fn rtsp_url(device: &Device, path: &str) -> String {
    format!("rtsp://{}:554{}", device.ip, path)
}

/// 脉冲型报警的防抖计数器
///
/// 活动时计数器置为上限，每次衰减减一，从 1 变为 0 时报告该类型结束。
#[derive(Debug, Default)]
pub struct DebounceCounters {
    reset_to: u8,
    counters: HashMap<AlarmKind, u8>,
}

impl DebounceCounters {
    pub fn new(reset_to: u8) -> Self {
        Self {
            reset_to,
            counters: HashMap::new(),
        }
    }

    pub fn pulse(&mut self, kind: AlarmKind) {
        self.counters.insert(kind, self.reset_to);
    }

    /// 将计数器限制在 `max` 以内
    pub fn clamp(&mut self, kind: AlarmKind, max: u8) {
        if let Some(count) = self.counters.get_mut(&kind) {
            if *count > max {
                *count = max;
            }
        }
    }

    /// 衰减一次，返回刚刚归零的类型
    pub fn count_down(&mut self) -> Vec<AlarmKind> {
        let mut expired = Vec::new();
        for (kind, count) in self.counters.iter_mut() {
            if *count == 1 {
                expired.push(*kind);
            }
            *count = count.saturating_sub(1);
        }
        expired
    }

    pub fn get(&self, kind: AlarmKind) -> u8 {
        self.counters.get(&kind).copied().unwrap_or(0)
    }

    /// 所有计数器都已归零
    pub fn all_clear(&self) -> bool {
        self.counters.values().all(|count| *count == 0)
    }
}

/// 按 application/x-www-form-urlencoded 规则编码查询参数
pub(crate) fn encode_query_value(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// 在 `key` 之后截取值，直到下一个 `terminator`（缺省为行尾）
pub(crate) fn value_after<'a>(content: &'a str, key: &str, terminator: &str) -> Option<&'a str> {
    let start = content.find(key)? + key.len();
    let rest = &content[start..];
    let end = rest
        .find(terminator)
        .or_else(|| rest.find(['\r', '\n']))
        .unwrap_or(rest.len());
    Some(rest[..end].trim())
}
