use super::{AdapterContext, BrandAdapter, DebounceCounters};
use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device, PtzVector};
use crate::transport::{redact_query, VendorReply, VendorRequest};
use crate::xml::{self, Notification};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const DEVICE_NS: &str = "http://www.onvif.org/ver10/device/wsdl";
const MEDIA_NS: &str = "http://www.onvif.org/ver10/media/wsdl";
const PTZ_NS: &str = "http://www.onvif.org/ver20/ptz/wsdl";
const EVENTS_NS: &str = "http://www.onvif.org/ver10/events/wsdl";
const WSN_NS: &str = "http://docs.oasis-open.org/wsn/b-2";
const SCHEMA_NS: &str = "http://www.onvif.org/ver10/schema";

/// 订阅续期间隔，续期时申请 1 分钟
const RENEW_INTERVAL: Duration = Duration::from_secs(40);
/// 超过该时间没有收到 PullMessages 回复则重新拉取
const PULL_STALL: Duration = Duration::from_secs(30);
/// 越线是瞬时事件，按巡检周期衰减
const LINE_DEBOUNCE: u8 = 2;

/// 事件主题（去掉 `tns1:` 前缀）到报警类型
fn topic_alarm(topic: &str) -> Option<AlarmKind> {
    let topic = topic.split_once(':').map_or(topic, |(_, rest)| rest);
    match topic {
        "VideoSource/MotionAlarm" | "RuleEngine/CellMotionDetector/Motion" => Some(AlarmKind::Motion),
        "RuleEngine/FieldDetector/ObjectsInside" => Some(AlarmKind::FieldDetection),
        "RuleEngine/LineDetector/Crossed" => Some(AlarmKind::LineCrossing),
        "AudioAnalytics/Audio/DetectedSound" => Some(AlarmKind::Audio),
        "RuleEngine/TamperDetector/Tamper" => Some(AlarmKind::SceneChange),
        t if t.starts_with("VideoSource/ImageTooDark") => Some(AlarmKind::TooDark),
        t if t.starts_with("VideoSource/ImageTooBlurry") => Some(AlarmKind::TooBlurry),
        _ => None,
    }
}

/// 消息中第一个布尔取值
fn notification_state(message: &Notification) -> Option<bool> {
    message.data.iter().find_map(|(_, value)| match value.as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    })
}

fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CameraError::config(format!(
            "{} {} is outside {}..={}",
            name, value, min, max
        )))
    }
}

/// 校验云台参数，绝对定位的变焦只允许 0..=1
fn check_vector(vector: &PtzVector, absolute: bool) -> Result<()> {
    check_range("pan", vector.pan, -1.0, 1.0)?;
    check_range("tilt", vector.tilt, -1.0, 1.0)?;
    check_range("zoom", vector.zoom, if absolute { 0.0 } else { -1.0 }, 1.0)
}

fn ptz_vector_xml(element: &str, vector: &PtzVector, absolute: bool) -> String {
    let (pan_space, zoom_space) = if absolute {
        (
            r#" space="http://www.onvif.org/ver10/tptz/PanTiltSpaces/PositionGenericSpace""#,
            r#" space="http://www.onvif.org/ver10/tptz/ZoomSpaces/PositionGenericSpace""#,
        )
    } else {
        ("", "")
    };
    format!(
        r#"<{element}><PanTilt xmlns="{ns}" x="{pan}" y="{tilt}"{pan_space}/><Zoom xmlns="{ns}" x="{zoom}"{zoom_space}/></{element}>"#,
        element = element,
        ns = SCHEMA_NS,
        pan = vector.pan,
        tilt = vector.tilt,
        zoom = vector.zoom,
        pan_space = pan_space,
        zoom_space = zoom_space,
    )
}

/// 构建 SOAP 请求
fn soap_envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
  <s:Body>
    {}
  </s:Body>
</s:Envelope>"#,
        body
    )
}

fn service_url(device: &Device, service: &str) -> String {
    format!("http://{}:{}/onvif/{}", device.ip, device.onvif_port, service)
}

/// 通用 ONVIF 设备
#[derive(Debug)]
pub struct OnvifAdapter {
    media_xaddr: Option<String>,
    ptz_xaddr: Option<String>,
    events_xaddr: Option<String>,
    /// PullPoint 订阅地址
    subscription: Option<String>,
    subscribe_sent: Option<Instant>,
    last_renew: Option<Instant>,
    last_pull: Option<Instant>,
    counters: DebounceCounters,
    profile_tokens: Vec<String>,
    preset_tokens: Vec<String>,
    /// 预置位列表到达后执行
    pending_preset: Option<u32>,
    stream_uri: Option<String>,
    snapshot_uri: Option<String>,
}

impl Default for OnvifAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OnvifAdapter {
    pub fn new() -> Self {
        Self {
            media_xaddr: None,
            ptz_xaddr: None,
            events_xaddr: None,
            subscription: None,
            subscribe_sent: None,
            last_renew: None,
            last_pull: None,
            counters: DebounceCounters::new(LINE_DEBOUNCE),
            profile_tokens: Vec::new(),
            preset_tokens: Vec::new(),
            pending_preset: None,
            stream_uri: None,
            snapshot_uri: None,
        }
    }

    fn media_url(&self, device: &Device) -> String {
        self.media_xaddr
            .clone()
            .unwrap_or_else(|| service_url(device, "media_service"))
    }

    fn ptz_url(&self, device: &Device) -> String {
        self.ptz_xaddr
            .clone()
            .unwrap_or_else(|| service_url(device, "ptz_service"))
    }

    fn profile_token(&self) -> Result<&str> {
        self.profile_tokens
            .first()
            .map(String::as_str)
            .ok_or_else(|| CameraError::protocol("no media profile discovered"))
    }

    fn request_profiles(&self, ctx: &mut AdapterContext<'_>) {
        ctx.send(VendorRequest::post_soap(
            self.media_url(ctx.device),
            soap_envelope(&format!(r#"<GetProfiles xmlns="{}"/>"#, MEDIA_NS)),
        ));
    }

    fn request_uris(&self, token: &str, ctx: &mut AdapterContext<'_>) {
        let media = self.media_url(ctx.device);
        ctx.send(VendorRequest::post_soap(
            media.clone(),
            soap_envelope(&format!(
                r#"<GetStreamUri xmlns="{}"><StreamSetup><Stream xmlns="http://www.onvif.org/ver10/schema">RTP-Unicast</Stream><Transport xmlns="http://www.onvif.org/ver10/schema"><Protocol>RTSP</Protocol></Transport></StreamSetup><ProfileToken>{}</ProfileToken></GetStreamUri>"#,
                MEDIA_NS, token
            )),
        ));
        ctx.send(VendorRequest::post_soap(
            media,
            soap_envelope(&format!(
                r#"<GetSnapshotUri xmlns="{}"><ProfileToken>{}</ProfileToken></GetSnapshotUri>"#,
                MEDIA_NS, token
            )),
        ));
    }

    fn goto_preset(&self, index: u32, ctx: &mut AdapterContext<'_>) -> Result<()> {
        let preset = self
            .preset_tokens
            .get(index as usize - 1)
            .ok_or_else(|| CameraError::config(format!("preset {} does not exist", index)))?;
        ctx.send(VendorRequest::post_soap(
            self.ptz_url(ctx.device),
            soap_envelope(&format!(
                r#"<GotoPreset xmlns="{}"><ProfileToken>{}</ProfileToken><PresetToken>{}</PresetToken></GotoPreset>"#,
                PTZ_NS,
                self.profile_token()?,
                preset
            )),
        ));
        Ok(())
    }

    fn move_ptz(&self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        let token = self.profile_token()?;
        let body = match command {
            CameraCommand::ContinuousMove(velocity) => {
                check_vector(velocity, false)?;
                format!(
                    r#"<ContinuousMove xmlns="{}"><ProfileToken>{}</ProfileToken>{}</ContinuousMove>"#,
                    PTZ_NS,
                    token,
                    ptz_vector_xml("Velocity", velocity, false)
                )
            }
            CameraCommand::RelativeMove(translation) => {
                check_vector(translation, false)?;
                format!(
                    r#"<RelativeMove xmlns="{}"><ProfileToken>{}</ProfileToken>{}</RelativeMove>"#,
                    PTZ_NS,
                    token,
                    ptz_vector_xml("Translation", translation, false)
                )
            }
            CameraCommand::AbsoluteMove(position) => {
                check_vector(position, true)?;
                format!(
                    r#"<AbsoluteMove xmlns="{}"><ProfileToken>{}</ProfileToken>{}</AbsoluteMove>"#,
                    PTZ_NS,
                    token,
                    ptz_vector_xml("Position", position, true)
                )
            }
            _ => format!(
                r#"<Stop xmlns="{}"><ProfileToken>{}</ProfileToken><PanTilt>true</PanTilt><Zoom>true</Zoom></Stop>"#,
                PTZ_NS, token
            ),
        };
        ctx.send(VendorRequest::post_soap(self.ptz_url(ctx.device), soap_envelope(&body)));
        Ok(())
    }

    fn create_subscription(&mut self, events: &str, ctx: &mut AdapterContext<'_>) {
        self.subscribe_sent = Some(Instant::now());
        ctx.send(VendorRequest::post_soap(
            events,
            soap_envelope(&format!(
                r#"<CreatePullPointSubscription xmlns="{}"><InitialTerminationTime>PT600S</InitialTerminationTime></CreatePullPointSubscription>"#,
                EVENTS_NS
            )),
        ));
    }

    fn pull_messages(&mut self, address: &str, ctx: &mut AdapterContext<'_>) {
        self.last_pull = Some(Instant::now());
        ctx.send(VendorRequest::post_soap(
            address,
            soap_envelope(&format!(
                r#"<PullMessages xmlns="{}"><Timeout>PT5S</Timeout><MessageLimit>10</MessageLimit></PullMessages>"#,
                EVENTS_NS
            )),
        ));
    }

    fn renew(&mut self, address: &str, ctx: &mut AdapterContext<'_>) {
        self.last_renew = Some(Instant::now());
        ctx.send(VendorRequest::post_soap(
            address,
            soap_envelope(&format!(
                r#"<Renew xmlns="{}"><TerminationTime>PT1M</TerminationTime></Renew>"#,
                WSN_NS
            )),
        ));
    }

    fn handle_notifications(&mut self, body: &str, ctx: &mut AdapterContext<'_>) {
        for message in xml::notifications(body) {
            let Some(kind) = topic_alarm(&message.topic) else {
                debug!(target: "onvif_client", device_id = %ctx.device.id, "Ignoring event {}", message.topic);
                continue;
            };
            if kind == AlarmKind::LineCrossing && message.value("ObjectId").is_some() {
                ctx.alarm(kind, true);
                self.counters.pulse(kind);
            } else if let Some(active) = notification_state(&message) {
                ctx.alarm(kind, active);
            }
        }
    }

    fn is_event_target(&self, target: &str) -> bool {
        self.subscription.as_deref() == Some(target) || self.events_xaddr.as_deref() == Some(target)
    }

    fn fault_reason(body: &str) -> String {
        xml::element_text(body, "Text")
            .or_else(|| xml::element_text(body, "Value"))
            .unwrap_or_else(|| "SOAP fault".to_string())
    }
}

impl BrandAdapter for OnvifAdapter {
    fn brand(&self) -> Brand {
        Brand::Onvif
    }

    fn handshake(&self, device: &Device) -> Option<VendorRequest> {
        Some(VendorRequest::post_soap(
            service_url(device, "device_service"),
            soap_envelope(&format!(r#"<GetDeviceInformation xmlns="{}"/>"#, DEVICE_NS)),
        ))
    }

    fn verify_handshake(&mut self, reply: &VendorReply, ctx: &mut AdapterContext<'_>) -> Result<()> {
        if xml::body_element(&reply.body).as_deref() == Some("Fault") {
            let reason = Self::fault_reason(&reply.body);
            return if reply.body.contains("NotAuthorized") || reason.contains("ender not authorized") {
                Err(CameraError::auth(reason))
            } else {
                Err(CameraError::protocol(reason))
            };
        }
        if !reply.is_success() {
            return Err(CameraError::protocol(format!(
                "GetDeviceInformation returned status {}",
                reply.status
            )));
        }
        for (element, name) in [
            ("Manufacturer", "manufacturer"),
            ("Model", "model"),
            ("FirmwareVersion", "firmware"),
            ("SerialNumber", "serial_number"),
            ("HardwareId", "hardware_id"),
        ] {
            if let Some(value) = xml::element_text(&reply.body, element) {
                ctx.attribute(name, value);
            }
        }
        Ok(())
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        self.subscription = None;
        self.subscribe_sent = None;
        self.last_pull = None;
        ctx.send(VendorRequest::post_soap(
            service_url(ctx.device, "device_service"),
            soap_envelope(&format!(
                r#"<GetCapabilities xmlns="{}"><Category>All</Category></GetCapabilities>"#,
                DEVICE_NS
            )),
        ));
    }

    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        let Some(events) = self.events_xaddr.clone() else {
            return;
        };
        if let Some(address) = self.subscription.clone() {
            // 每个 PullMessages 回复都会立即发出下一次拉取
            if self.last_pull.map_or(false, |at| at.elapsed() < PULL_STALL) {
                if self.last_renew.map_or(true, |at| at.elapsed() >= RENEW_INTERVAL) {
                    self.renew(&address, ctx);
                }
                return;
            }
            debug!(target: "onvif_client", device_id = %ctx.device.id, "Event pull stalled, subscribing again");
            self.subscription = None;
            self.subscribe_sent = None;
        }
        if self.subscribe_sent.map_or(true, |at| at.elapsed() >= PULL_STALL) {
            self.create_subscription(&events, ctx);
        }
    }

    fn tick(&mut self, ctx: &mut AdapterContext<'_>) {
        for kind in self.counters.count_down() {
            ctx.alarm(kind, false);
        }
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        let Some(element) = xml::body_element(body) else {
            if !body.trim().is_empty() {
                debug!(target: "onvif_client", device_id = %ctx.device.id, "Non-SOAP reply from {}", redact_query(target));
                ctx.malformed("non-SOAP reply");
            }
            return;
        };
        debug!(target: "onvif_client", device_id = %ctx.device.id, "Received {}", element);

        match element.as_str() {
            "GetCapabilitiesResponse" => {
                self.media_xaddr = xml::nested_text(body, "Media", "XAddr");
                self.ptz_xaddr = xml::nested_text(body, "PTZ", "XAddr");
                self.events_xaddr = xml::nested_text(body, "Events", "XAddr");
                ctx.attribute("ptz", self.ptz_xaddr.is_some());
                self.request_profiles(ctx);
                if let Some(events) = self.events_xaddr.clone() {
                    self.create_subscription(&events, ctx);
                }
            }
            "CreatePullPointSubscriptionResponse" => {
                match xml::nested_text(body, "SubscriptionReference", "Address") {
                    Some(address) => {
                        debug!(target: "onvif_client", device_id = %ctx.device.id, "Subscribed to events at {}", address);
                        self.last_renew = Some(Instant::now());
                        self.subscription = Some(address.clone());
                        self.pull_messages(&address, ctx);
                    }
                    None => warn!(device_id = %ctx.device.id, "Event subscription reply has no address"),
                }
            }
            "PullMessagesResponse" => {
                self.handle_notifications(body, ctx);
                if let Some(address) = self.subscription.clone() {
                    self.pull_messages(&address, ctx);
                }
            }
            "RenewResponse" => {
                debug!(target: "onvif_client", device_id = %ctx.device.id, "Event subscription renewed");
            }
            "GetProfilesResponse" => {
                self.profile_tokens = xml::attribute_values(body, "Profiles", "token");
                match self.profile_tokens.first().cloned() {
                    Some(token) => self.request_uris(&token, ctx),
                    None => warn!(device_id = %ctx.device.id, "Camera reported no media profiles"),
                }
            }
            "GetStreamUriResponse" => {
                if let Some(uri) = xml::element_text(body, "Uri") {
                    debug!(target: "onvif_client", device_id = %ctx.device.id, "Stream uri {}", uri);
                    ctx.attribute("stream_uri", uri.clone());
                    self.stream_uri = Some(uri);
                }
            }
            "GetSnapshotUriResponse" => {
                if let Some(uri) = xml::element_text(body, "Uri") {
                    ctx.attribute("snapshot_uri", uri.clone());
                    self.snapshot_uri = Some(uri);
                }
            }
            "GetPresetsResponse" => {
                self.preset_tokens = xml::attribute_values(body, "Preset", "token");
                ctx.attribute("preset_count", self.preset_tokens.len());
                if let Some(index) = self.pending_preset.take() {
                    if let Err(e) = self.goto_preset(index, ctx) {
                        ctx.reject(e.to_string());
                    }
                }
            }
            "Fault" if self.is_event_target(target) => {
                // 订阅过期或被设备回收，下次巡检重新订阅
                debug!(target: "onvif_client", device_id = %ctx.device.id, "Event subscription fault: {}", Self::fault_reason(body));
                self.subscription = None;
                self.subscribe_sent = None;
                self.last_pull = None;
            }
            "Fault" => {
                let reason = Self::fault_reason(body);
                // 老设备不支持 GetCapabilities 时按默认地址继续
                if self.profile_tokens.is_empty() && self.media_xaddr.is_none() && target.ends_with("device_service") {
                    debug!(target: "onvif_client", device_id = %ctx.device.id, "GetCapabilities failed: {}", reason);
                    self.request_profiles(ctx);
                } else {
                    ctx.reject(reason);
                }
            }
            _ => {}
        }
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        match command {
            // 0 号保留给 HOME
            CameraCommand::GotoPreset(0) => Err(CameraError::config("preset index starts at 1")),
            CameraCommand::GotoPreset(index) => {
                let token = self.profile_token()?.to_string();
                if self.preset_tokens.is_empty() {
                    self.pending_preset = Some(*index);
                    ctx.send(VendorRequest::post_soap(
                        self.ptz_url(ctx.device),
                        soap_envelope(&format!(
                            r#"<GetPresets xmlns="{}"><ProfileToken>{}</ProfileToken></GetPresets>"#,
                            PTZ_NS, token
                        )),
                    ));
                    Ok(())
                } else {
                    self.goto_preset(*index, ctx)
                }
            }
            CameraCommand::ContinuousMove(_)
            | CameraCommand::RelativeMove(_)
            | CameraCommand::AbsoluteMove(_)
            | CameraCommand::StopPtz => self.move_ptz(command, ctx),
            other => Err(CameraError::Unsupported(other.name().to_string())),
        }
    }

    fn snapshot_url(&self, _device: &Device) -> Option<String> {
        self.snapshot_uri.clone()
    }

    fn ffmpeg_input(&self, _device: &Device) -> Option<String> {
        self.stream_uri.clone()
    }
}
