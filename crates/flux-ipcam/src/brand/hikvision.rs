use super::{rtsp_url, AdapterContext, BrandAdapter, DebounceCounters};
use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::transport::VendorRequest;
use crate::xml;
use std::collections::HashMap;
use tracing::{debug, info};

const ALERT_STREAM: &str = "/ISAPI/Event/notification/alertStream";
const ALERT_END: &str = "</EventNotificationAlert>";
const VIDEOLOSS_INACTIVE: &str = "<eventType>videoloss</eventType>\r\n<eventState>inactive</eventState>";
const DEBOUNCE: u8 = 3;

/// 脉冲事件类型，及是否同时触发运动报警
const PULSE_EVENTS: [(&str, AlarmKind, bool); 7] = [
    ("linedetection", AlarmKind::LineCrossing, true),
    ("fielddetection", AlarmKind::FieldDetection, true),
    ("VMD", AlarmKind::Motion, false),
    ("facedetection", AlarmKind::FaceDetected, false),
    ("unattendedBaggage", AlarmKind::ItemLeft, false),
    ("attendedBaggage", AlarmKind::ItemTaken, false),
    ("PIR", AlarmKind::Pir, true),
];

/// Hikvision ISAPI
pub struct HikvisionAdapter {
    counters: DebounceCounters,
    check_alarm_input: bool,
    /// 等待 GET 回复后再写回的修改：URL -> [(元素, 新值)]
    pending_changes: HashMap<String, Vec<(String, String)>>,
    stream_buffer: String,
}

impl HikvisionAdapter {
    pub fn new() -> Self {
        Self {
            counters: DebounceCounters::new(DEBOUNCE),
            check_alarm_input: true,
            pending_changes: HashMap::new(),
            stream_buffer: String::new(),
        }
    }

    fn motion_url(ch: u32) -> String {
        format!("/ISAPI/System/Video/inputs/channels/{}01/motionDetection", ch)
    }

    fn line_url(ch: u32) -> String {
        format!("/ISAPI/Smart/LineDetection/{}01", ch)
    }

    fn field_url(ch: u32) -> String {
        format!("/ISAPI/Smart/FieldDetection/{}01", ch)
    }

    fn audio_url(ch: u32) -> String {
        format!("/ISAPI/Smart/AudioDetection/channels/{}01", ch)
    }

    fn overlay_url(ch: u32) -> String {
        format!("/ISAPI/System/Video/inputs/channels/{}/overlays/text/1", ch)
    }

    fn input_url(ch: u32) -> String {
        format!("/ISAPI/System/IO/inputs/{}", ch)
    }

    fn input_status_url(ch: u32) -> String {
        format!("/ISAPI/System/IO/inputs/{}/status", ch)
    }

    /// 读改写：有缓存的配置时直接修改后 PUT，否则先 GET
    fn change_setting(&mut self, url: String, element: &str, value: String, ctx: &mut AdapterContext<'_>) {
        match ctx.tracker.reply(&url) {
            Some(body) if !body.is_empty() => {
                if let Some(patched) = Self::patch(&body, element, &value) {
                    ctx.tracker.store_reply(&url, patched.clone());
                    ctx.send(VendorRequest::put_xml(url, patched));
                } else {
                    debug!(device_id = %ctx.device.id, element = element, "Element missing from cached {}", url);
                }
            }
            _ => {
                debug!(device_id = %ctx.device.id, "No cached reply for {}, requesting it first", url);
                let first = !self.pending_changes.contains_key(&url);
                self.pending_changes
                    .entry(url.clone())
                    .or_default()
                    .push((element.to_string(), value));
                if first {
                    ctx.get(url);
                }
            }
        }
    }

    fn patch(body: &str, element: &str, value: &str) -> Option<String> {
        let body = body
            .strip_prefix("<?xml version=\"1.0\" encoding=\"UTF-8\"?>")
            .unwrap_or(body);
        xml::replace_element_text(body, element, value)
    }

    fn apply_pending(&mut self, url: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        let Some(changes) = self.pending_changes.remove(url) else {
            return;
        };
        let mut patched = body.to_string();
        for (element, value) in changes {
            match Self::patch(&patched, &element, &value) {
                Some(next) => patched = next,
                None => debug!(device_id = %ctx.device.id, element = %element, "Element missing from {}", url),
            }
        }
        ctx.tracker.store_reply(url, patched.clone());
        ctx.send(VendorRequest::put_xml(url, patched));
    }

    fn count_down(&mut self, ctx: &mut AdapterContext<'_>) {
        for kind in self.counters.count_down() {
            if kind != AlarmKind::Motion {
                ctx.alarm(kind, false);
            }
        }
        if self.counters.all_clear() {
            ctx.alarm(AlarmKind::Motion, false);
        }
    }

    fn video_loss_recovered(&mut self, ctx: &mut AdapterContext<'_>) {
        self.counters.clamp(AlarmKind::Motion, 1);
        self.count_down(ctx);
        self.count_down(ctx);
    }

    fn process_alert(&mut self, alert: &str, ctx: &mut AdapterContext<'_>) {
        let channel_tag = format!("hannelID>{}</", ctx.channel());
        if alert.contains(&channel_tag) {
            for (event, kind, with_motion) in PULSE_EVENTS {
                if alert.contains(&format!("<eventType>{}</eventType>", event)) {
                    ctx.alarm(kind, true);
                    if with_motion {
                        ctx.alarm(AlarmKind::Motion, true);
                    }
                    self.counters.pulse(kind);
                }
            }
            if alert.contains(VIDEOLOSS_INACTIVE) {
                self.video_loss_recovered(ctx);
            }
        } else if alert.contains("<channelID>0</channelID>") && alert.contains(VIDEOLOSS_INACTIVE) {
            // NVR 用通道 0 表示全部通道
            self.video_loss_recovered(ctx);
        }
        self.count_down(ctx);
    }

    fn enabled(body: &str) -> Option<bool> {
        if body.contains("<enabled>true</enabled>") {
            Some(true)
        } else if body.contains("<enabled>false</enabled>") {
            Some(false)
        } else {
            None
        }
    }

    fn store_enabled(&mut self, url: String, attribute: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        ctx.tracker.store_reply(&url, body);
        if let Some(on) = Self::enabled(body) {
            ctx.attribute(attribute, on);
        }
        self.apply_pending(&url, body, ctx);
    }
}

impl Default for HikvisionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BrandAdapter for HikvisionAdapter {
    fn brand(&self) -> Brand {
        Brand::Hikvision
    }

    fn handshake(&self, _device: &Device) -> Option<VendorRequest> {
        Some(VendorRequest::get("/ISAPI/System/deviceInfo"))
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        let ch = ctx.channel();
        ctx.get(Self::motion_url(ch));
        ctx.get(Self::line_url(ch));
        ctx.get(Self::audio_url(ch));
        ctx.get(Self::overlay_url(ch));
        ctx.get(Self::input_url(ch));
        ctx.open_stream(VendorRequest::get(ALERT_STREAM));
    }

    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        if ctx.tracker.is_stopped(ALERT_STREAM) {
            info!(device_id = %ctx.device.id, "Alarm stream was not running, re-starting it");
            ctx.open_stream(VendorRequest::get(ALERT_STREAM));
        }
    }

    fn tick(&mut self, ctx: &mut AdapterContext<'_>) {
        self.count_down(ctx);
    }

    fn ingest_stream(&mut self, _target: &str, chunk: &str, ctx: &mut AdapterContext<'_>) {
        self.stream_buffer.push_str(chunk);
        while let Some(end) = self.stream_buffer.find(ALERT_END) {
            let alert: String = self.stream_buffer.drain(..end + ALERT_END.len()).collect();
            if alert.contains("<EventNotificationAlert") {
                self.process_alert(&alert, ctx);
            }
        }
        // 没有结束标记的超长内容视为垃圾
        if self.stream_buffer.len() > 64 * 1024 {
            debug!(device_id = %ctx.device.id, "Dropping oversized alert stream buffer");
            self.stream_buffer.clear();
        }
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        let ch = ctx.channel();
        let root = xml::root_element(body).unwrap_or_default();
        match root.as_str() {
            "MotionDetection" => self.store_enabled(Self::motion_url(ch), "enable_motion_alarm", body, ctx),
            "LineDetection" => self.store_enabled(Self::line_url(ch), "enable_line_crossing_alarm", body, ctx),
            "FieldDetection" => {
                self.store_enabled(Self::field_url(ch), "enable_field_detection_alarm", body, ctx)
            }
            "AudioDetection" => self.store_enabled(Self::audio_url(ch), "enable_audio_alarm", body, ctx),
            "PIRAlarm" => self.store_enabled("/ISAPI/WLAlarm/PIR".to_string(), "enable_pir_alarm", body, ctx),
            "IOInputPort" => {
                let url = Self::input_url(ch);
                ctx.tracker.store_reply(&url, body);
                if let Some(on) = Self::enabled(body) {
                    ctx.attribute("enable_external_alarm_input", on);
                }
                if body.contains("<triggering>low</triggering>") {
                    ctx.attribute("trigger_external_alarm_input", false);
                } else if body.contains("<triggering>high</triggering>") {
                    ctx.attribute("trigger_external_alarm_input", true);
                }
                self.apply_pending(&url, body, ctx);
            }
            "TextOverlay" => {
                let url = Self::overlay_url(ch);
                ctx.tracker.store_reply(&url, body);
                let text = match Self::enabled(body) {
                    Some(true) => xml::element_text(body, "displayText").unwrap_or_default(),
                    _ => String::new(),
                };
                ctx.attribute("text_overlay", text);
                self.apply_pending(&url, body, ctx);
            }
            "IOPortStatus" => {
                if body.contains("<ioState>active</ioState>") {
                    ctx.alarm(AlarmKind::ExternalInput, true);
                } else if body.contains("<ioState>inactive</ioState>") {
                    ctx.alarm(AlarmKind::ExternalInput, false);
                }
            }
            "ResponseStatus" => {
                let status_url = format!("<requestURL>{}</requestURL>", Self::input_status_url(ch));
                if body.contains(&status_url)
                    && body.contains("<statusString>Invalid Operation</statusString>")
                {
                    self.check_alarm_input = false;
                    debug!(device_id = %ctx.device.id, "Stopping alarm input checks, camera lacks the feature");
                }
            }
            "EventNotificationAlert" => self.process_alert(body, ctx),
            "" if !body.trim().is_empty() => {
                debug!(device_id = %ctx.device.id, "Non-XML reply for {}", target);
                ctx.malformed("non-XML reply");
            }
            _ => debug!(device_id = %ctx.device.id, "Unhandled reply for {}", target),
        }
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        let ch = ctx.channel();
        match command {
            CameraCommand::EnableMotionAlarm(on) => {
                self.change_setting(Self::motion_url(ch), "enabled", on.to_string(), ctx)
            }
            CameraCommand::EnableLineCrossing(on) => {
                self.change_setting(Self::line_url(ch), "enabled", on.to_string(), ctx)
            }
            CameraCommand::EnableFieldDetection(on) => {
                self.change_setting(Self::field_url(ch), "enabled", on.to_string(), ctx)
            }
            CameraCommand::EnableAudioAlarm(on) => {
                self.change_setting(Self::audio_url(ch), "enabled", on.to_string(), ctx)
            }
            CameraCommand::EnablePirAlarm(on) => {
                self.change_setting("/ISAPI/WLAlarm/PIR".to_string(), "enabled", on.to_string(), ctx)
            }
            CameraCommand::SetMotionThreshold(threshold) => self.change_setting(
                "/ISAPI/WLAlarm/PIR".to_string(),
                "enabled",
                (*threshold > 0).to_string(),
                ctx,
            ),
            CameraCommand::EnableExternalAlarmInput(on) => {
                self.change_setting(Self::input_url(ch), "enabled", on.to_string(), ctx)
            }
            CameraCommand::TriggerExternalAlarmInput(on) => {
                let level = if *on { "high" } else { "low" };
                self.change_setting(Self::input_url(ch), "triggering", level.to_string(), ctx)
            }
            CameraCommand::TextOverlay(text) => {
                let url = Self::overlay_url(ch);
                if text.is_empty() {
                    self.change_setting(url, "enabled", "false".to_string(), ctx);
                } else {
                    self.change_setting(url.clone(), "displayText", text.clone(), ctx);
                    self.change_setting(url, "enabled", "true".to_string(), ctx);
                }
            }
            CameraCommand::ActivateAlarmOutput(on) => {
                let body = format!(
                    "<IOPortData version=\"1.0\" xmlns=\"http://www.hikvision.com/ver10/XMLSchema\">\r\n    <outputState>{}</outputState>\r\n</IOPortData>\r\n",
                    if *on { "high" } else { "low" }
                );
                ctx.send(VendorRequest::put_xml(
                    format!("/ISAPI/System/IO/outputs/{}/trigger", ch),
                    body,
                ));
            }
            other => return Err(CameraError::Unsupported(other.name().to_string())),
        }
        Ok(())
    }

    fn refresh_requests(&self, device: &Device) -> Vec<VendorRequest> {
        let ch = device.nvr_channel;
        let mut requests = Vec::new();
        if self.check_alarm_input {
            requests.push(VendorRequest::get(Self::input_status_url(ch)));
        }
        requests.push(VendorRequest::get(Self::motion_url(ch)));
        requests.push(VendorRequest::get(Self::line_url(ch)));
        requests.push(VendorRequest::get(Self::audio_url(ch)));
        requests.push(VendorRequest::get(Self::overlay_url(ch)));
        requests.push(VendorRequest::get(Self::input_url(ch)));
        requests
    }

    fn snapshot_url(&self, device: &Device) -> Option<String> {
        Some(format!("/ISAPI/Streaming/channels/{}01/picture", device.nvr_channel))
    }

    fn mjpeg_url(&self, device: &Device) -> Option<String> {
        Some(format!("/ISAPI/Streaming/channels/{}02/httppreview", device.nvr_channel))
    }

    fn ffmpeg_input(&self, device: &Device) -> Option<String> {
        Some(rtsp_url(
            device,
            &format!("/ISAPI/Streaming/channels/{}01", device.nvr_channel),
        ))
    }
}
