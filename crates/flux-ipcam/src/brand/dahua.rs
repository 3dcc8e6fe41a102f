use super::{encode_query_value, rtsp_url, value_after, AdapterContext, BrandAdapter};
use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::transport::VendorRequest;
use tracing::{debug, info};

pub(super) const CONFIG_MANAGER: &str = "/cgi-bin/configManager.cgi?action=";
const EVENT_STREAM: &str = "/cgi-bin/eventManager.cgi?action=attach&codes=[All]";

/// 与报警无关的事件码
const IGNORED_CODES: [&str; 9] = [
    "TimeChange",
    "NTPAdjustTime",
    "StorageChange",
    "Reboot",
    "NewFile",
    "VideoMotionInfo",
    "RtspSessionDisconnect",
    "LeFunctionStatusSync",
    "RecordDelete",
];

fn set_config(query: &str) -> VendorRequest {
    VendorRequest::get(format!("{}setConfig&{}", CONFIG_MANAGER, query))
}

/// configManager 命令（Dahua 与 Amcrest 共用）
pub(super) fn config_command(
    command: &CameraCommand,
    ctx: &mut AdapterContext<'_>,
) -> Result<()> {
    let request = match command {
        CameraCommand::EnableMotionAlarm(true) => {
            set_config("MotionDetect[0].Enable=true&MotionDetect[0].EventHandler.Dejitter=1")
        }
        CameraCommand::EnableMotionAlarm(false) => set_config("MotionDetect[0].Enable=false"),
        CameraCommand::EnableAudioAlarm(true) | CameraCommand::SetMotionThreshold(1..=u8::MAX) => {
            set_config("AudioDetect[0].MutationDetect=true&AudioDetect[0].EventHandler.Dejitter=1")
        }
        CameraCommand::EnableAudioAlarm(false) | CameraCommand::SetMotionThreshold(0) => {
            set_config("AudioDetect[0].MutationDetect=false")
        }
        CameraCommand::SetAudioThreshold(threshold) => set_config(&format!(
            "AudioDetect[0].MutationThreold={}",
            (*threshold).max(1)
        )),
        CameraCommand::EnableLineCrossing(on) => {
            set_config(&format!("VideoAnalyseRule[0][1].Enable={}", on))
        }
        CameraCommand::EnablePrivacyMode(on) => set_config(&format!("LeLensMask[0].Enable={}", on)),
        CameraCommand::ActivateAlarmOutput(on) => {
            set_config(&format!("AlarmOut[0].Mode={}", u8::from(*on)))
        }
        CameraCommand::ActivateAlarmOutput2(on) => {
            set_config(&format!("AlarmOut[1].Mode={}", u8::from(*on)))
        }
        CameraCommand::TextOverlay(text) if text.is_empty() => {
            set_config("VideoWidget[0].CustomTitle[1].EncodeBlend=false")
        }
        CameraCommand::TextOverlay(text) => set_config(&format!(
            "VideoWidget[0].CustomTitle[1].EncodeBlend=true&VideoWidget[0].CustomTitle[1].Text={}",
            encode_query_value(text)
        )),
        CameraCommand::EnableIrLed(on) => {
            ctx.attribute("auto_ir_led", false);
            set_config(if *on {
                "Lighting[0][0].Mode=Manual"
            } else {
                "Lighting[0][0].Mode=Off"
            })
        }
        CameraCommand::AutoIrLed(true) => {
            ctx.attribute("enable_ir_led", serde_json::Value::Null);
            set_config("Lighting[0][0].Mode=Auto")
        }
        CameraCommand::AutoIrLed(false) => return Ok(()),
        other => return Err(CameraError::Unsupported(other.name().to_string())),
    };
    ctx.send(request);
    Ok(())
}

/// setConfig 回复：成功时为 `OK`
pub(super) fn check_set_config(target: &str, body: &str, ctx: &mut AdapterContext<'_>) -> bool {
    if !target.contains("action=setConfig") {
        return false;
    }
    if !body.trim().starts_with("OK") {
        ctx.reject(body.trim().to_string());
    }
    true
}

/// getConfig 回复中的 `table.*` 字段
pub(super) fn ingest_config(body: &str, ctx: &mut AdapterContext<'_>) -> bool {
    let mut handled = false;
    let mut flag = |on: &str, off: &str, name: &str, ctx: &mut AdapterContext<'_>| {
        if body.contains(on) {
            ctx.attribute(name, true);
            handled = true;
        } else if body.contains(off) {
            ctx.attribute(name, false);
            handled = true;
        }
    };

    flag(
        "table.MotionDetect[0].Enable=true",
        "table.MotionDetect[0].Enable=false",
        "enable_motion_alarm",
        ctx,
    );
    flag(
        "table.AudioDetect[0].MutationDetect=true",
        "table.AudioDetect[0].MutationDetect=false",
        "enable_audio_alarm",
        ctx,
    );
    flag(
        "table.VideoAnalyseRule[0][1].Enable=true",
        "table.VideoAnalyseRule[0][1].Enable=false",
        "enable_line_crossing_alarm",
        ctx,
    );
    flag(
        "table.LeLensMask[0].Enable=true",
        "table.LeLensMask[0].Enable=false",
        "enable_privacy_mode",
        ctx,
    );

    if let Some(value) = value_after(body, "table.AudioDetect[0].MutationThreold=", "\r\n") {
        match value.parse::<u32>() {
            Ok(threshold) => {
                ctx.attribute("audio_threshold", threshold);
                handled = true;
            }
            Err(_) => debug!(device_id = %ctx.device.id, "Invalid audio threshold '{}'", value),
        }
    }
    handled
}

/// Dahua HTTP API
pub struct DahuaAdapter {
    stream_buffer: String,
}

impl DahuaAdapter {
    pub fn new() -> Self {
        Self {
            stream_buffer: String::new(),
        }
    }

    fn process_event(line: &str, ctx: &mut AdapterContext<'_>) {
        let Some(event) = line.split("Code=").nth(1) else {
            return;
        };
        let mut parts = event.split(';');
        let code = parts.next().unwrap_or_default().trim();
        let action = parts
            .find_map(|part| part.trim().strip_prefix("action="))
            .unwrap_or_default();
        let active = match action {
            "Start" => true,
            "Stop" => false,
            _ if code == "LensMaskOpen" || code == "LensMaskClose" => code == "LensMaskOpen",
            _ => {
                debug!(device_id = %ctx.device.id, code = code, action = action, "Unrecognised event action");
                return;
            }
        };

        let kind = match code {
            "VideoMotion" => AlarmKind::Motion,
            "TakenAwayDetection" => AlarmKind::ItemTaken,
            "LeftDetection" => AlarmKind::ItemLeft,
            "SmartMotionVehicle" => AlarmKind::Car,
            "SmartMotionHuman" => AlarmKind::Human,
            "CrossLineDetection" => AlarmKind::LineCrossing,
            "AudioMutation" => AlarmKind::Audio,
            "FaceDetection" => AlarmKind::FaceDetected,
            "ParkingDetection" => AlarmKind::Parking,
            "CrossRegionDetection" => AlarmKind::FieldDetection,
            "VideoLoss" | "VideoBlind" => AlarmKind::TooDark,
            "VideoAbnormalDetection" => AlarmKind::SceneChange,
            "VideoUnFocus" => AlarmKind::TooBlurry,
            "AlarmLocal" if line.contains("index=0") => AlarmKind::ExternalInput,
            "AlarmLocal" => AlarmKind::ExternalInput2,
            "LensMaskOpen" | "LensMaskClose" => {
                ctx.attribute("enable_privacy_mode", active);
                return;
            }
            code if IGNORED_CODES.contains(&code) => return,
            _ => {
                debug!(device_id = %ctx.device.id, code = code, action = action, "Unrecognised event");
                return;
            }
        };
        ctx.alarm(kind, active);
    }
}

impl Default for DahuaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl BrandAdapter for DahuaAdapter {
    fn brand(&self) -> Brand {
        Brand::Dahua
    }

    fn handshake(&self, _device: &Device) -> Option<VendorRequest> {
        Some(VendorRequest::get("/cgi-bin/magicBox.cgi?action=getSystemInfo"))
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        for request in self.refresh_requests(ctx.device) {
            ctx.send(request);
        }
        ctx.open_stream(VendorRequest::get(EVENT_STREAM));
    }

    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        if ctx.tracker.is_stopped(EVENT_STREAM) {
            info!(device_id = %ctx.device.id, "Alarm stream was not running, re-starting it");
            ctx.open_stream(VendorRequest::get(EVENT_STREAM));
        }
    }

    fn ingest_stream(&mut self, _target: &str, chunk: &str, ctx: &mut AdapterContext<'_>) {
        self.stream_buffer.push_str(chunk);
        while let Some(end) = self.stream_buffer.find('\n') {
            let line: String = self.stream_buffer.drain(..=end).collect();
            if line.contains("Code=") {
                Self::process_event(&line, ctx);
            }
        }
        if self.stream_buffer.len() > 16 * 1024 {
            self.stream_buffer.clear();
        }
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        if check_set_config(target, body, ctx) {
            return;
        }
        if body.contains("Code=") {
            for line in body.lines() {
                Self::process_event(line, ctx);
            }
            return;
        }
        if !ingest_config(body, ctx) {
            debug!(device_id = %ctx.device.id, "Unhandled reply for {}", target);
        }
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        config_command(command, ctx)
    }

    fn refresh_requests(&self, _device: &Device) -> Vec<VendorRequest> {
        ["AudioDetect[0]", "CrossLineDetection[0]", "MotionDetect[0]", "LeLensMask[0]"]
            .iter()
            .map(|name| VendorRequest::get(format!("{}getConfig&name={}", CONFIG_MANAGER, name)))
            .collect()
    }

    fn snapshot_url(&self, device: &Device) -> Option<String> {
        Some(format!("/cgi-bin/snapshot.cgi?channel={}", device.nvr_channel))
    }

    fn mjpeg_url(&self, device: &Device) -> Option<String> {
        Some(format!(
            "/cgi-bin/mjpg/video.cgi?channel={}&subtype=1",
            device.nvr_channel
        ))
    }

    fn ffmpeg_input(&self, device: &Device) -> Option<String> {
        Some(rtsp_url(
            device,
            &format!("/cam/realmonitor?channel={}&subtype=0", device.nvr_channel),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::RequestTracker;

    fn run_stream(adapter: &mut DahuaAdapter, chunks: &[&str]) -> Vec<(AlarmKind, bool)> {
        let device = Device::new("dahua", Brand::Dahua, "10.0.0.11");
        let tracker = RequestTracker::new();
        let mut ctx = AdapterContext::new(&device, &tracker);
        for chunk in chunks {
            adapter.ingest_stream(EVENT_STREAM, chunk, &mut ctx);
        }
        ctx.into_output().alarms
    }

    #[test]
    fn test_event_stream_start_stop() {
        let mut adapter = DahuaAdapter::new();
        let alarms = run_stream(
            &mut adapter,
            &[
                "--myboundary\r\nContent-Type: text/plain\r\nContent-Length:36\r\n\r\nCode=VideoMotion;action=Start;index=0\r\n",
                "--myboundary\r\nContent-Type: text/plain\r\n\r\nCode=VideoMotion;act",
                "ion=Stop;index=0\r\n--myboundary\r\n\r\nCode=AlarmLocal;action=Start;index=1\r\n",
            ],
        );
        assert_eq!(
            alarms,
            vec![
                (AlarmKind::Motion, true),
                (AlarmKind::Motion, false),
                (AlarmKind::ExternalInput2, true)
            ]
        );
    }

    #[test]
    fn test_ignored_and_unknown_codes() {
        let mut adapter = DahuaAdapter::new();
        let alarms = run_stream(
            &mut adapter,
            &[
                "Code=NTPAdjustTime;action=Pulse;index=0\r\n",
                "Code=SomethingNew;action=Start;index=0\r\n",
                "Code=garbled\r\n",
            ],
        );
        assert!(alarms.is_empty());
    }

    #[test]
    fn test_config_reply() {
        let device = Device::new("dahua", Brand::Dahua, "10.0.0.11");
        let tracker = RequestTracker::new();
        let mut adapter = DahuaAdapter::new();
        let mut ctx = AdapterContext::new(&device, &tracker);

        adapter.ingest(
            "/cgi-bin/configManager.cgi?action=getConfig&name=AudioDetect[0]",
            "table.AudioDetect[0].MutationDetect=true\r\ntable.AudioDetect[0].MutationThreold=35\r\n",
            &mut ctx,
        );
        let attributes = ctx.into_output().attributes;
        assert!(attributes.contains(&("enable_audio_alarm".to_string(), true.into())));
        assert!(attributes.contains(&("audio_threshold".to_string(), 35.into())));
    }

    #[test]
    fn test_commands_and_rejection() {
        let device = Device::new("dahua", Brand::Dahua, "10.0.0.11");
        let tracker = RequestTracker::new();
        let mut adapter = DahuaAdapter::new();

        let mut ctx = AdapterContext::new(&device, &tracker);
        adapter
            .build_command(&CameraCommand::TextOverlay("Front Gate".to_string()), &mut ctx)
            .unwrap();
        adapter
            .build_command(&CameraCommand::SetAudioThreshold(0), &mut ctx)
            .unwrap();
        let output = ctx.into_output();
        assert_eq!(
            output.requests[0].target,
            "/cgi-bin/configManager.cgi?action=setConfig&VideoWidget[0].CustomTitle[1].EncodeBlend=true&VideoWidget[0].CustomTitle[1].Text=Front+Gate"
        );
        assert!(output.requests[1].target.ends_with("MutationThreold=1"));

        let mut ctx = AdapterContext::new(&device, &tracker);
        adapter.ingest(
            "/cgi-bin/configManager.cgi?action=setConfig&LeLensMask[0].Enable=true",
            "Error\r\nBad Request!\r\n",
            &mut ctx,
        );
        assert!(ctx.into_output().rejection.unwrap().starts_with("Error"));
    }
}
