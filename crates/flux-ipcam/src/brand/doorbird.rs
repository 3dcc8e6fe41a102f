use super::{rtsp_url, AdapterContext, BrandAdapter};
use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::transport::{VendorReply, VendorRequest};
use tracing::{debug, info};

const MONITOR: &str = "/bha-api/monitor.cgi?ring=doorbell,motionsensor";
const INFO: &str = "/bha-api/info.cgi";

/// Doorbird 门铃
#[derive(Debug, Default)]
pub struct DoorbirdAdapter {
    stream_buffer: String,
}

impl DoorbirdAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `doorbell:H` 表示触发，`:L` 表示结束
    fn process_line(line: &str, ctx: &mut AdapterContext<'_>) {
        let Some((event, level)) = line.trim().split_once(':') else {
            return;
        };
        let active = level.trim() == "H";
        match event.trim() {
            "doorbell" => ctx.alarm(AlarmKind::Doorbell, active),
            "motionsensor" => ctx.alarm(AlarmKind::Motion, active),
            _ => {}
        }
    }
}

impl BrandAdapter for DoorbirdAdapter {
    fn brand(&self) -> Brand {
        Brand::Doorbird
    }

    fn handshake(&self, _device: &Device) -> Option<VendorRequest> {
        Some(VendorRequest::get(INFO))
    }

    fn verify_handshake(&mut self, reply: &VendorReply, ctx: &mut AdapterContext<'_>) -> Result<()> {
        if !reply.is_success() {
            return Err(CameraError::protocol(format!("info.cgi returned status {}", reply.status)));
        }
        if let Ok(info) = serde_json::from_str::<serde_json::Value>(&reply.body) {
            let version = &info["BHA"]["VERSION"][0];
            if let Some(firmware) = version["FIRMWARE"].as_str() {
                ctx.attribute("firmware", firmware);
            }
            if let Some(model) = version["DEVICE-TYPE"].as_str() {
                ctx.attribute("model", model);
            }
        }
        Ok(())
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        ctx.open_stream(VendorRequest::get(MONITOR));
    }

    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        if ctx.tracker.is_stopped(MONITOR) {
            info!(device_id = %ctx.device.id, "Monitor stream was not running, re-starting it");
            self.stream_buffer.clear();
            ctx.open_stream(VendorRequest::get(MONITOR));
        }
    }

    fn ingest_stream(&mut self, _target: &str, chunk: &str, ctx: &mut AdapterContext<'_>) {
        self.stream_buffer.push_str(chunk);
        while let Some(end) = self.stream_buffer.find('\n') {
            let line: String = self.stream_buffer.drain(..=end).collect();
            Self::process_line(&line, ctx);
        }
        if self.stream_buffer.len() > 4096 {
            self.stream_buffer.clear();
        }
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        if target.starts_with("/bha-api/open-door.cgi") || target.starts_with("/bha-api/light-on.cgi") {
            return;
        }
        for line in body.lines() {
            Self::process_line(line, ctx);
        }
        debug!(device_id = %ctx.device.id, "Reply for {}", target);
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        match command {
            CameraCommand::OpenDoor(relay) => ctx.get(format!("/bha-api/open-door.cgi?r={}", relay)),
            CameraCommand::EnableLight(true) => ctx.get("/bha-api/light-on.cgi"),
            other => return Err(CameraError::Unsupported(other.name().to_string())),
        }
        Ok(())
    }

    fn snapshot_url(&self, _device: &Device) -> Option<String> {
        Some("/bha-api/image.cgi".to_string())
    }

    fn mjpeg_url(&self, _device: &Device) -> Option<String> {
        Some("/bha-api/video.cgi".to_string())
    }

    fn ffmpeg_input(&self, device: &Device) -> Option<String> {
        Some(rtsp_url(device, "/mpeg/media.amp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::RequestTracker;

    #[test]
    fn test_monitor_events() {
        let device = Device::new("door", Brand::Doorbird, "10.0.0.30");
        let tracker = RequestTracker::new();
        let mut adapter = DoorbirdAdapter::new();
        let mut ctx = AdapterContext::new(&device, &tracker);
        for chunk in ["--ioboundary\r\nContent-Type: text/plain\r\n\r\ndoorbell:H\r\n", "motionsensor:L\r\n", "doorbe", "ll:L\r\n"] {
            adapter.ingest_stream(MONITOR, chunk, &mut ctx);
        }
        assert_eq!(
            ctx.into_output().alarms,
            vec![
                (AlarmKind::Doorbell, true),
                (AlarmKind::Motion, false),
                (AlarmKind::Doorbell, false)
            ]
        );
    }

    #[test]
    fn test_door_and_light_commands() {
        let device = Device::new("door", Brand::Doorbird, "10.0.0.30");
        let tracker = RequestTracker::new();
        let mut adapter = DoorbirdAdapter::new();
        let mut ctx = AdapterContext::new(&device, &tracker);
        adapter.build_command(&CameraCommand::OpenDoor(2), &mut ctx).unwrap();
        adapter.build_command(&CameraCommand::EnableLight(true), &mut ctx).unwrap();
        assert!(adapter.build_command(&CameraCommand::EnableLight(false), &mut ctx).is_err());
        let targets: Vec<_> = ctx.into_output().requests.into_iter().map(|r| r.target).collect();
        assert_eq!(targets, vec!["/bha-api/open-door.cgi?r=2", "/bha-api/light-on.cgi"]);
    }
}
