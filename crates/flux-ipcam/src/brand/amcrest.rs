use super::dahua::{check_set_config, config_command, ingest_config, CONFIG_MANAGER};
use super::{rtsp_url, AdapterContext, BrandAdapter};
use crate::error::Result;
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::transport::VendorRequest;
use tracing::debug;

const MOTION_INDEXES: &str = "/cgi-bin/eventManager.cgi?action=getEventIndexes&code=VideoMotion";
const AUDIO_INDEXES: &str = "/cgi-bin/eventManager.cgi?action=getEventIndexes&code=AudioMutation";

/// Amcrest：Dahua 命令集，报警靠主动轮询
#[derive(Default)]
pub struct AmcrestAdapter;

impl AmcrestAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl BrandAdapter for AmcrestAdapter {
    fn brand(&self) -> Brand {
        Brand::Amcrest
    }

    fn handshake(&self, _device: &Device) -> Option<VendorRequest> {
        Some(VendorRequest::get("/cgi-bin/magicBox.cgi?action=getSystemInfo"))
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        for request in self.refresh_requests(ctx.device) {
            ctx.send(request);
        }
    }

    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        ctx.get(MOTION_INDEXES);
        ctx.get(AUDIO_INDEXES);
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        if check_set_config(target, body, ctx) {
            return;
        }

        let kind = match target {
            MOTION_INDEXES => Some(AlarmKind::Motion),
            AUDIO_INDEXES => Some(AlarmKind::Audio),
            _ => None,
        };
        if let Some(kind) = kind {
            if body.contains("Error: No Events") {
                ctx.alarm(kind, false);
            } else if body.contains("channels[0]=0") {
                ctx.alarm(kind, true);
            } else {
                debug!(device_id = %ctx.device.id, "Unexpected event index reply for {}", target);
            }
            return;
        }

        if body.contains("Code=LensMaskOpen;") {
            ctx.attribute("enable_privacy_mode", true);
        } else if body.contains("Code=LensMaskClose;") {
            ctx.attribute("enable_privacy_mode", false);
        } else if !ingest_config(body, ctx) {
            debug!(device_id = %ctx.device.id, "Unhandled reply for {}", target);
        }
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        config_command(command, ctx)
    }

    fn refresh_requests(&self, _device: &Device) -> Vec<VendorRequest> {
        ["AudioDetect[0]", "LeLensMask[0]", "MotionDetect[0]", "CrossLineDetection[0]"]
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
