use super::{encode_query_value, rtsp_url, value_after, AdapterContext, BrandAdapter};
use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::transport::VendorRequest;
use tracing::debug;

const INFRARED: &str = "/param.cgi?cmd=getinfrared";
const OVERLAY: &str = "/param.cgi?cmd=getoverlayattr&-region=1";
const MOTION_ATTR: &str = "/cgi-bin/hi3510/param.cgi?cmd=getmdattr";
const ALARM_ATTR: &str = "/param.cgi?cmd=getalarmattr";
const AUDIO_ATTR: &str = "/cgi-bin/hi3510/param.cgi?cmd=getaudioalarmattr";
const PIR_ATTR: &str = "/param.cgi?cmd=getpirattr";
const IO_ATTR: &str = "/param.cgi?cmd=getioattr";

/// Instar：回复按请求 URL 区分，报警通过 `/instar?&active=N` 回调推送
#[derive(Default)]
pub struct InstarAdapter {
    /// 2K+ 机型的新接口
    new_api: bool,
    audio_threshold: Option<u8>,
}

impl InstarAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn var<'a>(content: &'a str, name: &str) -> Option<&'a str> {
        value_after(content, &format!("var {}=\"", name), "\"")
    }
}

impl BrandAdapter for InstarAdapter {
    fn brand(&self) -> Brand {
        Brand::Instar
    }

    fn handshake(&self, _device: &Device) -> Option<VendorRequest> {
        Some(VendorRequest::get(INFRARED))
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        if let Some((host, port)) = ctx.callback.clone() {
            // 新旧两种接口都尝试，根据成功的回复判断机型
            ctx.get(format!(
                "/param.cgi?cmd=setasaction&-server=1&enable=1&-interval=1&cmd=setasattr&-as_index=1&-as_server={}&-as_port={}&-as_path=/instar&-as_queryattr1=&-as_queryval1=&-as_activequery=1&-as_auth=0&-as_query1=0&-as_query2=0&-as_query3=0",
                host, port
            ));
            ctx.get(format!(
                "/param.cgi?cmd=setmdalarm&-aname=server2&-switch=on&-interval=1&cmd=setalarmserverattr&-as_index=3&-as_server={}&-as_port={}&-as_path=/instar&-as_queryattr1=&-as_queryval1=&-as_queryattr2=&-as_queryval2=&-as_queryattr3=&-as_queryval3=&-as_activequery=1&-as_auth=0&-as_query1=0&-as_query2=0&-as_query3=0",
                host, port
            ));
        }
        for request in self.refresh_requests(ctx.device) {
            ctx.send(request);
        }
    }

    /// 报警只以脉冲形式推送，每个周期复位
    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        ctx.alarm(AlarmKind::Motion, false);
        ctx.alarm(AlarmKind::Pir, false);
        ctx.alarm(AlarmKind::Audio, false);
    }

    fn alarm_pushed(&mut self, query: &str, ctx: &mut AdapterContext<'_>) {
        let active = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("active="))
            .and_then(|value| value.parse::<u8>().ok());
        debug!(device_id = %ctx.device.id, query = query, "Alarm has been triggered");
        match active {
            Some(1..=4) | Some(7..=10) => ctx.alarm(AlarmKind::Motion, true),
            Some(5) => {
                ctx.alarm(AlarmKind::Pir, true);
                ctx.alarm(AlarmKind::Motion, true);
            }
            Some(6) => ctx.alarm(AlarmKind::Audio, true),
            _ => debug!(device_id = %ctx.device.id, "Unknown alarm push '{}'", query),
        }
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        match target {
            INFRARED => {
                ctx.attribute("auto_ir_led", body.contains("var infraredstat=\"auto"));
            }
            OVERLAY => {
                if body.contains("var show_1=\"0\"") {
                    ctx.attribute("text_overlay", "");
                } else if let Some(name) = Self::var(body, "name_1").filter(|n| !n.is_empty()) {
                    ctx.attribute("text_overlay", name);
                }
            }
            MOTION_ATTR => {
                ctx.attribute("enable_motion_alarm", body.contains("var m1_enable=\"1\""));
            }
            ALARM_ATTR => {
                ctx.attribute("enable_motion_alarm", body.contains("var md1_enable=\"1\""));
            }
            AUDIO_ATTR => {
                let enabled = body.contains("var aa_enable=\"1\"");
                ctx.attribute("enable_audio_alarm", enabled);
                if enabled {
                    if let Some(value) = Self::var(body, "aa_value").and_then(|v| v.parse::<u32>().ok()) {
                        ctx.attribute("audio_threshold", value);
                    }
                }
            }
            PIR_ATTR => {
                ctx.attribute("enable_pir_alarm", body.contains("var pir_enable=\"1\""));
            }
            IO_ATTR => {
                ctx.attribute(
                    "enable_external_alarm_input",
                    body.contains("var io_enable=\"1\""),
                );
            }
            _ if target.starts_with("/param.cgi?cmd=setasaction&-server=1&enable=1") => {
                if body.contains("response=\"200\";") {
                    self.new_api = true;
                    debug!(device_id = %ctx.device.id, "Alarm server set up for a 2K+ camera");
                }
            }
            _ if target.starts_with("/param.cgi?cmd=setmdalarm&-aname=server2") => {
                if body.starts_with("[Succeed]set ok") {
                    self.new_api = false;
                    debug!(device_id = %ctx.device.id, "Alarm server set up for a 1080p camera");
                }
            }
            _ if target.contains("cmd=set") => {
                if body.contains("[Error]") {
                    ctx.reject(body.trim().to_string());
                }
            }
            _ => debug!(device_id = %ctx.device.id, "Unknown reply from {}", target),
        }
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        match command {
            CameraCommand::EnableMotionAlarm(on) => {
                let val = u8::from(*on);
                ctx.get(format!(
                    "/cgi-bin/hi3510/param.cgi?cmd=setmdattr&-enable={v}&-name=1&cmd=setmdattr&-enable={v}&-name=2&cmd=setmdattr&-enable={v}&-name=3&cmd=setmdattr&-enable={v}&-name=4",
                    v = val
                ));
            }
            CameraCommand::SetAudioThreshold(threshold) => {
                if self.audio_threshold != Some(*threshold) {
                    self.audio_threshold = Some(*threshold);
                    if *threshold > 0 {
                        ctx.get("/cgi-bin/hi3510/param.cgi?cmd=setaudioalarmattr&-aa_enable=1");
                        ctx.get(format!(
                            "/cgi-bin/hi3510/param.cgi?cmd=setaudioalarmattr&-aa_enable=1&-aa_value={}",
                            threshold
                        ));
                    } else {
                        ctx.get("/cgi-bin/hi3510/param.cgi?cmd=setaudioalarmattr&-aa_enable=0");
                    }
                }
            }
            CameraCommand::EnableAudioAlarm(on) => ctx.get(format!(
                "/cgi-bin/hi3510/param.cgi?cmd=setaudioalarmattr&-aa_enable={}",
                u8::from(*on)
            )),
            CameraCommand::TextOverlay(text) if text.is_empty() => {
                ctx.get("/param.cgi?cmd=setoverlayattr&-region=1&-show=0")
            }
            CameraCommand::TextOverlay(text) => ctx.get(format!(
                "/param.cgi?cmd=setoverlayattr&-region=1&-show=1&-name={}",
                encode_query_value(text)
            )),
            CameraCommand::AutoIrLed(on) | CameraCommand::EnableIrLed(on) => ctx.get(format!(
                "/param.cgi?cmd=setinfrared&-infraredstat={}",
                if *on { "auto" } else { "close" }
            )),
            CameraCommand::EnablePirAlarm(on) => ctx.get(format!(
                "/param.cgi?cmd=setpirattr&-pir_enable={}",
                u8::from(*on)
            )),
            CameraCommand::EnableExternalAlarmInput(on) => ctx.get(format!(
                "/param.cgi?cmd=setioattr&-io_enable={}",
                u8::from(*on)
            )),
            other => return Err(CameraError::Unsupported(other.name().to_string())),
        }
        Ok(())
    }

    fn refresh_requests(&self, _device: &Device) -> Vec<VendorRequest> {
        let motion = if self.new_api { ALARM_ATTR } else { MOTION_ATTR };
        [AUDIO_ATTR, motion, INFRARED, OVERLAY, PIR_ATTR, IO_ATTR]
            .into_iter()
            .map(VendorRequest::get)
            .collect()
    }

    fn snapshot_url(&self, _device: &Device) -> Option<String> {
        Some(if self.new_api { "/snap.cgi?chn=12" } else { "/tmpfs/snap.jpg" }.to_string())
    }

    fn mjpeg_url(&self, _device: &Device) -> Option<String> {
        Some(
            if self.new_api {
                "/livestream/12?action=play&media=mjpeg"
            } else {
                "/mjpegstream.cgi?-chn=12"
            }
            .to_string(),
        )
    }

    fn ffmpeg_input(&self, device: &Device) -> Option<String> {
        Some(rtsp_url(device, if self.new_api { "/livestream/12" } else { "/11" }))
    }
}
