use super::{encode_query_value, rtsp_url, value_after, AdapterContext, BrandAdapter};
use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::transport::VendorRequest;
use tracing::debug;

const CGI: &str = "/cgi-bin/CGIProxy.fcgi?cmd=";

/// Foscam CGI
#[derive(Default)]
pub struct FoscamAdapter {
    audio_threshold: Option<u8>,
}

impl FoscamAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn credentials(device: &Device) -> String {
        format!(
            "usr={}&pwd={}",
            encode_query_value(&device.username),
            encode_query_value(&device.password)
        )
    }

    fn cgi(device: &Device, command: &str) -> VendorRequest {
        VendorRequest::get(format!("{}{}&{}", CGI, command, Self::credentials(device)))
    }

    fn audio_command(device: &Device, threshold: u8) -> VendorRequest {
        let command = match threshold {
            0 => "setAudioAlarmConfig&isEnable=0",
            1..=33 => "setAudioAlarmConfig&isEnable=1&sensitivity=0",
            34..=66 => "setAudioAlarmConfig&isEnable=1&sensitivity=1",
            _ => "setAudioAlarmConfig&isEnable=1&sensitivity=2",
        };
        Self::cgi(device, command)
    }
}

impl BrandAdapter for FoscamAdapter {
    fn brand(&self) -> Brand {
        Brand::Foscam
    }

    fn handshake(&self, device: &Device) -> Option<VendorRequest> {
        Some(Self::cgi(device, "getDevInfo"))
    }

    fn verify_handshake(
        &mut self,
        reply: &crate::transport::VendorReply,
        _ctx: &mut AdapterContext<'_>,
    ) -> Result<()> {
        // -2 表示用户名或密码错误
        match value_after(&reply.body, "<result>", "</result>") {
            Some("0") => Ok(()),
            Some("-2") => Err(CameraError::auth("camera rejected username or password")),
            Some(code) => Err(CameraError::protocol(format!("getDevInfo returned result {}", code))),
            None if reply.is_success() => Ok(()),
            None => Err(CameraError::protocol(format!(
                "handshake returned status {}",
                reply.status
            ))),
        }
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        ctx.send(Self::cgi(ctx.device, "getDevState"));
        ctx.send(Self::cgi(ctx.device, "getAudioAlarmConfig"));
    }

    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        ctx.send(Self::cgi(ctx.device, "getDevState"));
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        if target.contains("cmd=set") || target.contains("cmd=open") || target.contains("cmd=close") {
            match value_after(body, "<result>", "</result>") {
                Some("0") => {}
                Some(code) => ctx.reject(format!("camera returned result {}", code)),
                None => ctx.reject(body.trim().to_string()),
            }
            return;
        }

        let mut handled = false;
        match value_after(body, "<motionDetectAlarm>", "</motionDetectAlarm>") {
            Some("0") => {
                ctx.attribute("enable_motion_alarm", false);
                handled = true;
            }
            Some("1") => {
                ctx.attribute("enable_motion_alarm", true);
                ctx.alarm(AlarmKind::Motion, false);
                handled = true;
            }
            Some("2") => {
                ctx.attribute("enable_motion_alarm", true);
                ctx.alarm(AlarmKind::Motion, true);
                handled = true;
            }
            _ => {}
        }

        match value_after(body, "<soundAlarm>", "</soundAlarm>") {
            Some("0") => {
                ctx.attribute("enable_audio_alarm", false);
                ctx.alarm(AlarmKind::Audio, false);
                handled = true;
            }
            Some("1") => {
                ctx.attribute("enable_audio_alarm", true);
                ctx.alarm(AlarmKind::Audio, false);
                handled = true;
            }
            Some("2") => {
                ctx.attribute("enable_audio_alarm", true);
                ctx.alarm(AlarmKind::Audio, true);
                handled = true;
            }
            _ => {}
        }

        let threshold = match value_after(body, "<sensitivity>", "</sensitivity>") {
            Some("0") => Some(0),
            Some("1") => Some(50),
            Some("2") => Some(100),
            _ => None,
        };
        if let Some(threshold) = threshold {
            ctx.attribute("audio_threshold", threshold);
            handled = true;
        }

        match value_after(body, "<infraLedState>", "</infraLedState>") {
            Some("0") => {
                ctx.attribute("enable_ir_led", false);
                handled = true;
            }
            Some("1") => {
                ctx.attribute("enable_ir_led", true);
                handled = true;
            }
            _ => {}
        }

        if !handled {
            debug!(device_id = %ctx.device.id, "Unhandled reply for {}", target);
            // 所有 CGI 回复都带 <result>，缺失说明回复本身不对
            if !body.trim().is_empty() && !body.contains("<result>") {
                ctx.malformed("reply without result code");
            }
        }
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        let device = ctx.device;
        match command {
            CameraCommand::EnableMotionAlarm(on) => {
                let flag = u8::from(*on);
                ctx.send(Self::cgi(device, &format!("setMotionDetectConfig&isEnable={}", flag)));
                ctx.send(Self::cgi(device, &format!("setMotionDetectConfig1&isEnable={}", flag)));
            }
            CameraCommand::EnableAudioAlarm(on) => {
                ctx.send(Self::cgi(
                    device,
                    &format!("setAudioAlarmConfig&isEnable={}", u8::from(*on)),
                ));
            }
            CameraCommand::SetMotionThreshold(threshold) => {
                ctx.send(Self::cgi(
                    device,
                    &format!("setAudioAlarmConfig&isEnable={}", u8::from(*threshold > 0)),
                ));
            }
            CameraCommand::SetAudioThreshold(threshold) => {
                if self.audio_threshold != Some(*threshold) {
                    self.audio_threshold = Some(*threshold);
                    ctx.send(Self::audio_command(device, *threshold));
                }
            }
            CameraCommand::EnableIrLed(on) => {
                ctx.send(Self::cgi(device, "setInfraLedConfig&mode=1"));
                ctx.attribute("auto_ir_led", false);
                ctx.send(Self::cgi(
                    device,
                    if *on { "openInfraLed" } else { "closeInfraLed" },
                ));
            }
            CameraCommand::AutoIrLed(on) => {
                if *on {
                    ctx.attribute("enable_ir_led", serde_json::Value::Null);
                }
                ctx.send(Self::cgi(
                    device,
                    &format!("setInfraLedConfig&mode={}", if *on { 0 } else { 1 }),
                ));
            }
            other => return Err(CameraError::Unsupported(other.name().to_string())),
        }
        Ok(())
    }

    fn refresh_requests(&self, device: &Device) -> Vec<VendorRequest> {
        vec![
            Self::cgi(device, "getDevState"),
            Self::cgi(device, "getAudioAlarmConfig"),
        ]
    }

    fn snapshot_url(&self, device: &Device) -> Option<String> {
        Some(format!(
            "/cgi-bin/CGIProxy.fcgi?{}&cmd=snapPicture2",
            Self::credentials(device)
        ))
    }

    fn mjpeg_url(&self, device: &Device) -> Option<String> {
        Some(format!(
            "/cgi-bin/CGIStream.cgi?cmd=GetMJStream&{}",
            Self::credentials(device)
        ))
    }

    fn ffmpeg_input(&self, device: &Device) -> Option<String> {
        Some(rtsp_url(device, "/videoMain"))
    }
}
