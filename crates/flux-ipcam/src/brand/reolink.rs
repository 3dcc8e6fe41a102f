use super::{encode_query_value, rtsp_url, AdapterContext, BrandAdapter};
use crate::auth::SessionToken;
use crate::error::{CameraError, Result};
use crate::model::{AlarmKind, Brand, CameraCommand, Device};
use crate::transport::{VendorReply, VendorRequest};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

const API: &str = "/cgi-bin/api.cgi?";
/// 会话失效
const RSP_INVALID_TOKEN: i64 = -6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigType {
    Select,
    Bool,
    Number,
}

/// 端点 -> 配置分组与 JSON 路径
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    pub group: &'static str,
    pub path: &'static str,
    pub kind: ConfigType,
    pub writable: bool,
}

/// 端点表，首次使用时构建，之后只读
pub fn endpoint_table() -> &'static HashMap<&'static str, EndpointConfig> {
    static TABLE: OnceLock<HashMap<&'static str, EndpointConfig>> = OnceLock::new();
    TABLE.get_or_init(|| {
        use ConfigType::*;
        let entries: [(&str, &str, &str, ConfigType, bool); 32] = [
            ("exposure", "Isp", "exposure", Select, true),
            ("day_night", "Isp", "dayNight", Select, true),
            ("back_light", "Isp", "backLight", Select, true),
            ("white_balance", "Isp", "whiteBalance", Select, true),
            ("anti_flicker", "Isp", "antiFlicker", Select, true),
            ("image_rotate", "Isp", "rotation", Bool, true),
            ("3dnr", "Isp", "nr3d", Bool, true),
            ("image_mirror", "Isp", "mirroring", Bool, true),
            ("drc", "Isp", "drc", Number, true),
            ("blue_gain", "Isp", "blueGain", Number, true),
            ("blc", "Isp", "blc", Number, true),
            ("red_gain", "Isp", "redGain", Number, true),
            ("bg_color", "Osd", "bgcolor", Bool, true),
            ("name_show", "Osd", "osdChannel/enable", Bool, true),
            ("name_position", "Osd", "osdChannel/pos", Select, true),
            ("datetime_show", "Osd", "osdTime/enable", Bool, true),
            ("datetime_position", "Osd", "osdTime/pos", Select, true),
            ("watermark_show", "Osd", "watermark", Bool, true),
            ("bright", "Image", "bright", Number, true),
            ("contrast", "Image", "contrast", Number, true),
            ("hue", "Image", "hue", Number, true),
            ("saturation", "Image", "saturation", Number, true),
            ("sharpen", "Image", "sharpen", Number, true),
            ("record_audio", "Enc", "audio", Bool, true),
            ("stream_main_resolution", "Enc", "mainStream/size", Select, true),
            ("stream_main_bitrate", "Enc", "mainStream/bitRate", Select, true),
            ("stream_main_framerate", "Enc", "mainStream/frameRate", Select, true),
            ("stream_main_h264_profile", "Enc", "mainStream/profile", Select, true),
            ("stream_secondary_resolution", "Enc", "subStream/size", Select, true),
            ("stream_secondary_bitrate", "Enc", "subStream/bitRate", Select, true),
            ("cpu_loading", "Performance", "cpuUsed", Number, false),
            ("bandwidth", "Performance", "codecRate", Number, false),
        ];
        entries
            .into_iter()
            .map(|(endpoint, group, path, kind, writable)| {
                (
                    endpoint,
                    EndpointConfig {
                        group,
                        path,
                        kind,
                        writable,
                    },
                )
            })
            .collect()
    })
}

fn pointer(path: &str) -> String {
    format!("/{}", path)
}

/// 按端点类型转换写入值
fn coerce(kind: ConfigType, value: &Value) -> Option<Value> {
    match (kind, value) {
        (ConfigType::Bool, Value::Bool(on)) => Some(json!(u8::from(*on))),
        (ConfigType::Bool, Value::Number(n)) => Some(json!(u8::from(n.as_i64() != Some(0)))),
        (ConfigType::Number, Value::Number(_)) => Some(value.clone()),
        (ConfigType::Number, Value::String(s)) => s.trim().parse::<i64>().ok().map(|n| json!(n)),
        (ConfigType::Select, Value::String(_)) => Some(value.clone()),
        _ => None,
    }
}

/// Reolink JSON API
#[derive(Default)]
pub struct ReolinkAdapter {
    token: Option<SessionToken>,
    logging_in: bool,
    /// 缓存的配置分组（Isp、Osd、Enc ...）
    groups: HashMap<String, Value>,
    /// 等待分组读取后再写入的修改
    pending_sets: HashMap<String, Vec<(&'static str, Value)>>,
    /// 因会话失效等待重发的命令：(cmd 查询串, 请求体)
    pending_retry: Vec<(String, String)>,
    /// 已重发过一次的命令
    retried: Vec<String>,
    /// 最近一次发出的命令请求体，按 cmd 查询串索引
    issued: HashMap<String, String>,
}

impl ReolinkAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(device: &Device) -> u32 {
        device.nvr_channel.saturating_sub(1)
    }

    fn login_request(device: &Device) -> VendorRequest {
        let body = json!([{
            "cmd": "Login",
            "action": 0,
            "param": { "User": { "userName": device.username, "password": device.password } }
        }]);
        VendorRequest::post_json(format!("{}cmd=Login", API), body.to_string())
    }

    fn authed(&self, cmd: &str, body: String) -> VendorRequest {
        let token = self
            .token
            .as_ref()
            .map(|t| t.token.as_str())
            .unwrap_or_default();
        let query = if cmd.is_empty() {
            format!("token={}", token)
        } else {
            format!("{}&token={}", cmd, token)
        };
        VendorRequest::post_json(format!("{}{}", API, query), body)
    }

    fn send_command(&mut self, cmd: &str, body: String, ctx: &mut AdapterContext<'_>) {
        self.issued.insert(cmd.to_string(), body.clone());
        if self.token.is_none() {
            self.pending_retry.push((cmd.to_string(), body));
            self.login(ctx);
        } else {
            ctx.send(self.authed(cmd, body));
        }
    }

    fn login(&mut self, ctx: &mut AdapterContext<'_>) {
        if !self.logging_in {
            self.logging_in = true;
            ctx.send(Self::login_request(ctx.device));
        }
    }

    fn batch_body(device: &Device, commands: &[&str]) -> String {
        let param = json!({ "channel": Self::channel(device) });
        let list: Vec<Value> = commands
            .iter()
            .map(|cmd| json!({ "cmd": cmd, "action": 1, "param": param }))
            .collect();
        Value::Array(list).to_string()
    }

    /// 目标 URL 中去掉 token 后的 cmd 查询串
    fn command_of(target: &str) -> String {
        let query = target.split_once('?').map(|(_, q)| q).unwrap_or_default();
        query
            .split('&')
            .filter(|part| !part.starts_with("token="))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn accept_token(&mut self, root: &Value) -> Result<()> {
        let token = &root["value"]["Token"];
        let name = token["name"]
            .as_str()
            .ok_or_else(|| CameraError::protocol("login reply has no token"))?;
        let lease = token["leaseTime"].as_u64().unwrap_or(3600);
        self.token = Some(SessionToken::new(name, Duration::from_secs(lease)));
        self.logging_in = false;
        Ok(())
    }

    fn flush_retries(&mut self, ctx: &mut AdapterContext<'_>) {
        for (cmd, body) in std::mem::take(&mut self.pending_retry) {
            ctx.send(self.authed(&cmd, body));
        }
    }

    fn emit_group(&self, group: &str, ctx: &mut AdapterContext<'_>) {
        let Some(value) = self.groups.get(group) else {
            return;
        };
        for (endpoint, config) in endpoint_table().iter().filter(|(_, c)| c.group == group) {
            if let Some(field) = value.pointer(&pointer(config.path)) {
                ctx.attribute(endpoint, field.clone());
            }
        }
    }

    fn write_group(&mut self, group: &str, changes: Vec<(&'static str, Value)>, ctx: &mut AdapterContext<'_>) {
        let Some(current) = self.groups.get_mut(group) else {
            return;
        };
        for (path, value) in changes {
            match current.pointer_mut(&pointer(path)) {
                Some(slot) => *slot = value,
                None => debug!(device_id = %ctx.device.id, group = group, path = path, "Setting path missing"),
            }
        }
        let cmd = format!("Set{}", group);
        let body = json!([{ "cmd": cmd, "action": 0, "param": { group: current.clone() } }]).to_string();
        self.send_command(&format!("cmd={}", cmd), body, ctx);
    }

    fn handle_root(&mut self, target: &str, root: &Value, ctx: &mut AdapterContext<'_>) {
        let cmd = root["cmd"].as_str().unwrap_or_default().to_string();
        let command = Self::command_of(target);

        if let Some(error) = root.get("error").filter(|e| !e.is_null()) {
            let code = error["rspCode"].as_i64().unwrap_or_default();
            let detail = error["detail"].as_str().unwrap_or("unknown error").to_string();
            if code == RSP_INVALID_TOKEN {
                self.token = None;
                if self.pending_retry.iter().any(|(c, _)| *c == command) {
                    return;
                }
                if self.retried.contains(&command) {
                    warn!(device_id = %ctx.device.id, cmd = %cmd, "Command failed again after relogin");
                    ctx.reject(detail);
                    return;
                }
                info!(device_id = %ctx.device.id, "Session token rejected, logging in again");
                if let Some(body) = self.issued.get(&command).cloned() {
                    self.retried.push(command.clone());
                    self.pending_retry.push((command, body));
                }
                self.login(ctx);
                return;
            }
            if cmd == "Login" {
                self.logging_in = false;
            }
            if cmd.starts_with("Set") || cmd == "Login" {
                ctx.reject(format!("{} (rspCode {})", detail, code));
            } else {
                debug!(device_id = %ctx.device.id, cmd = %cmd, code = code, "Camera returned error: {}", detail);
            }
            return;
        }
        self.retried.retain(|c| *c != command);

        match cmd.as_str() {
            "Login" => match self.accept_token(root) {
                Ok(()) => self.flush_retries(ctx),
                Err(e) => debug!(device_id = %ctx.device.id, "Invalid login reply: {}", e),
            },
            "GetIrLights" => {
                let state = root["value"]["IrLights"]["state"].as_str().unwrap_or_default();
                ctx.attribute("auto_ir_led", state.eq_ignore_ascii_case("auto"));
            }
            "GetDevInfo" => {
                let info = &root["value"]["DevInfo"];
                for (field, name) in [("model", "model"), ("hardVer", "hardware_id"), ("firmVer", "firmware")] {
                    if let Some(value) = info[field].as_str().filter(|v| !v.is_empty()) {
                        ctx.attribute(name, value);
                    }
                }
            }
            "GetMdState" => {
                if let Some(state) = root["value"]["state"].as_i64() {
                    ctx.alarm(AlarmKind::Motion, state == 1);
                }
            }
            cmd if cmd.starts_with("Get") => {
                let group = &cmd[3..];
                let Some(value) = root["value"].get(group) else {
                    debug!(device_id = %ctx.device.id, cmd = cmd, "Reply without group value");
                    return;
                };
                self.groups.insert(group.to_string(), value.clone());
                if let Some(range) = root.get("range").and_then(|r| r.get(group)) {
                    ctx.attribute(&format!("{}_range", group.to_lowercase()), range.clone());
                }
                self.emit_group(group, ctx);
                if let Some(changes) = self.pending_sets.remove(group) {
                    self.write_group(group, changes, ctx);
                }
            }
            cmd if cmd.starts_with("Set") => {
                self.emit_group(&cmd[3..], ctx);
            }
            _ => debug!(device_id = %ctx.device.id, cmd = %cmd, "Unhandled reply"),
        }
    }
}

impl BrandAdapter for ReolinkAdapter {
    fn brand(&self) -> Brand {
        Brand::Reolink
    }

    fn handshake(&self, device: &Device) -> Option<VendorRequest> {
        Some(Self::login_request(device))
    }

    fn verify_handshake(&mut self, reply: &VendorReply, _ctx: &mut AdapterContext<'_>) -> Result<()> {
        if !reply.is_success() {
            return Err(CameraError::protocol(format!("login returned status {}", reply.status)));
        }
        let roots: Value = serde_json::from_str(&reply.body)
            .map_err(|e| CameraError::protocol(format!("login reply is not JSON: {}", e)))?;
        let root = &roots[0];
        if let Some(error) = root.get("error").filter(|e| !e.is_null()) {
            return Err(CameraError::auth(format!(
                "login failed: {}",
                error["detail"].as_str().unwrap_or("unknown error")
            )));
        }
        self.accept_token(root)
    }

    fn on_connected(&mut self, ctx: &mut AdapterContext<'_>) {
        let body = Self::batch_body(
            ctx.device,
            &["GetDevInfo", "GetIrLights", "GetOsd", "GetEnc", "GetImage", "GetIsp"],
        );
        self.send_command("", body, ctx);
    }

    fn poll_camera(&mut self, ctx: &mut AdapterContext<'_>) {
        let body = Self::batch_body(ctx.device, &["GetMdState"]);
        self.send_command("cmd=GetMdState", body, ctx);
    }

    fn tick(&mut self, ctx: &mut AdapterContext<'_>) {
        if self.token.as_ref().map(|t| t.needs_refresh()).unwrap_or(false) {
            debug!(device_id = %ctx.device.id, "Session lease running out, logging in again");
            self.login(ctx);
        }
    }

    fn ingest(&mut self, target: &str, body: &str, ctx: &mut AdapterContext<'_>) {
        let roots: Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(_) => {
                debug!(device_id = %ctx.device.id, "Non-JSON reply for {}", target);
                if !body.trim().is_empty() {
                    ctx.malformed("non-JSON reply");
                }
                return;
            }
        };
        let Some(list) = roots.as_array() else {
            debug!(device_id = %ctx.device.id, "Unexpected reply shape for {}", target);
            ctx.malformed("unexpected reply shape");
            return;
        };
        for root in list {
            self.handle_root(target, root, ctx);
        }
        if !self.pending_retry.is_empty() && self.token.is_some() {
            self.flush_retries(ctx);
        }
    }

    fn build_command(&mut self, command: &CameraCommand, ctx: &mut AdapterContext<'_>) -> Result<()> {
        match command {
            CameraCommand::SetSetting { endpoint, value } => {
                let config = endpoint_table()
                    .get(endpoint.as_str())
                    .copied()
                    .ok_or_else(|| CameraError::Unsupported(format!("endpoint {}", endpoint)))?;
                if !config.writable {
                    return Err(CameraError::config(format!("endpoint {} is read-only", endpoint)));
                }
                let value = coerce(config.kind, value).ok_or_else(|| {
                    CameraError::config(format!("invalid value {} for endpoint {}", value, endpoint))
                })?;

                if self.groups.contains_key(config.group) {
                    self.write_group(config.group, vec![(config.path, value)], ctx);
                } else {
                    let first = !self.pending_sets.contains_key(config.group);
                    self.pending_sets
                        .entry(config.group.to_string())
                        .or_default()
                        .push((config.path, value));
                    if first {
                        let cmd = format!("Get{}", config.group);
                        let body = Self::batch_body(ctx.device, &[cmd.as_str()]);
                        self.send_command(&format!("cmd={}", cmd), body, ctx);
                    }
                }
            }
            CameraCommand::AutoIrLed(on) | CameraCommand::EnableIrLed(on) => {
                let body = json!([{
                    "cmd": "SetIrLights",
                    "action": 0,
                    "param": { "IrLights": { "channel": Self::channel(ctx.device), "state": if *on { "Auto" } else { "Off" } } }
                }]);
                self.send_command("cmd=SetIrLights", body.to_string(), ctx);
                ctx.attribute("auto_ir_led", *on);
            }
            other => return Err(CameraError::Unsupported(other.name().to_string())),
        }
        Ok(())
    }

    fn refresh_requests(&self, device: &Device) -> Vec<VendorRequest> {
        if self.token.is_none() {
            return Vec::new();
        }
        vec![self.authed(
            "cmd=GetPerformance",
            Self::batch_body(device, &["GetPerformance"]),
        )]
    }

    fn snapshot_url(&self, device: &Device) -> Option<String> {
        Some(format!(
            "{}cmd=Snap&channel={}&rs=flux&user={}&password={}",
            API,
            Self::channel(device),
            encode_query_value(&device.username),
            encode_query_value(&device.password)
        ))
    }

    fn ffmpeg_input(&self, device: &Device) -> Option<String> {
        Some(rtsp_url(
            device,
            &format!("/h264Preview_{:02}_main", device.nvr_channel),
        ))
    }
}
