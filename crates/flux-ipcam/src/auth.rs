use crate::error::{CameraError, Result};
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// nc 超过该值后回绕到 1
const NC_WRAP: u32 = 125;

/// 会话剩余时间低于该值时重新登录
pub const SESSION_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Digest 质询参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
    pub stale: bool,
}

/// 当前使用的认证方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    Basic,
    Digest(DigestChallenge),
}

/// 请求需要附带的认证信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    None,
    /// 由 HTTP 客户端生成 Basic 头
    Basic,
    /// 完整的 Authorization 头部值
    Digest(String),
}

/// 单个设备的 HTTP 认证状态
#[derive(Debug, Clone)]
pub struct AuthState {
    username: String,
    password: String,
    scheme: AuthScheme,
    nc: u32,
}

impl AuthState {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let scheme = if username.is_empty() {
            AuthScheme::None
        } else {
            AuthScheme::Basic
        };
        Self {
            username,
            password: password.into(),
            scheme,
            nc: 0,
        }
    }

    pub fn scheme(&self) -> &AuthScheme {
        &self.scheme
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// 为一次请求生成认证信息，`uri` 为路径加查询串
    pub fn authorization(&mut self, method: &str, uri: &str) -> Authorization {
        match &self.scheme {
            AuthScheme::None => Authorization::None,
            AuthScheme::Basic => Authorization::Basic,
            AuthScheme::Digest(challenge) => {
                self.nc = if self.nc >= NC_WRAP { 1 } else { self.nc + 1 };
                let header = digest_header(
                    &self.username,
                    &self.password,
                    method,
                    uri,
                    challenge,
                    self.nc,
                    &new_cnonce(),
                );
                Authorization::Digest(header)
            }
        }
    }

    /// 处理 401 回复，返回 Ok 表示应当重发一次
    pub fn on_unauthorized(&mut self, www_authenticate: Option<&str>) -> Result<()> {
        let header = www_authenticate
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                CameraError::auth("camera gave no WWW-Authenticate header, login details are wrong")
            })?;

        if self.password.is_empty() {
            return Err(CameraError::auth(
                "camera gave a 401 reply, a password is required",
            ));
        }

        if header.len() >= 5 && header[..5].eq_ignore_ascii_case("basic") {
            return match self.scheme {
                AuthScheme::Digest(_) => Err(CameraError::auth(
                    "camera requested basic auth while digest is in use",
                )),
                AuthScheme::Basic => Err(CameraError::auth("basic credentials rejected")),
                AuthScheme::None => {
                    debug!("Switching to basic auth");
                    self.scheme = AuthScheme::Basic;
                    Ok(())
                }
            };
        }

        let challenge = parse_challenge(header).ok_or_else(|| {
            CameraError::auth(format!("invalid WWW-Authenticate header: {}", header))
        })?;

        if let AuthScheme::Digest(current) = &self.scheme {
            if current.nonce == challenge.nonce && !challenge.stale {
                return Err(CameraError::auth("digest credentials rejected"));
            }
        }

        debug!(realm = %challenge.realm, stale = challenge.stale, "Using digest auth");
        self.scheme = AuthScheme::Digest(challenge);
        self.nc = 0;
        Ok(())
    }
}

/// 解析 `WWW-Authenticate: Digest ...`
pub fn parse_challenge(value: &str) -> Option<DigestChallenge> {
    let params = parse_auth_params(value)?;
    let realm = params.get("realm").filter(|r| !r.is_empty())?.clone();
    let nonce = params.get("nonce").cloned().unwrap_or_default();
    let qop = params.get("qop").and_then(|qop| {
        let options: Vec<&str> = qop.split(',').map(str::trim).collect();
        if options.contains(&"auth") {
            Some("auth".to_string())
        } else {
            options.first().filter(|o| !o.is_empty()).map(|o| o.to_string())
        }
    });

    Some(DigestChallenge {
        realm,
        nonce,
        opaque: params.get("opaque").filter(|o| !o.is_empty()).cloned(),
        qop,
        stale: params
            .get("stale")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })
}

/// 解析认证头部为键值对，支持引号内的逗号
fn parse_auth_params(value: &str) -> Option<HashMap<String, String>> {
    let trimmed = value.trim();
    let rest = match trimmed.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
        _ => trimmed,
    };

    let mut map = HashMap::new();
    let mut key = String::new();
    let mut val = String::new();
    let mut in_value = false;
    let mut in_quotes = false;

    for c in rest.chars() {
        match c {
            '"' if in_value => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                if !key.trim().is_empty() {
                    map.insert(key.trim().to_ascii_lowercase(), val.trim().to_string());
                }
                key.clear();
                val.clear();
                in_value = false;
            }
            '=' if !in_value => in_value = true,
            _ if in_value => val.push(c),
            _ => key.push(c),
        }
    }
    if !key.trim().is_empty() {
        map.insert(key.trim().to_ascii_lowercase(), val.trim().to_string());
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

fn new_cnonce() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// 计算 Digest 响应值
pub fn compute_digest_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    nc: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    match &challenge.qop {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, challenge.nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    }
}

fn digest_header(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &DigestChallenge,
    nc: u32,
    cnonce: &str,
) -> String {
    let nc = format!("{:08x}", nc);
    let response = compute_digest_response(username, password, method, uri, challenge, &nc, cnonce);

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        username, challenge.realm, challenge.nonce, uri
    );
    if let Some(qop) = &challenge.qop {
        header.push_str(&format!(", cnonce=\"{}\", nc={}, qop={}", cnonce, nc, qop));
    }
    header.push_str(&format!(", response=\"{}\"", response));
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    header
}

/// 带租期的会话令牌（Reolink 等）
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    obtained_at: Instant,
    lease: Duration,
}

impl SessionToken {
    pub fn new(token: impl Into<String>, lease: Duration) -> Self {
        Self {
            token: token.into(),
            obtained_at: Instant::now(),
            lease,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.lease.saturating_sub(self.obtained_at.elapsed())
    }

    /// 剩余租期不足时需要重新登录
    pub fn needs_refresh(&self) -> bool {
        self.remaining() < SESSION_REFRESH_MARGIN
    }
}
