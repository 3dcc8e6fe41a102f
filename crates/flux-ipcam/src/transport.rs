use crate::auth::{AuthState, Authorization};
use crate::error::{CameraError, Result};
use crate::model::Device;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Response, Url};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// 查询串中需要隐藏的参数
const SECRET_KEYS: [&str; 5] = ["pwd", "password", "token", "usr", "user"];

/// 日志中隐藏查询串里的凭据（Foscam、Reolink 把凭据放在 URL 上）
pub fn redact_query(target: &str) -> String {
    let Some((path, query)) = target.split_once('?') else {
        return target.to_string();
    };
    let parts: Vec<String> = query
        .split('&')
        .map(|part| match part.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key) => format!("{}=***", key),
            _ => part.to_string(),
        })
        .collect();
    format!("{}?{}", path, parts.join("&"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
        }
    }
}

/// 发往摄像头的请求，`target` 为路径或完整 URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorRequest {
    pub method: Method,
    pub target: String,
    pub body: Option<String>,
    pub content_type: Option<String>,
}

impl VendorRequest {
    pub fn get(target: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            target: target.into(),
            body: None,
            content_type: None,
        }
    }

    pub fn put_xml(target: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::Put,
            target: target.into(),
            body: Some(body.into()),
            content_type: Some("application/xml; charset=utf-8".to_string()),
        }
    }

    pub fn post_json(target: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            target: target.into(),
            body: Some(body.into()),
            content_type: Some("application/json".to_string()),
        }
    }

    pub fn post_soap(target: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::Post,
            target: target.into(),
            body: Some(body.into()),
            content_type: Some("application/soap+xml; charset=utf-8".to_string()),
        }
    }
}

impl fmt::Display for VendorRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.as_str(), redact_query(&self.target))
    }
}

/// 摄像头回复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorReply {
    pub status: u16,
    pub body: String,
}

impl VendorReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 与单个摄像头通信的传输层
#[async_trait]
pub trait CameraTransport: Send + Sync {
    /// 发送请求并读取完整回复；401 时按质询重发一次
    async fn execute(&self, request: &VendorRequest) -> Result<VendorReply>;

    /// 打开长连接，按到达顺序推送回复片段；连接结束时通道关闭
    async fn open_stream(&self, request: &VendorRequest) -> Result<mpsc::Receiver<String>>;

    /// 读取二进制内容（快照图片），非 2xx 视为传输错误
    async fn fetch_bytes(&self, request: &VendorRequest) -> Result<Bytes>;
}

/// 按设备创建传输层，测试中替换为模拟实现
pub type TransportFactory =
    Arc<dyn Fn(&Device) -> Result<Arc<dyn CameraTransport>> + Send + Sync>;

pub fn http_transport_factory(request_timeout: Duration, idle_timeout: Duration) -> TransportFactory {
    Arc::new(move |device: &Device| {
        let transport = HttpTransport::new(device, request_timeout, idle_timeout)?;
        Ok(Arc::new(transport) as Arc<dyn CameraTransport>)
    })
}

/// 基于 reqwest 的 HTTP 传输
pub struct HttpTransport {
    client: Client,
    device: Device,
    auth: Mutex<AuthState>,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(device: &Device, request_timeout: Duration, idle_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            device: device.clone(),
            auth: Mutex::new(AuthState::new(&device.username, &device.password)),
            request_timeout,
            idle_timeout,
        })
    }

    async fn send(&self, request: &VendorRequest, timeout: Option<Duration>) -> Result<Response> {
        let url = Url::parse(&self.device.resolve_url(&request.target))
            .map_err(|e| CameraError::config(format!("invalid url '{}': {}", request.target, e)))?;
        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        for attempt in 0..2 {
            let authorization = self
                .auth
                .lock()
                .await
                .authorization(request.method.as_str(), &uri);

            let mut builder = self.client.request(request.method.into(), url.clone());
            if let Some(timeout) = timeout {
                builder = builder.timeout(timeout);
            }
            builder = match authorization {
                Authorization::None => builder,
                Authorization::Basic => {
                    builder.basic_auth(&self.device.username, Some(&self.device.password))
                }
                Authorization::Digest(header) => builder.header(AUTHORIZATION, header),
            };
            if let Some(content_type) = &request.content_type {
                builder = builder.header(CONTENT_TYPE, content_type.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            debug!(
                target: "ipcam_http",
                device_id = %self.device.id,
                "Sending {} {}",
                request.method.as_str(),
                redact_query(&uri)
            );
            let response = builder.send().await?;

            if response.status().as_u16() != 401 {
                return Ok(response);
            }

            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            if attempt == 0 {
                self.auth.lock().await.on_unauthorized(challenge.as_deref())?;
                debug!(target: "ipcam_http", device_id = %self.device.id, "Replaying request after 401");
            }
        }

        Err(CameraError::auth(format!(
            "camera rejected credentials for {}",
            redact_query(&uri)
        )))
    }
}

#[async_trait]
impl CameraTransport for HttpTransport {
    async fn execute(&self, request: &VendorRequest) -> Result<VendorReply> {
        let response = self.send(request, Some(self.request_timeout)).await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(
            target: "ipcam_http",
            device_id = %self.device.id,
            status = status,
            "Received reply for {}",
            redact_query(&request.target)
        );
        Ok(VendorReply { status, body })
    }

    async fn open_stream(&self, request: &VendorRequest) -> Result<mpsc::Receiver<String>> {
        let mut response = self.send(request, None).await?;
        if !response.status().is_success() {
            return Err(CameraError::transport(format!(
                "{} returned status {}",
                redact_query(&request.target),
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let idle_timeout = self.idle_timeout;
        let device_id = self.device.id.clone();
        let target = redact_query(&request.target);

        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(idle_timeout, response.chunk()).await {
                    Ok(Ok(Some(chunk))) => {
                        let text = String::from_utf8_lossy(&chunk).into_owned();
                        if tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Ok(None)) => {
                        debug!(target: "ipcam_http", device_id = %device_id, "Stream {} closed by camera", target);
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(target: "ipcam_http", device_id = %device_id, "Stream {} failed: {}", target, e);
                        break;
                    }
                    Err(_) => {
                        debug!(target: "ipcam_http", device_id = %device_id, "Stream {} idle, closing", target);
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn fetch_bytes(&self, request: &VendorRequest) -> Result<Bytes> {
        let response = self.send(request, Some(self.request_timeout)).await?;
        if !response.status().is_success() {
            return Err(CameraError::transport(format!(
                "{} returned status {}",
                redact_query(&request.target),
                response.status()
            )));
        }
        Ok(response.bytes().await?)
    }
}
