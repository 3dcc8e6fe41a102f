#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use flux_config::GlobalConfig;
use flux_ipcam::{
    CameraError, CameraTransport, DeviceEvent, Result, TransportFactory, VendorReply,
    VendorRequest,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// 内存中的模拟摄像头
///
/// 按目标地址的子串匹配预设回复，未匹配时返回 200 空内容
#[derive(Default)]
pub struct MockCamera {
    replies: Mutex<Vec<(String, VendorReply)>>,
    requests: Mutex<Vec<VendorRequest>>,
    streams: Mutex<Vec<(String, mpsc::Sender<String>)>>,
    image: Mutex<Option<Bytes>>,
    unreachable: AtomicBool,
    unauthorized: AtomicBool,
}

impl MockCamera {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> TransportFactory {
        let camera = self.clone();
        Arc::new(move |_device| Ok(camera.clone() as Arc<dyn CameraTransport>))
    }

    pub fn respond(&self, pattern: &str, reply: VendorReply) {
        let mut replies = self.replies.lock().unwrap();
        replies.retain(|(existing, _)| existing != pattern);
        replies.push((pattern.to_string(), reply));
    }

    pub fn set_image(&self, image: &'static [u8]) {
        *self.image.lock().unwrap() = Some(Bytes::from_static(image));
    }

    pub fn set_unreachable(&self, value: bool) {
        self.unreachable.store(value, Ordering::SeqCst);
    }

    pub fn set_unauthorized(&self, value: bool) {
        self.unauthorized.store(value, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<VendorRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.target.contains(pattern))
            .count()
    }

    pub fn stream_open(&self, pattern: &str) -> bool {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .any(|(target, tx)| target.contains(pattern) && !tx.is_closed())
    }

    /// 向匹配的长连接推送片段
    pub async fn push(&self, pattern: &str, chunk: &str) {
        let sender = self
            .streams
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(target, tx)| target.contains(pattern) && !tx.is_closed())
            .map(|(_, tx)| tx.clone())
            .expect("stream is not open");
        sender.send(chunk.to_string()).await.unwrap();
    }

    fn check(&self, request: &VendorRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CameraError::transport("connection refused"));
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(CameraError::auth("camera rejected credentials"));
        }
        Ok(())
    }
}

#[async_trait]
impl CameraTransport for MockCamera {
    async fn execute(&self, request: &VendorRequest) -> Result<VendorReply> {
        self.check(request)?;
        let replies = self.replies.lock().unwrap();
        Ok(replies
            .iter()
            .find(|(pattern, _)| request.target.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| VendorReply::ok("")))
    }

    async fn open_stream(&self, request: &VendorRequest) -> Result<mpsc::Receiver<String>> {
        self.check(request)?;
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().push((request.target.clone(), tx));
        Ok(rx)
    }

    async fn fetch_bytes(&self, request: &VendorRequest) -> Result<Bytes> {
        self.check(request)?;
        self.image
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CameraError::transport("snapshot returned status 404"))
    }
}

/// 秒级周期、首次立即连接的配置
pub fn fast_config(media_root: &Path) -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.engine.reconnect_interval_secs = 1;
    config.engine.initial_delay_secs = 0;
    config.engine.housekeeping_interval_secs = 1;
    config.engine.request_timeout_secs = 2;
    config.media.root_dir = media_root.to_path_buf();
    config.media.hls_startup_delay_ms = 10;
    config.ffmpeg.path = "/nonexistent/ffmpeg".into();
    config
}

/// 只会一直运行的转码程序替身，忽略所有参数
pub fn idle_transcoder(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-ffmpeg.sh");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub async fn wait_for<F>(rx: &mut broadcast::Receiver<DeviceEvent>, mut matches: F) -> DeviceEvent
where
    F: FnMut(&DeviceEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(8), async {
        loop {
            let event = rx.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not received in time")
}

pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(8), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met in time")
}
