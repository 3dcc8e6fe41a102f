use bytes::{Bytes, BytesMut};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// 当前快照
///
/// 网络接收路径写入、HTTP 服务路径读取，读写都在锁内完成
#[derive(Debug)]
pub struct SnapshotBuffer {
    current: Mutex<Option<(Bytes, Instant)>>,
    /// 最近一次被认领的刷新时间，多个观看者共用一次抓取
    refresh_claimed: Mutex<Option<Instant>>,
    version: watch::Sender<u64>,
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBuffer {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            current: Mutex::new(None),
            refresh_claimed: Mutex::new(None),
            version,
        }
    }

    /// 替换当前快照并唤醒等待者
    pub fn publish(&self, image: Bytes) {
        if let Ok(mut current) = self.current.lock() {
            *current = Some((image, Instant::now()));
        }
        self.version.send_modify(|version| *version += 1);
    }

    pub fn latest(&self) -> Option<Bytes> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|(image, _)| image.clone()))
    }

    pub fn age(&self) -> Option<Duration> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|(_, at)| at.elapsed()))
    }

    /// 当前快照已超过 `interval` 且这一周期内还没有人刷新时返回 true，调用方负责抓取
    pub fn claim_refresh(&self, interval: Duration) -> bool {
        if self.age().map(|age| age < interval).unwrap_or(false) {
            return false;
        }
        let Ok(mut claimed) = self.refresh_claimed.lock() else {
            return false;
        };
        match *claimed {
            Some(at) if at.elapsed() < interval => false,
            _ => {
                *claimed = Some(Instant::now());
                true
            }
        }
    }

    /// 订阅快照更新，需在触发生成之前调用
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// 等待下一张快照
    pub async fn wait_next(&self, mut updates: watch::Receiver<u64>, timeout: Duration) -> Option<Bytes> {
        match tokio::time::timeout(timeout, updates.changed()).await {
            Ok(Ok(())) => self.latest(),
            _ => None,
        }
    }
}

/// 按请求累积推送的图片分块，内容完整后才交给 `SnapshotBuffer`
#[derive(Debug)]
pub struct FrameAssembler {
    buffer: BytesMut,
    expected: Option<usize>,
    limit: usize,
}

impl FrameAssembler {
    /// 有 Content-Length 时按其分配，否则使用默认容量并允许增长到四倍
    pub fn new(content_length: Option<usize>, default_capacity: usize) -> Self {
        let capacity = content_length.unwrap_or(default_capacity);
        Self {
            buffer: BytesMut::with_capacity(capacity),
            expected: content_length,
            limit: content_length.unwrap_or(default_capacity.saturating_mul(4)),
        }
    }

    /// 追加分块，超过上限时返回 false
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        if self.buffer.len() + chunk.len() > self.limit {
            return false;
        }
        self.buffer.extend_from_slice(chunk);
        true
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// 完成标记到达；内容不足 Content-Length 时丢弃
    pub fn finish(self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        match self.expected {
            Some(expected) if expected != self.buffer.len() => None,
            _ => Some(self.buffer.freeze()),
        }
    }
}
