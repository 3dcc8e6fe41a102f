use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::debug;

pub type ChannelId = u64;

/// 被追踪的请求：目标 URL 对应的连接和最近一次回复
#[derive(Debug, Clone)]
pub struct TrackedRequest {
    pub url: String,
    pub channel: Option<ChannelId>,
    pub reply: Option<String>,
    pub updated_at: Instant,
}

struct OpenChannel {
    url: String,
    open: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

/// 连接存活标记，随读取任务一起销毁
#[derive(Debug)]
pub struct ChannelGuard {
    open: Arc<AtomicBool>,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// 清理结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// 已关闭且无回复的追踪项
    pub reaped: usize,
    /// 因超出上限被主动关闭的连接
    pub closed: usize,
}

/// 请求/连接追踪器
///
/// 供设置的读改写流程读取最近回复，也供维护周期判断长连接是否已断开。
#[derive(Default)]
pub struct RequestTracker {
    entries: DashMap<String, TrackedRequest>,
    channels: DashMap<ChannelId, OpenChannel>,
    next_id: AtomicU64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次请求，已有条目时保留回复
    pub fn track(&self, url: &str, channel: Option<ChannelId>) {
        let mut entry = self
            .entries
            .entry(url.to_string())
            .or_insert_with(|| TrackedRequest {
                url: url.to_string(),
                channel: None,
                reply: None,
                updated_at: Instant::now(),
            });
        if channel.is_some() {
            entry.channel = channel;
        }
        entry.updated_at = Instant::now();
    }

    pub fn store_reply(&self, url: &str, body: impl Into<String>) {
        let body = body.into();
        match self.entries.get_mut(url) {
            Some(mut entry) => {
                entry.reply = Some(body);
                entry.updated_at = Instant::now();
            }
            None => {
                self.entries.insert(
                    url.to_string(),
                    TrackedRequest {
                        url: url.to_string(),
                        channel: None,
                        reply: Some(body),
                        updated_at: Instant::now(),
                    },
                );
            }
        }
    }

    /// 最近一次回复
    pub fn reply(&self, url: &str) -> Option<String> {
        self.entries.get(url).and_then(|entry| entry.reply.clone())
    }

    pub fn get(&self, url: &str) -> Option<TrackedRequest> {
        self.entries.get(url).map(|entry| entry.clone())
    }

    /// 没有条目，或条目的连接已关闭
    pub fn is_stopped(&self, url: &str) -> bool {
        let channel = match self.entries.get(url) {
            Some(entry) => entry.channel,
            None => return true,
        };
        match channel {
            Some(id) => !self.channel_open(id),
            None => true,
        }
    }

    /// 登记一个长连接，返回的标记需交给读取任务持有
    pub fn open_channel(&self, url: &str) -> (ChannelId, ChannelGuard) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let open = Arc::new(AtomicBool::new(true));
        self.channels.insert(
            id,
            OpenChannel {
                url: url.to_string(),
                open: open.clone(),
                abort: None,
            },
        );
        self.track(url, Some(id));
        (id, ChannelGuard { open })
    }

    /// 绑定读取任务，用于主动关闭
    pub fn bind_task(&self, id: ChannelId, abort: AbortHandle) {
        if let Some(mut channel) = self.channels.get_mut(&id) {
            channel.abort = Some(abort);
        }
    }

    pub fn channel_open(&self, id: ChannelId) -> bool {
        self.channels
            .get(&id)
            .map(|channel| channel.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn open_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|channel| channel.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 定期清理
    ///
    /// 先移除连接已关闭且没有回复的条目；若仍打开的连接数超过 `ceiling`，
    /// 关闭所有未被条目引用的连接。
    pub fn sweep(&self, ceiling: usize) -> SweepReport {
        let mut report = SweepReport::default();

        self.channels
            .retain(|_, channel| channel.open.load(Ordering::SeqCst));

        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let open = entry
                .channel
                .map(|id| self.channels.contains_key(&id))
                .unwrap_or(false);
            open || entry.reply.is_some()
        });
        report.reaped = before - self.entries.len();

        if self.channels.len() > ceiling {
            let referenced: Vec<ChannelId> = self
                .entries
                .iter()
                .filter_map(|entry| entry.channel)
                .collect();
            let orphans: Vec<ChannelId> = self
                .channels
                .iter()
                .filter(|channel| !referenced.contains(channel.key()))
                .map(|channel| *channel.key())
                .collect();
            for id in orphans {
                if let Some((_, channel)) = self.channels.remove(&id) {
                    debug!(url = %channel.url, "Closing untracked channel over ceiling");
                    close(channel);
                    report.closed += 1;
                }
            }
        }

        report
    }

    /// 关闭指定 URL 的连接
    pub fn close_url(&self, url: &str) -> bool {
        let channel = self.entries.get_mut(url).and_then(|mut entry| entry.channel.take());
        match channel.and_then(|id| self.channels.remove(&id)) {
            Some((_, channel)) => {
                close(channel);
                true
            }
            None => false,
        }
    }

    /// 关闭全部连接并清空条目（设备停止时调用，可重复调用）
    pub fn close_all(&self) {
        let ids: Vec<ChannelId> = self.channels.iter().map(|c| *c.key()).collect();
        for id in ids {
            if let Some((_, channel)) = self.channels.remove(&id) {
                close(channel);
            }
        }
        self.entries.clear();
    }
}

fn close(channel: OpenChannel) {
    channel.open.store(false, Ordering::SeqCst);
    if let Some(abort) = channel.abort {
        abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reply_roundtrip_keeps_latest() {
        let tracker = RequestTracker::new();
        tracker.track("/ISAPI/System/Video/inputs/channels/1/motionDetection", None);
        assert!(tracker.reply("/ISAPI/System/Video/inputs/channels/1/motionDetection").is_none());

        tracker.store_reply("/ISAPI/System/Video/inputs/channels/1/motionDetection", "<a/>");
        tracker.store_reply("/ISAPI/System/Video/inputs/channels/1/motionDetection", "<b/>");
        assert_eq!(
            tracker.reply("/ISAPI/System/Video/inputs/channels/1/motionDetection").as_deref(),
            Some("<b/>")
        );
    }

    #[test]
    fn test_is_stopped_follows_guard() {
        let tracker = RequestTracker::new();
        assert!(tracker.is_stopped("/alertStream"));

        let (id, guard) = tracker.open_channel("/alertStream");
        assert!(!tracker.is_stopped("/alertStream"));
        assert!(tracker.channel_open(id));

        drop(guard);
        assert!(tracker.is_stopped("/alertStream"));
    }

    #[test]
    fn test_sweep_reaps_closed_without_reply() {
        let tracker = RequestTracker::new();
        let (_, guard) = tracker.open_channel("/closed");
        let (_, _keep) = tracker.open_channel("/open");
        let (_, with_reply) = tracker.open_channel("/answered");
        tracker.store_reply("/answered", "ok");
        drop(guard);
        drop(with_reply);

        let report = tracker.sweep(18);
        assert_eq!(report.reaped, 1);
        assert_eq!(report.closed, 0);
        assert!(tracker.get("/closed").is_none());
        assert!(tracker.get("/open").is_some());
        assert_eq!(tracker.reply("/answered").as_deref(), Some("ok"));
        assert_eq!(tracker.open_count(), 1);
    }

    #[tokio::test]
    async fn test_sweep_closes_untracked_over_ceiling() {
        let tracker = RequestTracker::new();

        let mut guards = Vec::new();
        for i in 0..3 {
            let url = format!("/poll/{}", i);
            let (id, guard) = tracker.open_channel(&url);
            let task = tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
            });
            tracker.bind_task(id, task.abort_handle());
            guards.push((guard, task));
        }
        // 让 /poll/0 的条目指向别的连接，原连接变成未被引用
        tracker.entries.get_mut("/poll/0").unwrap().channel = None;

        let report = tracker.sweep(2);
        assert_eq!(report.closed, 1);
        assert_eq!(tracker.open_count(), 2);

        let (_, first) = guards.remove(0);
        let result = first.await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let tracker = RequestTracker::new();
        let (id, _guard) = tracker.open_channel("/cgi-bin/eventManager.cgi");
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        tracker.bind_task(id, task.abort_handle());

        tracker.close_all();
        tracker.close_all();

        assert!(tracker.is_empty());
        assert!(tracker.is_stopped("/cgi-bin/eventManager.cgi"));
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
