use std::time::{Duration, Instant};

/// 进程重启退避
///
/// 每次快速退出延迟翻倍，直到上限；正常运行一段时间后退出会重置。
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial: Duration,
    max: Duration,
    failures: u32,
    next_allowed: Option<Instant>,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
            next_allowed: None,
        }
    }

    /// 记录一次快速失败，返回下次允许启动前的等待时间
    pub fn record_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let factor = 1u32.checked_shl(self.failures - 1).unwrap_or(u32::MAX);
        let delay = self.initial.saturating_mul(factor).min(self.max);
        self.next_allowed = Some(Instant::now() + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.next_allowed = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// 距离允许重启的剩余时间
    pub fn remaining(&self) -> Option<Duration> {
        let next = self.next_allowed?;
        let now = Instant::now();
        if next > now {
            Some(next - now)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_max() {
        let mut backoff = RestartBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.record_failure(), Duration::from_millis(100));
        assert_eq!(backoff.record_failure(), Duration::from_millis(200));
        assert_eq!(backoff.record_failure(), Duration::from_millis(350));
        assert_eq!(backoff.record_failure(), Duration::from_millis(350));
        assert_eq!(backoff.failures(), 4);
        assert!(backoff.remaining().is_some());
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = RestartBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.record_failure();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.remaining().is_none());
    }

    #[test]
    fn test_many_failures_do_not_overflow() {
        let mut backoff = RestartBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        for _ in 0..100 {
            backoff.record_failure();
        }
        assert_eq!(backoff.record_failure(), Duration::from_secs(60));
    }
}
