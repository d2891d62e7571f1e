//! 速率限制器 - 固定窗口准入控制
//!
//! 每个 key（事件类型，或事件类型 + payload 字段）一个计数器 + 窗口起始时间，
//! 窗口过期后重置。计数器在同一把锁内检查并递增，并发准入不会丢失更新。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::event_type::RateLimitPolicy;

/// 每 N 次准入检查清理一次过期窗口
const CLEANUP_CHECK_INTERVAL: usize = 256;

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
struct FixedWindow {
    started: Instant,
    window: Duration,
    count: u32,
}

impl FixedWindow {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.started) >= self.window
    }
}

/// 速率限制器
pub struct RateLimiter {
    windows: Mutex<HashMap<String, FixedWindow>>,
    checks: AtomicUsize,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            checks: AtomicUsize::new(0),
        }
    }

    /// 尝试准入
    pub fn try_admit(&self, key: &str, policy: &RateLimitPolicy) -> Admission {
        self.try_admit_at(key, policy, Instant::now())
    }

    /// 尝试准入（带时间戳，用于测试）
    pub fn try_admit_at(&self, key: &str, policy: &RateLimitPolicy, now: Instant) -> Admission {
        if self.checks.fetch_add(1, Ordering::Relaxed) % CLEANUP_CHECK_INTERVAL == CLEANUP_CHECK_INTERVAL - 1 {
            self.cleanup_at(now);
        }

        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let entry = windows.entry(key.to_string()).or_insert_with(|| FixedWindow {
            started: now,
            window: policy.window(),
            count: 0,
        });

        if entry.expired(now) {
            entry.started = now;
            entry.window = policy.window();
            entry.count = 0;
        }

        if entry.count >= policy.max_requests {
            let retry_after = entry.window.saturating_sub(now.duration_since(entry.started));
            debug!(key = %key, count = entry.count, "Rate limit rejected");
            return Admission::Rejected { retry_after };
        }

        entry.count += 1;
        Admission::Allowed {
            remaining: policy.max_requests - entry.count,
        }
    }

    /// 清理过期的窗口
    pub fn cleanup(&self) {
        self.cleanup_at(Instant::now());
    }

    fn cleanup_at(&self, now: Instant) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.retain(|_, w| !w.expired(now));
    }

    /// 当前跟踪的 key 数量
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
