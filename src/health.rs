//! Provider 健康跟踪
//!
//! 每个 (渠道, provider) 一条记录。连续失败达到阈值（默认 5）后标记为不健康，
//! 一次成功即恢复。后台循环周期调用 `health_check()`，独立于投递流量校正状态。
//! 健康状态只作为路由参考，不会直接拒绝 emit。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::provider::ProviderRegistry;
use crate::storage::{Storage, PROVIDER_HEALTH};

/// 默认连续失败阈值
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// 健康记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealthRecord {
    pub channel: String,
    pub provider: String,
    pub is_healthy: bool,
    pub consecutive_failures: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProviderHealthRecord {
    fn new(channel: &str, provider: &str) -> Self {
        Self {
            channel: channel.to_string(),
            provider: provider.to_string(),
            is_healthy: true,
            consecutive_failures: 0,
            last_check_at: None,
            last_error: None,
        }
    }

    pub fn key(&self) -> String {
        health_key(&self.channel, &self.provider)
    }
}

pub fn health_key(channel: &str, provider: &str) -> String {
    format!("{}:{}", channel, provider)
}

/// Provider 健康跟踪器
///
/// 所有修改在同一把锁内完成，并发上报成功/失败不会丢失更新。
pub struct ProviderHealthTracker {
    records: Mutex<HashMap<(String, String), ProviderHealthRecord>>,
    failure_threshold: u32,
}

impl ProviderHealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// 记录一次成功：清零连续失败，恢复健康
    pub fn record_success(&self, channel: &str, provider: &str) -> ProviderHealthRecord {
        self.update(channel, provider, |record| {
            if !record.is_healthy {
                info!(channel = %record.channel, provider = %record.provider, "Provider recovered");
            }
            record.consecutive_failures = 0;
            record.is_healthy = true;
        })
    }

    /// 记录一次失败：连续失败达到阈值时标记为不健康
    pub fn record_failure(&self, channel: &str, provider: &str, error: &str) -> ProviderHealthRecord {
        let threshold = self.failure_threshold;
        self.update(channel, provider, |record| {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.last_error = Some(error.to_string());
            if record.is_healthy && record.consecutive_failures >= threshold {
                warn!(
                    channel = %record.channel,
                    provider = %record.provider,
                    failures = record.consecutive_failures,
                    "Provider marked unhealthy"
                );
                record.is_healthy = false;
            }
        })
    }

    /// 用健康检查结果校正状态
    pub fn reconcile(&self, channel: &str, provider: &str, healthy: bool) -> ProviderHealthRecord {
        self.update(channel, provider, |record| {
            if healthy {
                if !record.is_healthy {
                    info!(channel = %record.channel, provider = %record.provider, "Health check passed, provider restored");
                }
                record.is_healthy = true;
                record.consecutive_failures = 0;
            } else {
                if record.is_healthy {
                    warn!(channel = %record.channel, provider = %record.provider, "Health check failed, provider marked unhealthy");
                }
                record.is_healthy = false;
                record.last_error = Some("health check failed".to_string());
            }
        })
    }

    /// 未知 provider 视为健康
    pub fn is_healthy(&self, channel: &str, provider: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(&(channel.to_string(), provider.to_string()))
            .map_or(true, |r| r.is_healthy)
    }

    pub fn get(&self, channel: &str, provider: &str) -> Option<ProviderHealthRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(&(channel.to_string(), provider.to_string())).cloned()
    }

    /// 所有记录（按渠道、provider 排序）
    pub fn snapshot(&self) -> Vec<ProviderHealthRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| (&a.channel, &a.provider).cmp(&(&b.channel, &b.provider)));
        all
    }

    fn update<F>(&self, channel: &str, provider: &str, f: F) -> ProviderHealthRecord
    where
        F: FnOnce(&mut ProviderHealthRecord),
    {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry((channel.to_string(), provider.to_string()))
            .or_insert_with(|| ProviderHealthRecord::new(channel, provider));
        f(record);
        record.last_check_at = Some(Utc::now());
        record.clone()
    }
}

impl Default for ProviderHealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

/// 执行一轮健康检查
pub async fn check_all(
    tracker: &ProviderHealthTracker,
    providers: &ProviderRegistry,
    storage: &dyn Storage,
    timeout: Duration,
) {
    for (channel, provider) in providers.all() {
        let healthy = match tokio::time::timeout(timeout, provider.health_check()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                debug!(channel = %channel, provider = provider.name(), "Health check timed out");
                false
            }
        };

        let record = tracker.reconcile(&channel, provider.name(), healthy);
        persist_record(storage, &record).await;
    }
}

/// 启动后台健康检查循环，收到 shutdown 信号后退出
pub fn spawn_health_checks(
    tracker: Arc<ProviderHealthTracker>,
    providers: Arc<ProviderRegistry>,
    storage: Arc<dyn Storage>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回，跳过，避免启动时立刻检查
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    check_all(&tracker, &providers, storage.as_ref(), interval).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Health check loop stopped");
                        break;
                    }
                }
            }
        }
    })
}

/// 持久化健康记录（失败只记日志）
pub async fn persist_record(storage: &dyn Storage, record: &ProviderHealthRecord) {
    let value = match serde_json::to_value(record) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Failed to serialize provider health record");
            return;
        }
    };
    if let Err(e) = storage.put(PROVIDER_HEALTH, &record.key(), value).await {
        warn!(key = %record.key(), error = %e, "Failed to persist provider health record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChannelProvider, DeliveryContext, SendOutcome};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_unhealthy_after_threshold() {
        let tracker = ProviderHealthTracker::new(3);
        tracker.record_failure("email", "smtp", "e1");
        tracker.record_failure("email", "smtp", "e2");
        assert!(tracker.is_healthy("email", "smtp"));

        let record = tracker.record_failure("email", "smtp", "e3");
        assert!(!record.is_healthy);
        assert_eq!(record.consecutive_failures, 3);
        assert_eq!(record.last_error.as_deref(), Some("e3"));
        assert!(!tracker.is_healthy("email", "smtp"));
    }

    #[test]
    fn test_success_resets() {
        let tracker = ProviderHealthTracker::new(2);
        tracker.record_failure("sms", "twilio", "x");
        tracker.record_failure("sms", "twilio", "x");
        assert!(!tracker.is_healthy("sms", "twilio"));

        let record = tracker.record_success("sms", "twilio");
        assert!(record.is_healthy);
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_check_at.is_some());
    }

    #[test]
    fn test_unknown_provider_is_healthy() {
        let tracker = ProviderHealthTracker::default();
        assert_eq!(tracker.failure_threshold(), DEFAULT_FAILURE_THRESHOLD);
        assert!(tracker.is_healthy("chat", "anything"));
        assert!(tracker.get("chat", "anything").is_none());
    }

    #[test]
    fn test_concurrent_failures_not_lost() {
        let tracker = Arc::new(ProviderHealthTracker::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.record_failure("webhook", "hook", "boom");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.get("webhook", "hook").unwrap().consecutive_failures, 400);
    }

    struct ToggleProvider {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl ChannelProvider for ToggleProvider {
        fn name(&self) -> &str {
            "toggle"
        }

        async fn send(&self, _payload: &serde_json::Value, _ctx: &DeliveryContext) -> anyhow::Result<SendOutcome> {
            Ok(SendOutcome::sent())
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_check_all_reconciles_and_persists() {
        let provider = Arc::new(ToggleProvider {
            healthy: AtomicBool::new(false),
        });
        let mut registry = ProviderRegistry::new();
        registry.register("chat", provider.clone());
        let tracker = ProviderHealthTracker::new(5);
        let storage = MemoryStorage::new();

        check_all(&tracker, &registry, &storage, Duration::from_secs(1)).await;
        assert!(!tracker.is_healthy("chat", "toggle"));
        let stored = storage.get(PROVIDER_HEALTH, "chat:toggle").await.unwrap().unwrap();
        assert_eq!(stored["is_healthy"], false);

        provider.healthy.store(true, Ordering::SeqCst);
        check_all(&tracker, &registry, &storage, Duration::from_secs(1)).await;
        assert!(tracker.is_healthy("chat", "toggle"));
    }
}
