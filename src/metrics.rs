//! 指标上报
//!
//! 编排器与队列管理器在这里上报计数、耗时样本与瞬时值，引擎内部不回读。
//! 导出器在 crate 之外实现 `MetricsSink`。

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// 引擎指标接收方，所有方法默认什么都不做
pub trait MetricsSink: Send + Sync {
    /// 一次 `emit` 以 `status` 结束
    fn event_emitted(&self, _event_type: &str, _status: &str) {}

    /// 一个渠道得到最终结果
    fn notification_recorded(&self, _event_type: &str, _channel: &str, _status: &str) {}

    /// 单个渠道的投递耗时（同步为全部尝试，异步为单次尝试）
    fn processing_duration(&self, _event_type: &str, _channel: &str, _elapsed: Duration) {}

    /// 队列中等待的任务数
    fn queue_depth(&self, _queue: &str, _depth: usize) {}

    /// 正在处理任务的 worker 数
    fn active_workers(&self, _queue: &str, _active: usize) {}
}

/// 丢弃所有指标
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// [`InMemoryMetrics`] 的快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// `emitted:<event_type>:<status>` / `notification:<event_type>:<channel>:<status>`
    pub counters: HashMap<String, u64>,
    /// `<event_type>:<channel>` -> 耗时样本（毫秒）
    pub durations_ms: HashMap<String, Vec<u64>>,
    /// `queue_depth:<queue>` / `active_workers:<queue>`
    pub gauges: HashMap<String, usize>,
}

/// 在内存中保存带标签的计数、耗时样本与瞬时值
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.snapshot().counters.get(key).copied().unwrap_or(0)
    }

    pub fn gauge(&self, key: &str) -> Option<usize> {
        self.snapshot().gauges.get(key).copied()
    }

    fn incr(&self, key: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *inner.counters.entry(key).or_insert(0) += 1;
    }

    fn set_gauge(&self, key: String, value: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.gauges.insert(key, value);
    }
}

impl MetricsSink for InMemoryMetrics {
    fn event_emitted(&self, event_type: &str, status: &str) {
        self.incr(format!("emitted:{}:{}", event_type, status));
    }

    fn notification_recorded(&self, event_type: &str, channel: &str, status: &str) {
        self.incr(format!("notification:{}:{}:{}", event_type, channel, status));
    }

    fn processing_duration(&self, event_type: &str, channel: &str, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .durations_ms
            .entry(format!("{}:{}", event_type, channel))
            .or_default()
            .push(elapsed.as_millis() as u64);
    }

    fn queue_depth(&self, queue: &str, depth: usize) {
        self.set_gauge(format!("queue_depth:{}", queue), depth);
    }

    fn active_workers(&self, queue: &str, active: usize) {
        self.set_gauge(format!("active_workers:{}", queue), active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters() {
        let metrics = InMemoryMetrics::new();
        metrics.event_emitted("order.created", "queued");
        metrics.event_emitted("order.created", "queued");
        metrics.notification_recorded("order.created", "email", "sent");

        assert_eq!(metrics.counter("emitted:order.created:queued"), 2);
        assert_eq!(metrics.counter("notification:order.created:email:sent"), 1);
        assert_eq!(metrics.counter("emitted:order.created:rejected"), 0);
    }

    #[test]
    fn test_gauges_and_durations() {
        let metrics = InMemoryMetrics::new();
        metrics.queue_depth("notification", 3);
        metrics.queue_depth("notification", 1);
        metrics.active_workers("handler", 2);
        metrics.processing_duration("a", "sms", Duration::from_millis(15));

        assert_eq!(metrics.gauge("queue_depth:notification"), Some(1));
        assert_eq!(metrics.gauge("active_workers:handler"), Some(2));
        assert_eq!(metrics.snapshot().durations_ms["a:sms"], vec![15]);
    }

    #[test]
    fn test_noop_accepts_everything() {
        let sink: &dyn MetricsSink = &NoopMetrics;
        sink.event_emitted("x", "accepted");
        sink.queue_depth("q", 10);
    }
}
