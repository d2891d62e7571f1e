//! 业务 handler 队列
//!
//! 与通知队列完全独立的第二个队列：每个 emit 为每个订阅的 handler 入队一个任务。
//! 每个 handler 有自己的 worker（数量即该 handler 的并发上限），慢 handler 只会
//! 占满自己的 worker。handler 返回错误或 panic 都在边界处捕获并记录，不会传播给
//! emit 调用方，也不影响其他 handler。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{HandlerError, QueueError};
use crate::event_type::RetryPolicy;
use crate::queue::{EnqueueOptions, JobOutcome, JobProcessor, QueueManager, QueueStats, QueuedJob};
use crate::retry::{self, RetryDecision};
use crate::types::EmittedEvent;

/// 业务 handler
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EmittedEvent) -> anyhow::Result<()>;
}

/// handler 注册选项
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOptions {
    /// 并发上限（None 时使用 handler 队列配置的 concurrency）
    pub concurrency: Option<usize>,
    /// 失败重试策略（None 表示失败即进入死信）
    pub retry: Option<RetryPolicy>,
    /// 只接收这些事件类型（空表示全部）
    pub event_types: Vec<String>,
}

impl HandlerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn for_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    fn accepts(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event_type)
    }
}

/// handler 任务的 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandlerJob {
    handler: String,
    event: EmittedEvent,
}

struct RegisteredHandler {
    name: String,
    job_type: String,
    options: HandlerOptions,
}

/// 包装 handler，隔离错误与 panic
struct HandlerProcessor {
    name: String,
    handler: Arc<dyn EventHandler>,
    retry: Option<RetryPolicy>,
}

#[async_trait]
impl JobProcessor for HandlerProcessor {
    async fn process(&self, job: &QueuedJob) -> JobOutcome {
        let HandlerJob { event, .. } = match serde_json::from_value(job.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                return JobOutcome::DeadLetter {
                    error: format!("malformed handler job: {}", e),
                };
            }
        };

        let handler = Arc::clone(&self.handler);
        let error = match tokio::spawn(async move { handler.handle(&event).await }).await {
            Ok(Ok(())) => {
                debug!(handler = %self.name, correlation_id = %job.correlation_id, "Handler completed");
                return JobOutcome::Completed;
            }
            Ok(Err(e)) => HandlerError::Failed {
                handler: self.name.clone(),
                message: e.to_string(),
            },
            Err(_) => HandlerError::Panicked {
                handler: self.name.clone(),
            },
        };

        warn!(
            handler = %self.name,
            event_type = %job.event_type,
            correlation_id = %job.correlation_id,
            attempt = job.attempts,
            error = %error,
            "Handler failed"
        );

        match retry::next_attempt(job.attempts, self.retry.as_ref()) {
            RetryDecision::RetryAfter { delay, .. } => JobOutcome::Retry {
                delay,
                error: error.to_string(),
            },
            RetryDecision::Exhausted { .. } => JobOutcome::DeadLetter {
                error: error.to_string(),
            },
        }
    }
}

/// handler 队列管理器
pub struct HandlerQueueManager {
    queue: Arc<QueueManager>,
    handlers: RwLock<Vec<RegisteredHandler>>,
}

impl HandlerQueueManager {
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self {
            queue,
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    /// 注册 handler 并启动它的 worker
    pub fn register_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: HandlerOptions,
    ) -> Result<(), QueueError> {
        let name = name.into();
        let job_type = format!("handler:{}", name);

        self.queue.register_processor(
            job_type.clone(),
            Arc::new(HandlerProcessor {
                name: name.clone(),
                handler,
                retry: options.retry.clone(),
            }),
        )?;

        let concurrency = options.concurrency.unwrap_or(self.queue.concurrency()).max(1);
        self.queue.spawn_workers(vec![job_type.clone()], concurrency);

        debug!(handler = %name, concurrency, "Event handler registered");
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(RegisteredHandler { name, job_type, options });
        Ok(())
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|h| h.name.clone())
            .collect()
    }

    /// 为每个订阅该事件类型的 handler 入队一个任务
    ///
    /// 入队失败只记录日志；返回成功入队的任务数。
    pub async fn submit(&self, event: &EmittedEvent) -> usize {
        let targets: Vec<(String, String, u32)> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|h| h.options.accepts(&event.event_type))
            .map(|h| {
                let max_attempts = h.options.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1);
                (h.name.clone(), h.job_type.clone(), max_attempts)
            })
            .collect();

        let mut submitted = 0;
        for (name, job_type, max_attempts) in targets {
            let payload = match serde_json::to_value(HandlerJob {
                handler: name.clone(),
                event: event.clone(),
            }) {
                Ok(v) => v,
                Err(e) => {
                    warn!(handler = %name, error = %e, "Failed to serialize handler job");
                    continue;
                }
            };
            let options = EnqueueOptions::default()
                .with_priority(event.priority)
                .with_max_attempts(max_attempts)
                .with_correlation_id(event.correlation_id.clone());

            match self.queue.enqueue(&job_type, &event.event_type, payload, options).await {
                Ok(_) => submitted += 1,
                Err(e) => warn!(
                    handler = %name,
                    event_type = %event.event_type,
                    correlation_id = %event.correlation_id,
                    error = %e,
                    "Failed to submit event to handler"
                ),
            }
        }
        submitted
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.queue.stats().await
    }

    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout).await
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.queue.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_type::{BackoffKind, Priority};
    use crate::queue::MemoryBackend;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &EmittedEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &EmittedEvent) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("analytics backend unavailable")
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &EmittedEvent) -> anyhow::Result<()> {
            panic!("handler bug")
        }
    }

    fn manager() -> HandlerQueueManager {
        let queue = Arc::new(QueueManager::new(
            "handlers",
            Arc::new(MemoryBackend::new()),
            2,
            Duration::from_millis(10),
        ));
        HandlerQueueManager::new(queue)
    }

    fn event(event_type: &str) -> EmittedEvent {
        EmittedEvent {
            event_type: event_type.to_string(),
            payload: json!({"order_id": "o-1"}),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            priority: Priority::Normal,
            emitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_affect_others() {
        let handlers = manager();
        let ok = Arc::new(Counting { calls: AtomicU32::new(0) });
        let failing = Arc::new(Failing { calls: AtomicU32::new(0) });
        handlers.register_handler("audit", ok.clone(), HandlerOptions::default()).unwrap();
        handlers.register_handler("analytics", failing.clone(), HandlerOptions::default()).unwrap();
        handlers.register_handler("buggy", Arc::new(Panicking), HandlerOptions::default()).unwrap();

        assert_eq!(handlers.submit(&event("order.created")).await, 3);
        assert_eq!(handlers.submit(&event("order.created")).await, 3);
        assert!(handlers.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(ok.calls.load(Ordering::SeqCst), 2);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 2);

        let stats = handlers.stats().await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 4);
        handlers.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_retry_policy() {
        let handlers = manager();
        let failing = Arc::new(Failing { calls: AtomicU32::new(0) });
        let retry = RetryPolicy::new(3, Duration::from_millis(5), BackoffKind::Linear);
        handlers
            .register_handler("analytics", failing.clone(), HandlerOptions::default().with_retry(retry))
            .unwrap();

        handlers.submit(&event("order.created")).await;
        assert!(handlers.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        let dead = handlers.queue().dead_letters().await.unwrap();
        assert!(dead[0].last_error.as_deref().unwrap().contains("analytics backend unavailable"));
        handlers.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_type_filter() {
        let handlers = manager();
        let ok = Arc::new(Counting { calls: AtomicU32::new(0) });
        handlers
            .register_handler(
                "orders-only",
                ok.clone(),
                HandlerOptions::default().for_event_types(["order.created"]).with_concurrency(1),
            )
            .unwrap();

        assert_eq!(handlers.submit(&event("user.registered")).await, 0);
        assert_eq!(handlers.submit(&event("order.created")).await, 1);
        assert!(handlers.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handlers.handler_names(), vec!["orders-only"]);
        handlers.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_handler_name_rejected() {
        let handlers = manager();
        let ok = Arc::new(Counting { calls: AtomicU32::new(0) });
        handlers.register_handler("audit", ok.clone(), HandlerOptions::default()).unwrap();
        assert!(handlers.register_handler("audit", ok, HandlerOptions::default()).is_err());
        handlers.close().await.unwrap();
    }
}
