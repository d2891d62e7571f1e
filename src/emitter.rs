//! 事件发射器 - 唯一的公开入口
//!
//! emit 流程：
//! 1. 查找已启用的事件类型
//! 2. 按 schema 校验 payload（失败时不产生任何副作用）
//! 3. 确定处理模式（显式选项 > 事件类型默认；`auto` 按 wait_for_result；delay > 0 强制异步）
//! 4. 速率限制
//! 5. 同步：编排器内联投递；异步：每个渠道入队一个任务
//! 6. 交给 handler 队列（失败不影响返回结果）

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::event_type::{validate_payload, EventTypeDefinition, EventTypeRegistry, ProcessingMode};
use crate::handlers::HandlerQueueManager;
use crate::metrics::MetricsSink;
use crate::orchestrator::{NotificationJob, NotificationOrchestrator};
use crate::queue::{EnqueueOptions, QueueManager, NOTIFICATION_JOB};
use crate::rate_limit::{Admission, RateLimiter};
use crate::storage::{Storage, EMISSIONS};
use crate::types::{EmissionResult, EmissionStatus, EmitOptions, EmittedEvent};

pub struct EventEmitter {
    registry: Arc<EventTypeRegistry>,
    rate_limiter: Arc<RateLimiter>,
    orchestrator: Arc<NotificationOrchestrator>,
    queue: Arc<QueueManager>,
    handlers: Arc<HandlerQueueManager>,
    storage: Arc<dyn Storage>,
    metrics: Arc<dyn MetricsSink>,
    default_timeout: Duration,
}

impl EventEmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<EventTypeRegistry>,
        rate_limiter: Arc<RateLimiter>,
        orchestrator: Arc<NotificationOrchestrator>,
        queue: Arc<QueueManager>,
        handlers: Arc<HandlerQueueManager>,
        storage: Arc<dyn Storage>,
        metrics: Arc<dyn MetricsSink>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            rate_limiter,
            orchestrator,
            queue,
            handlers,
            storage,
            metrics,
            default_timeout,
        }
    }

    /// 发射事件
    ///
    /// 事件类型不存在/已禁用、payload 校验失败、入队失败返回 `Err`；
    /// 速率限制返回 `Ok`，状态为 `rate-limited`。
    pub async fn emit(&self, event_type: &str, payload: Value, options: EmitOptions) -> DispatchResult<EmissionResult> {
        match self.emit_inner(event_type, payload, options).await {
            Ok(result) => {
                self.metrics.event_emitted(event_type, result.status.as_str());
                self.persist(&result).await;
                Ok(result)
            }
            Err(e) => {
                let status = match e {
                    DispatchError::EventNotFound(_) | DispatchError::Validation(_) => EmissionStatus::Rejected.as_str(),
                    _ => "error",
                };
                self.metrics.event_emitted(event_type, status);
                Err(e)
            }
        }
    }

    async fn emit_inner(&self, event_type: &str, payload: Value, options: EmitOptions) -> DispatchResult<EmissionResult> {
        let def = self.registry.get_enabled(event_type).map_err(|e| {
            debug!(event_type = %event_type, "Emission rejected: unknown or disabled event type");
            e
        })?;

        if let Err(errors) = validate_payload(&def.schema, &payload) {
            info!(event_type = %event_type, errors = errors.len(), "Emission rejected: invalid payload");
            return Err(DispatchError::Validation(errors));
        }

        let correlation_id = options
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mode = resolve_mode(&def, &options);

        if let Some(policy) = &def.rate_limit {
            let key = policy.key_for(&def.name, &payload);
            if let Admission::Rejected { retry_after } = self.rate_limiter.try_admit(&key, policy) {
                let rejection = DispatchError::RateLimited { key };
                info!(
                    event_type = %event_type,
                    correlation_id = %correlation_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    reason = %rejection,
                    "Emission rejected"
                );
                return Ok(EmissionResult::new(EmissionStatus::RateLimited, correlation_id));
            }
        }

        let priority = options.priority.unwrap_or(def.priority);
        let event = EmittedEvent {
            event_type: def.name.clone(),
            payload: payload.clone(),
            correlation_id: correlation_id.clone(),
            priority,
            emitted_at: Utc::now(),
        };

        if def.channels.is_empty() {
            self.handlers.submit(&event).await;
            debug!(event_type = %event_type, correlation_id = %correlation_id, "Event accepted for handlers only");
            return Ok(EmissionResult::new(EmissionStatus::Accepted, correlation_id));
        }

        match mode {
            ProcessingMode::Sync => {
                self.handlers.submit(&event).await;
                let timeout = options
                    .timeout
                    .or_else(|| def.timeout())
                    .unwrap_or(self.default_timeout);
                let results = self
                    .orchestrator
                    .deliver_sync(Arc::clone(&def), payload, &correlation_id, timeout)
                    .await;
                info!(
                    event_type = %event_type,
                    correlation_id = %correlation_id,
                    sent = results.iter().filter(|r| r.is_sent()).count(),
                    channels = results.len(),
                    "Sync emission completed"
                );
                Ok(EmissionResult::new(EmissionStatus::Completed, correlation_id).with_results(results))
            }
            ProcessingMode::Async | ProcessingMode::Auto => {
                self.enqueue_channels(&def, &payload, &correlation_id, priority, options.delay)
                    .await?;
                self.handlers.submit(&event).await;
                info!(
                    event_type = %event_type,
                    correlation_id = %correlation_id,
                    channels = def.channels.len(),
                    "Emission queued"
                );
                Ok(EmissionResult::new(EmissionStatus::Queued, correlation_id))
            }
        }
    }

    async fn enqueue_channels(
        &self,
        def: &EventTypeDefinition,
        payload: &Value,
        correlation_id: &str,
        priority: crate::event_type::Priority,
        delay: Option<Duration>,
    ) -> DispatchResult<()> {
        let mut items = Vec::with_capacity(def.channels.len());
        for channel in &def.channels {
            let job = serde_json::to_value(NotificationJob {
                channel: channel.clone(),
                payload: payload.clone(),
            })
            .map_err(crate::error::QueueError::from)?;

            let mut options = EnqueueOptions::default()
                .with_priority(priority)
                .with_max_attempts(def.max_attempts())
                .with_correlation_id(correlation_id);
            if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                options = options.with_delay(delay);
            }
            items.push((job, options));
        }

        // 所有渠道一次入队，失败时不留下任何任务
        self.queue
            .enqueue_batch(NOTIFICATION_JOB, &def.name, items)
            .await?;
        Ok(())
    }

    async fn persist(&self, result: &EmissionResult) {
        let value = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Failed to serialize emission result");
                return;
            }
        };
        if let Err(e) = self.storage.put(EMISSIONS, &result.correlation_id, value).await {
            warn!(correlation_id = %result.correlation_id, error = %e, "Failed to persist emission result");
        }
    }
}

/// 有效处理模式
pub fn resolve_mode(def: &EventTypeDefinition, options: &EmitOptions) -> ProcessingMode {
    if options.delay.map_or(false, |d| !d.is_zero()) {
        return ProcessingMode::Async;
    }
    let wait = options.wait_for_result.unwrap_or(def.wait_for_result);
    options.mode.unwrap_or(def.mode).resolve(wait)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_mode() {
        let def = EventTypeDefinition::new("a");
        assert_eq!(resolve_mode(&def, &EmitOptions::new()), ProcessingMode::Async);
        assert_eq!(
            resolve_mode(&def, &EmitOptions::new().with_wait_for_result(true)),
            ProcessingMode::Sync
        );

        let sync_def = EventTypeDefinition::new("b").with_wait_for_result(true);
        assert_eq!(resolve_mode(&sync_def, &EmitOptions::new()), ProcessingMode::Sync);
        assert_eq!(
            resolve_mode(&sync_def, &EmitOptions::new().with_mode(ProcessingMode::Async)),
            ProcessingMode::Async
        );
    }

    #[test]
    fn test_delay_forces_async() {
        let def = EventTypeDefinition::new("a").with_mode(ProcessingMode::Sync);
        let opts = EmitOptions::new().with_delay(Duration::from_secs(5));
        assert_eq!(resolve_mode(&def, &opts), ProcessingMode::Async);

        let zero = EmitOptions::new().with_delay(Duration::ZERO);
        assert_eq!(resolve_mode(&def, &zero), ProcessingMode::Sync);
    }
}
