//! 通知编排器
//!
//! 对事件类型的每个渠道：选择 provider（按健康状态路由）→ 解析接收者 →
//! 带超时调用 `send` → 上报健康状态 → 按重试策略决定下一步。
//!
//! - 同步：每个渠道一个任务，内联重试循环；调用方最多等到截止时间，
//!   未完成的渠道记为 `failed`/`timeout`，后台任务按 `SyncTimeoutPolicy` 继续或中止
//! - 异步：作为 `notification` 任务的处理器，一次认领 = 一次尝试，
//!   失败时返回延迟重试，次数用尽进入死信

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{DeliveryConfig, SyncTimeoutPolicy};
use crate::error::DispatchError;
use crate::event_type::{EventTypeDefinition, EventTypeRegistry};
use crate::health::{persist_record, ProviderHealthTracker};
use crate::metrics::MetricsSink;
use crate::provider::{
    DeliveryContext, ProviderRegistry, ProviderSelection, RecipientLoader, SendOutcome,
};
use crate::queue::{JobOutcome, JobProcessor, QueuedJob};
use crate::retry::{self, RetryDecision};
use crate::storage::{Storage, NOTIFICATION_RESULTS};
use crate::types::NotificationResult;

/// 通知任务的 payload（每个渠道一个任务）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub channel: String,
    pub payload: Value,
}

/// 单次尝试的结果
#[derive(Debug, Clone, PartialEq)]
enum Attempt {
    Sent {
        provider: String,
        metadata: Option<Value>,
    },
    Skipped {
        provider: Option<String>,
        reason: String,
    },
    Failed {
        provider: Option<String>,
        error: String,
    },
}

/// 通知编排器
pub struct NotificationOrchestrator {
    registry: Arc<EventTypeRegistry>,
    providers: Arc<ProviderRegistry>,
    health: Arc<ProviderHealthTracker>,
    recipients: Arc<dyn RecipientLoader>,
    storage: Arc<dyn Storage>,
    metrics: Arc<dyn MetricsSink>,
    delivery: DeliveryConfig,
}

impl NotificationOrchestrator {
    pub fn new(
        registry: Arc<EventTypeRegistry>,
        providers: Arc<ProviderRegistry>,
        health: Arc<ProviderHealthTracker>,
        recipients: Arc<dyn RecipientLoader>,
        storage: Arc<dyn Storage>,
        metrics: Arc<dyn MetricsSink>,
        delivery: DeliveryConfig,
    ) -> Self {
        Self {
            registry,
            providers,
            health,
            recipients,
            storage,
            metrics,
            delivery,
        }
    }

    pub fn delivery(&self) -> &DeliveryConfig {
        &self.delivery
    }

    /// 对一个渠道做一次尝试
    async fn attempt_channel(
        &self,
        def: &EventTypeDefinition,
        channel: &str,
        payload: &Value,
        correlation_id: &str,
        attempt: u32,
    ) -> Attempt {
        let provider = match self.providers.select(channel, &self.health) {
            ProviderSelection::Selected(provider) => provider,
            ProviderSelection::NoProvider => {
                return Attempt::Skipped {
                    provider: None,
                    reason: format!("no provider registered for channel {}", channel),
                };
            }
            ProviderSelection::AllUnhealthy { primary } => {
                return Attempt::Skipped {
                    provider: Some(primary),
                    reason: "all providers unhealthy".to_string(),
                };
            }
        };
        let provider_name = provider.name().to_string();

        let recipients = match self.recipients.resolve(&def.name, payload).await {
            Ok(list) => list.into_iter().filter(|r| r.applies_to(channel)).collect(),
            Err(e) => {
                return Attempt::Failed {
                    provider: Some(provider_name),
                    error: format!("recipient resolution failed: {}", e),
                };
            }
        };

        let ctx = DeliveryContext {
            correlation_id: correlation_id.to_string(),
            event_type: def.name.clone(),
            channel: channel.to_string(),
            attempt,
            template_id: def.template_for(channel).map(String::from),
            recipients,
        };

        let call_timeout = self.delivery.provider_call_timeout();
        let outcome = match tokio::time::timeout(call_timeout, provider.send(payload, &ctx)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => SendOutcome::Failed(e.to_string()),
            Err(_) => SendOutcome::Failed(format!(
                "provider call timed out after {}ms",
                call_timeout.as_millis()
            )),
        };

        match outcome {
            SendOutcome::Sent { metadata } => {
                let record = self.health.record_success(channel, &provider_name);
                persist_record(self.storage.as_ref(), &record).await;
                debug!(
                    event_type = %def.name,
                    channel = %channel,
                    provider = %provider_name,
                    correlation_id = %correlation_id,
                    attempt,
                    "Notification sent"
                );
                Attempt::Sent {
                    provider: provider_name,
                    metadata,
                }
            }
            SendOutcome::Skipped(reason) => {
                let record = self.health.record_success(channel, &provider_name);
                persist_record(self.storage.as_ref(), &record).await;
                Attempt::Skipped {
                    provider: Some(provider_name),
                    reason,
                }
            }
            SendOutcome::Failed(error) => {
                let record = self.health.record_failure(channel, &provider_name, &error);
                persist_record(self.storage.as_ref(), &record).await;
                let failure = DispatchError::ProviderFailure {
                    channel: channel.to_string(),
                    provider: provider_name.clone(),
                    message: error.clone(),
                };
                warn!(
                    event_type = %def.name,
                    correlation_id = %correlation_id,
                    attempt,
                    consecutive_failures = record.consecutive_failures,
                    error = %failure,
                    "Notification attempt failed"
                );
                Attempt::Failed {
                    provider: Some(provider_name),
                    error,
                }
            }
        }
    }

    /// 同步投递：所有渠道并行，最多等待 `timeout`
    pub async fn deliver_sync(
        self: &Arc<Self>,
        def: Arc<EventTypeDefinition>,
        payload: Value,
        correlation_id: &str,
        timeout: Duration,
    ) -> Vec<NotificationResult> {
        let deadline = deadline_after(timeout);
        let payload = Arc::new(payload);

        let mut tasks = Vec::with_capacity(def.channels.len());
        for channel in &def.channels {
            let attempts = Arc::new(AtomicU32::new(0));
            let this = Arc::clone(self);
            let def = Arc::clone(&def);
            let payload = Arc::clone(&payload);
            let channel_name = channel.clone();
            let cid = correlation_id.to_string();
            let counter = Arc::clone(&attempts);
            let handle = tokio::spawn(async move {
                this.deliver_with_retries(&def, &channel_name, &payload, &cid, &counter)
                    .await
            });
            tasks.push((channel.clone(), attempts, handle));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for (channel, attempts, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(result)) => results.push(result),
                Ok(Err(e)) => {
                    let result = NotificationResult::failed(
                        &channel,
                        None,
                        attempts.load(Ordering::SeqCst),
                        format!("delivery task failed: {}", e),
                    );
                    self.finish(&def.name, correlation_id, &result).await;
                    results.push(result);
                }
                Err(_) => {
                    let result = NotificationResult::failed(
                        &channel,
                        None,
                        attempts.load(Ordering::SeqCst),
                        "timeout",
                    );
                    match self.delivery.sync_timeout_policy {
                        SyncTimeoutPolicy::Abandon => {
                            handle.abort();
                            self.finish(&def.name, correlation_id, &result).await;
                        }
                        SyncTimeoutPolicy::Continue => {
                            debug!(
                                event_type = %def.name,
                                channel = %channel,
                                correlation_id = %correlation_id,
                                "Caller timed out, delivery continues in background"
                            );
                        }
                    }
                    info!(
                        event_type = %def.name,
                        channel = %channel,
                        correlation_id = %correlation_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Sync delivery timed out"
                    );
                    results.push(result);
                }
            }
        }
        results
    }

    /// 内联重试循环，直到终态
    async fn deliver_with_retries(
        &self,
        def: &EventTypeDefinition,
        channel: &str,
        payload: &Value,
        correlation_id: &str,
        attempts: &AtomicU32,
    ) -> NotificationResult {
        let started = Instant::now();
        let mut attempt = 1;

        let result = loop {
            attempts.store(attempt, Ordering::SeqCst);
            match self.attempt_channel(def, channel, payload, correlation_id, attempt).await {
                Attempt::Sent { provider, metadata } => {
                    break NotificationResult::sent(channel, &provider, attempt, metadata);
                }
                Attempt::Skipped { provider, reason } => {
                    break NotificationResult::skipped(channel, provider.as_deref(), attempt, reason);
                }
                Attempt::Failed { provider, error } => match retry::next_attempt(attempt, def.retry.as_ref()) {
                    RetryDecision::RetryAfter { delay, next_attempt } => {
                        tokio::time::sleep(delay).await;
                        attempt = next_attempt;
                    }
                    RetryDecision::Exhausted { attempts } => {
                        self.log_exhausted(def, channel, correlation_id, attempts, &error);
                        break NotificationResult::failed(channel, provider.as_deref(), attempts, error);
                    }
                },
            }
        };

        self.metrics
            .processing_duration(&def.name, channel, started.elapsed());
        self.finish(&def.name, correlation_id, &result).await;
        result
    }

    fn log_exhausted(
        &self,
        def: &EventTypeDefinition,
        channel: &str,
        correlation_id: &str,
        attempts: u32,
        error: &str,
    ) {
        let exhausted = DispatchError::RetryExhausted {
            channel: channel.to_string(),
            attempts,
            message: error.to_string(),
        };
        warn!(
            event_type = %def.name,
            correlation_id = %correlation_id,
            error = %exhausted,
            "Notification failed permanently"
        );
    }

    /// 记录终态：指标 + 持久化
    async fn finish(&self, event_type: &str, correlation_id: &str, result: &NotificationResult) {
        self.metrics
            .notification_recorded(event_type, &result.channel, result.status.as_str());
        self.persist_result(correlation_id, result).await;
    }

    async fn persist_result(&self, correlation_id: &str, result: &NotificationResult) {
        let key = format!("{}:{}", correlation_id, result.channel);
        let value = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize notification result");
                return;
            }
        };
        if let Err(e) = self.storage.put(NOTIFICATION_RESULTS, &key, value).await {
            warn!(key = %key, error = %e, "Failed to persist notification result");
        }
    }

    /// 读取某次 emit 已持久化的渠道结果
    pub async fn results(&self, correlation_id: &str) -> anyhow::Result<Vec<NotificationResult>> {
        let prefix = format!("{}:", correlation_id);
        let mut results = Vec::new();
        for (_, value) in self.storage.query(NOTIFICATION_RESULTS, &prefix).await? {
            results.push(serde_json::from_value(value)?);
        }
        Ok(results)
    }
}

#[async_trait]
impl JobProcessor for NotificationOrchestrator {
    async fn process(&self, job: &QueuedJob) -> JobOutcome {
        let NotificationJob { channel, payload } = match serde_json::from_value(job.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                return JobOutcome::DeadLetter {
                    error: format!("malformed notification job: {}", e),
                };
            }
        };
        let def = match self.registry.get(&job.event_type) {
            Ok(def) => def,
            Err(e) => return JobOutcome::DeadLetter { error: e.to_string() },
        };

        let started = Instant::now();
        let attempt = job.attempts.max(1);
        let outcome = self
            .attempt_channel(&def, &channel, &payload, &job.correlation_id, attempt)
            .await;
        self.metrics
            .processing_duration(&def.name, &channel, started.elapsed());

        match outcome {
            Attempt::Sent { provider, metadata } => {
                let result = NotificationResult::sent(&channel, &provider, attempt, metadata);
                self.finish(&def.name, &job.correlation_id, &result).await;
                JobOutcome::Completed
            }
            Attempt::Skipped { provider, reason } => {
                let result = NotificationResult::skipped(&channel, provider.as_deref(), attempt, reason);
                self.finish(&def.name, &job.correlation_id, &result).await;
                JobOutcome::Completed
            }
            Attempt::Failed { provider, error } => {
                let result = NotificationResult::failed(&channel, provider.as_deref(), attempt, error.clone());
                match retry::next_attempt(attempt, def.retry.as_ref()) {
                    RetryDecision::RetryAfter { delay, .. } => {
                        // 中间状态，后续尝试会覆盖
                        self.persist_result(&job.correlation_id, &result).await;
                        JobOutcome::Retry { delay, error }
                    }
                    RetryDecision::Exhausted { attempts } => {
                        self.log_exhausted(&def, &channel, &job.correlation_id, attempts, &error);
                        self.finish(&def.name, &job.correlation_id, &result).await;
                        JobOutcome::DeadLetter { error }
                    }
                }
            }
        }
    }
}

/// `now + timeout`，溢出时取约 30 年后
pub(crate) fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}
