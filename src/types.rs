//! emit 的输入选项与结果类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{DispatchError, FieldError};
use crate::event_type::{Priority, ProcessingMode};

/// 单个渠道的投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Sent,
    Failed,
    Skipped,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Sent => "sent",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个渠道的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    pub channel: String,
    /// 最后一次尝试使用的 provider（没有可用 provider 时为空）
    pub provider: Option<String>,
    pub status: NotificationStatus,
    /// 实际发生的尝试次数
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NotificationResult {
    pub fn sent(channel: &str, provider: &str, attempts: u32, metadata: Option<Value>) -> Self {
        Self {
            channel: channel.to_string(),
            provider: Some(provider.to_string()),
            status: NotificationStatus::Sent,
            attempts,
            timestamp: Utc::now(),
            error: None,
            metadata,
        }
    }

    pub fn failed(channel: &str, provider: Option<&str>, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            provider: provider.map(String::from),
            status: NotificationStatus::Failed,
            attempts,
            timestamp: Utc::now(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn skipped(channel: &str, provider: Option<&str>, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            provider: provider.map(String::from),
            status: NotificationStatus::Skipped,
            attempts,
            timestamp: Utc::now(),
            error: Some(reason.into()),
            metadata: None,
        }
    }

    pub fn is_sent(&self) -> bool {
        self.status == NotificationStatus::Sent
    }
}

/// emit 结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmissionStatus {
    /// 已接受（事件类型没有渠道，只交给 handler）
    Accepted,
    /// 已入队（异步）
    Queued,
    /// 同步投递已结束（含失败/超时渠道）
    Completed,
    /// 事件类型不存在/已禁用，或 payload 校验失败
    Rejected,
    /// 速率限制拒绝
    RateLimited,
}

impl EmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmissionStatus::Accepted => "accepted",
            EmissionStatus::Queued => "queued",
            EmissionStatus::Completed => "completed",
            EmissionStatus::Rejected => "rejected",
            EmissionStatus::RateLimited => "rate-limited",
        }
    }
}

impl std::fmt::Display for EmissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// emit 返回值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionResult {
    pub status: EmissionStatus,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<NotificationResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<FieldError>>,
}

impl EmissionResult {
    pub fn new(status: EmissionStatus, correlation_id: impl Into<String>) -> Self {
        Self {
            status,
            correlation_id: correlation_id.into(),
            results: None,
            validation_errors: None,
        }
    }

    pub fn with_results(mut self, results: Vec<NotificationResult>) -> Self {
        self.results = Some(results);
        self
    }

    /// 将调用方可见的拒绝折叠为结果值
    ///
    /// 基础设施错误（队列后端等）没有对应的结果状态，原样返回。
    pub fn from_error(error: DispatchError, correlation_id: impl Into<String>) -> Result<Self, DispatchError> {
        let correlation_id = correlation_id.into();
        match error {
            DispatchError::EventNotFound(_) => Ok(Self::new(EmissionStatus::Rejected, correlation_id)),
            DispatchError::Validation(errors) => Ok(Self {
                validation_errors: Some(errors),
                ..Self::new(EmissionStatus::Rejected, correlation_id)
            }),
            DispatchError::RateLimited { .. } => Ok(Self::new(EmissionStatus::RateLimited, correlation_id)),
            other => Err(other),
        }
    }

    /// 指定渠道的结果
    pub fn result_for(&self, channel: &str) -> Option<&NotificationResult> {
        self.results.as_ref()?.iter().find(|r| r.channel == channel)
    }
}

/// emit 覆盖选项；未设置的字段使用事件类型的默认值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitOptions {
    pub mode: Option<ProcessingMode>,
    pub wait_for_result: Option<bool>,
    pub priority: Option<Priority>,
    /// 延迟投递（> 0 时强制异步）
    pub delay: Option<Duration>,
    pub correlation_id: Option<String>,
    /// 同步模式等待上限
    pub timeout: Option<Duration>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_wait_for_result(mut self, wait: bool) -> Self {
        self.wait_for_result = Some(wait);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// 交给 handler 的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmittedEvent {
    pub event_type: String,
    pub payload: Value,
    pub correlation_id: String,
    pub priority: Priority,
    pub emitted_at: DateTime<Utc>,
}
