//! 错误分类 - 调用方可见的拒绝与内部失败

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单个字段的校验错误
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// 字段名
    pub field: String,
    /// 错误描述
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// 队列后端错误
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue backend serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue {0} is closed")]
    Closed(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("processor already registered for job type {0}")]
    DuplicateProcessor(String),

    #[error("invalid job state: {0}")]
    InvalidState(String),
}

/// 业务 handler 错误（只记录日志，不向 emit 调用方传播）
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler {handler} failed: {message}")]
    Failed { handler: String, message: String },

    #[error("handler {handler} panicked")]
    Panicked { handler: String },
}

/// 分发引擎错误
#[derive(Debug, Error)]
pub enum DispatchError {
    /// 事件类型不存在或已禁用
    #[error("event type not found or disabled: {0}")]
    EventNotFound(String),

    /// payload 不符合 schema
    #[error("payload validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    /// 速率限制拒绝
    #[error("rate limited: {key}")]
    RateLimited { key: String },

    /// 单次渠道投递失败
    #[error("provider {provider} failed on channel {channel}: {message}")]
    ProviderFailure {
        channel: String,
        provider: String,
        message: String,
    },

    /// 重试次数耗尽
    #[error("retries exhausted for channel {channel} after {attempts} attempts: {message}")]
    RetryExhausted {
        channel: String,
        attempts: u32,
        message: String,
    },

    #[error(transparent)]
    QueueBackend(#[from] QueueError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// 配置错误（启动时 fail fast）
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_lists_fields() {
        let err = DispatchError::Validation(vec![
            FieldError::new("order_id", "required field is missing"),
            FieldError::new("total", "expected number, got string"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("order_id: required field is missing"));
        assert!(msg.contains("total: expected number, got string"));
    }

    #[test]
    fn test_config_error_joins_problems() {
        let err = DispatchError::Config(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "invalid configuration: a; b");
    }

    #[test]
    fn test_queue_error_converts() {
        let err: DispatchError = QueueError::Closed("notifications".to_string()).into();
        assert!(matches!(err, DispatchError::QueueBackend(QueueError::Closed(_))));
    }
}
