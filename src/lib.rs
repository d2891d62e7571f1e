//! Event Notify - 进程内事件通知分发引擎
//!
//! 事件类型注册、payload 校验、多渠道投递（同步/队列异步）、重试与退避、
//! 速率限制、provider 健康追踪，以及与通知隔离的业务 handler 队列。

pub mod cli;
pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod event_type;
pub mod handlers;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod storage;
pub mod types;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder};
pub use error::{DispatchError, DispatchResult, FieldError, HandlerError, QueueError};
pub use event_type::{
    BackoffKind, EventTypeDefinition, EventTypeRegistry, FieldKind, FieldSchema, Priority, ProcessingMode,
    RateLimitKey, RateLimitPolicy, RetryPolicy,
};
pub use handlers::{EventHandler, HandlerOptions};
pub use health::{ProviderHealthRecord, ProviderHealthTracker};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use provider::{ChannelProvider, DeliveryContext, Recipient, RecipientLoader, SendOutcome, TemplateRenderer};
pub use queue::{QueueBackend, QueueStats, QueuedJob};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use types::{EmissionResult, EmissionStatus, EmitOptions, EmittedEvent, NotificationResult, NotificationStatus};
