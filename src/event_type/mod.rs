//! 事件类型 - 定义、schema 校验与注册表

pub mod definition;
pub mod registry;
pub mod schema;

pub use definition::{
    BackoffKind, EventTypeDefinition, FieldKind, FieldSchema, Priority, ProcessingMode,
    RateLimitKey, RateLimitPolicy, RetryPolicy,
};
pub use registry::EventTypeRegistry;
pub use schema::validate_payload;
