//! 事件类型定义 - schema、渠道、处理模式、重试与限流策略

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// payload 字段的基础类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Boolean => "boolean",
            FieldKind::Date => "date",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 单个字段的 schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSchema {
    pub fn required(kind: FieldKind) -> Self {
        Self { kind, required: true }
    }

    pub fn optional(kind: FieldKind) -> Self {
        Self { kind, required: false }
    }
}

/// 处理模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    /// 调用方等待投递结果
    Sync,
    /// 入队后立即返回
    Async,
    /// 根据 wait_for_result 决定
    #[default]
    Auto,
}

impl ProcessingMode {
    /// 解析实际模式：`Auto` 在需要等待结果时走同步，否则异步
    pub fn resolve(self, wait_for_result: bool) -> ProcessingMode {
        match self {
            ProcessingMode::Auto if wait_for_result => ProcessingMode::Sync,
            ProcessingMode::Auto => ProcessingMode::Async,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingMode::Sync => "sync",
            ProcessingMode::Async => "async",
            ProcessingMode::Auto => "auto",
        }
    }
}

impl std::str::FromStr for ProcessingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(ProcessingMode::Sync),
            "async" => Ok(ProcessingMode::Async),
            "auto" => Ok(ProcessingMode::Auto),
            other => Err(format!("unknown processing mode: {}", other)),
        }
    }
}

/// 优先级（High 先于 Normal 先于 Low）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// 不重试
    None,
    Linear,
    #[default]
    Exponential,
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次），>= 1
    pub attempts: u32,
    /// 初始延迟（毫秒）
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// 延迟上限（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration, backoff: BackoffKind) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
            backoff,
            max_delay_ms: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(max_delay.as_millis() as u64);
        self
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }
}

/// 限流 key 的组成方式（必须显式配置）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    /// 仅按事件类型
    EventType,
    /// 事件类型 + payload 中某个字段（如 recipient id）
    Field(String),
}

/// 限流策略（固定窗口）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max_requests: u32,
    pub key: RateLimitKey,
}

impl RateLimitPolicy {
    pub fn new(window: Duration, max_requests: u32, key: RateLimitKey) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
            key,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// 计算限流 key；字段缺失时退回到事件类型
    pub fn key_for(&self, event_type: &str, payload: &serde_json::Value) -> String {
        match &self.key {
            RateLimitKey::EventType => event_type.to_string(),
            RateLimitKey::Field(field) => match payload.get(field) {
                Some(serde_json::Value::String(s)) => format!("{}:{}", event_type, s),
                Some(serde_json::Value::Null) | None => event_type.to_string(),
                Some(other) => format!("{}:{}", event_type, other),
            },
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// 事件类型定义
///
/// 启动时从配置加载，之后除 `enabled` 外不可变（`enabled` 由注册表单独保存）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTypeDefinition {
    /// 唯一名称，如 `order.created`
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// 字段名 -> schema
    #[serde(default)]
    pub schema: BTreeMap<String, FieldSchema>,
    /// 投递渠道
    #[serde(default)]
    pub channels: Vec<String>,
    /// 渠道 -> 模板 ID
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub templates: HashMap<String, String>,
    #[serde(default)]
    pub mode: ProcessingMode,
    #[serde(default)]
    pub wait_for_result: bool,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
    /// 同步模式默认超时（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl EventTypeDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            schema: BTreeMap::new(),
            channels: Vec::new(),
            templates: HashMap::new(),
            mode: ProcessingMode::Auto,
            wait_for_result: false,
            priority: Priority::Normal,
            retry: None,
            rate_limit: None,
            timeout_ms: None,
            enabled: true,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, schema: FieldSchema) -> Self {
        self.schema.insert(name.into(), schema);
        self
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_template(mut self, channel: impl Into<String>, template_id: impl Into<String>) -> Self {
        self.templates.insert(channel.into(), template_id.into());
        self
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_wait_for_result(mut self, wait: bool) -> Self {
        self.wait_for_result = wait;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 每个渠道允许的总尝试次数
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn template_for(&self, channel: &str) -> Option<&str> {
        self.templates.get(channel).map(|s| s.as_str())
    }
}
