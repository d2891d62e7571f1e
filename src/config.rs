//! 引擎配置 - JSON 配置文件
//!
//! 配置文件路径优先级：
//! 1. 显式传入的路径（CLI `--config`）
//! 2. 环境变量 `EVN_CONFIG`
//! 3. `~/.config/event-notify/config.json`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DispatchError, DispatchResult};
use crate::event_type::EventTypeDefinition;
use crate::health::DEFAULT_FAILURE_THRESHOLD;

/// 配置文件路径环境变量
pub const CONFIG_ENV: &str = "EVN_CONFIG";

/// 配置目录：`~/.config/event-notify`
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("event-notify")
}

/// 内置 provider 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// HTTP POST
    Webhook,
    /// 追加写入 JSONL 文件
    LocalFile,
    /// 调用外部命令（chat/SMS 网关 CLI）
    Command,
}

/// provider 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub channel: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub options: Value,
}

/// 队列后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendKind {
    Memory,
    File,
}

/// 队列配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    /// 文件后端路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// worker 数量
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 空闲时轮询间隔（毫秒），决定延迟任务的最大可见延迟
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl QueueConfig {
    pub fn memory(concurrency: usize) -> Self {
        Self {
            backend: QueueBackendKind::Memory,
            path: None,
            concurrency,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn file(path: impl Into<PathBuf>, concurrency: usize) -> Self {
        Self {
            backend: QueueBackendKind::File,
            path: Some(path.into()),
            concurrency,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// 文件后端路径（未配置时使用默认文件名）
    pub fn resolved_path(&self, default_file: &str) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| config_dir().join(default_file))
    }

    fn handler_default() -> Self {
        Self::memory(2)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::File,
            path: None,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// 健康检查配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_check_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            check_interval_secs: default_check_interval_secs(),
            enabled: true,
        }
    }
}

/// 同步调用方超时后，未完成渠道的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTimeoutPolicy {
    /// 后台继续投递（含重试），结果写入存储
    #[default]
    Continue,
    /// 中止未完成的投递任务
    Abandon,
}

/// 投递配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// 同步模式默认超时（事件类型未配置时）
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// 单次 provider 调用超时
    #[serde(default = "default_timeout_ms")]
    pub provider_call_timeout_ms: u64,
    #[serde(default)]
    pub sync_timeout_policy: SyncTimeoutPolicy,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl DeliveryConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn provider_call_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_call_timeout_ms.max(1))
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            provider_call_timeout_ms: default_timeout_ms(),
            sync_timeout_policy: SyncTimeoutPolicy::Continue,
        }
    }
}

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub event_types: Vec<EventTypeDefinition>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// 模板 ID -> 模板文本
    #[serde(default)]
    pub templates: HashMap<String, String>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default = "QueueConfig::handler_default")]
    pub handler_queue: QueueConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            providers: Vec::new(),
            templates: HashMap::new(),
            queue: QueueConfig::default(),
            handler_queue: QueueConfig::handler_default(),
            health: HealthConfig::default(),
            delivery: DeliveryConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 全部使用内存后端（嵌入式使用和测试）
    pub fn in_memory() -> Self {
        Self {
            queue: QueueConfig::memory(default_concurrency()),
            ..Self::default()
        }
    }

    pub fn with_event_type(mut self, def: EventTypeDefinition) -> Self {
        self.event_types.push(def);
        self
    }

    pub fn with_template(mut self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(id.into(), text.into());
        self
    }

    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        config_dir().join("config.json")
    }

    /// 解析配置文件路径
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }
        Self::default_path()
    }

    /// 读取并解析配置文件
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_path(explicit);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(content)?;
        Ok(config)
    }

    /// 配置层面的校验（事件类型本身的校验由注册表完成）
    pub fn validate(&self) -> DispatchResult<()> {
        let mut problems = Vec::new();

        for def in &self.event_types {
            for (channel, template_id) in &def.templates {
                if !self.templates.contains_key(template_id) {
                    problems.push(format!(
                        "{}: channel {} references unknown template {}",
                        def.name, channel, template_id
                    ));
                }
            }
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() || provider.channel.trim().is_empty() {
                problems.push("provider requires non-empty name and channel".to_string());
                continue;
            }
            if !seen.insert((provider.channel.clone(), provider.name.clone())) {
                problems.push(format!(
                    "duplicate provider {} on channel {}",
                    provider.name, provider.channel
                ));
            }
        }

        if self.queue.concurrency == 0 {
            problems.push("queue.concurrency must be >= 1".to_string());
        }
        if self.handler_queue.concurrency == 0 {
            problems.push("handler_queue.concurrency must be >= 1".to_string());
        }
        if self.health.enabled && self.health.check_interval_secs == 0 {
            problems.push("health.check_interval_secs must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Config(problems))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_type::{Priority, ProcessingMode};

    const SAMPLE: &str = r#"{
        "event_types": [
            {
                "name": "order.created",
                "schema": {"order_id": {"type": "string", "required": true}},
                "channels": ["email", "webhook"],
                "templates": {"email": "order_email"},
                "mode": "async",
                "priority": "high",
                "retry": {"attempts": 3, "delay_ms": 1000, "backoff": "exponential", "max_delay_ms": 10000}
            }
        ],
        "providers": [
            {"name": "hook", "channel": "webhook", "kind": "webhook", "options": {"url": "http://localhost:9080/hook"}},
            {"name": "mailbox", "channel": "email", "kind": "local_file", "options": {"path": "/tmp/mail.jsonl"}}
        ],
        "templates": {"order_email": "Order {{ order_id }} created"},
        "queue": {"backend": "memory", "concurrency": 8},
        "delivery": {"sync_timeout_policy": "abandon"}
    }"#;

    #[test]
    fn test_parse_sample() {
        let config = EngineConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.event_types.len(), 1);
        assert_eq!(config.event_types[0].mode, ProcessingMode::Async);
        assert_eq!(config.event_types[0].priority, Priority::High);
        assert_eq!(config.providers[1].kind, ProviderKind::LocalFile);
        assert_eq!(config.queue.backend, QueueBackendKind::Memory);
        assert_eq!(config.queue.concurrency, 8);
        assert_eq!(config.queue.poll_interval_ms, 100);
        assert_eq!(config.handler_queue, QueueConfig::memory(2));
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.delivery.sync_timeout_policy, SyncTimeoutPolicy::Abandon);
        assert_eq!(config.delivery.default_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_json("{}").unwrap();
        assert_eq!(config.queue.backend, QueueBackendKind::File);
        assert_eq!(config.storage.backend, StorageKind::Memory);
        assert_eq!(config.delivery.sync_timeout_policy, SyncTimeoutPolicy::Continue);
        assert_eq!(EngineConfig::in_memory().queue.backend, QueueBackendKind::Memory);
    }

    #[test]
    fn test_unknown_template_reference() {
        let mut config = EngineConfig::from_json(SAMPLE).unwrap();
        config.templates.clear();
        match config.validate() {
            Err(DispatchError::Config(problems)) => {
                assert_eq!(problems.len(), 1);
                assert!(problems[0].contains("unknown template order_email"));
            }
            _ => panic!("expected config error"),
        }
    }

    #[test]
    fn test_duplicate_provider() {
        let mut config = EngineConfig::from_json(SAMPLE).unwrap();
        let dup = config.providers[0].clone();
        config.providers.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_type_fails_parse() {
        let raw = r#"{"event_types": [{"name": "x", "schema": {"a": {"type": "decimal"}}}]}"#;
        assert!(EngineConfig::from_json(raw).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.providers.len(), 2);

        let missing = EngineConfig::load(Some(&dir.path().join("missing.json")));
        assert!(missing.is_err());
    }

    #[test]
    fn test_resolve_explicit_path_wins() {
        let explicit = Path::new("/etc/evn.json");
        assert_eq!(EngineConfig::resolve_path(Some(explicit)), PathBuf::from("/etc/evn.json"));
    }
}
