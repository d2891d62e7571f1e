//! 渠道 provider 抽象层
//!
//! # 设计目标
//! 1. 统一接口：所有 provider 实现 `ChannelProvider` trait
//! 2. 显式注册：启动时调用 `ProviderRegistry::register(channel, provider)`，不做自动发现
//! 3. 路由：同一渠道可注册多个 provider，按注册顺序选择第一个健康的（其余为 fallback）
//! 4. 模板渲染由 provider 调用 `TemplateRenderer`，编排器不关心模板

pub mod channels;
pub mod recipients;
pub mod registry;
pub mod template;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use recipients::{PayloadRecipientLoader, RecipientLoader};
pub use registry::{ProviderRegistry, ProviderSelection};
pub use template::{SimpleTemplateRenderer, TemplateRenderer};

/// 接收者
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    /// 地址（邮箱、手机号、chat id、URL 等）
    pub address: String,
    /// 限定渠道；`None` 表示适用所有渠道
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// 渠道相关的附加信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            channel: None,
            metadata: None,
        }
    }

    pub fn for_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn applies_to(&self, channel: &str) -> bool {
        self.channel.as_deref().map_or(true, |c| c == channel)
    }
}

/// 单次投递的上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryContext {
    pub correlation_id: String,
    pub event_type: String,
    pub channel: String,
    /// 当前尝试次数（从 1 开始）
    pub attempt: u32,
    /// 渠道关联的模板
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// 已按渠道过滤的接收者
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

/// provider 发送结果
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// 发送成功，可附带 provider 元数据（消息 ID 等）
    Sent { metadata: Option<Value> },
    /// 跳过（provider 判断无需发送）
    Skipped(String),
    /// 发送失败
    Failed(String),
}

impl SendOutcome {
    pub fn sent() -> Self {
        SendOutcome::Sent { metadata: None }
    }
}

/// 渠道 provider trait
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// provider 名称（用于日志、健康记录和结果）
    fn name(&self) -> &str;

    /// 发送一次；`Err` 与 `Failed` 都视为本次尝试失败
    async fn send(&self, payload: &Value, ctx: &DeliveryContext) -> Result<SendOutcome>;

    /// 健康检查，由后台循环周期调用
    async fn health_check(&self) -> bool {
        true
    }

    /// 校验 provider 配置，返回全部问题
    fn validate_config(&self, _config: &Value) -> std::result::Result<(), Vec<String>> {
        Ok(())
    }
}
