//! Webhook provider - HTTP POST 投递
//!
//! 请求体是一个 JSON 信封：事件类型、correlation id、尝试次数、原始 payload、
//! 渲染后的消息（渠道有模板时）以及接收者列表。非 2xx 响应视为失败。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::provider::{ChannelProvider, DeliveryContext, Recipient, SendOutcome, TemplateRenderer};

/// Webhook 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// 目标 URL
    pub url: String,
    /// Bearer token（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// 额外请求头
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 超时时间 (秒)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 健康检查 URL（GET，2xx 视为健康）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: None,
            headers: HashMap::new(),
            timeout_secs: default_timeout_secs(),
            health_url: None,
        }
    }
}

impl WebhookConfig {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.url.trim().is_empty() {
            errors.push("url is required".to_string());
        } else if !is_http_url(&self.url) {
            errors.push(format!("url must start with http:// or https://: {}", self.url));
        }
        if let Some(health_url) = &self.health_url {
            if !is_http_url(health_url) {
                errors.push(format!("health_url must start with http:// or https://: {}", health_url));
            }
        }
        if self.timeout_secs == 0 {
            errors.push("timeout_secs must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn no_recipients(recipients: &&[Recipient]) -> bool {
    recipients.is_empty()
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Webhook 请求载荷
#[derive(Debug, Serialize)]
pub struct WebhookEnvelope<'a> {
    pub event_type: &'a str,
    pub correlation_id: &'a str,
    pub channel: &'a str,
    pub attempt: u32,
    pub payload: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "no_recipients")]
    pub recipients: &'a [Recipient],
}

/// Webhook provider
pub struct WebhookProvider {
    name: String,
    client: Client,
    config: WebhookConfig,
    renderer: Option<Arc<dyn TemplateRenderer>>,
}

impl WebhookProvider {
    pub fn new(
        name: impl Into<String>,
        config: WebhookConfig,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| anyhow!("invalid webhook config: {}", errors.join("; ")))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            name: name.into(),
            client,
            config,
            renderer,
        })
    }

    /// 从配置中的 options 创建
    pub fn from_options(
        name: impl Into<String>,
        options: &Value,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Result<Self> {
        let config: WebhookConfig = serde_json::from_value(options.clone())
            .map_err(|e| anyhow!("invalid webhook options: {}", e))?;
        Self::new(name, config, renderer)
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    fn render_message(&self, payload: &Value, ctx: &DeliveryContext) -> Result<Option<String>> {
        match (&ctx.template_id, &self.renderer) {
            (Some(template_id), Some(renderer)) => Ok(Some(renderer.render(template_id, payload)?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl ChannelProvider for WebhookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &Value, ctx: &DeliveryContext) -> Result<SendOutcome> {
        let envelope = WebhookEnvelope {
            event_type: &ctx.event_type,
            correlation_id: &ctx.correlation_id,
            channel: &ctx.channel,
            attempt: ctx.attempt,
            payload,
            message: self.render_message(payload, ctx)?,
            recipients: &ctx.recipients,
        };

        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("X-Correlation-Id", ctx.correlation_id.as_str());

        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .json(&envelope)
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {}", e))?;

        let status = response.status();
        if status.is_success() {
            debug!(
                provider = %self.name,
                correlation_id = %ctx.correlation_id,
                status = status.as_u16(),
                "Webhook delivered"
            );
            Ok(SendOutcome::Sent {
                metadata: Some(serde_json::json!({ "status": status.as_u16() })),
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(
                provider = %self.name,
                correlation_id = %ctx.correlation_id,
                status = status.as_u16(),
                "Webhook rejected"
            );
            Ok(SendOutcome::Failed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&body, 200)
            )))
        }
    }

    async fn health_check(&self) -> bool {
        let url = match &self.config.health_url {
            Some(url) => url,
            None => return true,
        };

        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.name, error = %e, "Webhook health check failed");
                false
            }
        }
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        let parsed: WebhookConfig =
            serde_json::from_value(config.clone()).map_err(|e| vec![e.to_string()])?;
        parsed.validate()
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_webhook_config_default() {
        let config = WebhookConfig::default();
        assert_eq!(config.timeout_secs, 30);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_webhook_requires_url() {
        let result = WebhookProvider::new("hook", WebhookConfig::default(), None);
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("url is required"));
    }

    #[test]
    fn test_validate_config_reports_all_errors() {
        let provider = WebhookProvider::from_options(
            "hook",
            &json!({"url": "http://localhost:9080/hook"}),
            None,
        )
        .unwrap();

        let errors = provider
            .validate_config(&json!({"url": "ftp://x", "health_url": "nope", "timeout_secs": 0}))
            .unwrap_err();
        assert_eq!(errors.len(), 3);

        assert!(provider.validate_config(&json!({"url": "https://example.com"})).is_ok());
        assert!(provider.validate_config(&json!({"token": "t"})).is_err());
    }

    #[test]
    fn test_envelope_serialization() {
        let payload = json!({"order_id": "o-1"});
        let recipients = vec![Recipient::new("ops")];
        let envelope = WebhookEnvelope {
            event_type: "order.created",
            correlation_id: "c-1",
            channel: "webhook",
            attempt: 2,
            payload: &payload,
            message: None,
            recipients: &recipients,
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event_type"], "order.created");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["payload"]["order_id"], "o-1");
        assert_eq!(value["recipients"][0]["address"], "ops");
        assert!(value.get("message").is_none());
    }

    #[tokio::test]
    async fn test_health_check_without_url_is_healthy() {
        let provider = WebhookProvider::from_options(
            "hook",
            &json!({"url": "http://localhost:9080/hook"}),
            None,
        )
        .unwrap();
        assert!(provider.health_check().await);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long message", 10), "this is...");
    }
}
