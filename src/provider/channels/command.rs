//! 外部命令 provider
//!
//! 通过外部 CLI（chat / SMS 网关）发送消息：
//! `<program> [args...] --channel <channel> --target <target> --message <message>`
//! 退出码非 0 视为失败，stderr 作为错误信息。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info};

use crate::provider::{ChannelProvider, DeliveryContext, SendOutcome, TemplateRenderer};

/// 命令 provider 配置
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// 可执行文件（PATH 中的名称或绝对路径）
    pub program: String,
    /// 固定前缀参数，如 `["message", "send"]`
    #[serde(default)]
    pub args: Vec<String>,
    /// 固定目标；未配置时使用接收者地址（逗号分隔）
    #[serde(default)]
    pub target: Option<String>,
}

impl CommandConfig {
    fn validate(&self) -> std::result::Result<(), Vec<String>> {
        if self.program.trim().is_empty() {
            return Err(vec!["program is required".to_string()]);
        }
        if !program_exists(&self.program) {
            return Err(vec![format!("program not found: {}", self.program)]);
        }
        Ok(())
    }
}

fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.is_absolute() {
        return path.exists();
    }
    which::which(program).is_ok()
}

/// 外部命令 provider
pub struct CommandProvider {
    name: String,
    config: CommandConfig,
    renderer: Option<Arc<dyn TemplateRenderer>>,
}

impl CommandProvider {
    pub fn new(
        name: impl Into<String>,
        config: CommandConfig,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| anyhow!("invalid command config: {}", errors.join("; ")))?;
        Ok(Self {
            name: name.into(),
            config,
            renderer,
        })
    }

    pub fn from_options(
        name: impl Into<String>,
        options: &Value,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Result<Self> {
        let config: CommandConfig = serde_json::from_value(options.clone())
            .map_err(|e| anyhow!("invalid command options: {}", e))?;
        Self::new(name, config, renderer)
    }

    /// 消息内容：有模板时渲染，否则为 payload JSON
    fn format_message(&self, payload: &Value, ctx: &DeliveryContext) -> Result<String> {
        match (&ctx.template_id, &self.renderer) {
            (Some(template_id), Some(renderer)) => renderer.render(template_id, payload),
            _ => Ok(serde_json::to_string(payload)?),
        }
    }

    fn target(&self, ctx: &DeliveryContext) -> Option<String> {
        if let Some(target) = &self.config.target {
            return Some(target.clone());
        }
        if ctx.recipients.is_empty() {
            return None;
        }
        Some(
            ctx.recipients
                .iter()
                .map(|r| r.address.as_str())
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

#[async_trait]
impl ChannelProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &Value, ctx: &DeliveryContext) -> Result<SendOutcome> {
        let target = match self.target(ctx) {
            Some(t) => t,
            None => return Ok(SendOutcome::Skipped("no recipient for channel".to_string())),
        };
        let message = self.format_message(payload, ctx)?;

        let output = Command::new(&self.config.program)
            .args(&self.config.args)
            .args(["--channel", &ctx.channel, "--target", &target, "--message", &message])
            .stdin(Stdio::null())
            .output()
            .await?;

        if output.status.success() {
            info!(
                provider = %self.name,
                channel = %ctx.channel,
                target = %target,
                correlation_id = %ctx.correlation_id,
                "Message sent successfully"
            );
            Ok(SendOutcome::sent())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(
                provider = %self.name,
                channel = %ctx.channel,
                error = %stderr,
                "Failed to send message"
            );
            let reason = if stderr.is_empty() {
                format!("command exited with {}", output.status)
            } else {
                stderr
            };
            Ok(SendOutcome::Failed(reason))
        }
    }

    async fn health_check(&self) -> bool {
        program_exists(&self.config.program)
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        let parsed: CommandConfig =
            serde_json::from_value(config.clone()).map_err(|e| vec![e.to_string()])?;
        parsed.validate()
    }
}
