//! Emit 命令 - 从命令行发射一个事件
//!
//! 异步模式下等待队列空闲（有上限）后，打印已持久化的渠道结果。

use anyhow::{anyhow, Result};
use clap::Args;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use super::output::{format_output, result_line};
use crate::error::DispatchError;
use crate::event_type::{Priority, ProcessingMode};
use crate::types::{EmissionResult, EmissionStatus, EmitOptions, NotificationResult};

/// 异步投递的最长等待时间
const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Emit 命令参数
#[derive(Args)]
pub struct EmitArgs {
    /// 事件类型
    pub event_type: String,

    /// JSON payload
    #[arg(long, short, default_value = "{}")]
    pub payload: String,

    /// 处理模式: sync, async, auto
    #[arg(long)]
    pub mode: Option<ProcessingMode>,

    /// 等待投递结果（auto 模式下选择同步）
    #[arg(long)]
    pub wait: bool,

    /// 优先级: low, normal, high
    #[arg(long)]
    pub priority: Option<Priority>,

    /// 延迟投递（毫秒）
    #[arg(long)]
    pub delay_ms: Option<u64>,

    /// 同步超时（毫秒）
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[arg(long)]
    pub correlation_id: Option<String>,

    /// 配置文件路径
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

impl EmitArgs {
    /// 解析 payload 并组装 emit 选项
    pub fn to_request(&self) -> Result<(Value, EmitOptions)> {
        let payload: Value =
            serde_json::from_str(&self.payload).map_err(|e| anyhow!("--payload is not valid JSON: {}", e))?;

        let mut options = EmitOptions::new();
        if let Some(mode) = self.mode {
            options = options.with_mode(mode);
        }
        if self.wait {
            options = options.with_wait_for_result(true);
        }
        if let Some(priority) = self.priority {
            options = options.with_priority(priority);
        }
        if let Some(ms) = self.delay_ms {
            options = options.with_delay(Duration::from_millis(ms));
        }
        if let Some(ms) = self.timeout_ms {
            options = options.with_timeout(Duration::from_millis(ms));
        }
        if let Some(id) = &self.correlation_id {
            options = options.with_correlation_id(id.clone());
        }
        Ok((payload, options))
    }
}

/// Emit 命令输出
#[derive(Debug, Serialize)]
pub struct EmitOutput {
    #[serde(flatten)]
    pub emission: EmissionResult,
    /// 异步投递完成后从存储读取的结果
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delivered: Vec<NotificationResult>,
}

/// 处理 emit 命令，返回 emission 状态
pub async fn handle_emit(args: EmitArgs) -> Result<EmissionStatus> {
    let (payload, mut options) = args.to_request()?;
    let correlation_id = options
        .correlation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    options = options.with_correlation_id(correlation_id.clone());

    let engine = super::load_engine(args.config.as_deref(), true).await?;

    let emission = match engine.emit(&args.event_type, payload, options).await {
        Ok(result) => result,
        Err(e) => fold_error(e, &correlation_id)?,
    };

    let mut delivered = Vec::new();
    if emission.status == EmissionStatus::Queued {
        if !engine.wait_idle(IDLE_WAIT).await {
            warn!(correlation_id = %correlation_id, "Queue did not drain before the wait limit");
        }
        delivered = engine.results(&correlation_id).await?;
    }
    engine.shutdown().await?;

    let status = emission.status;
    let output = EmitOutput { emission, delivered };
    println!("{}", format_output(&output, args.json, render_text));
    Ok(status)
}

fn fold_error(error: DispatchError, correlation_id: &str) -> Result<EmissionResult> {
    EmissionResult::from_error(error, correlation_id).map_err(anyhow::Error::from)
}

fn render_text(output: &EmitOutput) -> String {
    let emission = &output.emission;
    let mut lines = vec![
        format!("status: {}", emission.status),
        format!("correlation_id: {}", emission.correlation_id),
    ];
    if let Some(errors) = &emission.validation_errors {
        lines.push("validation errors:".to_string());
        lines.extend(errors.iter().map(|e| format!("  {}", e)));
    }
    let results = emission.results.as_deref().unwrap_or(output.delivered.as_slice());
    if !results.is_empty() {
        lines.push("channels:".to_string());
        lines.extend(results.iter().map(result_line));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldError;
    use clap::Parser;
    use serde_json::json;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        emit: EmitArgs,
    }

    #[test]
    fn test_parse_emit_args() {
        let cli = TestCli::parse_from([
            "evn",
            "order.created",
            "--payload",
            r#"{"order_id": "o-1"}"#,
            "--mode",
            "sync",
            "--priority",
            "high",
            "--timeout-ms",
            "500",
            "--correlation-id",
            "c-1",
        ]);
        let (payload, options) = cli.emit.to_request().unwrap();
        assert_eq!(payload, json!({"order_id": "o-1"}));
        assert_eq!(options.mode, Some(ProcessingMode::Sync));
        assert_eq!(options.priority, Some(Priority::High));
        assert_eq!(options.timeout, Some(Duration::from_millis(500)));
        assert_eq!(options.correlation_id.as_deref(), Some("c-1"));
        assert!(options.wait_for_result.is_none());
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        let cli = TestCli::parse_from(["evn", "order.created", "--payload", "{not json"]);
        let err = cli.emit.to_request().unwrap_err();
        assert!(err.to_string().contains("--payload"));
    }

    #[test]
    fn test_render_text_lists_validation_errors() {
        let emission = EmissionResult::from_error(
            DispatchError::Validation(vec![FieldError::new("order_id", "required field is missing")]),
            "c-1",
        )
        .unwrap();
        let text = render_text(&EmitOutput {
            emission,
            delivered: Vec::new(),
        });
        assert!(text.contains("status: rejected"));
        assert!(text.contains("order_id: required field is missing"));
    }

    #[test]
    fn test_render_text_uses_delivered_results() {
        let text = render_text(&EmitOutput {
            emission: EmissionResult::new(EmissionStatus::Queued, "c-2"),
            delivered: vec![NotificationResult::sent("email", "mailbox", 1, None)],
        });
        assert!(text.contains("status: queued"));
        assert!(text.contains("email"));
        assert!(text.contains("provider=mailbox"));
    }
}
