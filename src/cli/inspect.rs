//! 运维命令 - 查看事件类型、队列状态与死信，清理与人工重试

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use super::load_engine;
use super::output::format_output;
use crate::engine::{Engine, HANDLER_QUEUE, NOTIFICATION_QUEUE};
use crate::health::ProviderHealthRecord;
use crate::queue::{QueueStats, QueuedJob};

/// 只读命令的通用参数
#[derive(Args)]
pub struct InspectArgs {
    /// 配置文件路径
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

/// Clean 命令参数
#[derive(Args)]
pub struct CleanArgs {
    /// 删除结束超过 N 秒的任务
    #[arg(long, default_value = "86400")]
    pub older_than_secs: u64,

    #[command(flatten)]
    pub common: InspectArgs,
}

/// Retry 命令参数
#[derive(Args)]
pub struct RetryArgs {
    /// 死信任务 ID
    pub job_id: String,

    #[command(flatten)]
    pub common: InspectArgs,
}

/// 事件类型摘要
#[derive(Debug, Serialize)]
pub struct TypeSummary {
    pub name: String,
    pub enabled: bool,
    pub mode: String,
    pub priority: String,
    pub channels: Vec<String>,
    pub max_attempts: u32,
    pub rate_limited: bool,
}

pub fn type_summaries(engine: &Engine) -> Vec<TypeSummary> {
    let registry = engine.registry();
    let mut summaries: Vec<TypeSummary> = registry
        .definitions()
        .iter()
        .map(|def| TypeSummary {
            name: def.name.clone(),
            enabled: registry.is_enabled(&def.name),
            mode: def.mode.as_str().to_string(),
            priority: def.priority.as_str().to_string(),
            channels: def.channels.clone(),
            max_attempts: def.max_attempts(),
            rate_limited: def.rate_limit.is_some(),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    summaries
}

/// 处理 types 命令
pub async fn handle_types(args: InspectArgs) -> Result<()> {
    let engine = load_engine(args.config.as_deref(), false).await?;
    let summaries = type_summaries(&engine);
    engine.shutdown().await?;

    println!(
        "{}",
        format_output(&summaries, args.json, |types| {
            if types.is_empty() {
                return "No event types configured".to_string();
            }
            types
                .iter()
                .map(|t| {
                    format!(
                        "{:<24} {:<8} {:<6} {:<6} attempts={} channels={}{}",
                        t.name,
                        if t.enabled { "enabled" } else { "disabled" },
                        t.mode,
                        t.priority,
                        t.max_attempts,
                        t.channels.join(","),
                        if t.rate_limited { " rate-limited" } else { "" }
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    );
    Ok(())
}

/// 队列与 provider 健康状态
#[derive(Debug, Serialize)]
pub struct StatsOutput {
    pub notification: QueueStats,
    pub handler: QueueStats,
    pub providers: Vec<ProviderHealthRecord>,
}

/// 处理 stats 命令
pub async fn handle_stats(args: InspectArgs) -> Result<()> {
    let engine = load_engine(args.config.as_deref(), false).await?;
    engine.check_health().await;
    let output = StatsOutput {
        notification: engine.notification_stats().await?,
        handler: engine.handler_stats().await?,
        providers: engine.provider_health(),
    };
    engine.shutdown().await?;

    println!("{}", format_output(&output, args.json, render_stats));
    Ok(())
}

fn render_stats(output: &StatsOutput) -> String {
    let queue_line = |name: &str, s: &QueueStats| {
        format!(
            "{:<13} waiting={} active={} completed={} failed={}",
            name, s.waiting, s.active, s.completed, s.failed
        )
    };
    let mut lines = vec![
        queue_line(NOTIFICATION_QUEUE, &output.notification),
        queue_line(HANDLER_QUEUE, &output.handler),
    ];
    for record in &output.providers {
        let mut line = format!(
            "provider {}:{} {}",
            record.channel,
            record.provider,
            if record.is_healthy { "healthy" } else { "unhealthy" }
        );
        if let Some(error) = &record.last_error {
            line.push_str(&format!(" ({})", error));
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// 死信摘要
#[derive(Debug, Serialize)]
pub struct DeadLetterSummary {
    pub queue: String,
    pub id: String,
    pub job_type: String,
    pub event_type: String,
    pub correlation_id: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeadLetterSummary {
    fn from_job(queue: &str, job: QueuedJob) -> Self {
        Self {
            queue: queue.to_string(),
            id: job.id,
            job_type: job.job_type,
            event_type: job.event_type,
            correlation_id: job.correlation_id,
            attempts: job.attempts,
            last_error: job.last_error,
            finished_at: job.finished_at,
        }
    }
}

/// 处理 dead-letters 命令
pub async fn handle_dead_letters(args: InspectArgs) -> Result<()> {
    let engine = load_engine(args.config.as_deref(), false).await?;
    let mut summaries: Vec<DeadLetterSummary> = engine
        .dead_letters()
        .await?
        .into_iter()
        .map(|job| DeadLetterSummary::from_job(NOTIFICATION_QUEUE, job))
        .collect();
    summaries.extend(
        engine
            .handler_dead_letters()
            .await?
            .into_iter()
            .map(|job| DeadLetterSummary::from_job(HANDLER_QUEUE, job)),
    );
    engine.shutdown().await?;

    println!(
        "{}",
        format_output(&summaries, args.json, |jobs| {
            if jobs.is_empty() {
                return "No dead-lettered jobs".to_string();
            }
            jobs.iter()
                .map(|j| {
                    format!(
                        "{} [{}] {} {} attempts={} error={}",
                        j.id,
                        j.queue,
                        j.job_type,
                        j.event_type,
                        j.attempts,
                        j.last_error.as_deref().unwrap_or("-")
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
    );
    Ok(())
}

/// 处理 clean 命令
pub async fn handle_clean(args: CleanArgs) -> Result<()> {
    let engine = load_engine(args.common.config.as_deref(), false).await?;
    let removed = engine.clean(Duration::from_secs(args.older_than_secs)).await?;
    engine.shutdown().await?;

    let output = serde_json::json!({ "removed": removed });
    println!(
        "{}",
        format_output(&output, args.common.json, |_| format!("Removed {} finished jobs", removed))
    );
    Ok(())
}

/// 处理 retry 命令
pub async fn handle_retry(args: RetryArgs) -> Result<()> {
    let engine = load_engine(args.common.config.as_deref(), false).await?;
    let result = engine.retry_dead_letter(&args.job_id).await;
    engine.shutdown().await?;
    let job = result?;

    println!(
        "{}",
        format_output(&job, args.common.json, |j| format!(
            "Job {} ({}) moved back to waiting",
            j.id, j.job_type
        ))
    );
    Ok(())
}
