//! Event Notify CLI
//!
//! 按配置发射事件、查看队列状态与死信、校验配置

use anyhow::Result;
use clap::{Parser, Subcommand};
use event_notify::cli::{
    handle_clean, handle_dead_letters, handle_emit, handle_retry, handle_stats, handle_types, handle_validate,
    CleanArgs, EmitArgs, InspectArgs, RetryArgs, ValidateArgs,
};
use event_notify::types::EmissionStatus;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "evn")]
#[command(about = "Event Notify - 事件通知分发引擎")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发射一个事件
    Emit(EmitArgs),
    /// 列出已配置的事件类型
    Types(InspectArgs),
    /// 校验配置文件
    Validate(ValidateArgs),
    /// 查看队列统计与 provider 健康状态
    Stats(InspectArgs),
    /// 清理已结束的任务
    Clean(CleanArgs),
    /// 列出死信任务
    DeadLetters(InspectArgs),
    /// 将死信任务放回等待队列
    Retry(RetryArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，例如: RUST_LOG=debug evn emit order.created
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("event_notify=info,evn=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Emit(args) => {
            let status = handle_emit(args).await?;
            if matches!(status, EmissionStatus::Rejected | EmissionStatus::RateLimited) {
                std::process::exit(1);
            }
        }
        Commands::Types(args) => handle_types(args).await?,
        Commands::Validate(args) => {
            if !handle_validate(args)? {
                std::process::exit(1);
            }
        }
        Commands::Stats(args) => handle_stats(args).await?,
        Commands::Clean(args) => handle_clean(args).await?,
        Commands::DeadLetters(args) => handle_dead_letters(args).await?,
        Commands::Retry(args) => handle_retry(args).await?,
    }

    Ok(())
}
