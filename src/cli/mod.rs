//! CLI command handling

pub mod emit;
pub mod inspect;
pub mod output;
pub mod validate;

pub use emit::*;
pub use inspect::*;
pub use output::*;
pub use validate::*;

use anyhow::Result;
use std::path::Path;

use crate::config::EngineConfig;
use crate::engine::Engine;

/// 加载配置并构建引擎
///
/// 只读检查类命令传 `start_workers = false`，不会消费队列中的任务。
pub async fn load_engine(config: Option<&Path>, start_workers: bool) -> Result<Engine> {
    let config = EngineConfig::load(config)?;
    let engine = Engine::builder(config).start_workers(start_workers).build().await?;
    Ok(engine)
}
