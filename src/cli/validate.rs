//! Validate 命令 - 检查配置文件，不启动任何 worker

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::output::format_output;
use crate::config::EngineConfig;
use crate::engine::build_providers;
use crate::error::DispatchError;
use crate::event_type::EventTypeRegistry;
use crate::provider::{SimpleTemplateRenderer, TemplateRenderer};

/// Validate 命令参数
#[derive(Args)]
pub struct ValidateArgs {
    /// 配置文件路径
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// 输出 JSON 格式
    #[arg(long)]
    pub json: bool,
}

/// 校验报告
#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub path: String,
    pub valid: bool,
    pub event_types: usize,
    pub providers: usize,
    pub problems: Vec<String>,
}

/// 校验配置，收集全部问题
pub fn validate_config(config: &EngineConfig) -> Vec<String> {
    let mut problems = Vec::new();
    let mut collect = |result: Result<(), DispatchError>| match result {
        Ok(()) => {}
        Err(DispatchError::Config(list)) => problems.extend(list),
        Err(e) => problems.push(e.to_string()),
    };

    collect(config.validate());
    collect(EventTypeRegistry::from_definitions(config.event_types.clone()).map(|_| ()));

    let renderer: Arc<dyn TemplateRenderer> = Arc::new(SimpleTemplateRenderer::new(config.templates.clone()));
    collect(build_providers(config, Some(renderer)).map(|_| ()));
    problems
}

pub fn validate_file(path: Option<&Path>) -> ValidationReport {
    let resolved = EngineConfig::resolve_path(path);
    let (problems, event_types, providers) = match EngineConfig::load(Some(&resolved)) {
        Ok(config) => (
            validate_config(&config),
            config.event_types.len(),
            config.providers.len(),
        ),
        Err(e) => (vec![format!("{:#}", e)], 0, 0),
    };
    ValidationReport {
        path: resolved.display().to_string(),
        valid: problems.is_empty(),
        event_types,
        providers,
        problems,
    }
}

/// 处理 validate 命令，返回配置是否有效
pub fn handle_validate(args: ValidateArgs) -> Result<bool> {
    let report = validate_file(args.config.as_deref());
    println!(
        "{}",
        format_output(&report, args.json, |r| {
            if r.valid {
                format!(
                    "{} is valid ({} event types, {} providers)",
                    r.path, r.event_types, r.providers
                )
            } else {
                let mut lines = vec![format!("{} is invalid:", r.path)];
                lines.extend(r.problems.iter().map(|p| format!("  - {}", p)));
                lines.join("\n")
            }
        })
    );
    Ok(report.valid)
}
