//! 内置 provider 实现

pub mod command;
pub mod local_file;
pub mod webhook;

pub use command::{CommandConfig, CommandProvider};
pub use local_file::{DeliveredRecord, LocalFileProvider};
pub use webhook::{WebhookConfig, WebhookProvider};

use anyhow::Result;
use std::sync::Arc;

use super::{ChannelProvider, TemplateRenderer};
use crate::config::{ProviderConfig, ProviderKind};

/// 根据配置构建内置 provider
pub fn build_provider(
    config: &ProviderConfig,
    renderer: Option<Arc<dyn TemplateRenderer>>,
) -> Result<Arc<dyn ChannelProvider>> {
    let provider: Arc<dyn ChannelProvider> = match config.kind {
        ProviderKind::Webhook => Arc::new(WebhookProvider::from_options(&config.name, &config.options, renderer)?),
        ProviderKind::LocalFile => {
            Arc::new(LocalFileProvider::from_options(&config.name, &config.options, renderer)?)
        }
        ProviderKind::Command => Arc::new(CommandProvider::from_options(&config.name, &config.options, renderer)?),
    };
    Ok(provider)
}
