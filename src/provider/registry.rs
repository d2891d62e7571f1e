//! provider 注册表 - 管理每个渠道的 provider 并做路由选择

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::ChannelProvider;
use crate::health::ProviderHealthTracker;

/// 路由选择结果
pub enum ProviderSelection {
    /// 选中的 provider
    Selected(Arc<dyn ChannelProvider>),
    /// 渠道没有注册 provider
    NoProvider,
    /// 所有 provider 都不健康（无可用 fallback）
    AllUnhealthy { primary: String },
}

/// provider 注册表
pub struct ProviderRegistry {
    /// 渠道 -> provider（按注册顺序，第一个为主 provider）
    providers: HashMap<String, Vec<Arc<dyn ChannelProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// 注册 provider
    pub fn register(&mut self, channel: impl Into<String>, provider: Arc<dyn ChannelProvider>) {
        let channel = channel.into();
        info!(channel = %channel, provider = provider.name(), "Registering channel provider");
        self.providers.entry(channel).or_default().push(provider);
    }

    /// 选择渠道的 provider：按注册顺序取第一个健康的
    pub fn select(&self, channel: &str, health: &ProviderHealthTracker) -> ProviderSelection {
        let candidates = match self.providers.get(channel) {
            Some(list) if !list.is_empty() => list,
            _ => return ProviderSelection::NoProvider,
        };

        for provider in candidates {
            if health.is_healthy(channel, provider.name()) {
                return ProviderSelection::Selected(provider.clone());
            }
        }

        ProviderSelection::AllUnhealthy {
            primary: candidates[0].name().to_string(),
        }
    }

    pub fn providers_for(&self, channel: &str) -> Vec<Arc<dyn ChannelProvider>> {
        self.providers.get(channel).cloned().unwrap_or_default()
    }

    /// 所有 (渠道, provider) 对
    pub fn all(&self) -> Vec<(String, Arc<dyn ChannelProvider>)> {
        let mut all: Vec<_> = self
            .providers
            .iter()
            .flat_map(|(channel, list)| list.iter().map(move |p| (channel.clone(), p.clone())))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.providers.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.providers.get(channel).map_or(false, |l| !l.is_empty())
    }

    pub fn provider_count(&self) -> usize {
        self.providers.values().map(|l| l.len()).sum()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DeliveryContext, SendOutcome};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    struct NamedProvider(&'static str);

    #[async_trait]
    impl ChannelProvider for NamedProvider {
        fn name(&self) -> &str {
            self.0
        }

        async fn send(&self, _payload: &Value, _ctx: &DeliveryContext) -> Result<SendOutcome> {
            Ok(SendOutcome::sent())
        }
    }

    fn select_name(registry: &ProviderRegistry, channel: &str, health: &ProviderHealthTracker) -> Option<String> {
        match registry.select(channel, health) {
            ProviderSelection::Selected(p) => Some(p.name().to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_select_primary_then_fallback() {
        let mut registry = ProviderRegistry::new();
        registry.register("email", Arc::new(NamedProvider("smtp")));
        registry.register("email", Arc::new(NamedProvider("ses")));
        let health = ProviderHealthTracker::new(1);

        assert_eq!(select_name(&registry, "email", &health), Some("smtp".to_string()));

        health.record_failure("email", "smtp", "down");
        assert_eq!(select_name(&registry, "email", &health), Some("ses".to_string()));

        health.record_failure("email", "ses", "down");
        assert!(matches!(
            registry.select("email", &health),
            ProviderSelection::AllUnhealthy { ref primary } if primary == "smtp"
        ));
    }

    #[test]
    fn test_select_unknown_channel() {
        let registry = ProviderRegistry::new();
        let health = ProviderHealthTracker::new(5);
        assert!(matches!(registry.select("sms", &health), ProviderSelection::NoProvider));
    }

    #[test]
    fn test_all_and_channels() {
        let mut registry = ProviderRegistry::new();
        registry.register("webhook", Arc::new(NamedProvider("hook")));
        registry.register("email", Arc::new(NamedProvider("smtp")));
        assert_eq!(registry.channels(), vec!["email", "webhook"]);
        assert_eq!(registry.provider_count(), 2);
        assert_eq!(registry.all()[0].0, "email");
        assert!(registry.has_channel("email"));
        assert!(!registry.has_channel("sms"));
    }
}
