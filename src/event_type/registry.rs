//! 事件类型注册表
//!
//! 启动时一次性加载；重复名称或非法策略直接失败。
//! `enabled` 是唯一允许的运行时修改，单独存放，定义本身保持不可变。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::info;

use super::definition::{BackoffKind, EventTypeDefinition};
use crate::error::{DispatchError, DispatchResult};

pub struct EventTypeRegistry {
    definitions: HashMap<String, Arc<EventTypeDefinition>>,
    enabled: RwLock<HashMap<String, bool>>,
}

impl EventTypeRegistry {
    /// 从定义列表构建注册表
    pub fn from_definitions(definitions: Vec<EventTypeDefinition>) -> DispatchResult<Self> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();

        for def in &definitions {
            if def.name.trim().is_empty() {
                problems.push("event type with empty name".to_string());
                continue;
            }
            if !seen.insert(def.name.clone()) {
                problems.push(format!("duplicate event type: {}", def.name));
            }
            problems.extend(check_definition(def));
        }

        if !problems.is_empty() {
            return Err(DispatchError::Config(problems));
        }

        let enabled = definitions
            .iter()
            .map(|d| (d.name.clone(), d.enabled))
            .collect();
        let definitions: HashMap<_, _> = definitions
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(d)))
            .collect();

        info!(count = definitions.len(), "Event type registry loaded");

        Ok(Self {
            definitions,
            enabled: RwLock::new(enabled),
        })
    }

    /// 获取定义（不检查 enabled）
    pub fn get(&self, name: &str) -> DispatchResult<Arc<EventTypeDefinition>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::EventNotFound(name.to_string()))
    }

    /// 获取已启用的定义，未知或已禁用都返回 `EventNotFound`
    pub fn get_enabled(&self, name: &str) -> DispatchResult<Arc<EventTypeDefinition>> {
        let def = self.get(name)?;
        if !self.is_enabled(name) {
            return Err(DispatchError::EventNotFound(name.to_string()));
        }
        Ok(def)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        let enabled = self.enabled.read().unwrap_or_else(|e| e.into_inner());
        enabled.get(name).copied().unwrap_or(false)
    }

    pub fn set_enabled(&self, name: &str, value: bool) -> DispatchResult<()> {
        if !self.definitions.contains_key(name) {
            return Err(DispatchError::EventNotFound(name.to_string()));
        }
        let mut enabled = self.enabled.write().unwrap_or_else(|e| e.into_inner());
        enabled.insert(name.to_string(), value);
        info!(event_type = %name, enabled = value, "Event type toggled");
        Ok(())
    }

    /// 所有事件类型名称（排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<Arc<EventTypeDefinition>> {
        self.names()
            .iter()
            .filter_map(|n| self.definitions.get(n).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn check_definition(def: &EventTypeDefinition) -> Vec<String> {
    let mut problems = Vec::new();

    if let Some(retry) = &def.retry {
        if retry.attempts < 1 {
            problems.push(format!("{}: retry.attempts must be >= 1", def.name));
        }
        if retry.backoff != BackoffKind::None && retry.delay_ms == 0 && retry.attempts > 1 {
            problems.push(format!("{}: retry.delay_ms must be > 0 when retrying", def.name));
        }
    }

    if let Some(limit) = &def.rate_limit {
        if limit.max_requests < 1 {
            problems.push(format!("{}: rate_limit.max_requests must be >= 1", def.name));
        }
        if limit.window_ms == 0 {
            problems.push(format!("{}: rate_limit.window_ms must be > 0", def.name));
        }
    }

    for channel in def.templates.keys() {
        if !def.channels.contains(channel) {
            problems.push(format!(
                "{}: template configured for unknown channel {}",
                def.name, channel
            ));
        }
    }

    problems
}
