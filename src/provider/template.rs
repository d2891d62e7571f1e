//! 模板渲染
//!
//! 模板缓存由渲染器自己持有：启动时从配置填充，只在显式 `reload` 时整体替换。

use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// 模板渲染器（由 provider 调用）
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template_id: &str, variables: &Value) -> Result<String>;
}

/// `{{ field }}` / `{{ nested.field }}` 占位符替换
pub struct SimpleTemplateRenderer {
    templates: RwLock<HashMap<String, String>>,
    placeholder: Regex,
}

impl SimpleTemplateRenderer {
    pub fn new(templates: HashMap<String, String>) -> Self {
        Self {
            templates: RwLock::new(templates),
            placeholder: Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("placeholder pattern is valid"),
        }
    }

    /// 替换整个模板缓存
    pub fn reload(&self, templates: HashMap<String, String>) {
        let mut guard = self.templates.write().unwrap_or_else(|e| e.into_inner());
        *guard = templates;
    }

    pub fn contains(&self, template_id: &str) -> bool {
        let guard = self.templates.read().unwrap_or_else(|e| e.into_inner());
        guard.contains_key(template_id)
    }

    pub fn template_ids(&self) -> Vec<String> {
        let guard = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = guard.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for SimpleTemplateRenderer {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl TemplateRenderer for SimpleTemplateRenderer {
    fn render(&self, template_id: &str, variables: &Value) -> Result<String> {
        let template = {
            let guard = self.templates.read().unwrap_or_else(|e| e.into_inner());
            guard
                .get(template_id)
                .cloned()
                .ok_or_else(|| anyhow!("unknown template: {}", template_id))?
        };

        let rendered = self.placeholder.replace_all(&template, |caps: &regex::Captures| {
            lookup(variables, &caps[1]).map(value_to_text).unwrap_or_default()
        });

        Ok(rendered.into_owned())
    }
}

fn lookup<'a>(variables: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(variables, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
