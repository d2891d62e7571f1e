//! 接收者解析

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use super::Recipient;

/// 接收者加载器：在调用 provider 之前由编排器调用
#[async_trait]
pub trait RecipientLoader: Send + Sync {
    async fn resolve(&self, event_type: &str, payload: &Value) -> Result<Vec<Recipient>>;
}

/// 从 payload 中读取接收者
///
/// 1. `recipients` 数组：元素为字符串，或 `{address, channel, metadata}` 对象
/// 2. 否则读取常见地址字段：`email` -> email，`phone` -> sms，`user_id` -> 所有渠道
pub struct PayloadRecipientLoader;

impl PayloadRecipientLoader {
    pub fn new() -> Self {
        Self
    }

    fn from_list(list: &[Value]) -> Vec<Recipient> {
        list.iter()
            .filter_map(|entry| match entry {
                Value::String(s) if !s.trim().is_empty() => Some(Recipient::new(s.trim())),
                Value::Object(_) => serde_json::from_value::<Recipient>(entry.clone()).ok(),
                _ => None,
            })
            .collect()
    }

    fn from_well_known_fields(payload: &Value) -> Vec<Recipient> {
        let mut recipients = Vec::new();

        if let Some(email) = payload.get("email").and_then(|v| v.as_str()) {
            recipients.push(Recipient::new(email).for_channel("email"));
        }
        if let Some(phone) = payload.get("phone").and_then(|v| v.as_str()) {
            recipients.push(Recipient::new(phone).for_channel("sms"));
        }
        match payload.get("user_id") {
            Some(Value::String(id)) => recipients.push(Recipient::new(id.as_str())),
            Some(Value::Number(n)) => recipients.push(Recipient::new(n.to_string())),
            _ => {}
        }

        recipients
    }
}

impl Default for PayloadRecipientLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecipientLoader for PayloadRecipientLoader {
    async fn resolve(&self, _event_type: &str, payload: &Value) -> Result<Vec<Recipient>> {
        if let Some(list) = payload.get("recipients").and_then(|v| v.as_array()) {
            return Ok(Self::from_list(list));
        }
        Ok(Self::from_well_known_fields(payload))
    }
}
