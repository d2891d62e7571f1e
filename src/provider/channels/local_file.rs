//! 本地文件 provider - 将通知追加写入 JSONL 文件
//!
//! 适合审计记录、本地调试或作为 custom 渠道的落地方式。写入时持有排他文件锁，
//! 多个进程同时写同一文件也不会交错。

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::provider::{ChannelProvider, DeliveryContext, Recipient, SendOutcome, TemplateRenderer};

/// 文件中的一条通知记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredRecord {
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub correlation_id: String,
    pub channel: String,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct LocalFileOptions {
    path: PathBuf,
}

/// 本地文件 provider
pub struct LocalFileProvider {
    name: String,
    path: PathBuf,
    renderer: Option<Arc<dyn TemplateRenderer>>,
}

impl LocalFileProvider {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            renderer,
        }
    }

    pub fn from_options(
        name: impl Into<String>,
        options: &Value,
        renderer: Option<Arc<dyn TemplateRenderer>>,
    ) -> Result<Self> {
        let opts: LocalFileOptions = serde_json::from_value(options.clone())
            .map_err(|e| anyhow!("invalid local_file options: {}", e))?;
        Ok(Self::new(name, opts.path, renderer))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加记录（带文件锁）
    fn append(&self, record: &DeliveredRecord) -> Result<()> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let mut file = file;
        let written = writeln!(file, "{}", serde_json::to_string(record)?);
        file.unlock()?;
        written?;
        Ok(())
    }

    /// 读取最近 N 条记录
    pub fn read_recent(&self, n: usize) -> Vec<DeliveredRecord> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let records: Vec<DeliveredRecord> = BufReader::new(file)
            .lines()
            .filter_map(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        let start = records.len().saturating_sub(n);
        records[start..].to_vec()
    }
}

#[async_trait]
impl ChannelProvider for LocalFileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, payload: &Value, ctx: &DeliveryContext) -> Result<SendOutcome> {
        let message = match (&ctx.template_id, &self.renderer) {
            (Some(template_id), Some(renderer)) => Some(renderer.render(template_id, payload)?),
            _ => None,
        };

        let record = DeliveredRecord {
            ts: Utc::now(),
            event_type: ctx.event_type.clone(),
            correlation_id: ctx.correlation_id.clone(),
            channel: ctx.channel.clone(),
            attempt: ctx.attempt,
            recipients: ctx.recipients.clone(),
            message,
            payload: payload.clone(),
        };

        match self.append(&record) {
            Ok(()) => {
                debug!(
                    provider = %self.name,
                    correlation_id = %ctx.correlation_id,
                    "Notification recorded to local file"
                );
                Ok(SendOutcome::Sent {
                    metadata: Some(serde_json::json!({ "path": self.path.display().to_string() })),
                })
            }
            Err(e) => {
                warn!(
                    provider = %self.name,
                    error = %e,
                    "Failed to write notification to local file"
                );
                Ok(SendOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn health_check(&self) -> bool {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).is_ok(),
            _ => true,
        }
    }

    fn validate_config(&self, config: &Value) -> std::result::Result<(), Vec<String>> {
        let opts: LocalFileOptions =
            serde_json::from_value(config.clone()).map_err(|e| vec![e.to_string()])?;
        if opts.path.as_os_str().is_empty() {
            return Err(vec!["path is required".to_string()]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::SimpleTemplateRenderer;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx(template_id: Option<&str>) -> DeliveryContext {
        DeliveryContext {
            correlation_id: "c-1".to_string(),
            event_type: "order.created".to_string(),
            channel: "audit".to_string(),
            attempt: 1,
            template_id: template_id.map(String::from),
            recipients: vec![Recipient::new("ops")],
        }
    }

    #[tokio::test]
    async fn test_send_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalFileProvider::new("audit-log", dir.path().join("audit.jsonl"), None);

        let outcome = provider.send(&json!({"order_id": "o-1"}), &ctx(None)).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Sent { .. }));
        provider.send(&json!({"order_id": "o-2"}), &ctx(None)).await.unwrap();

        let records = provider.read_recent(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload["order_id"], "o-1");
        assert_eq!(records[1].correlation_id, "c-1");
        assert_eq!(provider.read_recent(1)[0].payload["order_id"], "o-2");
    }

    #[tokio::test]
    async fn test_send_renders_template() {
        let dir = tempfile::tempdir().unwrap();
        let mut templates = HashMap::new();
        templates.insert("t".to_string(), "order {{ order_id }}".to_string());
        let renderer: Arc<dyn TemplateRenderer> = Arc::new(SimpleTemplateRenderer::new(templates));
        let provider = LocalFileProvider::new("audit-log", dir.path().join("a.jsonl"), Some(renderer));

        provider.send(&json!({"order_id": "o-9"}), &ctx(Some("t"))).await.unwrap();
        assert_eq!(provider.read_recent(1)[0].message.as_deref(), Some("order o-9"));
    }

    #[test]
    fn test_from_options_requires_path() {
        assert!(LocalFileProvider::from_options("x", &json!({}), None).is_err());
        let provider = LocalFileProvider::from_options("x", &json!({"path": "/tmp/x.jsonl"}), None).unwrap();
        assert_eq!(provider.path(), Path::new("/tmp/x.jsonl"));
        assert!(provider.validate_config(&json!({"path": ""})).is_err());
    }

    #[test]
    fn test_read_recent_missing_file() {
        let provider = LocalFileProvider::new("x", "/nonexistent/dir/file.jsonl", None);
        assert!(provider.read_recent(5).is_empty());
    }
}
