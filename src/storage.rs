//! 存储抽象 - get/put/query 契约
//!
//! 核心只依赖这个窄接口；`MemoryStorage` 用于测试和单进程部署，
//! `FileStorage` 是 JSONL 追加日志（带文件锁），同一 key 以最后一次写入为准。

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 投递结果命名空间，key: `<correlation_id>:<channel>`
pub const NOTIFICATION_RESULTS: &str = "notification_results";
/// emit 结果命名空间，key: correlation id
pub const EMISSIONS: &str = "emissions";
/// provider 健康记录命名空间，key: `<channel>:<provider>`
pub const PROVIDER_HEALTH: &str = "provider_health";

/// 存储契约
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()>;

    /// 按 key 前缀查询，按 key 排序返回
    async fn query(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Value)>>;
}

/// 内存存储
#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn query(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Value)>> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data
            .get(namespace)
            .map(|ns| {
                ns.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// JSONL 文件中的一行
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    ns: String,
    key: String,
    value: Value,
}

/// JSONL 文件存储
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 默认路径：`~/.config/event-notify/storage.jsonl`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("event-notify")
            .join("storage.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &StoredEntry) -> Result<()> {
        use fs2::FileExt;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let mut file = file;
        let written = writeln!(file, "{}", serde_json::to_string(entry)?);
        file.unlock()?;
        written?;
        Ok(())
    }

    /// 读取某命名空间的最新值
    fn load(&self, namespace: &str) -> Result<BTreeMap<String, Value>> {
        let mut latest = BTreeMap::new();
        if !self.path.exists() {
            return Ok(latest);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        for line in reader.lines() {
            let line = line?;
            // 截断的尾行直接跳过
            if let Ok(entry) = serde_json::from_str::<StoredEntry>(&line) {
                if entry.ns == namespace {
                    latest.insert(entry.key, entry.value);
                }
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        Ok(self.load(namespace)?.remove(key))
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.append(&StoredEntry {
            ns: namespace.to_string(),
            key: key.to_string(),
            value,
        })
    }

    async fn query(&self, namespace: &str, prefix: &str) -> Result<Vec<(String, Value)>> {
        Ok(self
            .load(namespace)?
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect())
    }
}
