//! 文件队列后端 - 单进程持久化
//!
//! 任务表整体以 JSON 快照保存：写临时文件再原子替换，写入期间持有 `<path>.lock` 的排他文件锁。
//! 变更先作用在任务表副本上，落盘成功后才替换内存状态；落盘失败时内存与磁盘保持一致。
//! 文件写入在 `spawn_blocking` 中执行，不占用异步 worker 线程。
//! 打开时把上次进程遗留的 active 任务放回 waiting（at-least-once）。
//!
//! 快照包含已完成与死信任务，每次变更都会完整重写；长期运行时应定期调用
//! `QueueManager::clean`（或 `evn clean`）控制文件大小。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{JobTable, QueueBackend, QueueStats, QueuedJob};
use crate::error::QueueError;

pub struct FileBackend {
    path: PathBuf,
    table: Mutex<JobTable>,
}

impl FileBackend {
    /// 打开（或创建）队列文件
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut table = Self::load(&path)?;
        let recovered = table.recover_active();
        write_snapshot(&path, &serde_json::to_string(&table)?)?;
        if recovered > 0 {
            info!(path = %path.display(), recovered, "Recovered in-flight jobs from previous run");
        }

        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<JobTable, QueueError> {
        if !path.exists() {
            return Ok(JobTable::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(JobTable::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn persist(&self, table: &JobTable) -> Result<(), QueueError> {
        let content = serde_json::to_string(table)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&path, &content))
            .await
            .map_err(|e| QueueError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// 在副本上修改任务表，落盘成功后替换
    ///
    /// `f` 返回的布尔值表示是否有变化，无变化时跳过落盘。
    async fn commit<T>(
        &self,
        f: impl FnOnce(&mut JobTable) -> Result<(T, bool), QueueError>,
    ) -> Result<T, QueueError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let (value, changed) = f(&mut next)?;
        if !changed {
            return Ok(value);
        }
        if let Err(e) = self.persist(&next).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist queue state");
            return Err(e);
        }
        *table = next;
        Ok(value)
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut JobTable) -> Result<T, QueueError>) -> Result<T, QueueError> {
        self.commit(|table| f(table).map(|value| (value, true))).await
    }
}

/// 写临时文件后原子替换（阻塞 I/O）
fn write_snapshot(path: &Path, content: &str) -> Result<(), QueueError> {
    use fs2::FileExt;

    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_extension("lock"))?;
    lock.lock_exclusive()?;

    let result = (|| -> Result<(), QueueError> {
        let temp_path = path.with_extension("tmp");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(content.as_bytes())?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    })();

    lock.unlock()?;
    result
}

#[async_trait]
impl QueueBackend for FileBackend {
    async fn push(&self, job: QueuedJob) -> Result<QueuedJob, QueueError> {
        self.mutate(|table| Ok(table.push(job))).await
    }

    async fn push_batch(&self, jobs: Vec<QueuedJob>) -> Result<Vec<QueuedJob>, QueueError> {
        self.mutate(|table| Ok(table.push_all(jobs))).await
    }

    async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        self.mutate(|table| table.remove(job_id)).await
    }

    async fn claim(&self, job_types: &[String], now: DateTime<Utc>) -> Result<Option<QueuedJob>, QueueError> {
        self.commit(|table| {
            let claimed = table.claim(job_types, now);
            let changed = claimed.is_some();
            Ok((claimed, changed))
        })
        .await
    }

    async fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.mutate(|table| table.complete(job_id, now)).await
    }

    async fn retry(&self, job_id: &str, scheduled_for: DateTime<Utc>, error: &str) -> Result<(), QueueError> {
        self.mutate(|table| table.retry(job_id, scheduled_for, error)).await
    }

    async fn dead_letter(&self, job_id: &str, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.mutate(|table| table.dead_letter(job_id, error, now)).await
    }

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.table.lock().await.get(job_id))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.table.lock().await.stats())
    }

    async fn clean(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        self.mutate(|table| Ok(table.clean(older_than))).await
    }

    async fn dead_letters(&self) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.table.lock().await.dead_letters())
    }

    async fn requeue_dead_letter(&self, job_id: &str, now: DateTime<Utc>) -> Result<QueuedJob, QueueError> {
        self.mutate(|table| table.requeue_dead_letter(job_id, now)).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        let table = self.table.lock().await;
        self.persist(&table).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, JobStatus};
    use serde_json::json;

    fn job() -> QueuedJob {
        QueuedJob::new("notification", "order.created", json!({"channel": "email"}), &EnqueueOptions::default(), Utc::now())
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let pushed = {
            let backend = FileBackend::open(&path).unwrap();
            let pushed = backend.push(job()).await.unwrap();
            backend.close().await.unwrap();
            pushed
        };

        let backend = FileBackend::open(&path).unwrap();
        let loaded = backend.get(&pushed.id).await.unwrap().unwrap();
        assert_eq!(loaded.payload["channel"], "email");
        assert_eq!(loaded.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn test_active_jobs_recovered_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.push(job()).await.unwrap();
            let claimed = backend.claim(&[], Utc::now()).await.unwrap();
            assert!(claimed.is_some());
            assert_eq!(backend.stats().await.unwrap().active, 1);
        }

        let backend = FileBackend::open(&path).unwrap();
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.waiting, 1);

        let reclaimed = backend.claim(&[], Utc::now()).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(FileBackend::open(&path), Err(QueueError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue").join("queue.json");
        let backend = FileBackend::open(&path).unwrap();
        let first = backend.push(job()).await.unwrap();

        // 目录被删除后无法写快照
        fs::remove_dir_all(path.parent().unwrap()).unwrap();

        assert!(matches!(backend.push(job()).await, Err(QueueError::Io(_))));
        assert!(backend.push_batch(vec![job(), job()]).await.is_err());
        assert!(backend.claim(&[], Utc::now()).await.is_err());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.active, 0);
        let kept = backend.get(&first.id).await.unwrap().unwrap();
        assert_eq!(kept.status, JobStatus::Waiting);
        assert_eq!(kept.attempts, 0);
    }

    #[tokio::test]
    async fn test_push_batch_and_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let kept = {
            let backend = FileBackend::open(&path).unwrap();
            let pushed = backend.push_batch(vec![job(), job()]).await.unwrap();
            assert!(pushed[0].seq < pushed[1].seq);
            backend.remove(&pushed[0].id).await.unwrap();
            assert!(matches!(backend.remove(&pushed[0].id).await, Err(QueueError::UnknownJob(_))));
            pushed[1].id.clone()
        };

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.stats().await.unwrap().waiting, 1);
        assert!(backend.get(&kept).await.unwrap().is_some());
    }
}
