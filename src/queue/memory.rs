//! 内存队列后端（单进程，进程退出即丢失）

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard};

use super::{JobTable, QueueBackend, QueueStats, QueuedJob};
use crate::error::QueueError;

#[derive(Default)]
pub struct MemoryBackend {
    table: Mutex<JobTable>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push(&self, job: QueuedJob) -> Result<QueuedJob, QueueError> {
        Ok(self.table().push(job))
    }

    async fn push_batch(&self, jobs: Vec<QueuedJob>) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.table().push_all(jobs))
    }

    async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        self.table().remove(job_id)
    }

    async fn claim(&self, job_types: &[String], now: DateTime<Utc>) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.table().claim(job_types, now))
    }

    async fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.table().complete(job_id, now)
    }

    async fn retry(&self, job_id: &str, scheduled_for: DateTime<Utc>, error: &str) -> Result<(), QueueError> {
        self.table().retry(job_id, scheduled_for, error)
    }

    async fn dead_letter(&self, job_id: &str, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.table().dead_letter(job_id, error, now)
    }

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self.table().get(job_id))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.table().stats())
    }

    async fn clean(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        Ok(self.table().clean(older_than))
    }

    async fn dead_letters(&self) -> Result<Vec<QueuedJob>, QueueError> {
        Ok(self.table().dead_letters())
    }

    async fn requeue_dead_letter(&self, job_id: &str, now: DateTime<Utc>) -> Result<QueuedJob, QueueError> {
        self.table().requeue_dead_letter(job_id, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueOptions;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let backend = Arc::new(MemoryBackend::new());
        let now = Utc::now();
        for _ in 0..50 {
            backend
                .push(QueuedJob::new("t", "e", json!(null), &EnqueueOptions::default(), now))
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let backend = Arc::clone(&backend);
            tasks.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                while let Some(job) = backend.claim(&[], Utc::now()).await.unwrap() {
                    ids.push(job.id);
                }
                ids
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            all.extend(task.await.unwrap());
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 50);
        assert_eq!(all.len(), 50);
        assert_eq!(backend.stats().await.unwrap().active, 50);
    }
}
