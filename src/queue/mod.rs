//! 任务队列 - 统一的后端契约 + worker 池
//!
//! - `QueueBackend`：任务状态的唯一所有者（内存 / 文件，可插拔）
//! - `QueueManager`：入队、注册处理器、worker 池、统计/清理/关闭
//!
//! 队列不解释 payload；处理器返回 `JobOutcome` 决定完成、延迟重试或进入死信。
//! 认领顺序：`scheduled_for` 未到的任务不可见；高优先级先于低优先级，同优先级 FIFO。

pub mod file;
pub mod manager;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::error::QueueError;
use crate::event_type::Priority;

pub use file::FileBackend;
pub use manager::QueueManager;
pub use memory::MemoryBackend;

/// 通知投递任务类型（每个渠道一个任务）
pub const NOTIFICATION_JOB: &str = "notification";

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    DeadLettered,
}

/// 队列中的任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: String,
    pub job_type: String,
    pub event_type: String,
    pub payload: Value,
    pub correlation_id: String,
    pub priority: Priority,
    /// 入队序号，同优先级内 FIFO
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    /// 之前不可被认领
    pub scheduled_for: DateTime<Utc>,
    /// 已认领次数
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    pub fn new(
        job_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: Value,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            event_type: event_type.into(),
            payload,
            correlation_id: options
                .correlation_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            priority: options.priority,
            seq: 0,
            enqueued_at: now,
            scheduled_for: after(now, options.delay.unwrap_or_default()),
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            status: JobStatus::Waiting,
            last_error: None,
            finished_at: None,
        }
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.scheduled_for <= now
    }
}

/// 入队选项
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub delay: Option<Duration>,
    /// 总认领次数上限，达到后处理器要求重试也会进入死信
    pub max_attempts: u32,
    pub correlation_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            delay: None,
            max_attempts: 1,
            correlation_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// 队列统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    /// 死信数量
    pub failed: usize,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.waiting == 0 && self.active == 0
    }
}

/// 处理器对一次认领的结论
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// 延迟后重新可见；次数用尽时由 manager 转为死信
    Retry { delay: Duration, error: String },
    DeadLetter { error: String },
}

/// 任务处理器（每种 job type 恰好一个）
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &QueuedJob) -> JobOutcome;
}

/// 队列后端契约
///
/// 后端独占任务状态：一个任务同一时刻只会被一个 worker 认领。
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// 写入新任务，分配序号后返回
    async fn push(&self, job: QueuedJob) -> Result<QueuedJob, QueueError>;

    /// 整批写入：要么全部可见，要么一个都不留
    ///
    /// 默认实现逐个 `push`，中途失败时删除已写入的任务再返回原错误。
    /// 回滚前已被其他 worker 认领的任务无法撤回；有并发认领者的后端应覆盖为原子写入。
    async fn push_batch(&self, jobs: Vec<QueuedJob>) -> Result<Vec<QueuedJob>, QueueError> {
        let mut pushed = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.push(job).await {
                Ok(job) => pushed.push(job),
                Err(e) => {
                    for job in &pushed {
                        if let Err(undo) = self.remove(&job.id).await {
                            warn!(job_id = %job.id, error = %undo, "Failed to roll back partially enqueued job");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(pushed)
    }

    /// 删除仍在等待的任务（批量写入回滚用）
    async fn remove(&self, job_id: &str) -> Result<(), QueueError>;

    /// 认领一个可见任务（`job_types` 为空表示任意类型），attempts + 1
    async fn claim(&self, job_types: &[String], now: DateTime<Utc>) -> Result<Option<QueuedJob>, QueueError>;

    async fn complete(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), QueueError>;

    /// 放回等待队列，`scheduled_for` 之前不可见
    async fn retry(&self, job_id: &str, scheduled_for: DateTime<Utc>, error: &str) -> Result<(), QueueError>;

    async fn dead_letter(&self, job_id: &str, error: &str, now: DateTime<Utc>) -> Result<(), QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<QueuedJob>, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// 删除 `older_than` 之前结束的已完成/死信任务
    async fn clean(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError>;

    async fn dead_letters(&self) -> Result<Vec<QueuedJob>, QueueError>;

    /// 人工将死信任务放回等待队列，重置尝试次数
    async fn requeue_dead_letter(&self, job_id: &str, now: DateTime<Utc>) -> Result<QueuedJob, QueueError>;

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// 内存与文件后端共用的任务表
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct JobTable {
    next_seq: u64,
    jobs: HashMap<String, QueuedJob>,
}

impl JobTable {
    pub(crate) fn push(&mut self, mut job: QueuedJob) -> QueuedJob {
        self.next_seq += 1;
        job.seq = self.next_seq;
        job.status = JobStatus::Waiting;
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    pub(crate) fn push_all(&mut self, jobs: Vec<QueuedJob>) -> Vec<QueuedJob> {
        jobs.into_iter().map(|job| self.push(job)).collect()
    }

    pub(crate) fn remove(&mut self, job_id: &str) -> Result<(), QueueError> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        if job.status != JobStatus::Waiting {
            return Err(QueueError::InvalidState(format!("job {} is {:?}, expected waiting", job_id, job.status)));
        }
        self.jobs.remove(job_id);
        Ok(())
    }

    pub(crate) fn claim(&mut self, job_types: &[String], now: DateTime<Utc>) -> Option<QueuedJob> {
        let id = self
            .jobs
            .values()
            .filter(|job| job.is_visible(now))
            .filter(|job| job_types.is_empty() || job_types.iter().any(|t| t == &job.job_type))
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|job| job.id.clone())?;

        let job = self.jobs.get_mut(&id)?;
        job.status = JobStatus::Active;
        job.attempts += 1;
        Some(job.clone())
    }

    fn active_job(&mut self, job_id: &str) -> Result<&mut QueuedJob, QueueError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        if job.status != JobStatus::Active {
            return Err(QueueError::InvalidState(format!(
                "job {} is {:?}, expected active",
                job_id, job.status
            )));
        }
        Ok(job)
    }

    pub(crate) fn complete(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let job = self.active_job(job_id)?;
        job.status = JobStatus::Completed;
        job.finished_at = Some(now);
        Ok(())
    }

    pub(crate) fn retry(
        &mut self,
        job_id: &str,
        scheduled_for: DateTime<Utc>,
        error: &str,
    ) -> Result<(), QueueError> {
        let job = self.active_job(job_id)?;
        job.status = JobStatus::Waiting;
        job.scheduled_for = scheduled_for;
        job.last_error = Some(error.to_string());
        Ok(())
    }

    pub(crate) fn dead_letter(&mut self, job_id: &str, error: &str, now: DateTime<Utc>) -> Result<(), QueueError> {
        let job = self.active_job(job_id)?;
        job.status = JobStatus::DeadLettered;
        job.last_error = Some(error.to_string());
        job.finished_at = Some(now);
        Ok(())
    }

    pub(crate) fn get(&self, job_id: &str) -> Option<QueuedJob> {
        self.jobs.get(job_id).cloned()
    }

    pub(crate) fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for job in self.jobs.values() {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::DeadLettered => stats.failed += 1,
            }
        }
        stats
    }

    pub(crate) fn clean(&mut self, older_than: DateTime<Utc>) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| match (job.status, job.finished_at) {
            (JobStatus::Completed | JobStatus::DeadLettered, Some(finished)) => finished >= older_than,
            _ => true,
        });
        before - self.jobs.len()
    }

    pub(crate) fn dead_letters(&self) -> Vec<QueuedJob> {
        let mut jobs: Vec<QueuedJob> = self
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::DeadLettered)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.seq);
        jobs
    }

    pub(crate) fn requeue_dead_letter(&mut self, job_id: &str, now: DateTime<Utc>) -> Result<QueuedJob, QueueError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        if job.status != JobStatus::DeadLettered {
            return Err(QueueError::InvalidState(format!("job {} is not dead-lettered", job_id)));
        }
        job.status = JobStatus::Waiting;
        job.attempts = 0;
        job.scheduled_for = now;
        job.finished_at = None;
        Ok(job.clone())
    }

    /// 进程崩溃时仍处于 active 的任务重新变为可认领
    pub(crate) fn recover_active(&mut self) -> usize {
        let mut recovered = 0;
        for job in self.jobs.values_mut() {
            if job.status == JobStatus::Active {
                job.status = JobStatus::Waiting;
                recovered += 1;
            }
        }
        recovered
    }
}

/// `now + delay`，溢出时取最大时间
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(priority: Priority, now: DateTime<Utc>) -> QueuedJob {
        QueuedJob::new(
            NOTIFICATION_JOB,
            "order.created",
            json!({}),
            &EnqueueOptions::default().with_priority(priority),
            now,
        )
    }

    #[test]
    fn test_priority_then_fifo() {
        let now = Utc::now();
        let mut table = JobTable::default();
        let low = table.push(job(Priority::Low, now));
        let normal1 = table.push(job(Priority::Normal, now));
        let high = table.push(job(Priority::High, now));
        let normal2 = table.push(job(Priority::Normal, now));

        let order: Vec<String> = std::iter::from_fn(|| table.claim(&[], now))
            .map(|j| j.id)
            .collect();
        assert_eq!(order, vec![high.id, normal1.id, normal2.id, low.id]);
    }

    #[test]
    fn test_delayed_job_invisible_until_scheduled() {
        let now = Utc::now();
        let mut table = JobTable::default();
        let opts = EnqueueOptions::default().with_delay(Duration::from_secs(5));
        table.push(QueuedJob::new("t", "e", json!(null), &opts, now));

        assert!(table.claim(&[], now).is_none());
        assert!(table.claim(&[], now + chrono::Duration::seconds(4)).is_none());
        let claimed = table.claim(&[], now + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(claimed.attempts, 1);
        assert_eq!(table.stats().active, 1);
    }

    #[test]
    fn test_claim_filters_job_types() {
        let now = Utc::now();
        let mut table = JobTable::default();
        table.push(QueuedJob::new("a", "e", json!(null), &EnqueueOptions::default(), now));

        assert!(table.claim(&["b".to_string()], now).is_none());
        assert!(table.claim(&["a".to_string()], now).is_some());
    }

    #[test]
    fn test_retry_and_dead_letter_transitions() {
        let now = Utc::now();
        let mut table = JobTable::default();
        let pushed = table.push(job(Priority::Normal, now));

        let claimed = table.claim(&[], now).unwrap();
        table.retry(&claimed.id, now + chrono::Duration::seconds(1), "boom").unwrap();
        assert!(table.claim(&[], now).is_none());

        let claimed = table.claim(&[], now + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(claimed.attempts, 2);
        assert_eq!(claimed.last_error.as_deref(), Some("boom"));

        table.dead_letter(&claimed.id, "exhausted", now).unwrap();
        assert_eq!(table.stats(), QueueStats { waiting: 0, active: 0, completed: 0, failed: 1 });
        assert_eq!(table.dead_letters()[0].id, pushed.id);

        // 非 active 状态不能再次结束
        assert!(matches!(
            table.complete(&pushed.id, now),
            Err(QueueError::InvalidState(_))
        ));
        assert!(matches!(table.complete("missing", now), Err(QueueError::UnknownJob(_))));

        let requeued = table.requeue_dead_letter(&pushed.id, now).unwrap();
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.status, JobStatus::Waiting);
    }

    #[test]
    fn test_clean_removes_finished_jobs() {
        let now = Utc::now();
        let mut table = JobTable::default();
        table.push(job(Priority::Normal, now));
        table.push(job(Priority::Normal, now));
        table.push(job(Priority::Normal, now));

        let a = table.claim(&[], now).unwrap();
        table.complete(&a.id, now - chrono::Duration::hours(2)).unwrap();
        let b = table.claim(&[], now).unwrap();
        table.complete(&b.id, now).unwrap();

        assert_eq!(table.clean(now - chrono::Duration::hours(1)), 1);
        assert_eq!(table.stats().completed, 1);
        assert_eq!(table.stats().waiting, 1);
    }

    #[test]
    fn test_remove_only_waiting_jobs() {
        let now = Utc::now();
        let mut table = JobTable::default();
        let pushed = table.push_all(vec![job(Priority::Normal, now), job(Priority::Normal, now)]);
        assert_eq!(pushed.len(), 2);
        assert_eq!(pushed[1].seq, pushed[0].seq + 1);

        let claimed = table.claim(&[], now).unwrap();
        assert!(matches!(table.remove(&claimed.id), Err(QueueError::InvalidState(_))));

        let waiting = pushed.iter().find(|j| j.id != claimed.id).unwrap();
        table.remove(&waiting.id).unwrap();
        assert!(matches!(table.remove(&waiting.id), Err(QueueError::UnknownJob(_))));
        assert_eq!(table.stats(), QueueStats { waiting: 0, active: 1, completed: 0, failed: 0 });
    }

    #[test]
    fn test_recover_active() {
        let now = Utc::now();
        let mut table = JobTable::default();
        table.push(job(Priority::Normal, now));
        table.claim(&[], now).unwrap();

        assert_eq!(table.recover_active(), 1);
        assert_eq!(table.stats().waiting, 1);
    }
}
