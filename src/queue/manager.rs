//! 队列管理器 - worker 池
//!
//! 每种 job type 注册一个处理器；worker 循环认领任务、调用处理器、按结论结算。
//! 空闲时等待入队唤醒或轮询间隔（延迟任务靠轮询变为可见），收到关闭信号后
//! 处理完手头任务再退出。

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{after, EnqueueOptions, JobOutcome, JobProcessor, QueueBackend, QueueStats, QueuedJob};
use crate::error::QueueError;
use crate::metrics::{MetricsSink, NoopMetrics};

pub struct QueueManager {
    name: String,
    backend: Arc<dyn QueueBackend>,
    processors: RwLock<HashMap<String, Arc<dyn JobProcessor>>>,
    concurrency: usize,
    poll_interval: Duration,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    active: AtomicUsize,
    closed: AtomicBool,
    metrics: Arc<dyn MetricsSink>,
}

impl QueueManager {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn QueueBackend>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            backend,
            processors: RwLock::new(HashMap::new()),
            concurrency: concurrency.max(1),
            poll_interval,
            wake: Notify::new(),
            shutdown,
            workers: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    /// 注册处理器；同一 job type 只能注册一次
    pub fn register_processor(
        &self,
        job_type: impl Into<String>,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<(), QueueError> {
        let job_type = job_type.into();
        let mut processors = self.processors.write().unwrap_or_else(|e| e.into_inner());
        if processors.contains_key(&job_type) {
            return Err(QueueError::DuplicateProcessor(job_type));
        }
        debug!(queue = %self.name, job_type = %job_type, "Processor registered");
        processors.insert(job_type, processor);
        Ok(())
    }

    fn processor(&self, job_type: &str) -> Option<Arc<dyn JobProcessor>> {
        self.processors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_type)
            .cloned()
    }

    /// 入队
    pub async fn enqueue(
        &self,
        job_type: &str,
        event_type: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<QueuedJob, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.name.clone()));
        }

        let job = QueuedJob::new(job_type, event_type, payload, &options, Utc::now());
        let job = self.backend.push(job).await?;
        debug!(
            queue = %self.name,
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %job.priority,
            "Job enqueued"
        );

        self.wake.notify_waiters();
        self.report_depth().await;
        Ok(job)
    }

    /// 整批入队：全部写入成功才可见，任一失败则一个都不留
    pub async fn enqueue_batch(
        &self,
        job_type: &str,
        event_type: &str,
        items: Vec<(Value, EnqueueOptions)>,
    ) -> Result<Vec<QueuedJob>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed(self.name.clone()));
        }

        let now = Utc::now();
        let jobs = items
            .into_iter()
            .map(|(payload, options)| QueuedJob::new(job_type, event_type, payload, &options, now))
            .collect();
        let jobs = self.backend.push_batch(jobs).await?;
        debug!(queue = %self.name, job_type, count = jobs.len(), "Job batch enqueued");

        self.wake.notify_waiters();
        self.report_depth().await;
        Ok(jobs)
    }

    /// 启动 `concurrency` 个 worker，处理任意 job type
    pub fn start(self: &Arc<Self>) {
        self.spawn_workers(Vec::new(), self.concurrency);
    }

    /// 启动只认领指定 job type 的 worker（`job_types` 为空表示任意类型）
    pub fn spawn_workers(self: &Arc<Self>, job_types: Vec<String>, count: usize) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count.max(1) {
            let manager = Arc::clone(self);
            let job_types = job_types.clone();
            let worker_id = workers.len();
            workers.push(tokio::spawn(async move {
                manager.run_worker(worker_id, job_types).await;
            }));
        }
        info!(queue = %self.name, workers = workers.len(), "Queue workers started");
    }

    async fn run_worker(&self, worker_id: usize, job_types: Vec<String>) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.backend.claim(&job_types, Utc::now()).await {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %self.name, worker_id, error = %e, "Failed to claim job");
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        debug!(queue = %self.name, worker_id, "Queue worker stopped");
    }

    async fn run_job(&self, job: QueuedJob) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.active_workers(&self.name, active);

        let outcome = match self.processor(&job.job_type) {
            Some(processor) => {
                let claimed = job.clone();
                match tokio::spawn(async move { processor.process(&claimed).await }).await {
                    Ok(outcome) => outcome,
                    Err(e) => JobOutcome::DeadLetter {
                        error: format!("processor task failed: {}", e),
                    },
                }
            }
            None => JobOutcome::DeadLetter {
                error: format!("no processor registered for job type {}", job.job_type),
            },
        };

        self.settle(&job, outcome).await;

        let active = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.metrics.active_workers(&self.name, active);
        self.report_depth().await;
    }

    async fn settle(&self, job: &QueuedJob, outcome: JobOutcome) {
        let now = Utc::now();
        let result = match outcome {
            JobOutcome::Completed => self.backend.complete(&job.id, now).await,
            JobOutcome::Retry { delay, error } if job.attempts < job.max_attempts => {
                debug!(
                    queue = %self.name,
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Job scheduled for retry"
                );
                self.backend.retry(&job.id, after(now, delay), &error).await
            }
            JobOutcome::Retry { error, .. } | JobOutcome::DeadLetter { error } => {
                error!(
                    queue = %self.name,
                    job_id = %job.id,
                    job_type = %job.job_type,
                    event_type = %job.event_type,
                    correlation_id = %job.correlation_id,
                    attempts = job.attempts,
                    error = %error,
                    "Job moved to dead letter"
                );
                self.backend.dead_letter(&job.id, &error, now).await
            }
        };

        if let Err(e) = result {
            error!(queue = %self.name, job_id = %job.id, error = %e, "Failed to settle job");
        }
    }

    async fn report_depth(&self) {
        if let Ok(stats) = self.backend.stats().await {
            self.metrics.queue_depth(&self.name, stats.waiting);
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    /// 删除结束时间早于 `older_than` 之前的已完成/死信任务
    pub async fn clean(&self, older_than: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.backend.clean(cutoff).await?;
        info!(queue = %self.name, removed, "Queue cleaned");
        Ok(removed)
    }

    pub async fn dead_letters(&self) -> Result<Vec<QueuedJob>, QueueError> {
        self.backend.dead_letters().await
    }

    /// 人工重试死信任务
    pub async fn retry_dead_letter(&self, job_id: &str) -> Result<QueuedJob, QueueError> {
        let job = self.backend.requeue_dead_letter(job_id, Utc::now()).await?;
        info!(queue = %self.name, job_id = %job_id, "Dead-lettered job requeued");
        self.wake.notify_waiters();
        Ok(job)
    }

    /// 等待队列空闲（无 waiting / active 任务），超时返回 false
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                match self.backend.stats().await {
                    Ok(stats) if stats.is_idle() && self.active.load(Ordering::SeqCst) == 0 => return,
                    Ok(_) => {}
                    Err(e) => warn!(queue = %self.name, error = %e, "Failed to read queue stats"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 停止接收新任务，等待 worker 处理完手头任务后退出
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shutdown.send_replace(true);
        let workers: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(queue = %self.name, error = %e, "Queue worker ended abnormally");
            }
        }

        self.backend.close().await?;
        info!(queue = %self.name, "Queue closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_type::Priority;
    use crate::queue::{JobStatus, MemoryBackend};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    const POLL: Duration = Duration::from_millis(10);

    fn manager(concurrency: usize) -> Arc<QueueManager> {
        Arc::new(QueueManager::new("test", Arc::new(MemoryBackend::new()), concurrency, POLL))
    }

    /// 记录处理顺序
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobProcessor for Recorder {
        async fn process(&self, job: &QueuedJob) -> JobOutcome {
            self.seen.lock().unwrap().push(job.payload["name"].as_str().unwrap_or("").to_string());
            JobOutcome::Completed
        }
    }

    /// 总是要求重试
    struct AlwaysRetry {
        calls: AtomicU32,
    }

    #[async_trait]
    impl JobProcessor for AlwaysRetry {
        async fn process(&self, _job: &QueuedJob) -> JobOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            JobOutcome::Retry {
                delay: Duration::from_millis(5),
                error: "boom".to_string(),
            }
        }
    }

    struct Panics;

    #[async_trait]
    impl JobProcessor for Panics {
        async fn process(&self, _job: &QueuedJob) -> JobOutcome {
            panic!("processor bug");
        }
    }

    #[tokio::test]
    async fn test_priority_order_with_single_worker() {
        let queue = manager(1);
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        queue.register_processor("t", recorder.clone()).unwrap();

        for (name, priority) in [("low", Priority::Low), ("n1", Priority::Normal), ("high", Priority::High), ("n2", Priority::Normal)] {
            queue
                .enqueue("t", "e", json!({"name": name}), EnqueueOptions::default().with_priority(priority))
                .await
                .unwrap();
        }

        queue.start();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["high", "n1", "n2", "low"]);
        assert_eq!(queue.stats().await.unwrap().completed, 4);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_attempts_never_exceed_max() {
        let queue = manager(2);
        let processor = Arc::new(AlwaysRetry { calls: AtomicU32::new(0) });
        queue.register_processor("t", processor.clone()).unwrap();
        queue.start();

        let job = queue
            .enqueue("t", "e", json!({}), EnqueueOptions::default().with_max_attempts(3))
            .await
            .unwrap();

        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, job.id);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].status, JobStatus::DeadLettered);
        assert_eq!(dead[0].last_error.as_deref(), Some("boom"));
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_dead_letter_runs_again() {
        let queue = manager(1);
        let processor = Arc::new(AlwaysRetry { calls: AtomicU32::new(0) });
        queue.register_processor("t", processor.clone()).unwrap();
        queue.start();

        let job = queue.enqueue("t", "e", json!({}), EnqueueOptions::default()).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

        queue.retry_dead_letter(&job.id).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        assert!(queue.retry_dead_letter("missing").await.is_err());
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_processor_dead_letters() {
        let queue = manager(1);
        queue.start();
        queue.enqueue("unknown", "e", json!({}), EnqueueOptions::default()).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);

        let dead = queue.dead_letters().await.unwrap();
        assert!(dead[0].last_error.as_deref().unwrap().contains("no processor"));
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_processor_panic_is_contained() {
        let queue = manager(1);
        queue.register_processor("panic", Arc::new(Panics)).unwrap();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        queue.register_processor("ok", recorder.clone()).unwrap();
        queue.start();

        queue.enqueue("panic", "e", json!({}), EnqueueOptions::default()).await.unwrap();
        queue.enqueue("ok", "e", json!({"name": "after"}), EnqueueOptions::default()).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["after"]);
        assert_eq!(queue.stats().await.unwrap().failed, 1);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delayed_job_waits() {
        let queue = manager(1);
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        queue.register_processor("t", recorder.clone()).unwrap();
        queue.start();

        queue
            .enqueue("t", "e", json!({"name": "later"}), EnqueueOptions::default().with_delay(Duration::from_millis(200)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert!(queue.wait_idle(Duration::from_secs(5)).await);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["later"]);
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_processor_and_closed_queue() {
        let queue = manager(1);
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        queue.register_processor("t", recorder.clone()).unwrap();
        assert!(matches!(
            queue.register_processor("t", recorder),
            Err(QueueError::DuplicateProcessor(_))
        ));

        queue.start();
        queue.close().await.unwrap();
        assert!(queue.is_closed());
        let result = queue.enqueue("t", "e", json!({}), EnqueueOptions::default()).await;
        assert!(matches!(result, Err(QueueError::Closed(_))));
    }

    #[tokio::test]
    async fn test_clean_removes_completed() {
        let queue = manager(1);
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        queue.register_processor("t", recorder).unwrap();
        queue.start();

        queue.enqueue("t", "e", json!({}), EnqueueOptions::default()).await.unwrap();
        assert!(queue.wait_idle(Duration::from_secs(5)).await);

        assert_eq!(queue.clean(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(queue.clean(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
        queue.close().await.unwrap();
    }
}
