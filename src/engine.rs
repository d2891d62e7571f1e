//! 引擎组装 - 显式构建全部组件
//!
//! 不做自动发现：provider 与 handler 在构建时显式注册，配置中的内置 provider
//! 按 `kind` 构建。构建失败时一次性报告全部配置问题。

use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{EngineConfig, QueueBackendKind, QueueConfig, StorageKind};
use crate::emitter::EventEmitter;
use crate::error::{DispatchError, DispatchResult, QueueError};
use crate::event_type::EventTypeRegistry;
use crate::handlers::{EventHandler, HandlerOptions, HandlerQueueManager};
use crate::health::{self, ProviderHealthRecord, ProviderHealthTracker};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::orchestrator::NotificationOrchestrator;
use crate::provider::channels::build_provider;
use crate::provider::{
    ChannelProvider, PayloadRecipientLoader, ProviderRegistry, RecipientLoader, SimpleTemplateRenderer,
    TemplateRenderer,
};
use crate::queue::{FileBackend, MemoryBackend, QueueBackend, QueueManager, QueueStats, QueuedJob, NOTIFICATION_JOB};
use crate::rate_limit::RateLimiter;
use crate::storage::{FileStorage, MemoryStorage, Storage, EMISSIONS};
use crate::types::{EmissionResult, EmitOptions, NotificationResult};

/// 通知队列名
pub const NOTIFICATION_QUEUE: &str = "notification";
/// handler 队列名
pub const HANDLER_QUEUE: &str = "handler";

/// 引擎构建器
pub struct EngineBuilder {
    config: EngineConfig,
    providers: Vec<(String, Arc<dyn ChannelProvider>)>,
    handlers: Vec<(String, Arc<dyn EventHandler>, HandlerOptions)>,
    recipient_loader: Option<Arc<dyn RecipientLoader>>,
    template_renderer: Option<Arc<dyn TemplateRenderer>>,
    storage: Option<Arc<dyn Storage>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    queue_backend: Option<Arc<dyn QueueBackend>>,
    handler_queue_backend: Option<Arc<dyn QueueBackend>>,
    start_workers: bool,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            handlers: Vec::new(),
            recipient_loader: None,
            template_renderer: None,
            storage: None,
            metrics: None,
            queue_backend: None,
            handler_queue_backend: None,
            start_workers: true,
        }
    }

    /// 注册渠道 provider（排在配置构建的 provider 之后，作为 fallback）
    pub fn register_provider(mut self, channel: impl Into<String>, provider: Arc<dyn ChannelProvider>) -> Self {
        self.providers.push((channel.into(), provider));
        self
    }

    pub fn register_handler(mut self, name: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push((name.into(), handler, HandlerOptions::default()));
        self
    }

    pub fn register_handler_with(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: HandlerOptions,
    ) -> Self {
        self.handlers.push((name.into(), handler, options));
        self
    }

    pub fn recipient_loader(mut self, loader: Arc<dyn RecipientLoader>) -> Self {
        self.recipient_loader = Some(loader);
        self
    }

    pub fn template_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.template_renderer = Some(renderer);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.queue_backend = Some(backend);
        self
    }

    pub fn handler_queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.handler_queue_backend = Some(backend);
        self
    }

    /// 是否启动 worker 与健康检查（只读检查队列时关闭）
    pub fn start_workers(mut self, start: bool) -> Self {
        self.start_workers = start;
        self
    }

    /// 构建并启动引擎
    pub async fn build(self) -> DispatchResult<Engine> {
        self.config.validate()?;
        let registry = Arc::new(EventTypeRegistry::from_definitions(self.config.event_types.clone())?);

        let renderer: Arc<dyn TemplateRenderer> = match self.template_renderer {
            Some(renderer) => renderer,
            None => Arc::new(SimpleTemplateRenderer::new(self.config.templates.clone())),
        };

        let mut providers = build_providers(&self.config, Some(Arc::clone(&renderer)))?;
        for (channel, provider) in self.providers {
            providers.register(channel, provider);
        }
        for def in registry.definitions() {
            for channel in &def.channels {
                if !providers.has_channel(channel) {
                    warn!(event_type = %def.name, channel = %channel, "No provider registered for channel");
                }
            }
        }
        let providers = Arc::new(providers);

        let storage: Arc<dyn Storage> = match self.storage {
            Some(storage) => storage,
            None => match self.config.storage.backend {
                StorageKind::Memory => Arc::new(MemoryStorage::new()),
                StorageKind::File => Arc::new(FileStorage::new(
                    self.config.storage.path.clone().unwrap_or_else(FileStorage::default_path),
                )),
            },
        };
        let metrics: Arc<dyn MetricsSink> = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let recipients: Arc<dyn RecipientLoader> = self
            .recipient_loader
            .unwrap_or_else(|| Arc::new(PayloadRecipientLoader::new()));
        let health = Arc::new(ProviderHealthTracker::new(self.config.health.failure_threshold));

        let queue_backend = match self.queue_backend {
            Some(backend) => backend,
            None => open_backend(&self.config.queue, "queue.json")?,
        };
        let queue = Arc::new(
            QueueManager::new(
                NOTIFICATION_QUEUE,
                queue_backend,
                self.config.queue.concurrency,
                self.config.queue.poll_interval(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );

        let orchestrator = Arc::new(NotificationOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&providers),
            Arc::clone(&health),
            recipients,
            Arc::clone(&storage),
            Arc::clone(&metrics),
            self.config.delivery.clone(),
        ));
        queue.register_processor(NOTIFICATION_JOB, orchestrator.clone())?;

        let handler_backend = match self.handler_queue_backend {
            Some(backend) => backend,
            None => open_backend(&self.config.handler_queue, "handlers.json")?,
        };
        let handler_queue = Arc::new(
            QueueManager::new(
                HANDLER_QUEUE,
                handler_backend,
                self.config.handler_queue.concurrency,
                self.config.handler_queue.poll_interval(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let handlers = Arc::new(HandlerQueueManager::new(Arc::clone(&handler_queue)));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut health_loop = None;

        if self.start_workers {
            queue.start();
            for (name, handler, options) in self.handlers {
                handlers.register_handler(name, handler, options)?;
            }
            if self.config.health.enabled {
                health_loop = Some(health::spawn_health_checks(
                    Arc::clone(&health),
                    Arc::clone(&providers),
                    Arc::clone(&storage),
                    self.config.health.check_interval(),
                    shutdown_rx,
                ));
            }
        }

        let emitter = EventEmitter::new(
            Arc::clone(&registry),
            Arc::new(RateLimiter::new()),
            Arc::clone(&orchestrator),
            Arc::clone(&queue),
            Arc::clone(&handlers),
            Arc::clone(&storage),
            metrics,
            self.config.delivery.default_timeout(),
        );

        info!(
            event_types = registry.len(),
            providers = providers.provider_count(),
            handlers = handlers.handler_names().len(),
            "Event notification engine started"
        );

        Ok(Engine {
            registry,
            emitter,
            orchestrator,
            queue,
            handlers,
            providers,
            health,
            storage,
            shutdown: shutdown_tx,
            health_loop: Mutex::new(health_loop),
        })
    }
}

/// 根据配置构建内置 provider，并校验其配置；一次性报告全部问题
pub fn build_providers(
    config: &EngineConfig,
    renderer: Option<Arc<dyn TemplateRenderer>>,
) -> DispatchResult<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    let mut problems = Vec::new();

    for provider_config in &config.providers {
        match build_provider(provider_config, renderer.clone()) {
            Ok(provider) => {
                if let Err(errors) = provider.validate_config(&provider_config.options) {
                    problems.extend(errors.into_iter().map(|e| format!("provider {}: {}", provider_config.name, e)));
                    continue;
                }
                registry.register(provider_config.channel.clone(), provider);
            }
            Err(e) => problems.push(format!("provider {}: {}", provider_config.name, e)),
        }
    }

    if problems.is_empty() {
        Ok(registry)
    } else {
        Err(DispatchError::Config(problems))
    }
}

fn open_backend(config: &QueueConfig, default_file: &str) -> Result<Arc<dyn QueueBackend>, QueueError> {
    Ok(match config.backend {
        QueueBackendKind::Memory => Arc::new(MemoryBackend::new()),
        QueueBackendKind::File => {
            let path: PathBuf = config.resolved_path(default_file);
            Arc::new(FileBackend::open(path)?)
        }
    })
}

/// 运行中的引擎
pub struct Engine {
    registry: Arc<EventTypeRegistry>,
    emitter: EventEmitter,
    orchestrator: Arc<NotificationOrchestrator>,
    queue: Arc<QueueManager>,
    handlers: Arc<HandlerQueueManager>,
    providers: Arc<ProviderRegistry>,
    health: Arc<ProviderHealthTracker>,
    storage: Arc<dyn Storage>,
    shutdown: watch::Sender<bool>,
    health_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub async fn emit(&self, event_type: &str, payload: Value, options: EmitOptions) -> DispatchResult<EmissionResult> {
        self.emitter.emit(event_type, payload, options).await
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    pub fn set_enabled(&self, event_type: &str, enabled: bool) -> DispatchResult<()> {
        self.registry.set_enabled(event_type, enabled)
    }

    pub async fn notification_stats(&self) -> DispatchResult<QueueStats> {
        Ok(self.queue.stats().await?)
    }

    pub async fn handler_stats(&self) -> DispatchResult<QueueStats> {
        Ok(self.handlers.stats().await?)
    }

    /// 清理两个队列中已结束超过 `older_than` 的任务
    pub async fn clean(&self, older_than: Duration) -> DispatchResult<usize> {
        let removed = self.queue.clean(older_than).await? + self.handlers.queue().clean(older_than).await?;
        Ok(removed)
    }

    /// 通知队列死信
    pub async fn dead_letters(&self) -> DispatchResult<Vec<QueuedJob>> {
        Ok(self.queue.dead_letters().await?)
    }

    pub async fn handler_dead_letters(&self) -> DispatchResult<Vec<QueuedJob>> {
        Ok(self.handlers.queue().dead_letters().await?)
    }

    /// 人工重试死信任务（先查通知队列，再查 handler 队列）
    pub async fn retry_dead_letter(&self, job_id: &str) -> DispatchResult<QueuedJob> {
        match self.queue.retry_dead_letter(job_id).await {
            Err(QueueError::UnknownJob(_)) => Ok(self.handlers.queue().retry_dead_letter(job_id).await?),
            other => Ok(other?),
        }
    }

    /// 某次 emit 已持久化的渠道结果
    pub async fn results(&self, correlation_id: &str) -> anyhow::Result<Vec<NotificationResult>> {
        self.orchestrator.results(correlation_id).await
    }

    /// 某次 emit 的结果记录
    pub async fn emission(&self, correlation_id: &str) -> anyhow::Result<Option<EmissionResult>> {
        match self.storage.get(EMISSIONS, correlation_id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn provider_health(&self) -> Vec<ProviderHealthRecord> {
        self.health.snapshot()
    }

    /// 立即执行一轮健康检查
    pub async fn check_health(&self) {
        health::check_all(
            &self.health,
            &self.providers,
            self.storage.as_ref(),
            self.orchestrator.delivery().provider_call_timeout(),
        )
        .await;
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers.handler_names()
    }

    /// 等待两个队列都空闲
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = crate::orchestrator::deadline_after(timeout);
        if !self.queue.wait_idle(timeout).await {
            return false;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        self.handlers.wait_idle(remaining).await
    }

    /// 停止健康检查并关闭两个队列（等待进行中的任务结束）
    pub async fn shutdown(&self) -> DispatchResult<()> {
        self.shutdown.send_replace(true);
        let health_loop = self.health_loop.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = health_loop {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health check loop ended abnormally");
            }
        }

        self.queue.close().await?;
        self.handlers.close().await?;
        info!("Event notification engine stopped");
        Ok(())
    }
}
