// Consumers and the worker registry
//
// One consumer per category pulls from that category's job source, runs the
// bound processing function under a concurrency ceiling and a rate limiter,
// and publishes completion/failure on the registry's event bus.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::queue::broker::{Broker, JobSource};
use crate::queue::connection::ConnectionResolver;
use crate::queue::jobs::{Category, Job};
use crate::types::{QueueError, QueueResult};

const EVENT_BUFFER: usize = 1024;

/// Upper bound on jobs a single consumer runs at once.
pub const MAX_CONCURRENCY: usize = 1024;

/// Processing function bound to a consumer.
pub type ProcessFn =
    Arc<dyn Fn(Job) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// Wraps an async closure as a `ProcessFn`.
pub fn processor<F, Fut>(f: F) -> ProcessFn
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |job| f(job).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Jobs processed at the same time.
    pub concurrency: usize,
    /// Job starts allowed per `rate_window`.
    pub rate_max: u32,
    pub rate_window: Duration,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.clamp(1, MAX_CONCURRENCY),
            rate_max: config.rate_max,
            rate_window: Duration::from_millis(config.rate_window_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

impl WorkerOptions {
    /// Clamps concurrency into `1..=MAX_CONCURRENCY`.
    pub fn normalized(self) -> Self {
        Self { concurrency: self.concurrency.clamp(1, MAX_CONCURRENCY), ..self }
    }

    fn quota(&self) -> Quota {
        let max = NonZeroU32::new(self.rate_max).unwrap_or(NonZeroU32::MIN);
        Quota::with_period(self.rate_window / max.get())
            .map(|quota| quota.allow_burst(max))
            .unwrap_or_else(|| Quota::per_second(max))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum JobEvent {
    Completed {
        job_id: Uuid,
        category: Category,
        task_type: String,
        output: serde_json::Value,
    },
    Failed {
        job_id: Uuid,
        category: Category,
        task_type: String,
        reason: String,
        attempts_made: u32,
        will_retry: bool,
    },
}

impl JobEvent {
    pub fn category(&self) -> Category {
        match self {
            JobEvent::Completed { category, .. } | JobEvent::Failed { category, .. } => *category,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Completed { job_id, .. } | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }
}

/// State shared by the poll loop and every in-flight job.
struct Pipeline {
    category: Category,
    source: Arc<dyn JobSource>,
    process: ProcessFn,
    limiter: DefaultDirectRateLimiter,
    permits: Arc<Semaphore>,
    events: broadcast::Sender<JobEvent>,
    poll_interval: Duration,
}

impl Pipeline {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(category = %self.category, "Consumer started");

        while !*shutdown.borrow() {
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Take a rate slot before claiming, so a throttled job stays waiting.
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = self.limiter.until_ready() => {}
            }

            match self.source.fetch().await {
                Ok(Some(job)) => {
                    let pipeline = self.clone();
                    tokio::spawn(async move {
                        pipeline.process(job).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    warn!(category = %self.category, error = %e, "Failed to fetch job");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(category = %self.category, "Consumer stopped");
    }

    async fn process(&self, mut job: Job) {
        job.attempts_made += 1;
        debug!(
            category = %self.category,
            job_id = %job.id,
            task_type = %job.task_type,
            attempt = job.attempts_made,
            "Processing job"
        );

        match (self.process)(job.clone()).await {
            Ok(output) => {
                if let Err(e) = self.source.complete(&job).await {
                    error!(category = %self.category, job_id = %job.id, error = %e, "Failed to mark job completed");
                }
                let _ = self.events.send(JobEvent::Completed {
                    job_id: job.id,
                    category: self.category,
                    task_type: job.task_type,
                    output,
                });
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                let will_retry = job.has_attempts_left();
                let recorded = if will_retry {
                    self.source.retry(&job, job.retry_delay()).await
                } else {
                    self.source.fail(&job, &reason).await
                };
                if let Err(e) = recorded {
                    error!(category = %self.category, job_id = %job.id, error = %e, "Failed to record job failure");
                }
                let _ = self.events.send(JobEvent::Failed {
                    job_id: job.id,
                    category: self.category,
                    task_type: job.task_type,
                    reason,
                    attempts_made: job.attempts_made,
                    will_retry,
                });
            }
        }
    }
}

pub struct Consumer {
    category: Category,
    options: WorkerOptions,
    source: Arc<dyn JobSource>,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Consumer {
    /// Spawns the poll loop. Must be called inside a tokio runtime.
    fn start(
        category: Category,
        source: Arc<dyn JobSource>,
        process: ProcessFn,
        options: WorkerOptions,
        events: broadcast::Sender<JobEvent>,
    ) -> Arc<Self> {
        let options = options.normalized();
        let permits = Arc::new(Semaphore::new(options.concurrency));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let pipeline = Arc::new(Pipeline {
            category,
            source: source.clone(),
            process,
            limiter: RateLimiter::direct(options.quota()),
            permits: permits.clone(),
            events: events.clone(),
            poll_interval: options.poll_interval,
        });

        let tasks = vec![
            tokio::spawn(pipeline.run(shutdown_rx)),
            spawn_observer(category, events.subscribe(), log_completion),
            spawn_observer(category, events.subscribe(), log_failure),
        ];

        Arc::new(Self {
            category,
            options,
            source,
            permits,
            shutdown,
            tasks: Mutex::new(tasks),
            closed: AtomicBool::new(false),
        })
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn options(&self) -> WorkerOptions {
        self.options
    }

    /// Stops pulling new jobs, waits for in-flight jobs, then closes the source.
    pub async fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.shutdown.send(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await).into_iter();

        if let Some(poll_loop) = tasks.next() {
            poll_loop
                .await
                .map_err(|e| QueueError::Broker(format!("consumer {} loop failed: {}", self.category, e)))?;
        }

        // Every permit back means nothing is in flight.
        let concurrency = u32::try_from(self.options.concurrency)
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        let _drained = self
            .permits
            .acquire_many(concurrency)
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        for observer in tasks {
            observer.abort();
        }

        self.source.close().await
    }
}

fn log_completion(category: Category, event: &JobEvent) {
    if let JobEvent::Completed { job_id, task_type, .. } = event {
        info!(%category, %job_id, %task_type, "Job completed");
    }
}

fn log_failure(category: Category, event: &JobEvent) {
    if let JobEvent::Failed { job_id, task_type, reason, attempts_made, will_retry, .. } = event {
        if *will_retry {
            warn!(%category, %job_id, %task_type, %reason, attempts_made, "Job attempt failed, retrying");
        } else {
            error!(%category, %job_id, %task_type, %reason, attempts_made, "Job failed");
        }
    }
}

/// Observers only read events for their own category.
fn spawn_observer(
    category: Category,
    mut events: broadcast::Receiver<JobEvent>,
    observe: fn(Category, &JobEvent),
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.category() == category => observe(category, &event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%category, skipped, "Job event observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub struct WorkerRegistry {
    resolver: Arc<ConnectionResolver>,
    broker: Arc<dyn Broker>,
    consumers: Mutex<HashMap<Category, Arc<Consumer>>>,
    events: broadcast::Sender<JobEvent>,
}

impl WorkerRegistry {
    pub fn new(resolver: Arc<ConnectionResolver>, broker: Arc<dyn Broker>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            resolver,
            broker,
            consumers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Out-of-band completion and failure notifications for every consumer.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Returns the category's consumer, creating it on first use.
    /// An existing consumer keeps its original processing function.
    pub async fn get_or_create_consumer(
        &self,
        category: Category,
        process: ProcessFn,
        options: WorkerOptions,
    ) -> QueueResult<Option<Arc<Consumer>>> {
        let Some(connection) = self.resolver.resolve() else {
            return Ok(None);
        };

        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(&category) {
            return Ok(Some(consumer.clone()));
        }

        let source = self.broker.open_source(category, &connection)?;
        let consumer = Consumer::start(category, source, process, options, self.events.clone());
        consumers.insert(category, consumer.clone());

        info!(
            %category,
            concurrency = consumer.options().concurrency,
            rate_max = consumer.options().rate_max,
            rate_window_ms = consumer.options().rate_window.as_millis() as u64,
            "Consumer created"
        );
        Ok(Some(consumer))
    }

    pub async fn get(&self, category: Category) -> Option<Arc<Consumer>> {
        self.consumers.lock().await.get(&category).cloned()
    }

    pub async fn len(&self) -> usize {
        self.consumers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every consumer, continuing past failures. Returns one message per failure.
    pub async fn close_all(&self) -> Vec<String> {
        let consumers: Vec<_> = self.consumers.lock().await.drain().collect();
        let mut errors = Vec::new();
        for (category, consumer) in consumers {
            if let Err(e) = consumer.close().await {
                errors.push(format!("consumer {}: {}", category, e));
            }
        }
        errors
    }
}
