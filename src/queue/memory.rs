// In-process broker
//
// Keeps every category's queue in memory. Used as the test double for the
// Redis broker and for running consumers without external infrastructure.
// Jobs do not survive the process.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::RetentionConfig;
use crate::queue::broker::{Broker, Channel, JobSource};
use crate::queue::connection::ConnectionDescriptor;
use crate::queue::jobs::{Category, Job, JobState};
use crate::types::{QueueError, QueueResult};

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, (JobState, Job)>,
    /// Ready jobs ordered by (priority, arrival).
    waiting: BTreeMap<(u32, u64), Uuid>,
    delayed: Vec<(Instant, Uuid)>,
    ranks: HashMap<Uuid, (u32, u64)>,
    /// Finished ids, oldest first.
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
}

impl QueueState {
    fn push_waiting(&mut self, id: Uuid, rank: (u32, u64)) {
        self.waiting.insert(rank, id);
        self.ranks.insert(id, rank);
    }

    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        for (_, id) in due {
            if let Some(entry) = self.jobs.get_mut(&id) {
                entry.0 = JobState::Waiting;
            }
            let rank = self.ranks.get(&id).copied().unwrap_or((0, 0));
            self.waiting.insert(rank, id);
        }
    }

    fn set(&mut self, job: &Job, state: JobState) {
        self.jobs.insert(job.id, (state, job.clone()));
    }

    /// Records a finished job and forgets the oldest ones past `keep`.
    fn finish(&mut self, job: &Job, state: JobState, keep: usize) {
        self.set(job, state);
        self.ranks.remove(&job.id);
        let finished = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        finished.push_back(job.id);
        let mut expired = Vec::new();
        while finished.len() > keep {
            if let Some(old) = finished.pop_front() {
                expired.push(old);
            }
        }
        for old in expired {
            self.jobs.remove(&old);
        }
    }
}

struct MemoryQueue {
    category: Category,
    state: Mutex<QueueState>,
    sequence: AtomicU64,
}

impl MemoryQueue {
    fn new(category: Category) -> Self {
        Self {
            category,
            state: Mutex::new(QueueState::default()),
            sequence: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Faults {
    reject_connections: AtomicBool,
    fail_enqueue: AtomicBool,
    fail_close: AtomicBool,
}

/// Memory-backed broker. Cloning shares the underlying queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<Category, Arc<MemoryQueue>>>>,
    channels_opened: Arc<AtomicUsize>,
    sources_opened: Arc<AtomicUsize>,
    faults: Arc<Faults>,
    retention: RetentionConfig,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    /// Makes every subsequent open fail as if the descriptor were rejected.
    pub fn reject_connections(&self, reject: bool) {
        self.faults.reject_connections.store(reject, Ordering::SeqCst);
    }

    /// Makes every subsequent enqueue fail as a transport error.
    pub fn fail_enqueue(&self, fail: bool) {
        self.faults.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent close fail.
    pub fn fail_close(&self, fail: bool) {
        self.faults.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    pub fn sources_opened(&self) -> usize {
        self.sources_opened.load(Ordering::SeqCst)
    }

    /// Snapshot of every job the category has seen, with its current state.
    pub fn jobs(&self, category: Category) -> Vec<(JobState, Job)> {
        let queue = self.queue(category);
        let state = queue.lock();
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|(_, job)| job.created_at);
        jobs
    }

    fn queue(&self, category: Category) -> Arc<MemoryQueue> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry(category)
            .or_insert_with(|| Arc::new(MemoryQueue::new(category)))
            .clone()
    }

    fn check_connection(&self, connection: &ConnectionDescriptor) -> QueueResult<()> {
        if self.faults.reject_connections.load(Ordering::SeqCst) {
            return Err(QueueError::Configuration(format!(
                "broker rejected {}:{}",
                connection.host, connection.port
            )));
        }
        Ok(())
    }

    fn close_result(&self, what: &str, category: Category) -> QueueResult<()> {
        if self.faults.fail_close.load(Ordering::SeqCst) {
            return Err(QueueError::Broker(format!("failed to close {} {}", what, category)));
        }
        Ok(())
    }
}

impl Broker for MemoryBroker {
    fn open_channel(
        &self,
        category: Category,
        connection: &ConnectionDescriptor,
    ) -> QueueResult<Arc<dyn Channel>> {
        self.check_connection(connection)?;
        self.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryChannel {
            queue: self.queue(category),
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn open_source(
        &self,
        category: Category,
        connection: &ConnectionDescriptor,
    ) -> QueueResult<Arc<dyn JobSource>> {
        self.check_connection(connection)?;
        self.sources_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySource {
            queue: self.queue(category),
            broker: self.clone(),
        }))
    }
}

struct MemoryChannel {
    queue: Arc<MemoryQueue>,
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn category(&self) -> Category {
        self.queue.category
    }

    async fn enqueue(&self, job: Job) -> QueueResult<Uuid> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Submission(format!("channel {} is closed", self.queue.category)));
        }
        if self.broker.faults.fail_enqueue.load(Ordering::SeqCst) {
            return Err(QueueError::Submission("connection reset by broker".to_string()));
        }

        let id = job.id;
        let rank = (
            job.policy.priority.unwrap_or(0),
            self.queue.sequence.fetch_add(1, Ordering::SeqCst),
        );
        let mut state = self.queue.lock();
        state.set(&job, JobState::Waiting);
        state.push_waiting(id, rank);
        Ok(id)
    }

    async fn state(&self, id: Uuid) -> QueueResult<JobState> {
        let state = self.queue.lock();
        Ok(state.jobs.get(&id).map(|(s, _)| *s).unwrap_or(JobState::Unknown))
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.broker.close_result("channel", self.queue.category)
    }
}

struct MemorySource {
    queue: Arc<MemoryQueue>,
    broker: MemoryBroker,
}

#[async_trait]
impl JobSource for MemorySource {
    fn category(&self) -> Category {
        self.queue.category
    }

    async fn fetch(&self) -> QueueResult<Option<Job>> {
        let mut state = self.queue.lock();
        state.promote_due(Instant::now());

        let Some((_, id)) = state.waiting.pop_first() else {
            return Ok(None);
        };
        let job = match state.jobs.get_mut(&id) {
            Some(entry) => {
                entry.0 = JobState::Active;
                entry.1.clone()
            }
            None => return Ok(None),
        };
        Ok(Some(job))
    }

    async fn complete(&self, job: &Job) -> QueueResult<()> {
        let keep = self.broker.retention.keep_completed;
        self.queue.lock().finish(job, JobState::Completed, keep);
        Ok(())
    }

    async fn retry(&self, job: &Job, delay: Duration) -> QueueResult<()> {
        let mut state = self.queue.lock();
        state.set(job, JobState::Delayed);
        state.delayed.push((Instant::now() + delay, job.id));
        Ok(())
    }

    async fn fail(&self, job: &Job, reason: &str) -> QueueResult<()> {
        let mut failed = job.clone();
        failed.failed_reason = Some(reason.to_string());
        let keep = self.broker.retention.keep_failed;
        self.queue.lock().finish(&failed, JobState::Failed, keep);
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        self.broker.close_result("source", self.queue.category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::jobs::{JobOptions, JobPolicy};
    use serde_json::json;

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor::parse("redis://memory.local:6379").unwrap()
    }

    fn job(category: Category, options: JobOptions) -> Job {
        Job::new(category, "test", json!({}), category.default_policy().merge(&options))
    }

    #[tokio::test]
    async fn test_enqueue_then_fetch_marks_active() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel(Category::Email, &descriptor()).unwrap();
        let source = broker.open_source(Category::Email, &descriptor()).unwrap();

        let id = channel.enqueue(job(Category::Email, JobOptions::default())).await.unwrap();
        assert_eq!(channel.state(id).await.unwrap(), JobState::Waiting);

        let fetched = source.fetch().await.unwrap().unwrap();
        assert_eq!(fetched.id, id);
        assert_eq!(channel.state(id).await.unwrap(), JobState::Active);
        assert!(source.fetch().await.unwrap().is_none());

        source.complete(&fetched).await.unwrap();
        assert_eq!(channel.state(id).await.unwrap(), JobState::Completed);
    }

    #[tokio::test]
    async fn test_lower_priority_value_runs_first() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel(Category::Ai, &descriptor()).unwrap();
        let source = broker.open_source(Category::Ai, &descriptor()).unwrap();

        let routine = channel.enqueue(job(Category::Ai, JobOptions::default())).await.unwrap();
        let urgent = channel
            .enqueue(job(Category::Ai, JobOptions::default().with_priority(1)))
            .await
            .unwrap();

        assert_eq!(source.fetch().await.unwrap().unwrap().id, urgent);
        assert_eq!(source.fetch().await.unwrap().unwrap().id, routine);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_delay() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel(Category::Video, &descriptor()).unwrap();
        let source = broker.open_source(Category::Video, &descriptor()).unwrap();

        let id = channel.enqueue(job(Category::Video, JobOptions::default())).await.unwrap();
        let fetched = source.fetch().await.unwrap().unwrap();
        source.retry(&fetched, Duration::from_secs(5)).await.unwrap();
        assert_eq!(channel.state(id).await.unwrap(), JobState::Delayed);
        assert!(source.fetch().await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(source.fetch().await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn test_faults() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel(Category::Cleanup, &descriptor()).unwrap();

        broker.fail_enqueue(true);
        let err = channel
            .enqueue(Job::new(Category::Cleanup, "purge", json!({}), JobPolicy::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Submission(_)));

        broker.reject_connections(true);
        assert!(matches!(
            broker.open_channel(Category::Cleanup, &descriptor()),
            Err(QueueError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_finished_jobs_are_trimmed_to_retention() {
        let broker = MemoryBroker::new().with_retention(RetentionConfig { keep_completed: 2, keep_failed: 1 });
        let channel = broker.open_channel(Category::Email, &descriptor()).unwrap();
        let source = broker.open_source(Category::Email, &descriptor()).unwrap();

        let mut completed = Vec::new();
        for _ in 0..3 {
            channel.enqueue(job(Category::Email, JobOptions::default())).await.unwrap();
            let fetched = source.fetch().await.unwrap().unwrap();
            source.complete(&fetched).await.unwrap();
            completed.push(fetched.id);
        }
        let mut failed = Vec::new();
        for _ in 0..2 {
            channel.enqueue(job(Category::Email, JobOptions::default())).await.unwrap();
            let fetched = source.fetch().await.unwrap().unwrap();
            source.fail(&fetched, "bounced").await.unwrap();
            failed.push(fetched.id);
        }

        assert_eq!(channel.state(completed[0]).await.unwrap(), JobState::Unknown);
        assert_eq!(channel.state(completed[1]).await.unwrap(), JobState::Completed);
        assert_eq!(channel.state(completed[2]).await.unwrap(), JobState::Completed);
        assert_eq!(channel.state(failed[0]).await.unwrap(), JobState::Unknown);
        assert_eq!(channel.state(failed[1]).await.unwrap(), JobState::Failed);
        assert_eq!(broker.jobs(Category::Email).len(), 3);
    }

    #[tokio::test]
    async fn test_zero_retention_forgets_finished_jobs() {
        let broker = MemoryBroker::new().with_retention(RetentionConfig { keep_completed: 0, keep_failed: 0 });
        let channel = broker.open_channel(Category::Cleanup, &descriptor()).unwrap();
        let source = broker.open_source(Category::Cleanup, &descriptor()).unwrap();

        let id = channel.enqueue(job(Category::Cleanup, JobOptions::default())).await.unwrap();
        let fetched = source.fetch().await.unwrap().unwrap();
        source.complete(&fetched).await.unwrap();
        assert_eq!(channel.state(id).await.unwrap(), JobState::Unknown);
        assert!(broker.jobs(Category::Cleanup).is_empty());
    }
}
