// Background task dispatch
//
// Jobs go to a Redis-backed queue when one is configured and usable, and
// otherwise run inline (email, video, cleanup) or are reported as not
// processed (ai, notifications).

pub mod broker;
pub mod connection;
pub mod dispatch;
pub mod immediate;
pub mod jobs;
pub mod lifecycle;
pub mod memory;
pub mod redis_broker;
pub mod registry;
pub mod workers;

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::Config;

pub use broker::{Broker, Channel, JobSource};
pub use connection::{ConnectionDescriptor, ConnectionResolver};
pub use dispatch::{Dispatcher, Dispatchers};
pub use immediate::{EmailMessage, ImmediateHandler, LogMailer, Mailer};
pub use jobs::{
    Backoff, Category, ImmediateResult, Job, JobHandle, JobOptions, JobPolicy, JobState, Submission,
};
pub use lifecycle::Lifecycle;
pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;
pub use registry::QueueRegistry;
pub use workers::{
    processor, Consumer, JobEvent, ProcessFn, WorkerOptions, WorkerRegistry, MAX_CONCURRENCY,
};

/// Everything the host application needs, wired around one resolver and broker.
pub struct TaskQueues {
    pub resolver: Arc<ConnectionResolver>,
    pub queues: Arc<QueueRegistry>,
    pub workers: Arc<WorkerRegistry>,
    pub dispatchers: Dispatchers,
    pub lifecycle: Lifecycle,
}

impl TaskQueues {
    pub fn new(config: &Config, broker: Arc<dyn Broker>, mailer: Arc<dyn Mailer>) -> Self {
        let resolver = Arc::new(ConnectionResolver::new(config.queue.clone()));
        let queues = Arc::new(QueueRegistry::new(resolver.clone(), broker.clone()));
        let workers = Arc::new(WorkerRegistry::new(resolver.clone(), broker));
        let lifecycle = Lifecycle::new(
            resolver.clone(),
            queues.clone(),
            workers.clone(),
            WorkerOptions::from(&config.worker),
        );

        Self {
            dispatchers: Dispatchers::new(queues.clone(), mailer),
            resolver,
            queues,
            workers,
            lifecycle,
        }
    }

    /// Redis broker under the configured key prefix and retention, logging mailer for inline email.
    pub fn redis(config: &Config) -> Self {
        let broker = RedisBroker::new(config.queue.prefix.clone()).with_retention(config.retention.clone());
        Self::new(config, Arc::new(broker), Arc::new(LogMailer))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.workers.subscribe()
    }
}
