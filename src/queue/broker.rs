// Broker contract the dispatch layer is built on
//
// A `Channel` is the producer side of one category's queue and a
// `JobSource` the consumer side. Both are opened from a `Broker`, which
// owns the transport (Redis in production, memory in tests).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::queue::connection::ConnectionDescriptor;
use crate::queue::jobs::{Category, Job, JobState};
use crate::types::QueueResult;

#[async_trait]
pub trait Channel: Send + Sync {
    fn category(&self) -> Category;

    /// Hands the job to the broker and returns its id without waiting for processing.
    async fn enqueue(&self, job: Job) -> QueueResult<Uuid>;

    async fn state(&self, id: Uuid) -> QueueResult<JobState>;

    async fn close(&self) -> QueueResult<()>;
}

#[async_trait]
pub trait JobSource: Send + Sync {
    fn category(&self) -> Category;

    /// Claims the next ready job, if any, and marks it active.
    async fn fetch(&self) -> QueueResult<Option<Job>>;

    async fn complete(&self, job: &Job) -> QueueResult<()>;

    /// Parks a failed job until `delay` has elapsed.
    async fn retry(&self, job: &Job, delay: Duration) -> QueueResult<()>;

    /// Marks a job permanently failed.
    /// Finished jobs beyond the broker's retention are forgotten.
    async fn fail(&self, job: &Job, reason: &str) -> QueueResult<()>;

    async fn close(&self) -> QueueResult<()>;
}

/// Opens channels and job sources. Opening must not block on the network;
/// an error here means the descriptor itself was rejected.
pub trait Broker: Send + Sync {
    fn open_channel(
        &self,
        category: Category,
        connection: &ConnectionDescriptor,
    ) -> QueueResult<Arc<dyn Channel>>;

    fn open_source(
        &self,
        category: Category,
        connection: &ConnectionDescriptor,
    ) -> QueueResult<Arc<dyn JobSource>>;
}
