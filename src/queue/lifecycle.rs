// Consumer lifecycle
//
// Boot-time consumer wiring and the fault-isolated shutdown of every
// consumer and channel.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info};

use crate::queue::connection::ConnectionResolver;
use crate::queue::jobs::{Category, Job};
use crate::queue::registry::QueueRegistry;
use crate::queue::workers::{processor, WorkerOptions, WorkerRegistry};
use crate::types::{QueueError, QueueResult};

/// Categories whose consumers are started at boot. AI and notification
/// consumers are wired by their own collaborators.
pub const AUTO_START: [Category; 3] = [Category::Email, Category::Video, Category::Cleanup];

pub struct Lifecycle {
    resolver: Arc<ConnectionResolver>,
    queues: Arc<QueueRegistry>,
    workers: Arc<WorkerRegistry>,
    options: WorkerOptions,
}

impl Lifecycle {
    pub fn new(
        resolver: Arc<ConnectionResolver>,
        queues: Arc<QueueRegistry>,
        workers: Arc<WorkerRegistry>,
        options: WorkerOptions,
    ) -> Self {
        Self { resolver, queues, workers, options }
    }

    pub async fn start_all(&self) -> QueueResult<()> {
        if !self.resolver.is_available() {
            info!("Job queue unavailable; no consumers started");
            return Ok(());
        }

        for category in AUTO_START {
            let acknowledge = processor(move |job: Job| async move {
                info!(%category, job_id = %job.id, task_type = %job.task_type, "Job received");
                Ok(json!({ "acknowledged": true, "task": job.task_type }))
            });
            self.workers
                .get_or_create_consumer(category, acknowledge, self.options)
                .await?;
        }

        info!(categories = ?AUTO_START, "Consumers started");
        Ok(())
    }

    /// Closes every channel and consumer. A failed close never stops the
    /// rest; all failures come back in one `QueueError::Shutdown`.
    pub async fn stop_all(&self) -> QueueResult<()> {
        let mut errors = self.workers.close_all().await;
        errors.extend(self.queues.close_all().await);

        if errors.is_empty() {
            info!("Job queue shut down");
            Ok(())
        } else {
            for e in &errors {
                error!(error = %e, "Failed to close job queue resource");
            }
            Err(QueueError::Shutdown(errors))
        }
    }
}
