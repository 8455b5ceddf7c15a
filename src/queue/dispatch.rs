// Category dispatchers
//
// Each dispatcher owns one category. With a channel the job is enqueued and
// a handle returned at once; without one, shim categories run inline and the
// rest report `NotProcessed`.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::queue::immediate::{CleanupShim, EmailShim, ImmediateHandler, Mailer, VideoShim};
use crate::queue::jobs::{Category, ImmediateResult, Job, JobHandle, JobOptions, Submission};
use crate::queue::registry::QueueRegistry;
use crate::types::{QueueError, QueueResult};

pub struct Dispatcher {
    category: Category,
    queues: Arc<QueueRegistry>,
    shim: Option<Arc<dyn ImmediateHandler>>,
}

impl Dispatcher {
    /// A shim is ignored for categories without an inline fallback.
    pub fn new(
        category: Category,
        queues: Arc<QueueRegistry>,
        shim: Option<Arc<dyn ImmediateHandler>>,
    ) -> Self {
        let shim = shim.filter(|_| category.has_immediate_fallback());
        Self { category, queues, shim }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub async fn submit(
        &self,
        task_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<Submission> {
        let Some(channel) = self.queues.get_or_create_channel(self.category).await? else {
            return self.run_degraded(task_type, payload).await;
        };

        let policy = self.category.default_policy().merge(&options);
        let job = Job::new(self.category, task_type, payload, policy);
        let id = channel.enqueue(job).await?;

        info!(
            category = %self.category,
            job_id = %id,
            %task_type,
            attempts = policy.attempts,
            "Job queued"
        );
        Ok(Submission::Queued(JobHandle::new(id, self.category, task_type, channel)))
    }

    async fn run_degraded(&self, task_type: &str, payload: Value) -> QueueResult<Submission> {
        let Some(shim) = &self.shim else {
            warn!(
                category = %self.category,
                %task_type,
                "Job queue unavailable; task not processed"
            );
            return Ok(Submission::NotProcessed);
        };

        warn!(
            category = %self.category,
            %task_type,
            "Job queue unavailable; processing immediately"
        );
        let output = shim
            .execute(task_type, &payload)
            .await
            .map_err(|e| QueueError::Immediate(format!("{} {}: {:#}", self.category, task_type, e)))?;
        Ok(Submission::Immediate(ImmediateResult::new(self.category, task_type, output)))
    }
}

/// The five category dispatchers sharing one queue registry.
pub struct Dispatchers {
    pub email: Dispatcher,
    pub video: Dispatcher,
    pub ai: Dispatcher,
    pub cleanup: Dispatcher,
    pub notifications: Dispatcher,
}

impl Dispatchers {
    pub fn new(queues: Arc<QueueRegistry>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            email: Dispatcher::new(
                Category::Email,
                queues.clone(),
                Some(Arc::new(EmailShim::new(mailer))),
            ),
            video: Dispatcher::new(Category::Video, queues.clone(), Some(Arc::new(VideoShim))),
            ai: Dispatcher::new(Category::Ai, queues.clone(), None),
            cleanup: Dispatcher::new(Category::Cleanup, queues.clone(), Some(Arc::new(CleanupShim))),
            notifications: Dispatcher::new(Category::Notifications, queues, None),
        }
    }

    pub fn for_category(&self, category: Category) -> &Dispatcher {
        match category {
            Category::Email => &self.email,
            Category::Video => &self.video,
            Category::Ai => &self.ai,
            Category::Cleanup => &self.cleanup,
            Category::Notifications => &self.notifications,
        }
    }

    pub async fn submit(
        &self,
        category: Category,
        task_type: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<Submission> {
        self.for_category(category).submit(task_type, payload, options).await
    }
}
