// Job definitions for every task category

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::broker::Channel;
use crate::types::QueueResult;
use crate::utils::exponential_delay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Email,
    Video,
    Ai,
    Cleanup,
    Notifications,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Email,
        Category::Video,
        Category::Ai,
        Category::Cleanup,
        Category::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Email => "email",
            Category::Video => "video",
            Category::Ai => "ai",
            Category::Cleanup => "cleanup",
            Category::Notifications => "notifications",
        }
    }

    /// Retry policy applied when the caller does not override it.
    pub fn default_policy(&self) -> JobPolicy {
        match self {
            Category::Email => JobPolicy {
                attempts: 3,
                backoff: Some(Backoff::Exponential { delay: 2000 }),
                priority: None,
            },
            Category::Video => JobPolicy {
                attempts: 2,
                backoff: Some(Backoff::Fixed { delay: 5000 }),
                priority: None,
            },
            Category::Ai => JobPolicy {
                attempts: 2,
                backoff: Some(Backoff::Exponential { delay: 3000 }),
                priority: Some(5),
            },
            Category::Cleanup => JobPolicy {
                attempts: 1,
                backoff: None,
                priority: None,
            },
            Category::Notifications => JobPolicy::default(),
        }
    }

    /// Whether the category can run inline when no broker is available.
    /// AI inference and push delivery only make sense on the background path.
    pub fn has_immediate_fallback(&self) -> bool {
        matches!(self, Category::Email | Category::Video | Category::Cleanup)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay policy between attempts. `delay` is in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    Fixed { delay: u64 },
    Exponential { delay: u64 },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay: delay.as_millis() as u64 }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { delay: base.as_millis() as u64 }
    }

    /// Delay before the next attempt once `attempts_made` attempts have failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => Duration::from_millis(delay),
            Backoff::Exponential { delay } => {
                exponential_delay(Duration::from_millis(delay), attempts_made)
            }
        }
    }
}

/// Caller overrides for a single submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<Backoff>,
    pub priority: Option<u32>,
}

impl JobOptions {
    pub fn attempts(attempts: u32) -> Self {
        Self { attempts: Some(attempts), ..Self::default() }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// The resolved retry policy a job is enqueued with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    pub attempts: u32,
    pub backoff: Option<Backoff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self { attempts: 1, backoff: None, priority: None }
    }
}

impl JobPolicy {
    /// Overrides each field the caller set. Priority is only honoured by
    /// policies that carry one.
    pub fn merge(self, options: &JobOptions) -> Self {
        Self {
            attempts: options.attempts.unwrap_or(self.attempts).max(1),
            backoff: options.backoff.or(self.backoff),
            priority: self.priority.map(|default| options.priority.unwrap_or(default)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub category: Category,
    pub task_type: String,
    pub payload: serde_json::Value,
    #[serde(flatten)]
    pub policy: JobPolicy,
    #[serde(default)]
    pub attempts_made: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

impl Job {
    pub fn new(
        category: Category,
        task_type: impl Into<String>,
        payload: serde_json::Value,
        policy: JobPolicy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            task_type: task_type.into(),
            payload,
            policy,
            attempts_made: 0,
            created_at: chrono::Utc::now(),
            failed_reason: None,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.policy.attempts
    }

    /// Delay before the next attempt; zero when the job has no backoff.
    pub fn retry_delay(&self) -> Duration {
        self.policy
            .backoff
            .map(|backoff| backoff.delay_for(self.attempts_made))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Unknown,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "waiting" => JobState::Waiting,
            "delayed" => JobState::Delayed,
            "active" => JobState::Active,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }
}

/// Reference to an accepted job. Resolving it never waits for processing.
#[derive(Clone)]
pub struct JobHandle {
    pub id: Uuid,
    pub category: Category,
    pub task_type: String,
    channel: Arc<dyn Channel>,
}

impl JobHandle {
    pub(crate) fn new(
        id: Uuid,
        category: Category,
        task_type: impl Into<String>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self { id, category, task_type: task_type.into(), channel }
    }

    pub async fn status(&self) -> QueueResult<JobState> {
        self.channel.state(self.id).await
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("task_type", &self.task_type)
            .finish()
    }
}

/// Output of a degraded-mode inline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmediateResult {
    pub category: Category,
    pub task_type: String,
    /// Always true; marks that the task ran inline instead of on a worker.
    pub immediate: bool,
    pub output: serde_json::Value,
}

impl ImmediateResult {
    pub fn new(category: Category, task_type: impl Into<String>, output: serde_json::Value) -> Self {
        Self { category, task_type: task_type.into(), immediate: true, output }
    }
}

#[derive(Debug)]
pub enum Submission {
    Queued(JobHandle),
    Immediate(ImmediateResult),
    /// No broker and no inline substitute; the task was dropped.
    NotProcessed,
}

impl Submission {
    pub fn handle(&self) -> Option<&JobHandle> {
        match self {
            Submission::Queued(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn immediate(&self) -> Option<&ImmediateResult> {
        match self {
            Submission::Immediate(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_processed(&self) -> bool {
        !matches!(self, Submission::NotProcessed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_defaults() {
        let email = Category::Email.default_policy();
        assert_eq!(email.attempts, 3);
        assert_eq!(email.backoff, Some(Backoff::Exponential { delay: 2000 }));

        let video = Category::Video.default_policy();
        assert_eq!(video.attempts, 2);
        assert_eq!(video.backoff, Some(Backoff::Fixed { delay: 5000 }));

        let ai = Category::Ai.default_policy();
        assert_eq!(ai.attempts, 2);
        assert_eq!(ai.backoff, Some(Backoff::Exponential { delay: 3000 }));
        assert_eq!(ai.priority, Some(5));

        let cleanup = Category::Cleanup.default_policy();
        assert_eq!(cleanup.attempts, 1);
        assert!(cleanup.backoff.is_none());

        assert_eq!(Category::Notifications.default_policy(), JobPolicy::default());
    }

    #[test]
    fn test_merge_overrides_only_what_is_set() {
        let merged = Category::Video.default_policy().merge(&JobOptions::attempts(5));
        assert_eq!(merged.attempts, 5);
        assert_eq!(merged.backoff, Some(Backoff::Fixed { delay: 5000 }));

        let merged = Category::Email
            .default_policy()
            .merge(&JobOptions::default().with_backoff(Backoff::fixed(Duration::from_secs(1))));
        assert_eq!(merged.attempts, 3);
        assert_eq!(merged.backoff, Some(Backoff::Fixed { delay: 1000 }));
    }

    #[test]
    fn test_priority_only_applies_to_prioritised_categories() {
        let options = JobOptions::default().with_priority(1);
        assert_eq!(Category::Ai.default_policy().merge(&options).priority, Some(1));
        assert_eq!(Category::Email.default_policy().merge(&options).priority, None);
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let merged = JobPolicy::default().merge(&JobOptions::attempts(0));
        assert_eq!(merged.attempts, 1);
    }

    #[test]
    fn test_backoff_wire_format() {
        let value = serde_json::to_value(Backoff::Exponential { delay: 2000 }).unwrap();
        assert_eq!(value, json!({"type": "exponential", "delay": 2000}));
    }

    #[test]
    fn test_retry_delay_follows_backoff() {
        let mut job = Job::new(Category::Email, "welcome-email", json!({}), Category::Email.default_policy());
        job.attempts_made = 2;
        assert_eq!(job.retry_delay(), Duration::from_millis(4000));
        assert!(job.has_attempts_left());

        let mut cleanup = Job::new(Category::Cleanup, "purge", json!({}), Category::Cleanup.default_policy());
        cleanup.attempts_made = 1;
        assert_eq!(cleanup.retry_delay(), Duration::ZERO);
        assert!(!cleanup.has_attempts_left());
    }

    #[test]
    fn test_job_state_parse() {
        for state in [JobState::Waiting, JobState::Delayed, JobState::Active, JobState::Completed, JobState::Failed] {
            assert_eq!(JobState::parse(state.as_str()), state);
        }
        assert_eq!(JobState::parse("stalled"), JobState::Unknown);
    }
}
