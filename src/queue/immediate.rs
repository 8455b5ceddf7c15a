// Degraded-mode handlers
//
// When no broker is configured, email, video and cleanup tasks run inline
// in the caller's context through one of these handlers. They do the
// cheapest useful version of the work and never retry.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

#[async_trait]
pub trait ImmediateHandler: Send + Sync {
    async fn execute(&self, task_type: &str, payload: &Value) -> Result<Value>;
}

/// Email handed to a `Mailer`. `template` is the task type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: Option<String>,
    pub template: String,
    pub data: Value,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Mailer that only records the delivery in the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to = %message.to,
            template = %message.template,
            subject = message.subject.as_deref().unwrap_or(""),
            "Email delivered inline"
        );
        Ok(())
    }
}

pub struct EmailShim {
    mailer: Arc<dyn Mailer>,
}

impl EmailShim {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl ImmediateHandler for EmailShim {
    async fn execute(&self, task_type: &str, payload: &Value) -> Result<Value> {
        let to = payload
            .get("to")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|to| to.contains('@'))
            .ok_or_else(|| anyhow!("email payload needs a valid 'to' address"))?;

        let message = EmailMessage {
            to: to.to_string(),
            subject: payload.get("subject").and_then(Value::as_str).map(str::to_string),
            template: task_type.to_string(),
            data: payload.get("data").cloned().unwrap_or(Value::Null),
        };

        self.mailer
            .send(&message)
            .await
            .with_context(|| format!("sending {} to {}", task_type, message.to))?;

        Ok(json!({ "delivered": true, "to": message.to, "template": message.template }))
    }
}

/// Accepts the upload as-is. Transcoding and thumbnails are skipped inline.
/// A missing `videoId` is echoed back as `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct VideoShim;

#[async_trait]
impl ImmediateHandler for VideoShim {
    async fn execute(&self, task_type: &str, payload: &Value) -> Result<Value> {
        let video_id = match payload.get("videoId") {
            Some(Value::String(id)) if !id.is_empty() => Value::String(id.clone()),
            Some(Value::Number(id)) => Value::String(id.to_string()),
            _ => Value::Null,
        };

        warn!(%video_id, %task_type, "Skipping video post-processing without a job queue");
        Ok(json!({ "videoId": video_id, "task": task_type, "postProcessed": false }))
    }
}

/// Cleanup is best-effort; inline runs only acknowledge the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupShim;

#[async_trait]
impl ImmediateHandler for CleanupShim {
    async fn execute(&self, task_type: &str, payload: &Value) -> Result<Value> {
        let target = payload.get("target").and_then(Value::as_str).unwrap_or("all");
        info!(%task_type, %target, "Cleanup acknowledged inline");
        Ok(json!({ "task": task_type, "target": target, "acknowledged": true }))
    }
}
