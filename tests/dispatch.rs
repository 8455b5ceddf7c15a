use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskdispatch::config::{Config, QueueConfig, RetentionConfig, WorkerConfig};
use taskdispatch::queue::{
    Category, JobEvent, JobOptions, JobState, LogMailer, MemoryBroker, Submission, TaskQueues,
};

fn config(redis_url: Option<&str>) -> Config {
    Config {
        queue: QueueConfig {
            disabled: false,
            environment: "production".to_string(),
            redis_url: redis_url.map(str::to_string),
            prefix: "itest".to_string(),
        },
        worker: WorkerConfig {
            concurrency: 2,
            rate_max: 1000,
            rate_window_ms: 1000,
            poll_interval_ms: 5,
        },
        retention: RetentionConfig::default(),
    }
}

#[tokio::test]
async fn test_queued_email_is_processed_by_started_consumer() {
    let broker = MemoryBroker::new();
    let queues = TaskQueues::new(
        &config(Some("redis://cache.internal:6379")),
        Arc::new(broker.clone()),
        Arc::new(LogMailer),
    );
    let mut events = queues.subscribe();

    let submission = queues
        .dispatchers
        .email
        .submit("welcome-email", json!({ "to": "ada@example.org" }), JobOptions::default())
        .await
        .unwrap();
    let handle = match submission {
        Submission::Queued(handle) => handle,
        other => panic!("expected a queued job, got {:?}", other),
    };

    queues.lifecycle.start_all().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no job event")
        .unwrap();
    match event {
        JobEvent::Completed { job_id, category, output, .. } => {
            assert_eq!(job_id, handle.id);
            assert_eq!(category, Category::Email);
            assert_eq!(output["acknowledged"], json!(true));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(handle.status().await.unwrap(), JobState::Completed);

    queues.lifecycle.stop_all().await.unwrap();
    assert!(queues.queues.is_empty().await);
    assert!(queues.workers.is_empty().await);
}

#[tokio::test]
async fn test_disabled_queue_degrades_per_category() {
    let mut disabled = config(Some("redis://cache.internal:6379"));
    disabled.queue.disabled = true;
    let broker = MemoryBroker::new();
    let queues = TaskQueues::new(&disabled, Arc::new(broker.clone()), Arc::new(LogMailer));

    queues.lifecycle.start_all().await.unwrap();

    let video = queues
        .dispatchers
        .submit(Category::Video, "thumbnail", json!({ "videoId": 7 }), JobOptions::default())
        .await
        .unwrap();
    assert!(video.immediate().unwrap().immediate);

    let ai = queues
        .dispatchers
        .submit(Category::Ai, "summarize", json!({ "text": "..." }), JobOptions::default())
        .await
        .unwrap();
    assert!(matches!(ai, Submission::NotProcessed));

    assert_eq!(broker.channels_opened(), 0);
    assert_eq!(broker.sources_opened(), 0);
    queues.lifecycle.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_placeholder_host_is_treated_as_unavailable() {
    let queues = TaskQueues::new(
        &config(Some("redis://base:6379")),
        Arc::new(MemoryBroker::new()),
        Arc::new(LogMailer),
    );
    assert!(queues.resolver.resolve().is_none());

    let submission = queues
        .dispatchers
        .cleanup
        .submit("expired-sessions", json!({}), JobOptions::default())
        .await
        .unwrap();
    assert!(submission.immediate().is_some());
}
