// Error types shared by the dispatch layer

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The broker client rejected connection parameters that looked valid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Enqueue failed after a channel was obtained.
    #[error("Submission error: {0}")]
    Submission(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A degraded-mode handler failed while running inline.
    #[error("Immediate execution failed: {0}")]
    Immediate(String),

    #[error("Shutdown failed for {} resource(s): {}", .0.len(), .0.join("; "))]
    Shutdown(Vec<String>),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;
