use anyhow::Result;
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Forces degraded mode regardless of the other settings.
    pub disabled: bool,
    pub environment: String,
    pub redis_url: Option<String>,
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub rate_max: u32,
    pub rate_window_ms: u64,
    pub poll_interval_ms: u64,
}

/// How many finished jobs each category keeps for status lookups.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl QueueConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            environment: "development".to_string(),
            redis_url: None,
            prefix: "taskdispatch".to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_max: 100,
            rate_window_ms: 60_000,
            poll_interval_ms: 250,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            queue: QueueConfig {
                disabled: var("DISABLE_JOB_QUEUE", "false").trim().parse()?,
                environment: var("APP_ENV", "development"),
                redis_url: lookup("REDIS_URL")
                    .map(|url| url.trim().to_string())
                    .filter(|url| !url.is_empty()),
                prefix: var("QUEUE_PREFIX", "taskdispatch"),
            },
            worker: WorkerConfig {
                concurrency: var("WORKER_CONCURRENCY", "5").parse()?,
                rate_max: var("WORKER_RATE_MAX", "100").parse()?,
                rate_window_ms: var("WORKER_RATE_WINDOW_MS", "60000").parse()?,
                poll_interval_ms: var("WORKER_POLL_INTERVAL_MS", "250").parse()?,
            },
            retention: RetentionConfig {
                keep_completed: var("QUEUE_KEEP_COMPLETED", "100").parse()?,
                keep_failed: var("QUEUE_KEEP_FAILED", "500").parse()?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(!config.queue.disabled);
        assert!(!config.queue.is_production());
        assert!(config.queue.redis_url.is_none());
        assert_eq!(config.queue.prefix, "taskdispatch");
        assert_eq!(config.worker.concurrency, 5);
        assert_eq!(config.worker.rate_max, 100);
        assert_eq!(config.worker.rate_window_ms, 60_000);
        assert_eq!(config.retention.keep_completed, 100);
        assert_eq!(config.retention.keep_failed, 500);
    }

    #[test]
    fn test_reads_queue_settings() {
        let config = Config::from_lookup(lookup(&[
            ("DISABLE_JOB_QUEUE", "true"),
            ("APP_ENV", "Production"),
            ("REDIS_URL", "  redis://cache.internal:6380  "),
            ("WORKER_CONCURRENCY", "12"),
            ("QUEUE_KEEP_COMPLETED", "0"),
        ]))
        .unwrap();
        assert_eq!(config.retention.keep_completed, 0);
        assert!(config.queue.disabled);
        assert!(config.queue.is_production());
        assert_eq!(config.queue.redis_url.as_deref(), Some("redis://cache.internal:6380"));
        assert_eq!(config.worker.concurrency, 12);
    }

    #[test]
    fn test_blank_redis_url_is_treated_as_missing() {
        let config = Config::from_lookup(lookup(&[("REDIS_URL", "   ")])).unwrap();
        assert!(config.queue.redis_url.is_none());
    }

    #[test]
    fn test_malformed_numbers_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("WORKER_RATE_MAX", "lots")])).is_err());
        assert!(Config::from_lookup(lookup(&[("DISABLE_JOB_QUEUE", "maybe")])).is_err());
    }
}
