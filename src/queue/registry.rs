// Queue registry
//
// Memoizes one submission channel per category. Creation happens under the
// registry lock so concurrent callers share a single channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::queue::broker::{Broker, Channel};
use crate::queue::connection::ConnectionResolver;
use crate::queue::jobs::Category;
use crate::types::QueueResult;

/// One memoized submission channel per category.
pub struct QueueRegistry {
    resolver: Arc<ConnectionResolver>,
    broker: Arc<dyn Broker>,
    channels: Mutex<HashMap<Category, Arc<dyn Channel>>>,
}

impl QueueRegistry {
    pub fn new(resolver: Arc<ConnectionResolver>, broker: Arc<dyn Broker>) -> Self {
        Self {
            resolver,
            broker,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `Ok(None)` when no broker is usable. A broker that rejects the
    /// resolved connection is a configuration error and is returned as such.
    pub async fn get_or_create_channel(
        &self,
        category: Category,
    ) -> QueueResult<Option<Arc<dyn Channel>>> {
        let Some(connection) = self.resolver.resolve() else {
            return Ok(None);
        };

        // Held across creation so concurrent first calls share one channel.
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(&category) {
            return Ok(Some(channel.clone()));
        }

        let channel = self.broker.open_channel(category, &connection)?;
        channels.insert(category, channel.clone());
        info!(%category, host = %connection.host, "Queue channel created");
        Ok(Some(channel))
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every channel, continuing past failures. Returns one message per failure.
    pub async fn close_all(&self) -> Vec<String> {
        let channels: Vec<_> = self.channels.lock().await.drain().collect();
        let mut errors = Vec::new();
        for (category, channel) in channels {
            if let Err(e) = channel.close().await {
                errors.push(format!("channel {}: {}", category, e));
            }
        }
        errors
    }
}
