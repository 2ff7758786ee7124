//! Invalidation broadcast
//!
//! A [`Messenger`] carries [`InvalidationEvent`]s between processes sharing
//! a storage backend. Delivery is at-least-once at best; receivers
//! deduplicate by event id and treat every (re)connect as a signal that
//! events may have been missed.

use crate::config::{MessagingConfig, TransportConfig};
use async_trait::async_trait;
use permsync_api::{InvalidationEvent, Result};
use std::sync::Arc;
use std::time::Duration;

pub mod local;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use local::{LocalHub, LocalMessenger};

#[cfg(feature = "postgres")]
pub use postgres::PostgresMessenger;

/// Receives events from a [`Messenger`]
pub trait EventHandler: Send + Sync {
    /// An event arrived; may be a duplicate or our own echo
    fn on_event(&self, event: InvalidationEvent);

    /// The subscription was (re)established; anything before now may have
    /// been missed
    fn on_connected(&self);
}

/// Invalidation transport
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Short transport name for logs
    fn name(&self) -> &'static str;

    /// Broadcast an event to every subscribed process
    async fn publish(&self, event: &InvalidationEvent) -> Result<()>;

    /// Start delivering events to `handler`
    async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<()>;

    /// Stop delivery and release the transport
    async fn close(&self) -> Result<()>;
}

/// Transport for single-process deployments
#[derive(Debug, Default)]
pub struct NoopMessenger;

#[async_trait]
impl Messenger for NoopMessenger {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn publish(&self, _event: &InvalidationEvent) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _handler: Arc<dyn EventHandler>) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens the transport selected by configuration
pub async fn open_messenger(
    transport: &TransportConfig,
    config: &MessagingConfig,
) -> Result<Arc<dyn Messenger>> {
    let messenger: Arc<dyn Messenger> = match transport {
        TransportConfig::None => Arc::new(NoopMessenger),
        #[cfg(feature = "postgres")]
        TransportConfig::Postgres { url } => {
            Arc::new(PostgresMessenger::connect(url, config.clone()).await?)
        }
        #[allow(unreachable_patterns)]
        other => {
            let _ = config;
            return Err(permsync_api::PermsError::Configuration(format!(
                "messaging transport {:?} not compiled in",
                other
            )));
        }
    };
    Ok(messenger)
}

/// Reconnect delay for attempt number `attempt` (1-based)
pub(crate) fn reconnect_delay(config: &MessagingConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay_ms = config.reconnect_backoff.as_millis() as u64 * (1u64 << exponent);
    Duration::from_millis(delay_ms.min(config.max_reconnect_backoff.as_millis() as u64))
}
