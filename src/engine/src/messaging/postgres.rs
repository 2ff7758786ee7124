//! PostgreSQL LISTEN/NOTIFY transport
//!
//! Publishing is a `pg_notify` on a pooled connection. Subscribing keeps one
//! dedicated listener connection; when it drops, the listener is rebuilt
//! with capped exponential backoff and the handler is told it reconnected.

use super::{reconnect_delay, EventHandler, Messenger};
use crate::config::MessagingConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use permsync_api::{InvalidationEvent, PermsError, Result};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TRANSPORT: &str = "postgres";

/// NOTIFY payloads above this size are rejected by the server
const MAX_PAYLOAD_BYTES: usize = 8000;

/// LISTEN/NOTIFY messenger
pub struct PostgresMessenger {
    pool: PgPool,
    /// Whether `close` should close the pool too
    owns_pool: bool,
    config: MessagingConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PostgresMessenger {
    /// Connect with a small dedicated pool
    pub async fn connect(database_url: &str, config: MessagingConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .min_connections(1)
            .acquire_timeout(config.publish_timeout)
            .connect(database_url)
            .await
            .map_err(|e| PermsError::messaging(TRANSPORT, format!("connect failed: {}", e)))?;
        let mut messenger = Self::from_pool(pool, config);
        messenger.owns_pool = true;
        Ok(messenger)
    }

    /// Share an existing pool, e.g. the storage pool
    pub fn from_pool(pool: PgPool, config: MessagingConfig) -> Self {
        Self {
            pool,
            owns_pool: false,
            config,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn open_listener(pool: &PgPool, channel: &str) -> std::result::Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(channel).await?;
        Ok(listener)
    }

    async fn listen_loop(
        pool: PgPool,
        config: MessagingConfig,
        handler: Arc<dyn EventHandler>,
        shutdown: CancellationToken,
    ) {
        let mut attempt = 0u32;
        while !shutdown.is_cancelled() {
            let mut listener = match Self::open_listener(&pool, &config.channel).await {
                Ok(listener) => listener,
                Err(e) => {
                    attempt += 1;
                    let delay = reconnect_delay(&config, attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LISTEN failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            if attempt > 0 {
                info!(attempt, channel = %config.channel, "Invalidation listener reconnected");
            }
            attempt = 0;
            handler.on_connected();

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = listener.try_recv() => match received {
                        Ok(Some(notification)) => {
                            match InvalidationEvent::decode(notification.payload()) {
                                Ok(event) => handler.on_event(event),
                                Err(e) => warn!(error = %e, "Dropping undecodable notification"),
                            }
                        }
                        Ok(None) => {
                            warn!(channel = %config.channel, "Listener connection lost");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Listener failed");
                            break;
                        }
                    }
                }
            }

            attempt += 1;
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(reconnect_delay(&config, attempt)) => {}
            }
        }
    }
}

#[async_trait]
impl Messenger for PostgresMessenger {
    fn name(&self) -> &'static str {
        TRANSPORT
    }

    async fn publish(&self, event: &InvalidationEvent) -> Result<()> {
        let payload = event.encode()?;
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(PermsError::messaging(
                TRANSPORT,
                format!("payload of {} bytes exceeds NOTIFY limit", payload.len()),
            ));
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.config.channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| PermsError::messaging(TRANSPORT, format!("notify failed: {}", e)))?;

        debug!(event = %event.id, channel = %self.config.channel, "Published invalidation");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let task = tokio::spawn(Self::listen_loop(
            self.pool.clone(),
            self.config.clone(),
            handler,
            self.shutdown.clone(),
        ));
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        if self.owns_pool {
            self.pool.close().await;
        }
        Ok(())
    }
}
