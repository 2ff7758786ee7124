//! Node orchestrator: storage, transport and engine lifecycle

use anyhow::{Context, Result};
use permsync_api::{ContextSet, Subject, SubjectId, Tristate};
use permsync_engine::{open_messenger, open_storage, PermissionEngine, ReloadOutcome, StorageConfig};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;

/// Interval between cache statistics log lines while serving
const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// A running permission engine bound to its configured backends
pub struct PermsNode {
    name: String,
    engine: PermissionEngine,
    shutdown: CancellationToken,
}

impl PermsNode {
    /// Open storage and transport, then start the engine
    pub async fn new(config: NodeConfig) -> Result<Self> {
        info!("Initializing permsync node '{}'", config.node.name);

        let storage_config = config.storage();
        let data_dir = config.data_dir();
        if !matches!(storage_config, StorageConfig::Memory) {
            std::fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        }

        let storage = open_storage(&storage_config)
            .await
            .context("Failed to open storage backend")?;
        info!(backend = storage.name(), "Storage backend opened");

        let messenger = open_messenger(&config.transport, &config.engine.messaging)
            .await
            .context("Failed to open invalidation transport")?;
        info!(transport = messenger.name(), "Invalidation transport opened");

        let engine = PermissionEngine::start(config.engine.clone(), storage, messenger)
            .await
            .context("Failed to start permission engine")?;

        Ok(Self {
            name: config.node.name,
            engine,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn engine(&self) -> &PermissionEngine {
        &self.engine
    }

    /// Token that stops [`PermsNode::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled, logging cache health
    pub async fn run(&self) -> Result<()> {
        info!(node = %self.name, origin = %self.engine.origin(), "Node running");
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let cache = self.engine.cache_stats();
                    let sync = self.engine.sync_stats();
                    info!(
                        entries = cache.entries,
                        hit_rate = format!("{:.1}%", cache.hit_rate() * 100.0),
                        evictions = cache.evictions,
                        stale_hits = cache.stale_hits,
                        events_applied = sync.applied,
                        reconnects = sync.reconnects,
                        "Cache statistics"
                    );
                }
            }
        }
        Ok(())
    }

    /// Stop serving, close the transport and flush storage
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.engine
            .shutdown()
            .await
            .context("Engine shutdown failed")?;
        info!(node = %self.name, "Node stopped");
        Ok(())
    }

    /// Write every persisted subject to `output` as a JSON array
    pub async fn export(&self, output: &Path) -> Result<usize> {
        let subjects = self.engine.bulk_load().await.context("Bulk load failed")?;
        let json = serde_json::to_vec_pretty(&subjects)?;
        tokio::fs::write(output, json)
            .await
            .with_context(|| format!("Failed to write export to {:?}", output))?;
        info!(subjects = subjects.len(), path = ?output, "Exported subjects");
        Ok(subjects.len())
    }

    /// Replace stored subjects with those in the JSON array at `input`
    pub async fn import(&self, input: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(input)
            .await
            .with_context(|| format!("Failed to read import file {:?}", input))?;
        let subjects: Vec<Subject> =
            serde_json::from_slice(&bytes).context("Import file is not a subject array")?;

        self.engine
            .bulk_save(&subjects)
            .await
            .context("Bulk save failed")?;
        info!(subjects = subjects.len(), path = ?input, "Imported subjects");
        Ok(subjects.len())
    }

    /// Reload every subject from storage into memory
    pub async fn reload(&self) -> Result<()> {
        match self.engine.reload().await? {
            ReloadOutcome::Applied(count) => debug!(count, "Reload applied"),
            ReloadOutcome::Superseded => warn!("Reload superseded by a newer one"),
        }
        Ok(())
    }

    /// Evaluate one permission for a subject under `context`
    pub async fn check(
        &self,
        subject: &str,
        permission: &str,
        context: &str,
    ) -> Result<Tristate> {
        let id: SubjectId = subject
            .parse()
            .with_context(|| format!("Invalid subject '{}'", subject))?;
        let context: ContextSet = if context.trim().is_empty() {
            ContextSet::new()
        } else {
            context
                .parse()
                .with_context(|| format!("Invalid context '{}'", context))?
        };

        let result = self.engine.handle(id).check(permission, &context).await?;
        Ok(result)
    }
}
