//! Node configuration loading and validation

use anyhow::{Context, Result};
use permsync_engine::{EngineConfig, StorageConfig, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete node configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

// Default value functions
fn default_name() -> String { "permsync".to_string() }
fn default_data_dir() -> PathBuf { PathBuf::from("./data") }
fn default_log_level() -> String { "info".to_string() }

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl NodeConfig {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read configuration file {:?}", path.as_ref()))?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse configuration file")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.node.log_level.as_str()) {
            anyhow::bail!(
                "log_level must be one of {:?}, got '{}'",
                LOG_LEVELS,
                self.node.log_level
            );
        }

        // Validate engine
        let engine = &self.engine;
        if engine.cache.capacity == 0 || engine.cache.shards == 0 {
            anyhow::bail!("cache capacity and shard count must be positive");
        }
        if engine.cache.shards > engine.cache.capacity {
            anyhow::bail!("cache shard count cannot exceed its capacity");
        }
        if engine.cache.max_subjects == 0 {
            anyhow::bail!("cache max_subjects must be positive");
        }
        if engine.graph.max_depth == 0 {
            anyhow::bail!("graph max_depth must be at least 1");
        }
        if engine.retry.max_attempts == 0 {
            anyhow::bail!("retry max_attempts must be at least 1");
        }
        if engine.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("retry backoff_multiplier must be at least 1.0");
        }
        if engine.messaging.dedup_capacity == 0 {
            anyhow::bail!("messaging dedup_capacity must be positive");
        }

        // Validate storage and transport
        if let StorageConfig::Postgres {
            url,
            max_connections,
            min_connections,
            ..
        } = &self.storage
        {
            check_postgres_url(url)?;
            if min_connections > max_connections {
                anyhow::bail!("postgres min_connections exceeds max_connections");
            }
        }
        if let TransportConfig::Postgres { url } = &self.transport {
            check_postgres_url(url)?;
            if matches!(self.storage, StorageConfig::Memory) {
                anyhow::bail!("memory storage is process-local; a transport would broadcast changes no other process can read");
            }
        }

        Ok(())
    }

    /// Get absolute data directory path
    pub fn data_dir(&self) -> PathBuf {
        if self.node.data_dir.is_absolute() {
            self.node.data_dir.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.node.data_dir)
        }
    }

    /// Storage configuration with relative paths resolved against the data
    /// directory
    pub fn storage(&self) -> StorageConfig {
        let resolve = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                self.data_dir().join(path)
            }
        };
        match &self.storage {
            StorageConfig::File { path } => StorageConfig::File { path: resolve(path) },
            StorageConfig::Sled { path } => StorageConfig::Sled { path: resolve(path) },
            other => other.clone(),
        }
    }
}

fn check_postgres_url(url: &str) -> Result<()> {
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        anyhow::bail!("postgres url must start with postgres:// or postgresql://");
    }
    Ok(())
}
