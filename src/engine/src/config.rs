//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Calculator cache configuration
    pub cache: CacheConfig,

    /// Inheritance traversal configuration
    pub graph: GraphConfig,

    /// Storage retry and timeout policy
    pub retry: RetryConfig,

    /// Per-subject mutation serialization
    pub mutation: MutationConfig,

    /// Invalidation broadcast settings
    pub messaging: MessagingConfig,

    /// Load every subject into memory on start
    pub preload: bool,
}

/// Calculator cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of resolved entries across all shards
    pub capacity: usize,

    /// Number of independently locked shards
    pub shards: usize,

    /// Maximum number of invalidated entries kept for stale fallback
    pub stale_capacity: usize,

    /// Loaded subjects kept in memory before the least recently used are
    /// evicted
    pub max_subjects: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            shards: 16,
            stale_capacity: 10_000,
            max_subjects: 50_000,
        }
    }
}

/// Order in which ancestors are visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalAlgorithm {
    /// Each parent's whole ancestry before the next parent
    #[default]
    DepthFirstPreOrder,
    /// A parent's ancestors before the parent itself
    DepthFirstPostOrder,
    /// Strict depth order
    BreadthFirst,
}

/// Inheritance graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum inheritance depth; deeper ancestors are pruned
    pub max_depth: usize,

    pub algorithm: TraversalAlgorithm,

    /// Resolve `a.b.*` style wildcard nodes in `check`
    pub apply_wildcards: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_depth: 32,
            algorithm: TraversalAlgorithm::default(),
            apply_wildcards: true,
        }
    }
}

/// Retry policy for storage calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, including the first
    pub max_attempts: u32,

    /// Initial backoff duration (default: 50ms)
    pub initial_backoff: Duration,

    /// Maximum backoff duration (default: 2s)
    pub max_backoff: Duration,

    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,

    /// Timeout for a single attempt (default: 5s)
    pub operation_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Exponential backoff before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = (self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1)) as u64;

        Duration::from_millis(backoff_ms.min(self.max_backoff.as_millis() as u64))
    }
}

/// What happens when a subject already has a mutation in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationPolicy {
    /// Wait up to `lock_timeout`, then fail with `Busy`
    #[default]
    Queue,
    /// Fail with `Busy` immediately
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    pub policy: MutationPolicy,
    pub lock_timeout: Duration,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            policy: MutationPolicy::Queue,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Invalidation broadcast configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Upper bound on a single publish
    pub publish_timeout: Duration,

    /// Number of recently seen event ids remembered for deduplication
    pub dedup_capacity: usize,

    /// Channel name for transports that have one
    pub channel: String,

    /// Initial reconnect backoff
    pub reconnect_backoff: Duration,

    /// Maximum reconnect backoff
    pub max_reconnect_backoff: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(2),
            dedup_capacity: 4096,
            channel: "permsync_invalidation".to_string(),
            reconnect_backoff: Duration::from_millis(500),
            max_reconnect_backoff: Duration::from_secs(30),
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Process-local, lost on exit
    Memory,

    /// One JSON file per subject under `path`
    File { path: PathBuf },

    /// Embedded sled database at `path`
    Sled { path: PathBuf },

    /// PostgreSQL
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_min_connections")]
        min_connections: u32,
        #[serde(default = "default_acquire_timeout")]
        acquire_timeout: Duration,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

/// Invalidation transport selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Single process; nothing is broadcast
    #[default]
    None,

    /// PostgreSQL LISTEN/NOTIFY
    Postgres { url: String },
}

fn default_max_connections() -> u32 {
    25
}

fn default_min_connections() -> u32 {
    5
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(3)
}
