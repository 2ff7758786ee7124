//! # permsync engine
//!
//! Permission resolution, caching and cross-process synchronisation for
//! users and groups with contextual, inheritable, expiring permissions.
//!
//! ## Features
//!
//! - **Closest-wins resolution** over a priority-ordered inheritance graph
//! - **Contexts** (`server`, `world`, custom keys) on nodes and edges
//! - **Sharded LRU cache** with descendant-aware invalidation
//! - **Storage backends**: PostgreSQL, sled, flat JSON files, in-memory
//! - **Invalidation broadcast** over PostgreSQL LISTEN/NOTIFY or an
//!   in-process hub
//!
//! ## Example
//!
//! ```rust
//! use permsync_api::{ContextSet, InheritanceEdge, Node, SubjectId, Tristate};
//! use permsync_engine::{EngineConfig, InMemoryStorage, NoopMessenger, PermissionEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = PermissionEngine::start(
//!         EngineConfig::default(),
//!         Arc::new(InMemoryStorage::new()),
//!         Arc::new(NoopMessenger),
//!     )
//!     .await?;
//!
//!     engine.group("default")?.data().add(Node::grant("chat.use")?).await?;
//!
//!     let user = engine.user(uuid::Uuid::new_v4());
//!     user.data()
//!         .add_parent(InheritanceEdge::new(SubjectId::group("default")?))
//!         .await?;
//!
//!     let allowed = user.check("chat.use", &ContextSet::new()).await?;
//!     assert_eq!(allowed, Tristate::True);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod graph;
pub mod locks;
pub mod messaging;
pub mod registry;
pub mod resolver;
pub mod storage;
pub mod sync;

// Re-export commonly used types
pub use cache::{CacheStats, CalculatorCache};
pub use config::{
    CacheConfig, EngineConfig, GraphConfig, MessagingConfig, MutationConfig, MutationPolicy,
    RetryConfig, StorageConfig, TransportConfig, TraversalAlgorithm,
};
pub use engine::{PermissionEngine, ReloadOutcome, SubjectData, SubjectHandle};
pub use graph::{GraphDiagnostic, InheritanceGraph};
pub use messaging::{open_messenger, EventHandler, LocalHub, Messenger, NoopMessenger};
pub use resolver::{MetaData, Resolution, Resolver};
pub use storage::{open_storage, DiffOutcome, FileStorage, InMemoryStorage, Storage};
pub use sync::SyncStats;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
