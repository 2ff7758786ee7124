//! Storage backends
//!
//! Every backend implements [`Storage`]. The engine never talks to a backend
//! directly; it goes through [`RetryingStorage`], which adds per-attempt
//! timeouts and bounded exponential backoff for transient failures.

use crate::config::StorageConfig;
use async_trait::async_trait;
use permsync_api::{Node, PermsError, Result, Subject, SubjectDiff, SubjectId, SubjectKind};
use std::sync::Arc;
use tracing::warn;

pub mod file;
pub mod memory;
pub mod retry;

#[cfg(feature = "sled")]
pub mod sled_store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use file::FileStorage;
pub use memory::InMemoryStorage;
pub use retry::RetryingStorage;

#[cfg(feature = "sled")]
pub use sled_store::SledStorage;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;

/// Result of applying a diff
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// Subject as persisted after the diff
    pub subject: Subject,

    /// False when every change was an idempotent no-op
    pub changed: bool,
}

/// Storage backend trait
///
/// Implementations classify their native errors into [`PermsError`]:
/// connectivity problems become `StorageUnavailable`, constraint violations
/// `InvalidMutation`, undecodable records `CorruptRecord`.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Prepare the backend (schema, directories)
    async fn init(&self) -> Result<()>;

    /// Flush and release resources
    async fn shutdown(&self) -> Result<()>;

    /// Load one subject; `None` when it has never been persisted
    async fn load_subject(&self, id: &SubjectId) -> Result<Option<Subject>>;

    /// Replace a subject wholesale
    async fn save_subject(&self, subject: &Subject) -> Result<()>;

    /// Delete a subject's records; deleting an absent subject is a no-op
    async fn delete_subject(&self, id: &SubjectId) -> Result<()>;

    /// Ids of every persisted subject of a kind
    async fn list_subjects(&self, kind: SubjectKind) -> Result<Vec<SubjectId>>;

    /// Every persisted subject. Corrupt records come back empty.
    async fn bulk_load(&self) -> Result<Vec<Subject>>;

    /// Upsert many subjects; all-or-nothing where the backend supports it
    async fn bulk_save(&self, subjects: &[Subject]) -> Result<()>;

    /// Atomically apply a diff to one subject, creating it if needed.
    ///
    /// Applying the same diff twice is a no-op the second time, which makes
    /// this safe to retry after an ambiguous failure.
    async fn apply_node_diff(&self, id: &SubjectId, diff: &SubjectDiff) -> Result<DiffOutcome>;

    /// Subjects holding a node with exactly this key
    async fn search_permission(&self, key: &str) -> Result<Vec<(SubjectId, Node)>>;
}

/// Opens the backend selected by configuration
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config {
        StorageConfig::Memory => Arc::new(InMemoryStorage::new()),
        StorageConfig::File { path } => Arc::new(FileStorage::new(path)),
        #[cfg(feature = "sled")]
        StorageConfig::Sled { path } => Arc::new(SledStorage::open(path)?),
        #[cfg(feature = "postgres")]
        StorageConfig::Postgres {
            url,
            max_connections,
            min_connections,
            acquire_timeout,
        } => Arc::new(
            PostgresStorage::connect(url, *max_connections, *min_connections, *acquire_timeout)
                .await?,
        ),
        #[allow(unreachable_patterns)]
        other => {
            return Err(PermsError::Configuration(format!(
                "storage backend {:?} not compiled in",
                other
            )))
        }
    };
    Ok(storage)
}

/// Encodes a subject as its JSON document
pub(crate) fn encode_document(subject: &Subject) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(subject)?)
}

/// Decodes a JSON document, checking it belongs to `id`
pub(crate) fn decode_document(id: &SubjectId, bytes: &[u8]) -> Result<Subject> {
    let subject: Subject =
        serde_json::from_slice(bytes).map_err(|e| PermsError::corrupt(id, e.to_string()))?;
    if &subject.id != id {
        return Err(PermsError::corrupt(
            id,
            format!("document holds subject {}", subject.id),
        ));
    }
    for node in &subject.nodes {
        node.validate()
            .map_err(|e| PermsError::corrupt(id, e.to_string()))?;
    }
    Ok(subject)
}

/// Decodes for the bulk path: a corrupt record is logged and replaced by an
/// empty subject so one bad document cannot block a full load.
pub(crate) fn decode_or_empty(id: &SubjectId, bytes: &[u8]) -> Subject {
    match decode_document(id, bytes) {
        Ok(subject) => subject,
        Err(e) => {
            warn!(subject = %id, error = %e, "Corrupt record, treating subject as empty");
            Subject::new(id.clone())
        }
    }
}

/// Base for a diff: the current record, or an empty subject when the record
/// is absent or corrupt (a successful write then repairs it)
pub(crate) fn diff_base(id: &SubjectId, current: Result<Option<Subject>>) -> Result<Subject> {
    match current {
        Ok(Some(subject)) => Ok(subject),
        Ok(None) => Ok(Subject::new(id.clone())),
        Err(PermsError::CorruptRecord { message, .. }) => {
            warn!(subject = %id, error = %message, "Overwriting corrupt record");
            Ok(Subject::new(id.clone()))
        }
        Err(e) => Err(e),
    }
}

/// Nodes of `subject` whose key is `key`
pub(crate) fn matching_nodes(subject: &Subject, key: &str) -> Vec<(SubjectId, Node)> {
    subject
        .nodes
        .iter()
        .filter(|n| n.key == key)
        .map(|n| (subject.id.clone(), n.clone()))
        .collect()
}
