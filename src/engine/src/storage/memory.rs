//! In-memory storage backend

use super::{diff_base, matching_nodes, DiffOutcome, Storage};
use async_trait::async_trait;
use parking_lot::Mutex;
use permsync_api::{Node, PermsError, Result, Subject, SubjectDiff, SubjectId, SubjectKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone)]
enum Record {
    Valid(Subject),
    /// Undecodable record, for exercising the corrupt-record paths
    Corrupt(String),
}

/// In-memory storage implementation
///
/// Reference backend for tests and embedded use. Besides the [`Storage`]
/// contract it can simulate an outage, latency, a one-off failure and a
/// corrupt record.
pub struct InMemoryStorage {
    records: Arc<RwLock<HashMap<SubjectId, Record>>>,
    available: AtomicBool,
    latency: Mutex<Option<Duration>>,
    next_failure: Mutex<Option<PermsError>>,
    calls: AtomicUsize,
}

impl InMemoryStorage {
    /// Create a new in-memory storage
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            available: AtomicBool::new(true),
            latency: Mutex::new(None),
            next_failure: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Simulate the backend going away (`false`) or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Fail the next call with `error`
    pub fn fail_next(&self, error: PermsError) {
        *self.next_failure.lock() = Some(error);
    }

    /// Store an undecodable record for `id`
    pub async fn insert_corrupt(&self, id: SubjectId, reason: &str) {
        self.records
            .write()
            .await
            .insert(id, Record::Corrupt(reason.to_string()));
    }

    /// Number of trait calls made so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self, subject: impl ToString, operation: &'static str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = self.next_failure.lock().take() {
            return Err(error);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(PermsError::unavailable(subject, operation, "backend offline"));
        }
        Ok(())
    }

    fn decode(id: &SubjectId, record: &Record) -> Result<Subject> {
        match record {
            Record::Valid(subject) => Ok(subject.clone()),
            Record::Corrupt(reason) => Err(PermsError::corrupt(id, reason.clone())),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn init(&self) -> Result<()> {
        self.enter("*", "init").await
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn load_subject(&self, id: &SubjectId) -> Result<Option<Subject>> {
        self.enter(id, "load_subject").await?;
        let records = self.records.read().await;
        records
            .get(id)
            .map(|record| Self::decode(id, record))
            .transpose()
    }

    async fn save_subject(&self, subject: &Subject) -> Result<()> {
        self.enter(&subject.id, "save_subject").await?;
        self.records
            .write()
            .await
            .insert(subject.id.clone(), Record::Valid(subject.clone()));
        Ok(())
    }

    async fn delete_subject(&self, id: &SubjectId) -> Result<()> {
        self.enter(id, "delete_subject").await?;
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list_subjects(&self, kind: SubjectKind) -> Result<Vec<SubjectId>> {
        self.enter(kind, "list_subjects").await?;
        let records = self.records.read().await;
        let mut ids: Vec<SubjectId> = records.keys().filter(|id| id.kind() == kind).cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn bulk_load(&self) -> Result<Vec<Subject>> {
        self.enter("*", "bulk_load").await?;
        let records = self.records.read().await;
        let mut subjects: Vec<Subject> = records
            .iter()
            .map(|(id, record)| {
                Self::decode(id, record).unwrap_or_else(|e| {
                    warn!(subject = %id, error = %e, "Corrupt record, treating subject as empty");
                    Subject::new(id.clone())
                })
            })
            .collect();
        subjects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(subjects)
    }

    async fn bulk_save(&self, subjects: &[Subject]) -> Result<()> {
        self.enter("*", "bulk_save").await?;
        let mut records = self.records.write().await;
        for subject in subjects {
            records.insert(subject.id.clone(), Record::Valid(subject.clone()));
        }
        Ok(())
    }

    async fn apply_node_diff(&self, id: &SubjectId, diff: &SubjectDiff) -> Result<DiffOutcome> {
        self.enter(id, "apply_node_diff").await?;
        let mut records = self.records.write().await;
        let current = records.get(id).map(|r| Self::decode(id, r)).transpose();
        let base = diff_base(id, current)?;

        let (subject, changed) = base.apply_diff(diff);
        if changed {
            records.insert(id.clone(), Record::Valid(subject.clone()));
        }
        Ok(DiffOutcome { subject, changed })
    }

    async fn search_permission(&self, key: &str) -> Result<Vec<(SubjectId, Node)>> {
        self.enter(key, "search_permission").await?;
        let records = self.records.read().await;
        let mut hits: Vec<(SubjectId, Node)> = records
            .values()
            .filter_map(|record| match record {
                Record::Valid(subject) => Some(matching_nodes(subject, key)),
                Record::Corrupt(_) => None,
            })
            .flatten()
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> SubjectId {
        SubjectId::group(name).unwrap()
    }

    #[tokio::test]
    async fn test_apply_diff_creates_subject() {
        let storage = InMemoryStorage::new();
        let id = group("default");

        let outcome = storage
            .apply_node_diff(&id, &SubjectDiff::new().add(Node::grant("chat.use").unwrap()))
            .await
            .unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.subject.version, 1);

        let loaded = storage.load_subject(&id).await.unwrap().unwrap();
        assert_eq!(loaded, outcome.subject);
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let storage = InMemoryStorage::new();
        storage.set_available(false);
        assert!(storage.load_subject(&group("default")).await.is_err());
        storage.set_available(true);
        assert!(storage.load_subject(&group("default")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let storage = InMemoryStorage::new();
        let id = group("broken");
        storage.insert_corrupt(id.clone(), "truncated").await;

        assert!(matches!(
            storage.load_subject(&id).await,
            Err(PermsError::CorruptRecord { .. })
        ));

        let all = storage.bulk_load().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_empty());

        // a write repairs the record
        let outcome = storage
            .apply_node_diff(&id, &SubjectDiff::new().add(Node::grant("a.b").unwrap()))
            .await
            .unwrap();
        assert!(outcome.changed);
        assert!(storage.load_subject(&id).await.unwrap().is_some());
    }
}
