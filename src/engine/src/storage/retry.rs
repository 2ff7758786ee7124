//! Retry and timeout wrapper for storage backends

use super::{DiffOutcome, Storage};
use crate::config::RetryConfig;
use async_trait::async_trait;
use permsync_api::{Node, PermsError, Result, Subject, SubjectDiff, SubjectId, SubjectKind};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Wraps a backend so every call carries a timeout and transient failures
/// are retried with exponential backoff. Non-transient errors pass through
/// on the first attempt.
pub struct RetryingStorage {
    inner: Arc<dyn Storage>,
    config: RetryConfig,
}

impl RetryingStorage {
    pub fn new(inner: Arc<dyn Storage>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped backend
    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, subject: &str, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = match timeout(self.config.operation_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(PermsError::unavailable(
                    subject,
                    operation,
                    format!("timed out after {:?}", self.config.operation_timeout),
                )),
            };

            match result {
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.config.backoff(attempt);
                    debug!(
                        backend = self.inner.name(),
                        subject,
                        operation,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying storage call"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(
                            backend = self.inner.name(),
                            subject,
                            operation,
                            attempts = attempt,
                            error = %e,
                            "Storage call failed"
                        );
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl Storage for RetryingStorage {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn init(&self) -> Result<()> {
        self.run("*", "init", || self.inner.init()).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.run("*", "shutdown", || self.inner.shutdown()).await
    }

    async fn load_subject(&self, id: &SubjectId) -> Result<Option<Subject>> {
        self.run(&id.to_string(), "load_subject", || self.inner.load_subject(id))
            .await
    }

    async fn save_subject(&self, subject: &Subject) -> Result<()> {
        self.run(&subject.id.to_string(), "save_subject", || {
            self.inner.save_subject(subject)
        })
        .await
    }

    async fn delete_subject(&self, id: &SubjectId) -> Result<()> {
        self.run(&id.to_string(), "delete_subject", || self.inner.delete_subject(id))
            .await
    }

    async fn list_subjects(&self, kind: SubjectKind) -> Result<Vec<SubjectId>> {
        self.run(kind.as_str(), "list_subjects", || self.inner.list_subjects(kind))
            .await
    }

    async fn bulk_load(&self) -> Result<Vec<Subject>> {
        self.run("*", "bulk_load", || self.inner.bulk_load()).await
    }

    async fn bulk_save(&self, subjects: &[Subject]) -> Result<()> {
        self.run("*", "bulk_save", || self.inner.bulk_save(subjects))
            .await
    }

    async fn apply_node_diff(&self, id: &SubjectId, diff: &SubjectDiff) -> Result<DiffOutcome> {
        self.run(&id.to_string(), "apply_node_diff", || {
            self.inner.apply_node_diff(id, diff)
        })
        .await
    }

    async fn search_permission(&self, key: &str) -> Result<Vec<(SubjectId, Node)>> {
        self.run(key, "search_permission", || self.inner.search_permission(key))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use std::time::Duration;

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            operation_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_outage_surfaces_after_retries() {
        let memory = Arc::new(InMemoryStorage::new());
        memory.set_available(false);
        let storage = RetryingStorage::new(memory.clone(), fast_retry());

        let id = SubjectId::group("default").unwrap();
        let err = storage.load_subject(&id).await.unwrap_err();
        assert!(matches!(err, PermsError::StorageUnavailable { .. }));
        assert_eq!(memory.call_count(), 3);
    }

    #[tokio::test]
    async fn test_invalid_mutation_not_retried() {
        let memory = Arc::new(InMemoryStorage::new());
        let storage = RetryingStorage::new(memory.clone(), fast_retry());

        let id = SubjectId::group("default").unwrap();
        memory.fail_next(PermsError::invalid(&id, "constraint violated"));
        let err = storage
            .apply_node_diff(&id, &SubjectDiff::new().add(Node::grant("a").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, PermsError::InvalidMutation { .. }));
        assert_eq!(memory.call_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let memory = Arc::new(InMemoryStorage::new());
        let storage = RetryingStorage::new(memory.clone(), fast_retry());

        let id = SubjectId::group("default").unwrap();
        memory.fail_next(PermsError::unavailable(&id, "load_subject", "connection reset"));
        assert!(storage.load_subject(&id).await.unwrap().is_none());
        assert_eq!(memory.call_count(), 2);
    }

    #[tokio::test]
    async fn test_hung_backend_times_out() {
        let memory = Arc::new(InMemoryStorage::new());
        memory.set_latency(Duration::from_secs(5));
        let storage = RetryingStorage::new(
            memory,
            RetryConfig {
                max_attempts: 1,
                operation_timeout: Duration::from_millis(20),
                ..fast_retry()
            },
        );

        let id = SubjectId::group("default").unwrap();
        let err = storage.load_subject(&id).await.unwrap_err();
        assert!(matches!(err, PermsError::StorageUnavailable { .. }));
    }
}
