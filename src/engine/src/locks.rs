//! Per-subject mutation locks
//!
//! Mutations to one subject are serialized in-process. Depending on
//! [`MutationPolicy`] a second writer either waits (bounded by
//! `lock_timeout`) or is rejected with `Busy` straight away.

use crate::config::{MutationConfig, MutationPolicy};
use dashmap::DashMap;
use permsync_api::{PermsError, Result, SubjectId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Held while a subject is being mutated
pub type SubjectGuard = OwnedMutexGuard<()>;

/// Lock table keyed by subject
pub struct SubjectLocks {
    locks: DashMap<SubjectId, Arc<Mutex<()>>>,
    policy: MutationPolicy,
    timeout: Duration,
}

impl SubjectLocks {
    pub fn new(config: &MutationConfig) -> Self {
        Self {
            locks: DashMap::new(),
            policy: config.policy,
            timeout: config.lock_timeout,
        }
    }

    fn lock_for(&self, id: &SubjectId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the mutation lock for `id`
    pub async fn acquire(&self, id: &SubjectId) -> Result<SubjectGuard> {
        let lock = self.lock_for(id);
        match self.policy {
            MutationPolicy::Reject => lock.try_lock_owned().map_err(|_| {
                debug!(subject = %id, "Rejecting concurrent mutation");
                PermsError::busy(id)
            }),
            MutationPolicy::Queue => tokio::time::timeout(self.timeout, lock.lock_owned())
                .await
                .map_err(|_| {
                    debug!(subject = %id, timeout_ms = self.timeout.as_millis() as u64, "Mutation lock wait timed out");
                    PermsError::busy(id)
                }),
        }
    }

    /// Drop the entry for `id` once nobody holds or waits on it
    pub fn release(&self, id: &SubjectId) {
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Drop lock entries nobody holds
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
