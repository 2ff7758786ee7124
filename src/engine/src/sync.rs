//! Applying remote invalidations
//!
//! Events from other processes are applied to the local registry and cache.
//! Handling is idempotent: a duplicate delivery retires nothing new, and
//! recently seen event ids are skipped outright. Events carrying our own
//! origin are echoes of local changes that were already applied.

use crate::cache::CalculatorCache;
use crate::messaging::EventHandler;
use crate::registry::SubjectRegistry;
use lru::LruCache;
use parking_lot::Mutex;
use permsync_api::{InvalidationEvent, InvalidationScope};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// State shared by the engine and its sync handler
pub struct SharedState {
    pub cache: CalculatorCache,
    pub registry: SubjectRegistry,
}

/// Counters describing sync activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub applied: u64,
    pub duplicates: u64,
    pub echoes: u64,
    pub reconnects: u64,
}

/// Applies incoming events to [`SharedState`]
pub struct SyncHandler {
    origin: Uuid,
    state: Arc<SharedState>,
    seen: Mutex<LruCache<Uuid, ()>>,
    applied: AtomicU64,
    duplicates: AtomicU64,
    echoes: AtomicU64,
    reconnects: AtomicU64,
}

impl SyncHandler {
    pub fn new(origin: Uuid, state: Arc<SharedState>, dedup_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            origin,
            state,
            seen: Mutex::new(LruCache::new(capacity)),
            applied: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            echoes: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        }
    }

    /// Apply an event's effect, regardless of origin or prior delivery
    pub fn apply(&self, event: &InvalidationEvent) -> usize {
        let state = &self.state;
        match (&event.subject, event.scope) {
            (Some(subject), InvalidationScope::SelfOnly | InvalidationScope::Descendants) => {
                state.registry.mark_stale(subject);
                state.cache.invalidate(subject, event.scope, &state.registry)
            }
            _ => {
                state.registry.mark_all_stale();
                state.cache.clear()
            }
        }
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            echoes: self.echoes.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl EventHandler for SyncHandler {
    fn on_event(&self, event: InvalidationEvent) {
        if event.origin == self.origin {
            self.echoes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if self.seen.lock().put(event.id, ()).is_some() {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(event = %event.id, "Skipping duplicate invalidation");
            return;
        }

        let retired = self.apply(&event);
        self.applied.fetch_add(1, Ordering::Relaxed);
        debug!(
            event = %event.id,
            origin = %event.origin,
            subject = ?event.subject.as_ref().map(|s| s.to_string()),
            scope = ?event.scope,
            source_node = ?event.source_node,
            retired,
            "Applied remote invalidation"
        );
    }

    fn on_connected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        self.state.registry.mark_all_stale();
        let retired = self.state.cache.clear();
        info!(retired, "Invalidation stream (re)connected, cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::resolver::Resolution;
    use chrono::Utc;
    use permsync_api::{ContextSet, InheritanceEdge, Subject, SubjectId};
    use std::collections::BTreeMap;

    fn group(name: &str) -> SubjectId {
        SubjectId::group(name).unwrap()
    }

    fn state() -> Arc<SharedState> {
        Arc::new(SharedState {
            cache: CalculatorCache::new(&CacheConfig::default()),
            registry: SubjectRegistry::new(),
        })
    }

    fn seed(state: &SharedState, name: &str, parents: &[&str]) {
        let mut subject = Subject::new(group(name));
        for parent in parents {
            subject.add_parent(InheritanceEdge::new(group(parent)));
        }
        subject.version = 1;
        state.registry.insert(subject, state.registry.epoch());

        let ticket = state.cache.ticket(&group(name));
        state.cache.put_if_current(
            Arc::new(Resolution {
                subject: group(name),
                version: 1,
                context: ContextSet::new(),
                permissions: BTreeMap::new(),
                sources: BTreeMap::new(),
                meta: Default::default(),
                diagnostics: Vec::new(),
                valid_until: None,
                computed_at: Utc::now(),
            }),
            ticket,
        );
    }

    fn cached(state: &SharedState, name: &str) -> bool {
        state.cache.get(&group(name), &ContextSet::new(), Utc::now()).is_some()
    }

    #[test]
    fn test_descendant_event() {
        let state = state();
        seed(&state, "default", &[]);
        seed(&state, "vip", &["default"]);
        seed(&state, "admin", &[]);

        let handler = SyncHandler::new(Uuid::new_v4(), state.clone(), 16);
        let event = InvalidationEvent::subject(
            Uuid::new_v4(),
            group("default"),
            InvalidationScope::Descendants,
            None,
        );
        handler.on_event(event.clone());

        assert!(!cached(&state, "default"));
        assert!(!cached(&state, "vip"));
        assert!(cached(&state, "admin"));
        assert!(state.registry.is_stale(&group("default")));
        assert!(!state.registry.is_stale(&group("vip")));

        handler.on_event(event);
        assert_eq!(handler.stats().duplicates, 1);
        assert_eq!(handler.stats().applied, 1);
    }

    #[test]
    fn test_own_echo_ignored() {
        let state = state();
        seed(&state, "vip", &[]);
        let origin = Uuid::new_v4();
        let handler = SyncHandler::new(origin, state.clone(), 16);

        handler.on_event(InvalidationEvent::subject(
            origin,
            group("vip"),
            InvalidationScope::SelfOnly,
            None,
        ));
        assert!(cached(&state, "vip"));
        assert_eq!(handler.stats().echoes, 1);
    }

    #[test]
    fn test_all_and_reconnect_clear_everything() {
        let state = state();
        seed(&state, "a", &[]);
        seed(&state, "b", &[]);
        let handler = SyncHandler::new(Uuid::new_v4(), state.clone(), 16);

        handler.on_event(InvalidationEvent::all(Uuid::new_v4()));
        assert!(state.cache.is_empty());
        assert!(state.registry.is_stale(&group("a")));

        seed(&state, "a", &[]);
        handler.on_connected();
        assert!(state.cache.is_empty());
        assert_eq!(handler.stats().reconnects, 1);
    }
}
