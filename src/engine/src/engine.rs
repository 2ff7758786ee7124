//! Public facade
//!
//! [`PermissionEngine`] ties storage, the subject registry, the calculator
//! cache and the invalidation transport together. Hosts obtain a
//! [`SubjectHandle`] per user or group and read or mutate through it.
//!
//! Mutations complete once persisted and invalidated locally; the broadcast
//! to other processes is fire-and-forget. Lookups go to the cache first and
//! degrade to the last known result when storage cannot be reached.

use crate::cache::{CacheStats, CalculatorCache, DescendantIndex};
use crate::config::EngineConfig;
use crate::graph::would_create_cycle;
use crate::locks::SubjectLocks;
use crate::messaging::Messenger;
use crate::registry::SubjectRegistry;
use crate::resolver::{MetaData, Resolution, Resolver};
use crate::storage::{DiffOutcome, RetryingStorage, Storage};
use crate::sync::{SharedState, SyncHandler, SyncStats};
use chrono::Utc;
use futures::future::join_all;
use permsync_api::{
    ContextSet, InheritanceEdge, InvalidationEvent, InvalidationScope, Node, PermsError, Result,
    Subject, SubjectDiff, SubjectId, SubjectKind, Tristate,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of [`PermissionEngine::reload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The load was swapped in; number of subjects applied
    Applied(usize),
    /// A newer reload started before this one finished; results discarded
    Superseded,
}

struct EngineInner {
    origin: Uuid,
    config: EngineConfig,
    storage: RetryingStorage,
    messenger: Arc<dyn Messenger>,
    state: Arc<SharedState>,
    sync: Arc<SyncHandler>,
    locks: SubjectLocks,
    resolver: Resolver,
    reload_generation: AtomicU64,
    reload_lock: Mutex<()>,
}

/// Permission engine
#[derive(Clone)]
pub struct PermissionEngine {
    inner: Arc<EngineInner>,
}

impl PermissionEngine {
    /// Initialise storage, subscribe to invalidations and optionally preload
    /// every subject.
    ///
    /// A transport that cannot subscribe is logged and tolerated; the engine
    /// runs without remote invalidation until it recovers.
    pub async fn start(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        messenger: Arc<dyn Messenger>,
    ) -> Result<Self> {
        let origin = Uuid::new_v4();
        let storage = RetryingStorage::new(storage, config.retry.clone());
        storage.init().await?;

        let state = Arc::new(SharedState {
            cache: CalculatorCache::new(&config.cache),
            registry: SubjectRegistry::new(),
        });
        let sync = Arc::new(SyncHandler::new(
            origin,
            state.clone(),
            config.messaging.dedup_capacity,
        ));

        let engine = Self {
            inner: Arc::new(EngineInner {
                origin,
                resolver: Resolver::new(&config.graph),
                locks: SubjectLocks::new(&config.mutation),
                config,
                storage,
                messenger,
                state,
                sync,
                reload_generation: AtomicU64::new(0),
                reload_lock: Mutex::new(()),
            }),
        };

        let inner = &engine.inner;
        if let Err(e) = inner.messenger.subscribe(inner.sync.clone()).await {
            warn!(transport = inner.messenger.name(), error = %e, "Invalidation subscribe failed");
        }
        if inner.config.preload {
            engine.reload().await?;
        }

        info!(
            origin = %origin,
            backend = inner.storage.inner().name(),
            transport = inner.messenger.name(),
            "Permission engine started"
        );
        Ok(engine)
    }

    /// Process identity carried in published events
    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Handle for a subject. Nothing is loaded until the handle is used.
    pub fn subject(&self, kind: SubjectKind, name: &str) -> Result<SubjectHandle> {
        Ok(self.handle(SubjectId::new(kind, name)?))
    }

    pub fn user(&self, uuid: Uuid) -> SubjectHandle {
        self.handle(SubjectId::user(uuid))
    }

    pub fn group(&self, name: &str) -> Result<SubjectHandle> {
        self.subject(SubjectKind::Group, name)
    }

    pub fn handle(&self, id: SubjectId) -> SubjectHandle {
        SubjectHandle {
            engine: self.clone(),
            id,
        }
    }

    /// Export every persisted subject
    pub async fn bulk_load(&self) -> Result<Vec<Subject>> {
        self.inner.storage.bulk_load().await
    }

    /// Import subjects, replacing stored ones with the same id, then reload
    /// and tell every process to drop what it has cached
    pub async fn bulk_save(&self, subjects: &[Subject]) -> Result<()> {
        for subject in subjects {
            for node in &subject.nodes {
                node.validate()
                    .map_err(|e| PermsError::invalid(&subject.id, e.to_string()))?;
            }
            if subject.has_parent(&subject.id) {
                return Err(PermsError::invalid(&subject.id, "subject inherits itself"));
            }
        }

        self.inner.storage.bulk_save(subjects).await?;
        info!(subjects = subjects.len(), "Bulk save complete");

        self.reload().await?;
        self.inner.publish(InvalidationEvent::all(self.inner.origin));
        Ok(())
    }

    /// Reload every subject from storage into the registry and clear the
    /// cache. A reload that is overtaken by a newer one discards its results.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        let inner = &self.inner;
        let generation = inner.reload_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let epoch = inner.state.registry.epoch();

        let subjects = inner.storage.bulk_load().await?;

        let _guard = inner.reload_lock.lock().await;
        if inner.reload_generation.load(Ordering::Acquire) != generation {
            debug!(generation, "Reload superseded, discarding");
            return Ok(ReloadOutcome::Superseded);
        }

        let applied = inner.state.registry.replace_all(subjects, epoch);
        inner.state.cache.clear();
        info!(generation, applied, "Reloaded subjects from storage");
        Ok(ReloadOutcome::Applied(applied))
    }

    /// Remove a subject from storage, the registry and every cache
    pub async fn delete_subject(&self, id: &SubjectId) -> Result<()> {
        let inner = &self.inner;
        let guard = inner.locks.acquire(id).await?;

        let deleted = inner.storage.delete_subject(id).await;
        if deleted.is_ok() {
            inner.state.registry.remove(id);
            let scope = scope_for(id);
            inner.state.cache.invalidate(id, scope, &inner.state.registry);
            inner.publish(InvalidationEvent::subject(inner.origin, id.clone(), scope, None));
            info!(subject = %id, "Deleted subject");
        }
        drop(guard);
        inner.locks.release(id);
        deleted
    }

    /// Subjects directly holding a node with exactly this key
    pub async fn search_permission(&self, key: &str) -> Result<Vec<(SubjectId, Node)>> {
        self.inner
            .storage
            .search_permission(&Node::normalise_key(key))
            .await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.state.cache.stats()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.inner.sync.stats()
    }

    /// Subjects currently held in memory
    pub fn loaded_subjects(&self) -> usize {
        self.inner.state.registry.len()
    }

    /// Mutation lock entries not yet released
    pub fn pending_locks(&self) -> usize {
        self.inner.locks.len()
    }

    /// Close the transport and flush storage
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        if let Err(e) = inner.messenger.close().await {
            warn!(transport = inner.messenger.name(), error = %e, "Messenger close failed");
        }
        inner.locks.prune();
        inner.storage.shutdown().await?;
        info!(origin = %inner.origin, "Permission engine stopped");
        Ok(())
    }
}

/// Groups invalidate their inheritors too; users have none
fn scope_for(id: &SubjectId) -> InvalidationScope {
    if id.is_group() {
        InvalidationScope::Descendants
    } else {
        InvalidationScope::SelfOnly
    }
}

impl EngineInner {
    /// Registry snapshot if fresh, otherwise storage. Corrupt records read
    /// as empty.
    async fn fetch(&self, id: &SubjectId) -> Result<Option<Arc<Subject>>> {
        let registry = &self.state.registry;
        if let Some(subject) = registry.get_fresh(id) {
            return Ok(Some(subject));
        }

        let epoch = registry.epoch();
        match self.storage.load_subject(id).await {
            Ok(Some(subject)) => Ok(Some(registry.insert(subject, epoch))),
            Ok(None) => {
                if registry.is_stale(id) && registry.remove(id).is_some() {
                    debug!(subject = %id, "Subject vanished from storage");
                }
                Ok(None)
            }
            Err(PermsError::CorruptRecord { message, .. }) => {
                warn!(subject = %id, error = %message, "Corrupt record, treating subject as empty");
                Ok(Some(Arc::new(Subject::new(id.clone()))))
            }
            Err(e) => Err(e),
        }
    }

    /// `id` and everything it can reach through any edge, one level at a
    /// time. An absent root reads as empty; absent parents are left out.
    async fn load_closure(
        &self,
        id: &SubjectId,
    ) -> Result<(Arc<Subject>, HashMap<SubjectId, Arc<Subject>>)> {
        let mut arena = HashMap::new();
        let mut queued = HashSet::from([id.clone()]);
        let mut frontier = vec![id.clone()];
        let max_levels = self.config.graph.max_depth + 1;

        for _ in 0..max_levels {
            if frontier.is_empty() {
                break;
            }
            let loaded = join_all(frontier.iter().map(|member| self.fetch(member))).await;

            let mut next = Vec::new();
            for (current, result) in frontier.iter().zip(loaded) {
                let Some(subject) = result? else {
                    continue;
                };
                for edge in &subject.parents {
                    if queued.insert(edge.parent.clone()) {
                        next.push(edge.parent.clone());
                    }
                }
                arena.insert(current.clone(), subject);
            }
            frontier = next;
        }

        let root = arena
            .get(id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Subject::new(id.clone())));
        Ok((root, arena))
    }

    /// Drop `id` from memory. Cached resolutions of everything inheriting
    /// from it go too, since the reverse index can no longer reach them
    /// through `id` until it is loaded again.
    fn evict(&self, id: &SubjectId) {
        let state = &self.state;
        let dependents = state.registry.descendants(id);
        state.registry.remove(id);
        state.cache.invalidate_subject(id);
        match dependents {
            Some(dependents) => {
                for dependent in &dependents {
                    state.cache.invalidate_subject(dependent);
                }
            }
            None => {
                state.cache.clear();
            }
        }
    }

    /// Evict least recently used subjects once the registry is over its bound
    fn trim_registry(&self) {
        let limit = self.config.cache.max_subjects;
        let registry = &self.state.registry;
        if registry.len() <= limit {
            return;
        }
        let candidates = registry.eviction_candidates(limit - limit / 10);
        for id in &candidates {
            self.evict(id);
        }
        debug!(evicted = candidates.len(), remaining = registry.len(), "Trimmed subject registry");
    }

    async fn resolve(&self, id: &SubjectId, context: &ContextSet) -> Result<Arc<Resolution>> {
        let cache = &self.state.cache;
        let now = Utc::now();
        if let Some(hit) = cache.get(id, context, now) {
            return Ok(hit);
        }

        let ticket = cache.ticket(id);
        match self.load_closure(id).await {
            Ok((root, arena)) => {
                let resolution = Arc::new(self.resolver.resolve(root, &arena, context, now));
                for diagnostic in &resolution.diagnostics {
                    debug!(subject = %id, ?diagnostic, "Inheritance diagnostic");
                }
                cache.put_if_current(resolution.clone(), ticket);
                self.trim_registry();
                Ok(resolution)
            }
            Err(e) if e.is_transient() => match cache.get_stale(id, context) {
                Some(stale) => {
                    warn!(
                        subject = %id,
                        context = %context,
                        error = %e,
                        "Storage unavailable, serving last known resolution"
                    );
                    Ok(stale)
                }
                None => Err(PermsError::ResolutionUnavailable {
                    subject: id.to_string(),
                    message: e.to_string(),
                }),
            },
            Err(e) => Err(e),
        }
    }

    /// Rejects new parents that would close an inheritance cycle
    async fn guard_cycles(&self, id: &SubjectId, diff: &SubjectDiff) -> Result<()> {
        for edge in &diff.add_parents {
            let (_, arena) = self.load_closure(&edge.parent).await?;
            if would_create_cycle(id, &edge.parent, &arena) {
                return Err(PermsError::invalid(
                    id,
                    format!("inheriting {} would create a cycle", edge.parent),
                ));
            }
        }
        Ok(())
    }

    async fn mutate(&self, id: &SubjectId, diff: SubjectDiff) -> Result<DiffOutcome> {
        diff.validate(id)?;
        if diff.is_empty() {
            let subject = self.fetch(id).await?;
            return Ok(DiffOutcome {
                subject: subject.map_or_else(|| Subject::new(id.clone()), |s| (*s).clone()),
                changed: false,
            });
        }

        let guard = self.locks.acquire(id).await?;
        let outcome = self.mutate_locked(id, &diff).await;
        drop(guard);
        self.locks.release(id);
        self.trim_registry();
        outcome
    }

    async fn mutate_locked(&self, id: &SubjectId, diff: &SubjectDiff) -> Result<DiffOutcome> {
        if !diff.add_parents.is_empty() {
            self.guard_cycles(id, diff).await?;
        }

        let state = &self.state;
        let scope = scope_for(id);
        let epoch = state.registry.epoch();
        let outcome = match self.storage.apply_node_diff(id, diff).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_transient() {
                    // the write may or may not have landed
                    state.registry.mark_stale(id);
                    state.cache.invalidate(id, scope, &state.registry);
                }
                return Err(e);
            }
        };

        state.registry.insert(outcome.subject.clone(), epoch);
        if outcome.changed {
            let retired = state.cache.invalidate(id, scope, &state.registry);
            debug!(
                subject = %id,
                version = outcome.subject.version,
                retired,
                "Applied mutation"
            );
            self.publish(InvalidationEvent::subject(
                self.origin,
                id.clone(),
                scope,
                diff.source_node(),
            ));
        }
        Ok(outcome)
    }

    /// Broadcast without waiting; failures are logged only
    fn publish(&self, event: InvalidationEvent) {
        let messenger = self.messenger.clone();
        let timeout = self.config.messaging.publish_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, messenger.publish(&event)).await {
                Ok(Ok(())) => debug!(event = %event.id, "Invalidation published"),
                Ok(Err(e)) => warn!(event = %event.id, error = %e, "Invalidation publish failed"),
                Err(_) => warn!(
                    event = %event.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Invalidation publish timed out"
                ),
            }
        });
    }
}

/// Reads and writes for one subject
#[derive(Clone)]
pub struct SubjectHandle {
    engine: PermissionEngine,
    id: SubjectId,
}

impl SubjectHandle {
    pub fn id(&self) -> &SubjectId {
        &self.id
    }

    /// Mutation entry point
    pub fn data(&self) -> SubjectData<'_> {
        SubjectData { handle: self }
    }

    /// Effective permissions under `context`, from cache when possible
    pub async fn resolve(&self, context: &ContextSet) -> Result<Arc<Resolution>> {
        self.engine.inner.resolve(&self.id, context).await
    }

    /// Value of one permission, with wildcard fallback when enabled
    pub async fn check(&self, key: &str, context: &ContextSet) -> Result<Tristate> {
        let resolution = self.resolve(context).await?;
        Ok(resolution.check(key, self.engine.inner.config.graph.apply_wildcards))
    }

    /// Derived weight, prefix, suffix and meta under `context`
    pub async fn meta(&self, context: &ContextSet) -> Result<MetaData> {
        Ok(self.resolve(context).await?.meta.clone())
    }

    /// Current own nodes and parents; empty if never persisted
    pub async fn snapshot(&self) -> Result<Arc<Subject>> {
        Ok(self
            .engine
            .inner
            .fetch(&self.id)
            .await?
            .unwrap_or_else(|| Arc::new(Subject::new(self.id.clone()))))
    }

    /// Drop this subject from memory; the next access reloads it
    pub fn unload(&self) {
        self.engine.inner.evict(&self.id);
    }
}

/// Mutations of one subject; each call is one atomic diff
pub struct SubjectData<'a> {
    handle: &'a SubjectHandle,
}

impl SubjectData<'_> {
    /// Apply a whole diff atomically
    pub async fn apply(&self, diff: SubjectDiff) -> Result<DiffOutcome> {
        self.handle.engine.inner.mutate(&self.handle.id, diff).await
    }

    /// Add a node; false if an identical node was already present
    pub async fn add(&self, node: Node) -> Result<bool> {
        Ok(self.apply(SubjectDiff::new().add(node)).await?.changed)
    }

    /// Remove nodes with the same key, context and temporariness
    pub async fn remove(&self, node: Node) -> Result<bool> {
        Ok(self.apply(SubjectDiff::new().remove(node)).await?.changed)
    }

    pub async fn add_parent(&self, edge: InheritanceEdge) -> Result<bool> {
        Ok(self.apply(SubjectDiff::new().add_parent(edge)).await?.changed)
    }

    pub async fn remove_parent(&self, edge: InheritanceEdge) -> Result<bool> {
        Ok(self.apply(SubjectDiff::new().remove_parent(edge)).await?.changed)
    }

    /// Remove every node and parent
    pub async fn clear(&self) -> Result<bool> {
        Ok(self.apply(SubjectDiff::clear()).await?.changed)
    }
}
