//! Sharded calculator cache
//!
//! Resolutions are cached per `(subject, context signature)` in LRU shards.
//! Invalidated entries move to a bounded stale tier that backs the
//! fallback path when storage is down.
//!
//! A computation started before an invalidation must never repopulate the
//! cache afterwards. Callers take a [`Ticket`] before loading and insert
//! with [`CalculatorCache::put_if_current`]; any invalidation touching the
//! subject in between makes the ticket obsolete.

use crate::config::CacheConfig;
use crate::resolver::Resolution;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use permsync_api::{ContextSet, InvalidationScope, SubjectId};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Generation counters per shard; subjects hash onto one of these
const STRIPES: usize = 64;

type CacheKey = (SubjectId, String);

/// Who inherits from whom, for descendant invalidation
pub trait DescendantIndex {
    /// Every subject that transitively inherits `id`, or `None` when the
    /// index cannot answer reliably
    fn descendants(&self, id: &SubjectId) -> Option<Vec<SubjectId>>;
}

/// Proof that no invalidation touched a subject since it was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    global: u64,
    stripe: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub stale_hits: u64,
    /// Puts refused because an invalidation overtook the computation
    pub rejected_puts: u64,
    pub entries: usize,
    pub stale_entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    stale_hits: AtomicU64,
    rejected_puts: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Shard {
    entries: LruCache<CacheKey, Arc<Resolution>>,
    /// Context signatures cached per subject
    by_subject: HashMap<SubjectId, HashSet<String>>,
    stale: LruCache<CacheKey, Arc<Resolution>>,
    generations: [u64; STRIPES],
}

impl Shard {
    fn new(capacity: NonZeroUsize, stale_capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            by_subject: HashMap::new(),
            stale: LruCache::new(stale_capacity),
            generations: [0; STRIPES],
        }
    }

    fn forget(&mut self, key: &CacheKey) {
        if let Some(signatures) = self.by_subject.get_mut(&key.0) {
            signatures.remove(&key.1);
            if signatures.is_empty() {
                self.by_subject.remove(&key.0);
            }
        }
    }

    /// Moves every entry of `subject` to the stale tier
    fn retire(&mut self, subject: &SubjectId) -> usize {
        let Some(signatures) = self.by_subject.remove(subject) else {
            return 0;
        };
        let mut moved = 0;
        for signature in signatures {
            let key = (subject.clone(), signature);
            if let Some(resolution) = self.entries.pop(&key) {
                self.stale.put(key, resolution);
                moved += 1;
            }
        }
        moved
    }

    fn retire_all(&mut self) -> usize {
        let moved = self.entries.len();
        while let Some((key, resolution)) = self.entries.pop_lru() {
            self.stale.put(key, resolution);
        }
        self.by_subject.clear();
        moved
    }
}

/// Calculator cache
pub struct CalculatorCache {
    shards: Vec<Mutex<Shard>>,
    global: AtomicU64,
    counters: Counters,
    capacity: usize,
}

impl CalculatorCache {
    pub fn new(config: &CacheConfig) -> Self {
        let shard_count = config.shards.max(1);
        let per_shard = |total: usize| {
            NonZeroUsize::new((total / shard_count).max(1)).unwrap_or(NonZeroUsize::MIN)
        };
        let shards = (0..shard_count)
            .map(|_| Mutex::new(Shard::new(per_shard(config.capacity), per_shard(config.stale_capacity))))
            .collect();

        Self {
            shards,
            global: AtomicU64::new(0),
            counters: Counters::default(),
            capacity: config.capacity,
        }
    }

    fn locate(&self, subject: &SubjectId) -> (&Mutex<Shard>, usize) {
        let mut hasher = DefaultHasher::new();
        subject.hash(&mut hasher);
        let hash = hasher.finish() as usize;
        (&self.shards[hash % self.shards.len()], (hash >> 16) % STRIPES)
    }

    /// Fresh cached resolution, if any. Entries past their `valid_until`
    /// are retired and reported as a miss.
    pub fn get(
        &self,
        subject: &SubjectId,
        context: &ContextSet,
        now: DateTime<Utc>,
    ) -> Option<Arc<Resolution>> {
        let (shard, _) = self.locate(subject);
        let key = (subject.clone(), context.signature());
        let mut shard = shard.lock();

        match shard.entries.get(&key).cloned() {
            Some(resolution) if resolution.is_valid_at(now) => {
                bump(&self.counters.hits);
                Some(resolution)
            }
            Some(resolution) => {
                trace!(subject = %subject, "Cached resolution outlived its validity");
                shard.entries.pop(&key);
                shard.forget(&key);
                shard.stale.put(key, resolution);
                bump(&self.counters.misses);
                None
            }
            None => {
                bump(&self.counters.misses);
                None
            }
        }
    }

    /// Last known resolution, fresh or retired, for the degraded path
    pub fn get_stale(&self, subject: &SubjectId, context: &ContextSet) -> Option<Arc<Resolution>> {
        let (shard, _) = self.locate(subject);
        let key = (subject.clone(), context.signature());
        let mut shard = shard.lock();

        let mut found = shard.entries.peek(&key).cloned();
        if found.is_none() {
            found = shard.stale.get(&key).cloned();
        }
        if found.is_some() {
            bump(&self.counters.stale_hits);
        }
        found
    }

    /// Issue a ticket for a computation about to read `subject`
    pub fn ticket(&self, subject: &SubjectId) -> Ticket {
        let (shard, stripe) = self.locate(subject);
        let shard = shard.lock();
        Ticket {
            global: self.global.load(Ordering::Acquire),
            stripe: shard.generations[stripe],
        }
    }

    /// Insert unless an invalidation happened since `ticket` was issued
    pub fn put_if_current(&self, resolution: Arc<Resolution>, ticket: Ticket) -> bool {
        let subject = resolution.subject.clone();
        let (shard, stripe) = self.locate(&subject);
        let mut shard = shard.lock();

        if self.global.load(Ordering::Acquire) != ticket.global
            || shard.generations[stripe] != ticket.stripe
        {
            bump(&self.counters.rejected_puts);
            debug!(subject = %subject, "Discarding resolution computed before an invalidation");
            return false;
        }

        let signature = resolution.context.signature();
        let key = (subject.clone(), signature.clone());
        shard.stale.pop(&key);
        if let Some((evicted, _)) = shard.entries.push(key.clone(), resolution) {
            if evicted != key {
                shard.forget(&evicted);
                bump(&self.counters.evictions);
            }
        }
        shard.by_subject.entry(subject).or_default().insert(signature);
        true
    }

    /// Invalidate `subject` and, depending on `scope`, its descendants.
    /// Returns the number of entries retired. Idempotent.
    pub fn invalidate(
        &self,
        subject: &SubjectId,
        scope: InvalidationScope,
        index: &dyn DescendantIndex,
    ) -> usize {
        bump(&self.counters.invalidations);
        match scope {
            InvalidationScope::SelfOnly => self.invalidate_subject(subject),
            InvalidationScope::Descendants => match index.descendants(subject) {
                Some(descendants) => {
                    let mut retired = self.invalidate_subject(subject);
                    for descendant in &descendants {
                        retired += self.invalidate_subject(descendant);
                    }
                    debug!(
                        subject = %subject,
                        descendants = descendants.len(),
                        retired,
                        "Invalidated subject and descendants"
                    );
                    retired
                }
                None => {
                    debug!(subject = %subject, "Descendant index incomplete, clearing cache");
                    self.clear()
                }
            },
            InvalidationScope::All => self.clear(),
        }
    }

    /// Invalidate one subject's entries
    pub fn invalidate_subject(&self, subject: &SubjectId) -> usize {
        let (shard, stripe) = self.locate(subject);
        let mut shard = shard.lock();
        shard.generations[stripe] += 1;
        shard.retire(subject)
    }

    /// Retire every entry and obsolete every outstanding ticket
    pub fn clear(&self) -> usize {
        self.global.fetch_add(1, Ordering::AcqRel);
        self.shards.iter().map(|shard| shard.lock().retire_all()).sum()
    }

    /// Number of fresh entries
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let (entries, stale_entries) = self.shards.iter().fold((0, 0), |(e, s), shard| {
            let shard = shard.lock();
            (e + shard.entries.len(), s + shard.stale.len())
        });
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            rejected_puts: self.counters.rejected_puts.load(Ordering::Relaxed),
            entries,
            stale_entries,
            capacity: self.capacity,
        }
    }
}
