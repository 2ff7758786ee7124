//! Loaded subject snapshots and the reverse inheritance index
//!
//! The registry holds the latest known snapshot of every subject this
//! process has touched, keyed by id. Snapshots are immutable; a change
//! replaces the `Arc`. A reverse index (parent to children) answers
//! "who inherits this group" for descendant invalidation.
//!
//! Staleness is tracked with a global epoch. A reader captures
//! [`SubjectRegistry::epoch`] before it goes to storage; its insert only
//! clears a stale mark if nothing was marked stale in the meantime.
//!
//! Every read stamps the entry with a logical clock so the least recently
//! used subjects can be evicted once the registry grows past its bound.

use crate::cache::DescendantIndex;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use permsync_api::{Subject, SubjectId};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

struct Slot {
    subject: Arc<Subject>,
    touched: AtomicU64,
}

/// In-memory subject registry
pub struct SubjectRegistry {
    subjects: DashMap<SubjectId, Slot>,
    children: DashMap<SubjectId, HashSet<SubjectId>>,
    stale: DashSet<SubjectId>,
    epoch: AtomicU64,
    clock: AtomicU64,
    /// False while a full reload is swapping snapshots in
    complete: AtomicBool,
    index_lock: Mutex<()>,
}

impl Default for SubjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectRegistry {
    pub fn new() -> Self {
        Self {
            subjects: DashMap::new(),
            children: DashMap::new(),
            stale: DashSet::new(),
            epoch: AtomicU64::new(0),
            clock: AtomicU64::new(0),
            complete: AtomicBool::new(true),
            index_lock: Mutex::new(()),
        }
    }

    /// Current staleness epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Latest snapshot, stale or not
    pub fn get(&self, id: &SubjectId) -> Option<Arc<Subject>> {
        self.subjects.get(id).map(|slot| {
            slot.touched.store(self.tick(), Ordering::Relaxed);
            slot.subject.clone()
        })
    }

    fn install(&self, subject: Arc<Subject>) {
        self.index(&subject);
        let slot = Slot {
            touched: AtomicU64::new(self.tick()),
            subject: subject.clone(),
        };
        self.subjects.insert(subject.id.clone(), slot);
    }

    /// Snapshot that can be used without going back to storage
    pub fn get_fresh(&self, id: &SubjectId) -> Option<Arc<Subject>> {
        if self.stale.contains(id) {
            return None;
        }
        self.get(id)
    }

    pub fn is_stale(&self, id: &SubjectId) -> bool {
        self.stale.contains(id)
    }

    pub fn contains(&self, id: &SubjectId) -> bool {
        self.subjects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    pub fn ids(&self) -> Vec<SubjectId> {
        self.subjects.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Store a snapshot read at `epoch`. An older version never replaces a
    /// fresh newer one; a stale one yields to storage, which may hold a
    /// deleted and recreated subject. Returns the snapshot the registry now
    /// holds.
    pub fn insert(&self, subject: Subject, epoch: u64) -> Arc<Subject> {
        let _guard = self.index_lock.lock();
        let id = subject.id.clone();

        if let Some(existing) = self.get(&id) {
            if existing.version > subject.version && !self.stale.contains(&id) {
                return existing;
            }
            self.unindex(&existing);
        }

        let subject = Arc::new(subject);
        self.install(subject.clone());

        if self.epoch() == epoch {
            self.stale.remove(&id);
        }
        subject
    }

    /// Forget a subject entirely
    pub fn remove(&self, id: &SubjectId) -> Option<Arc<Subject>> {
        let _guard = self.index_lock.lock();
        let removed = self.subjects.remove(id).map(|(_, slot)| slot.subject);
        if let Some(subject) = &removed {
            self.unindex(subject);
        }
        self.stale.remove(id);
        removed
    }

    /// Force the next access to `id` back to storage
    pub fn mark_stale(&self, id: &SubjectId) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        if self.subjects.contains_key(id) {
            self.stale.insert(id.clone());
        }
    }

    /// Force every access back to storage
    pub fn mark_all_stale(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        for entry in self.subjects.iter() {
            self.stale.insert(entry.key().clone());
        }
    }

    /// Swap in a full load taken at `epoch`. Storage wins over whatever is
    /// held, including higher versions, since an import may carry lower
    /// ones. An entry that was ahead of the load, or any entry when the epoch
    /// moved during the load, is left stale so the next access re-reads it.
    /// Subjects missing from the load are marked stale rather than dropped,
    /// so a subject created after the load began survives. Returns the number
    /// of snapshots applied.
    pub fn replace_all(&self, loaded: Vec<Subject>, epoch: u64) -> usize {
        self.complete.store(false, Ordering::Release);
        let raced = self.epoch() != epoch;

        let mut seen = HashSet::with_capacity(loaded.len());
        let mut behind = 0;
        for subject in loaded {
            let _guard = self.index_lock.lock();
            let id = subject.id.clone();
            let mut ahead = false;
            if let Some((_, existing)) = self.subjects.remove(&id) {
                ahead = existing.subject.version > subject.version;
                self.unindex(&existing.subject);
            }
            self.install(Arc::new(subject));

            if ahead || raced {
                self.stale.insert(id.clone());
                behind += 1;
            } else {
                self.stale.remove(&id);
            }
            seen.insert(id);
        }

        let absent: Vec<SubjectId> = self
            .subjects
            .iter()
            .filter(|entry| !seen.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in &absent {
            self.stale.insert(id.clone());
        }

        self.complete.store(true, Ordering::Release);
        debug!(
            applied = seen.len(),
            behind,
            absent = absent.len(),
            "Replaced registry contents"
        );
        seen.len()
    }

    /// Least recently used subjects to drop so that at most `keep` remain
    pub fn eviction_candidates(&self, keep: usize) -> Vec<SubjectId> {
        let len = self.subjects.len();
        if len <= keep {
            return Vec::new();
        }
        let mut by_age: Vec<(u64, SubjectId)> = self
            .subjects
            .iter()
            .map(|entry| (entry.touched.load(Ordering::Relaxed), entry.key().clone()))
            .collect();
        by_age.sort_unstable_by_key(|(touched, _)| *touched);
        by_age.truncate(len - keep);
        by_age.into_iter().map(|(_, id)| id).collect()
    }

    /// Direct children of `parent`
    pub fn children(&self, parent: &SubjectId) -> Vec<SubjectId> {
        self.children
            .get(parent)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn index(&self, subject: &Subject) {
        for edge in &subject.parents {
            self.children
                .entry(edge.parent.clone())
                .or_default()
                .insert(subject.id.clone());
        }
    }

    fn unindex(&self, subject: &Subject) {
        for edge in &subject.parents {
            let now_empty = match self.children.get_mut(&edge.parent) {
                Some(mut entry) => {
                    entry.remove(&subject.id);
                    entry.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.children.remove_if(&edge.parent, |_, set| set.is_empty());
            }
        }
    }
}

impl DescendantIndex for SubjectRegistry {
    fn descendants(&self, id: &SubjectId) -> Option<Vec<SubjectId>> {
        if !self.complete.load(Ordering::Acquire) {
            return None;
        }

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for child in self.children(&current) {
                if &child != id && seen.insert(child.clone()) {
                    out.push(child.clone());
                    queue.push_back(child);
                }
            }
        }
        Some(out)
    }
}
