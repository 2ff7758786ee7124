//! Effective permission resolution
//!
//! Walks the ordered ancestors of a subject and applies closest-wins:
//!
//! 1. Within one subject, among active nodes for the same key, the most
//!    specific context wins, then the higher explicit weight, then the most
//!    recently created node.
//! 2. Across subjects, the first subject in traversal order that defines a
//!    key decides it, whether the value is a grant or a deny.
//!
//! Expired nodes are dropped at evaluation time; nothing is ever deleted
//! because it expired.

use crate::config::GraphConfig;
use crate::graph::{GraphDiagnostic, InheritanceGraph, SubjectSource};
use chrono::{DateTime, Utc};
use permsync_api::{ContextSet, Node, NodeKind, Specificity, Subject, SubjectId, Tristate};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Derived scalar settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    /// From `weight.<n>`, closest subject wins
    pub weight: Option<i32>,
    /// From `prefix.<priority>.<text>`, highest priority wins
    pub prefix: Option<String>,
    /// From `suffix.<priority>.<text>`, highest priority wins
    pub suffix: Option<String>,
    /// From `meta.<key>.<value>`, closest subject wins per key
    pub meta: BTreeMap<String, String>,
}

/// Resolved permissions of one subject under one runtime context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub subject: SubjectId,
    /// Subject version the result was computed from
    pub version: u64,
    pub context: ContextSet,
    pub permissions: BTreeMap<String, bool>,
    /// Which subject decided each key
    pub sources: BTreeMap<String, SubjectId>,
    pub meta: MetaData,
    pub diagnostics: Vec<GraphDiagnostic>,
    /// The result may change at this instant (first upcoming expiry)
    pub valid_until: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

impl Resolution {
    /// Exact lookup
    pub fn get(&self, key: &str) -> Option<bool> {
        self.permissions.get(key).copied()
    }

    /// Lookup with wildcard fallback: `a.b.c`, then `a.b.*`, `a.*`, `*`
    pub fn check(&self, key: &str, apply_wildcards: bool) -> Tristate {
        let key = Node::normalise_key(key);
        if let Some(value) = self.get(&key) {
            return Tristate::from(Some(value));
        }
        if !apply_wildcards {
            return Tristate::Undefined;
        }

        let parts: Vec<&str> = key.split('.').collect();
        for end in (1..parts.len()).rev() {
            let candidate = format!("{}.*", parts[..end].join("."));
            if let Some(value) = self.get(&candidate) {
                return Tristate::from(Some(value));
            }
        }
        Tristate::from(self.get("*"))
    }

    /// Whether the result still holds at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map_or(true, |until| now < until)
    }
}

type Rank = (Specificity, i32, DateTime<Utc>);

fn rank(node: &Node) -> Rank {
    (node.context.specificity(), node.weight, node.created_at)
}

/// Best node per key within one subject
fn winners<'a>(
    subject: &'a Subject,
    runtime: &'a ContextSet,
    now: DateTime<Utc>,
    valid_until: &mut Option<DateTime<Utc>>,
) -> Vec<&'a Node> {
    let mut best: HashMap<&str, &Node> = HashMap::new();
    for node in subject.active_nodes(runtime, now) {
        if let Some(expiry) = node.expiry {
            *valid_until = Some(valid_until.map_or(expiry, |v| v.min(expiry)));
        }
        match best.entry(node.key.as_str()) {
            Entry::Occupied(mut slot) => {
                if rank(node) > rank(slot.get()) {
                    slot.insert(node);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(node);
            }
        }
    }
    best.into_values().collect()
}

/// Accumulates meta while walking subjects closest first
#[derive(Default)]
struct MetaAccumulator {
    weight: Option<i32>,
    prefix: Option<(i32, String)>,
    suffix: Option<(i32, String)>,
    meta: BTreeMap<String, String>,
}

impl MetaAccumulator {
    fn absorb(&mut self, nodes: &[&Node]) {
        let mut subject_weight: Option<i32> = None;
        let mut subject_meta: HashMap<String, (Rank, String)> = HashMap::new();

        for node in nodes.iter().filter(|n| n.value) {
            match node.kind() {
                NodeKind::Weight(weight) => {
                    subject_weight = Some(subject_weight.map_or(weight, |w| w.max(weight)));
                }
                NodeKind::Meta { key, value } => {
                    let candidate = (rank(node), value);
                    match subject_meta.entry(key) {
                        Entry::Occupied(mut slot) => {
                            if candidate.0 > slot.get().0 {
                                slot.insert(candidate);
                            }
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(candidate);
                        }
                    }
                }
                NodeKind::Prefix { priority, text } => {
                    Self::offer(&mut self.prefix, priority, text);
                }
                NodeKind::Suffix { priority, text } => {
                    Self::offer(&mut self.suffix, priority, text);
                }
                NodeKind::Permission => {}
            }
        }

        if self.weight.is_none() {
            self.weight = subject_weight;
        }
        for (key, (_, value)) in subject_meta {
            self.meta.entry(key).or_insert(value);
        }
    }

    /// Strictly higher priority replaces, so ties go to the closer subject
    fn offer(slot: &mut Option<(i32, String)>, priority: i32, text: String) {
        if slot.as_ref().map_or(true, |(current, _)| priority > *current) {
            *slot = Some((priority, text));
        }
    }

    fn finish(self) -> MetaData {
        MetaData {
            weight: self.weight,
            prefix: self.prefix.map(|(_, text)| text),
            suffix: self.suffix.map(|(_, text)| text),
            meta: self.meta,
        }
    }
}

/// Computes [`Resolution`]s; pure over the snapshots it is given
#[derive(Debug, Clone)]
pub struct Resolver {
    graph: InheritanceGraph,
}

impl Resolver {
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            graph: InheritanceGraph::new(config),
        }
    }

    pub fn resolve<S: SubjectSource>(
        &self,
        root: Arc<Subject>,
        source: &S,
        runtime: &ContextSet,
        now: DateTime<Utc>,
    ) -> Resolution {
        let traversal = self.graph.traverse(root.clone(), source, runtime, now);
        let mut valid_until = traversal.valid_until;
        let mut permissions = BTreeMap::new();
        let mut sources = BTreeMap::new();
        let mut meta = MetaAccumulator::default();

        for subject in &traversal.order {
            let nodes = winners(subject, runtime, now, &mut valid_until);
            for node in &nodes {
                if !permissions.contains_key(&node.key) {
                    permissions.insert(node.key.clone(), node.value);
                    sources.insert(node.key.clone(), subject.id.clone());
                }
            }
            meta.absorb(&nodes);
        }

        Resolution {
            subject: root.id.clone(),
            version: root.version,
            context: runtime.clone(),
            permissions,
            sources,
            meta: meta.finish(),
            diagnostics: traversal.diagnostics,
            valid_until,
            computed_at: now,
        }
    }
}
