//! Inheritance graph traversal
//!
//! Subjects are looked up by id from a [`SubjectSource`] (an arena of
//! immutable snapshots), never by following pointers between subjects. A
//! visited set stops revisits and detects cycles; a depth bound prunes
//! overly deep chains. Neither condition is fatal: both surface as
//! [`GraphDiagnostic`]s next to whatever order could be produced.

use crate::config::{GraphConfig, TraversalAlgorithm};
use chrono::{DateTime, Utc};
use permsync_api::{ContextSet, InheritanceEdge, Subject, SubjectId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Lookup of subjects by id
pub trait SubjectSource {
    fn subject(&self, id: &SubjectId) -> Option<Arc<Subject>>;
}

impl SubjectSource for HashMap<SubjectId, Arc<Subject>> {
    fn subject(&self, id: &SubjectId) -> Option<Arc<Subject>> {
        self.get(id).cloned()
    }
}

/// Non-fatal problems found while traversing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphDiagnostic {
    /// `from` inherits `to`, which is already on the current path
    Cycle { from: SubjectId, to: SubjectId },
    /// `parent` lies deeper than the configured maximum
    DepthExceeded { parent: SubjectId, depth: usize },
    /// `child` inherits `parent`, which does not exist
    MissingParent { child: SubjectId, parent: SubjectId },
}

/// Ordered ancestors of a subject, self first
#[derive(Debug, Clone)]
pub struct Traversal {
    pub order: Vec<Arc<Subject>>,
    pub diagnostics: Vec<GraphDiagnostic>,
    /// Earliest future expiry among the edges that were followed
    pub valid_until: Option<DateTime<Utc>>,
}

impl Traversal {
    pub fn ids(&self) -> Vec<SubjectId> {
        self.order.iter().map(|s| s.id.clone()).collect()
    }
}

/// Produces the priority-ordered ancestor sequence for a subject
#[derive(Debug, Clone)]
pub struct InheritanceGraph {
    max_depth: usize,
    algorithm: TraversalAlgorithm,
}

struct Walk<'a, S: SubjectSource> {
    source: &'a S,
    runtime: &'a ContextSet,
    now: DateTime<Utc>,
    max_depth: usize,
    visited: HashSet<SubjectId>,
    path: Vec<SubjectId>,
    order: Vec<Arc<Subject>>,
    diagnostics: Vec<GraphDiagnostic>,
    valid_until: Option<DateTime<Utc>>,
}

impl<'a, S: SubjectSource> Walk<'a, S> {
    /// Active parents of `subject`, highest priority first, insertion order
    /// breaking ties
    fn parents(&mut self, subject: &Subject) -> Vec<InheritanceEdge> {
        let mut edges: Vec<InheritanceEdge> = subject
            .parents
            .iter()
            .filter(|e| e.is_active(self.runtime, self.now))
            .cloned()
            .collect();
        for edge in &edges {
            if let Some(expiry) = edge.expiry {
                self.valid_until = Some(self.valid_until.map_or(expiry, |v| v.min(expiry)));
            }
        }
        edges.sort_by_key(|e| std::cmp::Reverse(e.priority));
        edges
    }

    /// Resolves the parent of `edge`, recording why it cannot be followed
    fn enter(&mut self, child: &SubjectId, edge: &InheritanceEdge, depth: usize) -> Option<Arc<Subject>> {
        let parent = &edge.parent;
        if self.path.contains(parent) {
            self.diagnostics.push(GraphDiagnostic::Cycle {
                from: child.clone(),
                to: parent.clone(),
            });
            return None;
        }
        if self.visited.contains(parent) {
            return None;
        }
        if depth > self.max_depth {
            self.diagnostics.push(GraphDiagnostic::DepthExceeded {
                parent: parent.clone(),
                depth,
            });
            return None;
        }
        match self.source.subject(parent) {
            Some(subject) => {
                self.visited.insert(parent.clone());
                Some(subject)
            }
            None => {
                self.diagnostics.push(GraphDiagnostic::MissingParent {
                    child: child.clone(),
                    parent: parent.clone(),
                });
                None
            }
        }
    }

    fn pre_order(&mut self, subject: Arc<Subject>, depth: usize) {
        self.path.push(subject.id.clone());
        for edge in self.parents(&subject) {
            if let Some(parent) = self.enter(&subject.id, &edge, depth + 1) {
                self.order.push(parent.clone());
                self.pre_order(parent, depth + 1);
            }
        }
        self.path.pop();
    }

    fn post_order(&mut self, subject: Arc<Subject>, depth: usize) {
        self.path.push(subject.id.clone());
        for edge in self.parents(&subject) {
            if let Some(parent) = self.enter(&subject.id, &edge, depth + 1) {
                self.post_order(parent.clone(), depth + 1);
                self.order.push(parent);
            }
        }
        self.path.pop();
    }

    fn breadth_first(&mut self, root: Arc<Subject>) {
        // path of each queued subject, for cycle detection
        let mut queue: VecDeque<(Arc<Subject>, Vec<SubjectId>)> = VecDeque::new();
        queue.push_back((root.clone(), vec![root.id.clone()]));

        while let Some((subject, path)) = queue.pop_front() {
            self.path = path;
            let depth = self.path.len();
            for edge in self.parents(&subject) {
                if let Some(parent) = self.enter(&subject.id, &edge, depth) {
                    self.order.push(parent.clone());
                    let mut next_path = self.path.clone();
                    next_path.push(parent.id.clone());
                    queue.push_back((parent, next_path));
                }
            }
        }
        self.path.clear();
    }
}

impl InheritanceGraph {
    pub fn new(config: &GraphConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            algorithm: config.algorithm,
        }
    }

    /// Ordered ancestors of `root` under `runtime` at `now`, self first.
    ///
    /// Only edges active under the runtime context and not expired are
    /// followed.
    pub fn traverse<S: SubjectSource>(
        &self,
        root: Arc<Subject>,
        source: &S,
        runtime: &ContextSet,
        now: DateTime<Utc>,
    ) -> Traversal {
        let mut walk = Walk {
            source,
            runtime,
            now,
            max_depth: self.max_depth,
            visited: HashSet::from([root.id.clone()]),
            path: Vec::new(),
            order: vec![root.clone()],
            diagnostics: Vec::new(),
            valid_until: None,
        };

        match self.algorithm {
            TraversalAlgorithm::DepthFirstPreOrder => walk.pre_order(root, 0),
            TraversalAlgorithm::DepthFirstPostOrder => walk.post_order(root, 0),
            TraversalAlgorithm::BreadthFirst => walk.breadth_first(root),
        }

        Traversal {
            order: walk.order,
            diagnostics: walk.diagnostics,
            valid_until: walk.valid_until,
        }
    }
}

/// Whether making `child` inherit `parent` would close a cycle: true when
/// `parent` is `child` or already reaches `child` through any edge,
/// regardless of context or expiry.
pub fn would_create_cycle<S: SubjectSource>(child: &SubjectId, parent: &SubjectId, source: &S) -> bool {
    if child == parent {
        return true;
    }
    let mut seen = HashSet::new();
    let mut stack = vec![parent.clone()];
    while let Some(id) = stack.pop() {
        if &id == child {
            return true;
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(subject) = source.subject(&id) {
            stack.extend(subject.parents.iter().map(|e| e.parent.clone()));
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn id(name: &str) -> SubjectId {
        SubjectId::group(name).unwrap()
    }

    struct Fixture(HashMap<SubjectId, Arc<Subject>>);

    impl Fixture {
        fn new() -> Self {
            Self(HashMap::new())
        }

        /// `name` inherits `parents` in order, with descending priority 0
        fn add(mut self, name: &str, parents: &[&str]) -> Self {
            let mut subject = Subject::new(id(name));
            for parent in parents {
                subject.add_parent(InheritanceEdge::new(id(parent)));
            }
            self.0.insert(subject.id.clone(), Arc::new(subject));
            self
        }

        fn edge(mut self, name: &str, edge: InheritanceEdge) -> Self {
            let mut subject = (*self.0[&id(name)]).clone();
            subject.add_parent(edge);
            self.0.insert(subject.id.clone(), Arc::new(subject));
            self
        }

        fn traverse(&self, root: &str, config: GraphConfig) -> Traversal {
            InheritanceGraph::new(&config).traverse(
                self.0[&id(root)].clone(),
                &self.0,
                &ContextSet::new(),
                Utc::now(),
            )
        }
    }

    fn names(traversal: &Traversal) -> Vec<String> {
        traversal.order.iter().map(|s| s.id.name().to_string()).collect()
    }

    fn with_algorithm(algorithm: TraversalAlgorithm) -> GraphConfig {
        GraphConfig {
            algorithm,
            ..GraphConfig::default()
        }
    }

    // a -> b -> d, a -> c -> d
    fn diamond() -> Fixture {
        Fixture::new()
            .add("d", &[])
            .add("b", &["d"])
            .add("c", &["d"])
            .add("a", &["b", "c"])
    }

    #[test]
    fn test_pre_order_diamond() {
        let t = diamond().traverse("a", GraphConfig::default());
        assert_eq!(names(&t), vec!["a", "b", "d", "c"]);
        assert!(t.diagnostics.is_empty());
    }

    #[test]
    fn test_post_order_diamond() {
        let t = diamond().traverse("a", with_algorithm(TraversalAlgorithm::DepthFirstPostOrder));
        assert_eq!(names(&t), vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn test_breadth_first_diamond() {
        let t = diamond().traverse("a", with_algorithm(TraversalAlgorithm::BreadthFirst));
        assert_eq!(names(&t), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_priority_orders_parents() {
        let fixture = Fixture::new()
            .add("low", &[])
            .add("high", &[])
            .add("user", &[])
            .edge("user", InheritanceEdge::new(id("low")).with_priority(1))
            .edge("user", InheritanceEdge::new(id("high")).with_priority(10));
        let t = fixture.traverse("user", GraphConfig::default());
        assert_eq!(names(&t), vec!["user", "high", "low"]);
    }

    #[test]
    fn test_cycle_is_skipped_with_diagnostic() {
        let fixture = Fixture::new().add("a", &["b"]).add("b", &["a"]);
        for algorithm in [
            TraversalAlgorithm::DepthFirstPreOrder,
            TraversalAlgorithm::DepthFirstPostOrder,
            TraversalAlgorithm::BreadthFirst,
        ] {
            let t = fixture.traverse("a", with_algorithm(algorithm));
            assert_eq!(names(&t), vec!["a", "b"]);
            assert_eq!(
                t.diagnostics,
                vec![GraphDiagnostic::Cycle { from: id("b"), to: id("a") }]
            );
        }
    }

    #[test]
    fn test_depth_bound() {
        let fixture = Fixture::new()
            .add("g3", &[])
            .add("g2", &["g3"])
            .add("g1", &["g2"])
            .add("g0", &["g1"]);
        let t = fixture.traverse(
            "g0",
            GraphConfig {
                max_depth: 2,
                ..GraphConfig::default()
            },
        );
        assert_eq!(names(&t), vec!["g0", "g1", "g2"]);
        assert_eq!(
            t.diagnostics,
            vec![GraphDiagnostic::DepthExceeded { parent: id("g3"), depth: 3 }]
        );
    }

    #[test]
    fn test_missing_parent() {
        let fixture = Fixture::new().add("a", &["ghost"]);
        let t = fixture.traverse("a", GraphConfig::default());
        assert_eq!(names(&t), vec!["a"]);
        assert_eq!(
            t.diagnostics,
            vec![GraphDiagnostic::MissingParent { child: id("a"), parent: id("ghost") }]
        );
    }

    #[test]
    fn test_context_and_expiry_filter_edges() {
        let now = Utc::now();
        let fixture = Fixture::new()
            .add("nether", &[])
            .add("old", &[])
            .add("soon", &[])
            .add("user", &[])
            .edge(
                "user",
                InheritanceEdge::new(id("nether")).with_context("world=nether".parse().unwrap()),
            )
            .edge("user", InheritanceEdge::new(id("old")).with_expiry(now - Duration::hours(1)))
            .edge("user", InheritanceEdge::new(id("soon")).with_expiry(now + Duration::hours(1)));

        let t = InheritanceGraph::new(&GraphConfig::default()).traverse(
            fixture.0[&id("user")].clone(),
            &fixture.0,
            &"world=overworld".parse().unwrap(),
            now,
        );
        assert_eq!(names(&t), vec!["user", "soon"]);
        assert_eq!(t.valid_until, Some(now + Duration::hours(1)));
    }

    proptest::proptest! {
        #[test]
        fn prop_every_algorithm_visits_the_reachable_set_once(
            edges in proptest::collection::vec((0..8usize, 0..8usize), 0..24)
        ) {
            let mut fixture = Fixture::new();
            for i in 0..8 {
                fixture = fixture.add(&format!("g{}", i), &[]);
            }
            for (child, parent) in edges.iter().filter(|(c, p)| c != p) {
                fixture = fixture.edge(
                    &format!("g{}", child),
                    InheritanceEdge::new(id(&format!("g{}", parent))),
                );
            }

            let mut reachable = HashSet::from([id("g0")]);
            let mut stack = vec![id("g0")];
            while let Some(next) = stack.pop() {
                for edge in &fixture.0[&next].parents {
                    if reachable.insert(edge.parent.clone()) {
                        stack.push(edge.parent.clone());
                    }
                }
            }

            for algorithm in [
                TraversalAlgorithm::DepthFirstPreOrder,
                TraversalAlgorithm::DepthFirstPostOrder,
                TraversalAlgorithm::BreadthFirst,
            ] {
                let t = fixture.traverse("g0", with_algorithm(algorithm));
                let ids = t.ids();
                proptest::prop_assert_eq!(&ids[0], &id("g0"));
                let unique: HashSet<SubjectId> = ids.iter().cloned().collect();
                proptest::prop_assert_eq!(unique.len(), ids.len());
                proptest::prop_assert_eq!(&unique, &reachable);
            }
        }
    }

    #[test]
    fn test_would_create_cycle() {
        let fixture = Fixture::new().add("c", &[]).add("b", &["c"]).add("a", &["b"]);
        assert!(would_create_cycle(&id("c"), &id("a"), &fixture.0));
        assert!(would_create_cycle(&id("a"), &id("a"), &fixture.0));
        assert!(!would_create_cycle(&id("a"), &id("c"), &fixture.0));
    }
}
