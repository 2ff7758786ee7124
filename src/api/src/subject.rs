//! Subjects (users and groups), inheritance edges and node diffs

use crate::context::ContextSet;
use crate::error::{PermsError, Result};
use crate::node::Node;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of a group name
pub const MAX_GROUP_NAME_LENGTH: usize = 36;

/// Kind of subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectKind {
    User,
    Group,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::User => "user",
            SubjectKind::Group => "group",
        }
    }
}

impl fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubjectKind {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(SubjectKind::User),
            "group" => Ok(SubjectKind::Group),
            other => Err(PermsError::invalid(other, "unknown subject kind")),
        }
    }
}

/// Identity of a subject: `user:<uuid>` or `group:<name>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId {
    kind: SubjectKind,
    name: String,
}

impl SubjectId {
    /// Validates and normalises a name for the given kind
    pub fn new(kind: SubjectKind, name: &str) -> Result<Self> {
        let trimmed = name.trim();
        let name = match kind {
            SubjectKind::User => Uuid::parse_str(trimmed)
                .map_err(|e| PermsError::invalid(format!("user:{}", trimmed), e.to_string()))?
                .hyphenated()
                .to_string(),
            SubjectKind::Group => {
                let name = trimmed.to_lowercase();
                if name.is_empty() || name.len() > MAX_GROUP_NAME_LENGTH {
                    return Err(PermsError::invalid(
                        format!("group:{}", name),
                        format!("group name must be 1-{} chars", MAX_GROUP_NAME_LENGTH),
                    ));
                }
                if !name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_.-".contains(c))
                {
                    return Err(PermsError::invalid(
                        format!("group:{}", name),
                        "group name may only contain a-z, 0-9, '_', '.', '-'",
                    ));
                }
                name
            }
        };
        Ok(Self { kind, name })
    }

    pub fn user(uuid: Uuid) -> Self {
        Self {
            kind: SubjectKind::User,
            name: uuid.hyphenated().to_string(),
        }
    }

    pub fn group(name: &str) -> Result<Self> {
        Self::new(SubjectKind::Group, name)
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_group(&self) -> bool {
        self.kind == SubjectKind::Group
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

impl FromStr for SubjectId {
    type Err = PermsError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| PermsError::invalid(s, "expected <kind>:<name>"))?;
        SubjectId::new(kind.parse()?, name)
    }
}

impl TryFrom<String> for SubjectId {
    type Error = PermsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SubjectId> for String {
    fn from(id: SubjectId) -> Self {
        id.to_string()
    }
}

/// Directed child → parent inheritance relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritanceEdge {
    pub parent: SubjectId,

    /// Contexts under which the parent is inherited
    #[serde(default)]
    pub context: ContextSet,

    /// Orders multiple parents, higher first
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl InheritanceEdge {
    pub fn new(parent: SubjectId) -> Self {
        Self {
            parent,
            context: ContextSet::new(),
            priority: 0,
            expiry: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: ContextSet) -> Self {
        self.context = context;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }

    pub fn is_active(&self, runtime: &ContextSet, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.context.is_satisfied_by(runtime)
    }

    /// Same parent under the same context
    pub fn same_slot(&self, other: &InheritanceEdge) -> bool {
        self.parent == other.parent && self.context == other.context
    }
}

/// A user or group with its own nodes and direct parents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,

    /// Nodes in insertion order
    #[serde(default)]
    pub nodes: Vec<Node>,

    /// Direct parents in insertion order
    #[serde(default)]
    pub parents: Vec<InheritanceEdge>,

    /// Bumped on every persisted change
    #[serde(default)]
    pub version: u64,
}

impl Subject {
    pub fn new(id: SubjectId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            parents: Vec::new(),
            version: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.parents.is_empty()
    }

    /// Nodes taking part in resolution under `runtime` at `now`
    pub fn active_nodes<'a>(
        &'a self,
        runtime: &'a ContextSet,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.is_active(runtime, now))
    }

    pub fn has_parent(&self, parent: &SubjectId) -> bool {
        self.parents.iter().any(|e| &e.parent == parent)
    }

    /// Adds a node unless an identical one (same fingerprint) is present
    pub fn add_node(&mut self, node: Node) -> bool {
        let fingerprint = node.fingerprint();
        if self.nodes.iter().any(|n| n.fingerprint() == fingerprint) {
            return false;
        }
        self.nodes.push(node);
        true
    }

    /// Removes every node in the same slot as `node`
    pub fn remove_node(&mut self, node: &Node) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| !n.same_slot(node));
        self.nodes.len() != before
    }

    /// Adds a parent edge unless one for the same parent and context exists
    pub fn add_parent(&mut self, edge: InheritanceEdge) -> bool {
        if self.parents.iter().any(|e| e.same_slot(&edge)) {
            return false;
        }
        self.parents.push(edge);
        true
    }

    pub fn remove_parent(&mut self, edge: &InheritanceEdge) -> bool {
        let before = self.parents.len();
        self.parents.retain(|e| !e.same_slot(edge));
        self.parents.len() != before
    }

    /// Applies a diff to a copy of this subject. The returned subject has its
    /// version bumped only if something actually changed.
    pub fn apply_diff(&self, diff: &SubjectDiff) -> (Subject, bool) {
        let mut next = self.clone();
        let mut changed = false;

        if diff.clear && !next.is_empty() {
            next.nodes.clear();
            next.parents.clear();
            changed = true;
        }
        for node in &diff.remove_nodes {
            changed |= next.remove_node(node);
        }
        for edge in &diff.remove_parents {
            changed |= next.remove_parent(edge);
        }
        for node in &diff.add_nodes {
            changed |= next.add_node(node.clone());
        }
        for edge in &diff.add_parents {
            changed |= next.add_parent(edge.clone());
        }

        if changed {
            next.version = self.version + 1;
        }
        (next, changed)
    }
}

/// A set of node and parent changes applied atomically to one subject
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDiff {
    /// Remove everything before applying the rest
    #[serde(default)]
    pub clear: bool,
    #[serde(default)]
    pub add_nodes: Vec<Node>,
    #[serde(default)]
    pub remove_nodes: Vec<Node>,
    #[serde(default)]
    pub add_parents: Vec<InheritanceEdge>,
    #[serde(default)]
    pub remove_parents: Vec<InheritanceEdge>,
}

impl SubjectDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, node: Node) -> Self {
        self.add_nodes.push(node);
        self
    }

    pub fn remove(mut self, node: Node) -> Self {
        self.remove_nodes.push(node);
        self
    }

    pub fn add_parent(mut self, edge: InheritanceEdge) -> Self {
        self.add_parents.push(edge);
        self
    }

    pub fn remove_parent(mut self, edge: InheritanceEdge) -> Self {
        self.remove_parents.push(edge);
        self
    }

    pub fn clear() -> Self {
        Self {
            clear: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.clear
            && self.add_nodes.is_empty()
            && self.remove_nodes.is_empty()
            && self.add_parents.is_empty()
            && self.remove_parents.is_empty()
    }

    /// Whether the diff touches inheritance edges
    pub fn touches_parents(&self) -> bool {
        self.clear || !self.add_parents.is_empty() || !self.remove_parents.is_empty()
    }

    /// Structural checks that do not need the rest of the graph
    pub fn validate(&self, subject: &SubjectId) -> Result<()> {
        for node in self.add_nodes.iter().chain(&self.remove_nodes) {
            node.validate()
                .map_err(|e| PermsError::invalid(subject, e.to_string()))?;
        }
        for edge in &self.add_parents {
            if !edge.parent.is_group() {
                return Err(PermsError::invalid(
                    subject,
                    format!("parent {} is not a group", edge.parent),
                ));
            }
            if &edge.parent == subject {
                return Err(PermsError::invalid(subject, "subject cannot inherit itself"));
            }
        }
        Ok(())
    }

    /// Fingerprint of the first node touched, carried on invalidation events
    pub fn source_node(&self) -> Option<String> {
        self.add_nodes
            .iter()
            .chain(&self.remove_nodes)
            .next()
            .map(Node::fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str) -> SubjectId {
        SubjectId::group(name).unwrap()
    }

    #[test]
    fn test_subject_id_parsing() {
        let id: SubjectId = "Group:VIP".parse().unwrap();
        assert_eq!(id, group("vip"));
        assert_eq!(id.to_string(), "group:vip");

        let uuid = Uuid::new_v4();
        let user: SubjectId = format!("user:{}", uuid.simple()).parse().unwrap();
        assert_eq!(user, SubjectId::user(uuid));
        assert_eq!(user.name(), uuid.hyphenated().to_string());
    }

    #[test]
    fn test_invalid_subject_ids() {
        assert!(SubjectId::group("").is_err());
        assert!(SubjectId::group("has space").is_err());
        assert!(SubjectId::group(&"x".repeat(MAX_GROUP_NAME_LENGTH + 1)).is_err());
        assert!(SubjectId::new(SubjectKind::User, "not-a-uuid").is_err());
        assert!("vip".parse::<SubjectId>().is_err());
        assert!("team:vip".parse::<SubjectId>().is_err());
    }

    #[test]
    fn test_subject_id_serde_as_string() {
        let json = serde_json::to_string(&group("admin")).unwrap();
        assert_eq!(json, "\"group:admin\"");
        let back: SubjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, group("admin"));
        assert!(serde_json::from_str::<SubjectId>("\"group:a b\"").is_err());
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let mut subject = Subject::new(group("default"));
        assert!(subject.add_node(Node::grant("chat.use").unwrap()));
        assert!(!subject.add_node(Node::grant("chat.use").unwrap()));
        assert_eq!(subject.nodes.len(), 1);

        // same slot, different value: kept side by side
        assert!(subject.add_node(Node::deny("chat.use").unwrap()));
        assert_eq!(subject.nodes.len(), 2);
    }

    #[test]
    fn test_remove_matches_slot() {
        let mut subject = Subject::new(group("default"));
        subject.add_node(Node::grant("chat.use").unwrap());
        subject.add_node(Node::builder("chat.use").weight(5).build().unwrap());

        assert!(subject.remove_node(&Node::deny("chat.use").unwrap()));
        assert!(subject.nodes.is_empty());
        assert!(!subject.remove_node(&Node::grant("chat.use").unwrap()));
    }

    #[test]
    fn test_apply_diff_versions() {
        let subject = Subject::new(group("vip"));
        let diff = SubjectDiff::new()
            .add(Node::grant("fly.use").unwrap())
            .add_parent(InheritanceEdge::new(group("default")));

        let (next, changed) = subject.apply_diff(&diff);
        assert!(changed);
        assert_eq!(next.version, 1);
        assert!(next.has_parent(&group("default")));

        let (again, changed) = next.apply_diff(&diff);
        assert!(!changed);
        assert_eq!(again.version, 1);

        let (cleared, changed) = again.apply_diff(&SubjectDiff::clear());
        assert!(changed);
        assert!(cleared.is_empty());
        assert_eq!(cleared.version, 2);
    }

    #[test]
    fn test_diff_validation() {
        let vip = group("vip");
        let self_parent = SubjectDiff::new().add_parent(InheritanceEdge::new(vip.clone()));
        assert!(matches!(
            self_parent.validate(&vip),
            Err(PermsError::InvalidMutation { .. })
        ));

        let user_parent =
            SubjectDiff::new().add_parent(InheritanceEdge::new(SubjectId::user(Uuid::new_v4())));
        assert!(user_parent.validate(&vip).is_err());

        let ok = SubjectDiff::new().add_parent(InheritanceEdge::new(group("default")));
        assert!(ok.validate(&vip).is_ok());
    }
}
