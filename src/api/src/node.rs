//! Permission nodes
//!
//! A [`Node`] is one immutable permission fact. Changing a node means removing
//! it and adding a replacement; nothing edits a node in place.

use crate::context::ContextSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum length of a node key
pub const MAX_NODE_KEY_LENGTH: usize = 256;

/// Errors produced while validating a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Key is empty after trimming
    EmptyKey,
    /// Key exceeds [`MAX_NODE_KEY_LENGTH`]
    KeyTooLong(usize),
    /// Key contains whitespace
    Whitespace(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "node key cannot be empty"),
            Self::KeyTooLong(len) => write!(f, "node key too long ({} chars)", len),
            Self::Whitespace(key) => write!(f, "node key contains whitespace: '{}'", key),
        }
    }
}

impl std::error::Error for NodeError {}

/// Interpretation of a node key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Plain permission
    Permission,
    /// `weight.<n>`
    Weight(i32),
    /// `meta.<key>.<value>`
    Meta { key: String, value: String },
    /// `prefix.<priority>.<text>`
    Prefix { priority: i32, text: String },
    /// `suffix.<priority>.<text>`
    Suffix { priority: i32, text: String },
}

/// A single permission grant or deny
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Permission key, lowercased (e.g. `chat.use`)
    pub key: String,

    /// `true` grants, `false` explicitly denies
    pub value: bool,

    /// Contexts under which this node applies
    #[serde(default)]
    pub context: ContextSet,

    /// Explicit weight; secondary to context specificity
    #[serde(default)]
    pub weight: i32,

    /// Expiry instant for temporary nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,

    /// Creation time; the final tie-break (most recent wins)
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Start building a node for `key`
    pub fn builder(key: impl Into<String>) -> NodeBuilder {
        NodeBuilder::new(key)
    }

    /// Granting, global, permanent node
    pub fn grant(key: impl Into<String>) -> Result<Self, NodeError> {
        Self::builder(key).build()
    }

    /// Denying, global, permanent node
    pub fn deny(key: impl Into<String>) -> Result<Self, NodeError> {
        Self::builder(key).value(false).build()
    }

    /// Canonical form of a key, as stored on built nodes
    pub fn normalise_key(key: &str) -> String {
        normalise_key(key)
    }

    /// Checks the key invariants; used on decode paths as well as on build
    pub fn validate(&self) -> Result<(), NodeError> {
        validate_key(&self.key)
    }

    /// Whether this node carries an expiry
    pub fn is_temporary(&self) -> bool {
        self.expiry.is_some()
    }

    /// Whether the node has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry, Some(expiry) if expiry <= now)
    }

    /// Whether the node takes part in resolution under `runtime` at `now`
    pub fn is_active(&self, runtime: &ContextSet, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.context.is_satisfied_by(runtime)
    }

    /// True when both nodes occupy the same slot: same key, same context and
    /// both permanent or both temporary. Used to match removals.
    pub fn same_slot(&self, other: &Node) -> bool {
        self.key == other.key
            && self.context == other.context
            && self.is_temporary() == other.is_temporary()
    }

    /// Stable content fingerprint (BLAKE3, hex). Creation time is excluded so
    /// re-adding an identical grant is recognised as a duplicate.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.key.as_bytes());
        hasher.update(&[self.value as u8]);
        hasher.update(self.context.signature().as_bytes());
        hasher.update(&self.weight.to_le_bytes());
        if let Some(expiry) = self.expiry {
            hasher.update(&expiry.timestamp_millis().to_le_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Classifies the key into a special node type
    pub fn kind(&self) -> NodeKind {
        parse_kind(&self.key)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} [{}]", self.key, self.value, self.context)?;
        if let Some(expiry) = self.expiry {
            write!(f, " until {}", expiry.to_rfc3339())?;
        }
        Ok(())
    }
}

/// Lowercases a trimmed key. Display text of `prefix.`/`suffix.` nodes and
/// the value of `meta.` nodes keep their case.
fn normalise_key(key: &str) -> String {
    let key = key.trim();
    let mut parts = key.splitn(3, '.');
    let head = parts.next().unwrap_or_default().to_lowercase();
    match (head.as_str(), parts.next(), parts.next()) {
        ("prefix" | "suffix" | "meta", Some(second), Some(text)) => {
            format!("{}.{}.{}", head, second.to_lowercase(), text)
        }
        _ => key.to_lowercase(),
    }
}

fn validate_key(key: &str) -> Result<(), NodeError> {
    if key.is_empty() {
        return Err(NodeError::EmptyKey);
    }
    if key.len() > MAX_NODE_KEY_LENGTH {
        return Err(NodeError::KeyTooLong(key.len()));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(NodeError::Whitespace(key.to_string()));
    }
    Ok(())
}

fn parse_kind(key: &str) -> NodeKind {
    if let Some(rest) = key.strip_prefix("weight.") {
        if let Ok(weight) = rest.parse::<i32>() {
            return NodeKind::Weight(weight);
        }
    } else if let Some(rest) = key.strip_prefix("meta.") {
        if let Some((k, v)) = rest.split_once('.') {
            if !k.is_empty() && !v.is_empty() {
                return NodeKind::Meta {
                    key: k.to_string(),
                    value: v.to_string(),
                };
            }
        }
    } else if let Some(rest) = key.strip_prefix("prefix.") {
        if let Some((priority, text)) = parse_affix(rest) {
            return NodeKind::Prefix { priority, text };
        }
    } else if let Some(rest) = key.strip_prefix("suffix.") {
        if let Some((priority, text)) = parse_affix(rest) {
            return NodeKind::Suffix { priority, text };
        }
    }
    NodeKind::Permission
}

fn parse_affix(rest: &str) -> Option<(i32, String)> {
    let (priority, text) = rest.split_once('.')?;
    let priority = priority.parse().ok()?;
    Some((priority, text.to_string()))
}

/// Builder for [`Node`]
#[derive(Debug, Clone)]
pub struct NodeBuilder {
    key: String,
    value: bool,
    context: ContextSet,
    weight: i32,
    expiry: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
}

impl NodeBuilder {
    fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: true,
            context: ContextSet::new(),
            weight: 0,
            expiry: None,
            created_at: None,
        }
    }

    pub fn value(mut self, value: bool) -> Self {
        self.value = value;
        self
    }

    pub fn context(mut self, context: ContextSet) -> Self {
        self.context = context;
        self
    }

    pub fn weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    /// Overrides the creation time (imports, tests)
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self) -> Result<Node, NodeError> {
        let key = Node::normalise_key(&self.key);
        validate_key(&key)?;
        Ok(Node {
            key,
            value: self.value,
            context: self.context,
            weight: self.weight,
            expiry: self.expiry,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Three-valued permission check result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tristate {
    True,
    False,
    /// No node decided the key; the caller's default applies
    Undefined,
}

impl Tristate {
    pub fn as_bool(self) -> bool {
        matches!(self, Tristate::True)
    }
}

impl From<Option<bool>> for Tristate {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Tristate::True,
            Some(false) => Tristate::False,
            None => Tristate::Undefined,
        }
    }
}
