//! Context sets
//!
//! A context set maps a context key (`world`, `server`, `dimension`, ...) to
//! the set of values it allows. Nodes and inheritance edges carry one; a
//! runtime lookup supplies another.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a context key
pub const MAX_KEY_LENGTH: usize = 64;

/// Keys for which the value `global` means "not constrained"
const GLOBAL_KEYS: [&str; 2] = ["server", "world"];

/// Separators of the textual form, banned in keys and values
const RESERVED: [char; 3] = ['=', ';', ','];

/// Errors that can occur while building a context set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// Key is empty after trimming
    EmptyKey,
    /// Key is longer than [`MAX_KEY_LENGTH`]
    KeyTooLong(String),
    /// Key contains a reserved character
    InvalidKey(String),
    /// Value is empty after trimming
    EmptyValue(String),
    /// Value contains a reserved character
    InvalidValue(String),
    /// Textual form could not be parsed
    Malformed(String),
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "context key cannot be empty"),
            Self::KeyTooLong(key) => write!(f, "context key too long: '{}'", key),
            Self::InvalidKey(key) => write!(f, "invalid context key: '{}'", key),
            Self::EmptyValue(key) => write!(f, "empty value for context key '{}'", key),
            Self::InvalidValue(value) => write!(f, "invalid context value: '{}'", value),
            Self::Malformed(msg) => write!(f, "malformed context: {}", msg),
        }
    }
}

impl std::error::Error for ContextError {}

/// Ordering key describing how constrained a context set is.
///
/// Sets constraining `server` outrank those that don't, then `world`, then
/// the number of constrained keys; among equals, fewer allowed values is
/// narrower and ranks higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    has_server: bool,
    has_world: bool,
    keys: usize,
    narrowness: std::cmp::Reverse<usize>,
}

/// Mapping from context key to allowed values
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct ContextSet {
    entries: BTreeMap<String, BTreeSet<String>>,
}

impl ContextSet {
    /// Empty context set (always active)
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from key/value pairs
    pub fn of<K, V, I>(pairs: I) -> Result<Self, ContextError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut set = Self::new();
        for (key, value) in pairs {
            set.insert(key.as_ref(), value.as_ref())?;
        }
        Ok(set)
    }

    /// Adds a value for a key, normalising both
    pub fn insert(&mut self, key: &str, value: &str) -> Result<(), ContextError> {
        let key = normalise_key(key)?;
        let value = value.trim().to_lowercase();
        if value.is_empty() {
            return Err(ContextError::EmptyValue(key));
        }
        // separators would make two different sets share a signature
        if value.contains(RESERVED) {
            return Err(ContextError::InvalidValue(value));
        }
        if value == "global" && GLOBAL_KEYS.contains(&key.as_str()) {
            return Ok(());
        }
        self.entries.entry(key).or_default().insert(value);
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert)
    pub fn with(mut self, key: &str, value: &str) -> Result<Self, ContextError> {
        self.insert(key, value)?;
        Ok(self)
    }

    /// Removes every value for a key
    pub fn remove_key(&mut self, key: &str) {
        self.entries.remove(&key.trim().to_lowercase());
    }

    /// Values allowed for a key
    pub fn values(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(key)
    }

    /// Whether a key is constrained
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether the given key/value pair is present
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.entries
            .get(key)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of constrained keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over `(key, value)` pairs in canonical order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// True when every key of `self` has at least one of its values present
    /// in `runtime`. An empty set is satisfied by anything.
    pub fn is_satisfied_by(&self, runtime: &ContextSet) -> bool {
        self.entries.iter().all(|(key, allowed)| match runtime.entries.get(key) {
            Some(present) => allowed.iter().any(|v| present.contains(v)),
            None => false,
        })
    }

    /// How constrained this set is, for priority ordering
    pub fn specificity(&self) -> Specificity {
        Specificity {
            has_server: self.entries.contains_key("server"),
            has_world: self.entries.contains_key("world"),
            keys: self.entries.len(),
            narrowness: std::cmp::Reverse(self.entries.values().map(BTreeSet::len).sum()),
        }
    }

    /// Canonical string form, stable across processes; used as a cache key
    pub fn signature(&self) -> String {
        let mut out = String::new();
        for (idx, (key, values)) in self.entries.iter().enumerate() {
            if idx > 0 {
                out.push(';');
            }
            out.push_str(key);
            out.push('=');
            for (vidx, value) in values.iter().enumerate() {
                if vidx > 0 {
                    out.push(',');
                }
                out.push_str(value);
            }
        }
        out
    }
}

fn normalise_key(key: &str) -> Result<String, ContextError> {
    let key = key.trim().to_lowercase();
    if key.is_empty() {
        return Err(ContextError::EmptyKey);
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(ContextError::KeyTooLong(key));
    }
    if key.contains(RESERVED) {
        return Err(ContextError::InvalidKey(key));
    }
    Ok(key)
}

impl TryFrom<BTreeMap<String, Vec<String>>> for ContextSet {
    type Error = ContextError;

    fn try_from(raw: BTreeMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let mut set = ContextSet::new();
        for (key, values) in raw {
            for value in values {
                set.insert(&key, &value)?;
            }
        }
        Ok(set)
    }
}

impl From<ContextSet> for BTreeMap<String, Vec<String>> {
    fn from(set: ContextSet) -> Self {
        set.entries
            .into_iter()
            .map(|(k, vs)| (k, vs.into_iter().collect()))
            .collect()
    }
}

/// Parses `key=value` pairs separated by `;` or `,` (e.g. `world=nether;server=lobby`).
/// A bare token adds another value to the preceding key, so the canonical
/// [`signature`](ContextSet::signature) form `server=hub,lobby` parses back.
impl FromStr for ContextSet {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = ContextSet::new();
        let mut current_key: Option<&str> = None;
        for token in s.split([';', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            match token.split_once('=') {
                Some((key, value)) => {
                    set.insert(key, value)?;
                    current_key = Some(key);
                }
                None => {
                    let key = current_key.ok_or_else(|| {
                        ContextError::Malformed(format!("expected key=value, got '{}'", token))
                    })?;
                    set.insert(key, token)?;
                }
            }
        }
        Ok(set)
    }
}

impl fmt::Display for ContextSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "(global)")
        } else {
            let pairs: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, "{}", pairs.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ctx(s: &str) -> ContextSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_set_always_satisfied() {
        let node_ctx = ContextSet::new();
        assert!(node_ctx.is_satisfied_by(&ContextSet::new()));
        assert!(node_ctx.is_satisfied_by(&ctx("world=nether")));
    }

    #[test]
    fn test_world_filtering() {
        let node_ctx = ctx("world=nether");
        assert!(node_ctx.is_satisfied_by(&ctx("world=nether;server=lobby")));
        assert!(!node_ctx.is_satisfied_by(&ctx("world=overworld")));
        assert!(!node_ctx.is_satisfied_by(&ContextSet::new()));
    }

    #[test]
    fn test_any_value_per_key() {
        let node_ctx = ctx("world=nether,world=end");
        assert!(node_ctx.is_satisfied_by(&ctx("world=end")));
        assert!(!node_ctx.is_satisfied_by(&ctx("world=creative")));
    }

    #[test]
    fn test_normalisation() {
        let set = ctx(" World = Nether ");
        assert!(set.contains("world", "nether"));

        let global = ctx("server=global;world=GLOBAL");
        assert!(global.is_empty());
    }

    #[test]
    fn test_invalid_contexts() {
        assert_eq!("=nether".parse::<ContextSet>(), Err(ContextError::EmptyKey));
        assert!(matches!("world=".parse::<ContextSet>(), Err(ContextError::EmptyValue(_))));
        assert!(matches!("world".parse::<ContextSet>(), Err(ContextError::Malformed(_))));
        let long = format!("{}=x", "k".repeat(MAX_KEY_LENGTH + 1));
        assert!(matches!(long.parse::<ContextSet>(), Err(ContextError::KeyTooLong(_))));
    }

    #[test]
    fn test_separators_rejected_in_values() {
        let mut set = ContextSet::new();
        assert_eq!(set.insert("world", "a,b"), Err(ContextError::InvalidValue("a,b".into())));
        assert!(matches!(set.insert("world", "x=y"), Err(ContextError::InvalidValue(_))));
        assert!(matches!(set.insert("world", "x;y"), Err(ContextError::InvalidValue(_))));
        assert!(set.is_empty());

        // would otherwise collide with {world: [a, b]}
        let bad = r#"{"world":["a,b"]}"#;
        assert!(serde_json::from_str::<ContextSet>(bad).is_err());
        assert_eq!(ctx("world=a,b").signature(), "world=a,b");
    }

    #[test]
    fn test_signature_is_canonical() {
        let a = ctx("world=nether;server=lobby");
        let b = ctx("server=lobby;world=nether");
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature(), "server=lobby;world=nether");
        assert_eq!(ContextSet::new().signature(), "");
    }

    #[test]
    fn test_specificity_ordering() {
        let global = ContextSet::new();
        let world = ctx("world=nether");
        let server = ctx("server=lobby");
        let both = ctx("server=lobby;world=nether");
        let wide = ctx("server=lobby,server=hub");

        assert!(world.specificity() > global.specificity());
        assert!(server.specificity() > world.specificity());
        assert!(both.specificity() > server.specificity());
        assert!(server.specificity() > wide.specificity());
    }

    #[test]
    fn test_serde_validates() {
        let json = r#"{"world":["Nether"]}"#;
        let set: ContextSet = serde_json::from_str(json).unwrap();
        assert!(set.contains("world", "nether"));

        let bad = r#"{"":["x"]}"#;
        assert!(serde_json::from_str::<ContextSet>(bad).is_err());
    }

    proptest! {
        #[test]
        fn prop_set_satisfied_by_itself(pairs in proptest::collection::vec(("[a-z]{1,6}", "[a-z0-9]{1,6}"), 0..6)) {
            let set = ContextSet::of(pairs).unwrap();
            prop_assert!(set.is_satisfied_by(&set));
        }

        #[test]
        fn prop_signature_identifies_set(
            a in proptest::collection::vec(("[a-z]{1,3}", "[a-c,;=]{1,4}"), 0..4),
            b in proptest::collection::vec(("[a-z]{1,3}", "[a-c,;=]{1,4}"), 0..4),
        ) {
            if let (Ok(a), Ok(b)) = (ContextSet::of(a), ContextSet::of(b)) {
                prop_assert_eq!(a.signature() == b.signature(), a == b);
            }
        }

        #[test]
        fn prop_signature_roundtrips(pairs in proptest::collection::vec(("[a-z]{1,6}", "[a-z0-9]{1,6}"), 0..6)) {
            let set = ContextSet::of(pairs).unwrap();
            let parsed: ContextSet = set.signature().parse().unwrap();
            prop_assert_eq!(parsed, set);
        }
    }
}
