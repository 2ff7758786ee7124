//! Invalidation events exchanged between processes

use crate::error::{PermsError, Result};
use crate::subject::SubjectId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How far an invalidation reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationScope {
    /// Only the subject's own entries
    #[serde(rename = "SELF")]
    SelfOnly,
    /// The subject and everything inheriting from it
    #[serde(rename = "DESCENDANTS")]
    Descendants,
    /// Every entry
    #[serde(rename = "ALL")]
    All,
}

/// Cache invalidation broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Unique per event; used for deduplication
    pub id: Uuid,
    /// Publishing process
    pub origin: Uuid,
    /// Absent for [`InvalidationScope::All`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectId>,
    pub scope: InvalidationScope,
    /// Fingerprint of the node that triggered the event, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn subject(
        origin: Uuid,
        subject: SubjectId,
        scope: InvalidationScope,
        source_node: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            subject: Some(subject),
            scope,
            source_node,
            timestamp: Utc::now(),
        }
    }

    pub fn all(origin: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin,
            subject: None,
            scope: InvalidationScope::All,
            source_node: None,
            timestamp: Utc::now(),
        }
    }

    /// JSON wire form
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and checks the wire form
    pub fn decode(payload: &str) -> Result<Self> {
        let event: InvalidationEvent = serde_json::from_str(payload)?;
        if event.scope != InvalidationScope::All && event.subject.is_none() {
            return Err(PermsError::Serialization(format!(
                "event {} has scope {:?} but no subject",
                event.id, event.scope
            )));
        }
        Ok(event)
    }
}
