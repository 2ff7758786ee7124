//! Embedded document store backed by sled
//!
//! Two trees: `subjects` maps `kind:name` to the subject's JSON document and
//! `permissions` maps `<permission>\0<kind:name>` to nothing, serving as the
//! secondary index on permission key. Both trees change together inside one
//! sled transaction.

use super::{
    decode_document, decode_or_empty, diff_base, encode_document, matching_nodes, DiffOutcome,
    Storage,
};
use async_trait::async_trait;
use permsync_api::{Node, PermsError, Result, Subject, SubjectDiff, SubjectId, SubjectKind};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// sled storage implementation
pub struct SledStorage {
    db: Db,
    subjects: Tree,
    permissions: Tree,
}

impl SledStorage {
    /// Open (or create) a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| sled_error("*", "open", e))?;
        let subjects = db
            .open_tree("subjects")
            .map_err(|e| sled_error("*", "open", e))?;
        let permissions = db
            .open_tree("permissions")
            .map_err(|e| sled_error("*", "open", e))?;

        info!(path = %path.display(), "Opened sled storage");
        Ok(Self {
            db,
            subjects,
            permissions,
        })
    }

    fn index_key(permission: &str, id: &SubjectId) -> Vec<u8> {
        format!("{}\0{}", permission, id).into_bytes()
    }

    fn permission_keys(subject: &Subject) -> BTreeSet<&str> {
        subject.nodes.iter().map(|n| n.key.as_str()).collect()
    }

    /// Writes `next` and moves its index entries from `previous`, inside a
    /// transaction
    fn write_tx(
        subjects: &TransactionalTree,
        permissions: &TransactionalTree,
        previous: Option<&Subject>,
        next: &Subject,
    ) -> std::result::Result<(), ConflictableTransactionError<PermsError>> {
        let bytes = encode_document(next).map_err(ConflictableTransactionError::Abort)?;
        subjects.insert(next.id.to_string().as_bytes(), bytes)?;

        let new_keys = Self::permission_keys(next);
        if let Some(previous) = previous {
            for key in Self::permission_keys(previous).difference(&new_keys) {
                permissions.remove(Self::index_key(key, &next.id))?;
            }
        }
        for key in new_keys {
            permissions.insert(Self::index_key(key, &next.id), &[] as &[u8])?;
        }
        Ok(())
    }

    /// Rebuilds the index entries of `id` from its stored document. Used
    /// after overwriting a document that could not be decoded, whose old
    /// entries were unknown at write time.
    fn reindex(&self, id: &SubjectId, operation: &'static str) -> Result<()> {
        let keep: BTreeSet<String> = match self
            .subjects
            .get(id.to_string().as_bytes())
            .map_err(|e| sled_error(id, operation, e))?
        {
            Some(bytes) => decode_document(id, &bytes)
                .map(|subject| subject.nodes.into_iter().map(|n| n.key).collect())
                .unwrap_or_default(),
            None => BTreeSet::new(),
        };

        let suffix = format!("\0{}", id);
        let mut purged = 0;
        for entry in self.permissions.iter() {
            let (index_key, _) = entry.map_err(|e| sled_error(id, operation, e))?;
            let text = String::from_utf8_lossy(&index_key);
            match text.strip_suffix(suffix.as_str()) {
                Some(permission) if !keep.contains(permission) => {
                    self.permissions
                        .remove(&index_key)
                        .map_err(|e| sled_error(id, operation, e))?;
                    purged += 1;
                }
                _ => {}
            }
        }
        if purged > 0 {
            warn!(subject = %id, purged, "Purged index entries left by corrupt record");
        }
        Ok(())
    }

    fn read_tx(
        subjects: &TransactionalTree,
        id: &SubjectId,
    ) -> std::result::Result<Result<Option<Subject>>, ConflictableTransactionError<PermsError>> {
        let bytes = subjects.get(id.to_string().as_bytes())?;
        Ok(bytes.map(|b| decode_document(id, &b)).transpose())
    }
}

fn sled_error(subject: impl ToString, operation: &'static str, err: sled::Error) -> PermsError {
    match err {
        sled::Error::Io(e) => PermsError::unavailable(subject, operation, e.to_string()),
        sled::Error::Corruption { .. } => PermsError::corrupt(subject, err.to_string()),
        other => PermsError::Internal(format!("sled {} failed: {}", operation, other)),
    }
}

fn tx_error(
    subject: impl ToString,
    operation: &'static str,
    err: TransactionError<PermsError>,
) -> PermsError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => sled_error(subject, operation, e),
    }
}

#[async_trait]
impl Storage for SledStorage {
    fn name(&self) -> &'static str {
        "sled"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| sled_error("*", "shutdown", e))?;
        Ok(())
    }

    async fn load_subject(&self, id: &SubjectId) -> Result<Option<Subject>> {
        let bytes = self
            .subjects
            .get(id.to_string().as_bytes())
            .map_err(|e| sled_error(id, "load_subject", e))?;
        bytes.map(|b| decode_document(id, &b)).transpose()
    }

    async fn save_subject(&self, subject: &Subject) -> Result<()> {
        let replaced_corrupt = (&self.subjects, &self.permissions)
            .transaction(|(subjects, permissions)| {
                let previous = Self::read_tx(subjects, &subject.id)?;
                let corrupt = previous.is_err();
                Self::write_tx(subjects, permissions, previous.ok().flatten().as_ref(), subject)?;
                Ok(corrupt)
            })
            .map_err(|e| tx_error(&subject.id, "save_subject", e))?;

        if replaced_corrupt {
            self.reindex(&subject.id, "save_subject")?;
        }
        Ok(())
    }

    async fn delete_subject(&self, id: &SubjectId) -> Result<()> {
        let removed_corrupt = (&self.subjects, &self.permissions)
            .transaction(|(subjects, permissions)| {
                let previous = Self::read_tx(subjects, id)?;
                let corrupt = previous.is_err();
                if let Some(previous) = previous.ok().flatten() {
                    for key in Self::permission_keys(&previous) {
                        permissions.remove(Self::index_key(key, id))?;
                    }
                }
                subjects.remove(id.to_string().as_bytes())?;
                Ok(corrupt)
            })
            .map_err(|e| tx_error(id, "delete_subject", e))?;

        if removed_corrupt {
            self.reindex(id, "delete_subject")?;
        }
        Ok(())
    }

    async fn list_subjects(&self, kind: SubjectKind) -> Result<Vec<SubjectId>> {
        let prefix = format!("{}:", kind);
        let mut ids = Vec::new();
        for entry in self.subjects.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry.map_err(|e| sled_error(kind, "list_subjects", e))?;
            let key = String::from_utf8_lossy(&key);
            ids.push(key.parse::<SubjectId>()?);
        }
        Ok(ids)
    }

    async fn bulk_load(&self) -> Result<Vec<Subject>> {
        let mut subjects = Vec::new();
        for entry in self.subjects.iter() {
            let (key, value) = entry.map_err(|e| sled_error("*", "bulk_load", e))?;
            let key = String::from_utf8_lossy(&key);
            let id: SubjectId = key
                .parse()
                .map_err(|_| PermsError::corrupt(&key, "undecodable subject key"))?;
            subjects.push(decode_or_empty(&id, &value));
        }
        Ok(subjects)
    }

    /// All-or-nothing: one transaction across both trees
    async fn bulk_save(&self, batch: &[Subject]) -> Result<()> {
        let replaced_corrupt = (&self.subjects, &self.permissions)
            .transaction(|(subjects, permissions)| {
                let mut corrupt = Vec::new();
                for subject in batch {
                    let previous = Self::read_tx(subjects, &subject.id)?;
                    if previous.is_err() {
                        corrupt.push(&subject.id);
                    }
                    Self::write_tx(subjects, permissions, previous.ok().flatten().as_ref(), subject)?;
                }
                Ok(corrupt)
            })
            .map_err(|e| tx_error("*", "bulk_save", e))?;

        for id in replaced_corrupt {
            self.reindex(id, "bulk_save")?;
        }

        debug!(subjects = batch.len(), "Bulk saved to sled");
        Ok(())
    }

    async fn apply_node_diff(&self, id: &SubjectId, diff: &SubjectDiff) -> Result<DiffOutcome> {
        let (outcome, replaced_corrupt) = (&self.subjects, &self.permissions)
            .transaction(|(subjects, permissions)| {
                let current = Self::read_tx(subjects, id)?;
                let corrupt = matches!(current, Err(PermsError::CorruptRecord { .. }));
                let base = diff_base(id, current).map_err(ConflictableTransactionError::Abort)?;
                let (subject, changed) = base.apply_diff(diff);
                if changed {
                    Self::write_tx(subjects, permissions, Some(&base), &subject)?;
                }
                Ok((DiffOutcome { subject, changed }, corrupt && changed))
            })
            .map_err(|e| tx_error(id, "apply_node_diff", e))?;

        if replaced_corrupt {
            self.reindex(id, "apply_node_diff")?;
        }
        Ok(outcome)
    }

    async fn search_permission(&self, key: &str) -> Result<Vec<(SubjectId, Node)>> {
        let prefix = format!("{}\0", key);
        let mut ids = Vec::new();
        for entry in self.permissions.scan_prefix(prefix.as_bytes()) {
            let (index_key, _) = entry.map_err(|e| sled_error(key, "search_permission", e))?;
            let index_key = String::from_utf8_lossy(&index_key);
            if let Some(raw_id) = index_key.strip_prefix(prefix.as_str()) {
                ids.push(raw_id.parse::<SubjectId>()?);
            }
        }

        let mut hits = Vec::new();
        for id in ids {
            if let Some(subject) = self.load_subject(&id).await? {
                hits.extend(matching_nodes(&subject, key));
            }
        }
        Ok(hits)
    }
}
