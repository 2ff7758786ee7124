//! Flat-file storage backend
//!
//! Layout under the root directory:
//!
//! ```text
//! users/<uuid>.json
//! groups/<name>.json
//! ```
//!
//! Each write goes to a temporary file which is then renamed over the
//! target, so readers see either the old or the new document.

use super::{
    decode_document, decode_or_empty, diff_base, encode_document, matching_nodes, DiffOutcome,
    Storage,
};
use async_trait::async_trait;
use permsync_api::{Node, PermsError, Result, Subject, SubjectDiff, SubjectId, SubjectKind};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const KINDS: [SubjectKind; 2] = [SubjectKind::User, SubjectKind::Group];

/// Flat-file storage implementation
pub struct FileStorage {
    root: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn kind_dir(&self, kind: SubjectKind) -> PathBuf {
        match kind {
            SubjectKind::User => self.root.join("users"),
            SubjectKind::Group => self.root.join("groups"),
        }
    }

    fn path_for(&self, id: &SubjectId) -> PathBuf {
        self.kind_dir(id.kind()).join(format!("{}.json", id.name()))
    }

    async fn read(&self, id: &SubjectId) -> Result<Option<Subject>> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => decode_document(id, &bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(id, "load_subject", e)),
        }
    }

    async fn write(&self, subject: &Subject) -> Result<()> {
        let path = self.path_for(&subject.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = encode_document(subject)?;

        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&subject.id, "save_subject", e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&subject.id, "save_subject", e))?;

        debug!(subject = %subject.id, path = %path.display(), "Wrote subject file");
        Ok(())
    }

    async fn ids(&self, kind: SubjectKind) -> Result<Vec<SubjectId>> {
        let dir = self.kind_dir(kind);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(kind, "list_subjects", e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(kind, "list_subjects", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match SubjectId::new(kind, stem) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unrecognised file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn io_error(subject: impl ToString, operation: &'static str, err: std::io::Error) -> PermsError {
    PermsError::unavailable(subject, operation, err.to_string())
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn init(&self) -> Result<()> {
        for kind in KINDS {
            fs::create_dir_all(self.kind_dir(kind))
                .await
                .map_err(|e| io_error(kind, "init", e))?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn load_subject(&self, id: &SubjectId) -> Result<Option<Subject>> {
        self.read(id).await
    }

    async fn save_subject(&self, subject: &Subject) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write(subject).await
    }

    async fn delete_subject(&self, id: &SubjectId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(id, "delete_subject", e)),
        }
    }

    async fn list_subjects(&self, kind: SubjectKind) -> Result<Vec<SubjectId>> {
        self.ids(kind).await
    }

    async fn bulk_load(&self) -> Result<Vec<Subject>> {
        let mut subjects = Vec::new();
        for kind in KINDS {
            for id in self.ids(kind).await? {
                match fs::read(self.path_for(&id)).await {
                    Ok(bytes) => subjects.push(decode_or_empty(&id, &bytes)),
                    // removed between listing and reading
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(io_error(&id, "bulk_load", e)),
                }
            }
        }
        Ok(subjects)
    }

    /// Best-effort: every subject is attempted, failures are reported together
    async fn bulk_save(&self, subjects: &[Subject]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut failed = Vec::new();
        for subject in subjects {
            if let Err(e) = self.write(subject).await {
                warn!(subject = %subject.id, error = %e, "Bulk save failed for subject");
                failed.push(subject.id.to_string());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(PermsError::unavailable(
                failed.join(","),
                "bulk_save",
                format!("{} of {} subjects not written", failed.len(), subjects.len()),
            ))
        }
    }

    async fn apply_node_diff(&self, id: &SubjectId, diff: &SubjectDiff) -> Result<DiffOutcome> {
        let _guard = self.write_lock.lock().await;
        let base = diff_base(id, self.read(id).await)?;
        let (subject, changed) = base.apply_diff(diff);
        if changed {
            self.write(&subject).await?;
        }
        Ok(DiffOutcome { subject, changed })
    }

    async fn search_permission(&self, key: &str) -> Result<Vec<(SubjectId, Node)>> {
        let mut hits = Vec::new();
        for subject in self.bulk_load().await? {
            hits.extend(matching_nodes(&subject, key));
        }
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_layout_on_disk() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.init().await.unwrap();

        let id = SubjectId::group("vip").unwrap();
        storage
            .apply_node_diff(&id, &SubjectDiff::new().add(Node::grant("fly.use").unwrap()))
            .await
            .unwrap();

        let path = dir.path().join("groups").join("vip.json");
        assert!(path.exists());
        assert!(!dir.path().join("groups").join("vip.json.tmp").exists());

        let ids = storage.list_subjects(SubjectKind::Group).await.unwrap();
        assert_eq!(ids, vec![id]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        storage.init().await.unwrap();

        std::fs::write(dir.path().join("groups").join("broken.json"), b"{ nope").unwrap();
        let id = SubjectId::group("broken").unwrap();
        assert!(matches!(
            storage.load_subject(&id).await,
            Err(PermsError::CorruptRecord { .. })
        ));

        let all = storage.bulk_load().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_empty());
    }

    #[tokio::test]
    async fn test_missing_directories_read_as_empty() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path().join("never-created"));
        assert!(storage.bulk_load().await.unwrap().is_empty());
        assert!(storage
            .load_subject(&SubjectId::group("x").unwrap())
            .await
            .unwrap()
            .is_none());
    }
}
