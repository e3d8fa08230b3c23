//! A workspace root holding both stores, and the reset that clears them together.
//!
//! All persisted state lives under `<root>/data`. Store operations hold the
//! workspace gate for reading; [`Workspace::reset`] holds it for writing and
//! swaps `data` out with a single rename, so no reader ever sees artifacts
//! without their questions or the reverse.
//!
//! Working-set writers (reconcile, user edits, deletes, reset) also take the
//! writer lock from [`Workspace::lock_writer`]. It is an advisory lock on
//! `<root>/.writer.lock`, so it excludes writers in other handles and other
//! processes, not just other tasks sharing this handle. The lock file sits
//! outside `data` and survives a reset.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::error::StoreError;
use crate::fsio;
use crate::questions::QuestionStore;

const DATA_DIR: &str = "data";
const TRASH_PREFIX: &str = ".reset-";
const WRITER_LOCK: &str = ".writer.lock";

/// Held while a working-set write is in progress. Dropping it releases both
/// the in-process and the on-disk lock.
pub struct WriterGuard {
    _file: File,
    _local: OwnedMutexGuard<()>,
}

#[derive(Clone)]
pub struct Workspace {
    root: PathBuf,
    gate: Arc<RwLock<()>>,
    writer: Arc<Mutex<()>>,
    artifacts: Arc<ArtifactStore>,
    questions: Arc<QuestionStore>,
}

impl Workspace {
    /// Open a workspace rooted at `root`. Nothing is created until the first write.
    pub fn open(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let gate = Arc::new(RwLock::new(()));
        let data = root.join(DATA_DIR);
        Self {
            artifacts: Arc::new(ArtifactStore::new(data.join("artifacts"), Arc::clone(&gate))),
            questions: Arc::new(QuestionStore::new(data.join("questions"), Arc::clone(&gate))),
            root,
            gate,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifacts(&self) -> Arc<ArtifactStore> {
        Arc::clone(&self.artifacts)
    }

    pub fn questions(&self) -> Arc<QuestionStore> {
        Arc::clone(&self.questions)
    }

    /// Take the single-writer lock for the working set, waiting for any
    /// other writer on the same root to finish.
    pub async fn lock_writer(&self) -> Result<WriterGuard, StoreError> {
        // Tasks on this handle queue here instead of each parking a
        // blocking thread on the file lock.
        let local = Arc::clone(&self.writer).lock_owned().await;
        let path = self.root.join(WRITER_LOCK);
        let file = fsio::lock_exclusive(path.clone())
            .await
            .map_err(|e| StoreError::unavailable(&path, e))?;
        Ok(WriterGuard {
            _file: file,
            _local: local,
        })
    }

    /// Remove all artifacts and questions.
    ///
    /// Waits for in-flight store operations to finish, then renames `data`
    /// aside and deletes it. Once this returns `Ok`, every later read sees an
    /// empty workspace. A failure to delete the renamed directory is logged
    /// and does not fail the reset.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let _writer = self.lock_writer().await?;
        let _gate = self.gate.write().await;
        let data = self.root.join(DATA_DIR);
        let trash = self.root.join(format!("{TRASH_PREFIX}{}", Uuid::new_v4()));

        match tokio::fs::rename(&data, &trash).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("workspace reset (already empty)");
                return Ok(());
            }
            Err(e) => return Err(StoreError::unavailable(&data, e)),
        }

        if let Err(e) = tokio::fs::remove_dir_all(&trash).await {
            warn!(path = %trash.display(), error = %e, "could not remove reset data");
        }
        info!("workspace reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use llminister_core::{IncomingQuestion, StageKind, new_question};
    use serde_json::json;

    #[tokio::test]
    async fn reset_clears_artifacts_and_questions() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path());
        ws.artifacts()
            .append(StageKind::Extract, json!({"questions": []}))
            .await
            .unwrap();
        ws.questions()
            .upsert(&new_question(&IncomingQuestion::new("Wat is X?"), Utc::now()))
            .await
            .unwrap();

        ws.reset().await.unwrap();

        assert!(ws.artifacts().latest(StageKind::Extract).await.unwrap_err().is_not_found());
        assert!(ws.artifacts().list(StageKind::Extract).await.unwrap().is_empty());
        assert!(ws.questions().get_all().await.unwrap().is_empty());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != WRITER_LOCK)
            .collect();
        assert!(leftovers.is_empty(), "reset left files behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn writer_lock_excludes_other_handles_on_same_root() {
        let dir = tempfile::tempdir().unwrap();
        let first = Workspace::open(dir.path());
        let second = Workspace::open(dir.path());

        let held = first.lock_writer().await.unwrap();
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            second.lock_writer(),
        )
        .await;
        assert!(blocked.is_err(), "second handle wrote while the first held the lock");

        drop(held);
        let _guard = second.lock_writer().await.unwrap();
    }

    #[tokio::test]
    async fn reset_waits_for_writer_on_other_handle() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Workspace::open(dir.path());
        let resetter = Workspace::open(dir.path());
        writer
            .questions()
            .upsert(&new_question(&IncomingQuestion::new("Wat is X?"), Utc::now()))
            .await
            .unwrap();

        let held = writer.lock_writer().await.unwrap();
        let reset = tokio::spawn(async move { resetter.reset().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!reset.is_finished(), "reset ran while another handle held the writer lock");
        assert_eq!(writer.questions().get_all().await.unwrap().len(), 1);

        drop(held);
        reset.await.unwrap().unwrap();
        assert!(writer.questions().get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_of_empty_workspace_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        Workspace::open(dir.path()).reset().await.unwrap();
    }

    #[tokio::test]
    async fn sequences_restart_after_reset() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path());
        let artifacts = ws.artifacts();
        artifacts.append(StageKind::Transcribe, json!({})).await.unwrap();
        artifacts.append(StageKind::Transcribe, json!({})).await.unwrap();
        ws.reset().await.unwrap();
        let a = artifacts.append(StageKind::Transcribe, json!({})).await.unwrap();
        assert_eq!(a.sequence_id, 1);
    }

    #[tokio::test]
    async fn reset_waits_for_concurrent_appends() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::open(dir.path());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let artifacts = ws.artifacts();
                tokio::spawn(async move { artifacts.append(StageKind::Answer, json!({"n": i})).await })
            })
            .collect();
        ws.reset().await.unwrap();
        for w in writers {
            w.await.unwrap().unwrap();
        }
        // Every append landed either before the reset (and was cleared) or after it.
        let listed = ws.artifacts().list(StageKind::Answer).await.unwrap();
        let seqs: Vec<_> = listed.iter().map(|a| a.sequence_id).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    }
}
