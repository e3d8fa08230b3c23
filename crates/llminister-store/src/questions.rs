//! Working-set persistence: one JSON file per question under `<data>/questions/`.
//!
//! This is plain storage. Matching, merging and conflict detection belong to
//! the reconciliation engine, which is the only writer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use llminister_core::Question;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::fsio;

pub struct QuestionStore {
    dir: PathBuf,
    gate: Arc<RwLock<()>>,
}

impl QuestionStore {
    pub(crate) fn new(dir: PathBuf, gate: Arc<RwLock<()>>) -> Self {
        Self { dir, gate }
    }

    fn path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Every stored question, oldest first.
    pub async fn get_all(&self) -> Result<Vec<Question>, StoreError> {
        let _gate = self.gate.read().await;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::unavailable(&self.dir, e)),
        };

        let mut questions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::unavailable(&self.dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if fsio::is_hidden(name) {
                continue;
            }
            let Some(id) = name.strip_suffix(".json").and_then(|s| s.parse::<Uuid>().ok()) else {
                continue;
            };
            match read_question(&entry.path(), id).await {
                Ok(q) => questions.push(q),
                // Deleted between the scan and the read.
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        questions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.text.cmp(&b.text)));
        debug!(count = questions.len(), "working set loaded");
        Ok(questions)
    }

    pub async fn get(&self, id: Uuid) -> Result<Question, StoreError> {
        let _gate = self.gate.read().await;
        read_question(&self.path(id), id).await
    }

    /// Create or replace the stored copy of `question`.
    pub async fn upsert(&self, question: &Question) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::unavailable(&self.dir, e))?;
        let path = self.path(question.id);
        let bytes = serde_json::to_vec_pretty(question).map_err(|e| StoreError::corrupt(&path, e))?;
        fsio::replace(path.clone(), bytes)
            .await
            .map_err(|e| StoreError::unavailable(&path, e))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let _gate = self.gate.read().await;
        let path = self.path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(format!("question {id}")))
            }
            Err(e) => Err(StoreError::unavailable(&path, e)),
        }
    }
}

async fn read_question(path: &Path, id: Uuid) -> Result<Question, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(format!("question {id}")));
        }
        Err(e) => return Err(StoreError::unavailable(path, e)),
    };
    let question: Question =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(path, e))?;
    if question.id != id {
        return Err(StoreError::corrupt(
            path,
            format!("file holds question {}", question.id),
        ));
    }
    Ok(question)
}
