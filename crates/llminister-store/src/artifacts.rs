//! Append-only, per-stage artifact storage.
//!
//! Layout: `<data>/artifacts/<stage>/<seq:020>.json`. Sequence numbers are
//! assigned here, never by callers. Appends to one stage are serialized by an
//! in-process lock; the no-clobber rename is the backstop if another process
//! writes the same directory, in which case the append rescans and retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use llminister_core::{Artifact, StageKind};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::fsio;

pub struct ArtifactStore {
    dir: PathBuf,
    gate: Arc<RwLock<()>>,
    /// One append lock per stage, indexed like [`StageKind::ORDER`].
    writers: [Mutex<()>; 3],
}

impl ArtifactStore {
    pub(crate) fn new(dir: PathBuf, gate: Arc<RwLock<()>>) -> Self {
        Self {
            dir,
            gate,
            writers: StageKind::ORDER.map(|_| Mutex::new(())),
        }
    }

    fn stage_dir(&self, stage: StageKind) -> PathBuf {
        self.dir.join(stage.as_str())
    }

    /// Persist a new artifact for `stage` and return it with its assigned
    /// sequence number, which is greater than any previously stored for `stage`.
    pub async fn append(
        &self,
        stage: StageKind,
        payload: serde_json::Value,
    ) -> Result<Artifact, StoreError> {
        let _gate = self.gate.read().await;
        let _writer = self.writers[stage as usize].lock().await;

        let stage_dir = self.stage_dir(stage);
        tokio::fs::create_dir_all(&stage_dir)
            .await
            .map_err(|e| StoreError::unavailable(&stage_dir, e))?;

        loop {
            let sequence_id = scan_sequences(&stage_dir)
                .await?
                .last()
                .map_or(1, |&(seq, _)| seq + 1);
            let artifact = Artifact {
                stage_kind: stage,
                sequence_id,
                created_at: Utc::now(),
                payload: payload.clone(),
            };
            let path = stage_dir.join(file_name(sequence_id));
            let bytes = serde_json::to_vec_pretty(&artifact)
                .map_err(|e| StoreError::corrupt(&path, e))?;

            let created = fsio::create_new(path.clone(), bytes)
                .await
                .map_err(|e| StoreError::unavailable(&path, e))?;
            if created {
                info!(stage = %stage, sequence_id, "artifact stored");
                return Ok(artifact);
            }
            debug!(stage = %stage, sequence_id, "sequence taken by another writer, rescanning");
        }
    }

    /// The artifact with the highest sequence number for `stage`.
    pub async fn latest(&self, stage: StageKind) -> Result<Artifact, StoreError> {
        let _gate = self.gate.read().await;
        let stage_dir = self.stage_dir(stage);
        match scan_sequences(&stage_dir).await?.pop() {
            Some((seq, path)) => read_artifact(&path, stage, seq).await,
            None => Err(StoreError::NotFound(format!("no {stage} artifact"))),
        }
    }

    pub async fn get(&self, stage: StageKind, sequence_id: u64) -> Result<Artifact, StoreError> {
        let _gate = self.gate.read().await;
        let path = self.stage_dir(stage).join(file_name(sequence_id));
        read_artifact(&path, stage, sequence_id).await
    }

    /// All artifacts for `stage`, ascending by sequence number. Empty if the
    /// stage has never produced output.
    pub async fn list(&self, stage: StageKind) -> Result<Vec<Artifact>, StoreError> {
        let _gate = self.gate.read().await;
        let stage_dir = self.stage_dir(stage);
        let mut out = Vec::new();
        for (seq, path) in scan_sequences(&stage_dir).await? {
            out.push(read_artifact(&path, stage, seq).await?);
        }
        Ok(out)
    }
}

fn file_name(sequence_id: u64) -> String {
    format!("{sequence_id:020}.json")
}

fn parse_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(".json")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Sequence numbers present in `dir`, ascending. A missing directory is empty.
async fn scan_sequences(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::unavailable(dir, e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::unavailable(dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if fsio::is_hidden(name) {
            continue;
        }
        if let Some(seq) = parse_file_name(name) {
            found.push((seq, entry.path()));
        }
    }
    found.sort_unstable_by_key(|&(seq, _)| seq);
    Ok(found)
}

async fn read_artifact(path: &Path, stage: StageKind, sequence_id: u64) -> Result<Artifact, StoreError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(format!("{stage}#{sequence_id}")));
        }
        Err(e) => return Err(StoreError::unavailable(path, e)),
    };
    let artifact: Artifact =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::corrupt(path, e))?;
    if artifact.stage_kind != stage || artifact.sequence_id != sequence_id {
        return Err(StoreError::corrupt(
            path,
            format!(
                "file holds {} but is stored as {stage}#{sequence_id}",
                artifact.label()
            ),
        ));
    }
    debug!(artifact = %artifact.label(), "artifact loaded");
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Workspace;
    use serde_json::json;

    #[tokio::test]
    async fn sequences_start_at_one_and_increase() {
        let dir = tempfile::tempdir().unwrap();
        let store = Workspace::open(dir.path()).artifacts();

        let a = store.append(StageKind::Extract, json!({"questions": []})).await.unwrap();
        let b = store.append(StageKind::Extract, json!({"questions": []})).await.unwrap();
        let t = store.append(StageKind::Transcribe, json!({"text": "x"})).await.unwrap();
        assert_eq!((a.sequence_id, b.sequence_id, t.sequence_id), (1, 2, 1));

        let latest = store.latest(StageKind::Extract).await.unwrap();
        assert_eq!(latest, b);
        assert_eq!(store.get(StageKind::Extract, 1).await.unwrap(), a);
    }

    #[tokio::test]
    async fn concurrent_appends_get_distinct_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let store = Workspace::open(dir.path()).artifacts();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.append(StageKind::Answer, json!({"n": i})).await })
            })
            .collect();
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap().unwrap().sequence_id);
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=16).collect::<Vec<_>>());

        let latest = store.latest(StageKind::Answer).await.unwrap();
        assert_eq!(latest.sequence_id, 16);
        assert_eq!(store.list(StageKind::Answer).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn external_writer_collision_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let store = Workspace::open(dir.path()).artifacts();
        store.append(StageKind::Extract, json!({"questions": []})).await.unwrap();

        // A foreign process claimed seq 2 and 3 without going through this store.
        let stage_dir = dir.path().join("data/artifacts/extract");
        for seq in [2u64, 3] {
            let foreign = Artifact {
                stage_kind: StageKind::Extract,
                sequence_id: seq,
                created_at: Utc::now(),
                payload: json!({"questions": []}),
            };
            std::fs::write(stage_dir.join(file_name(seq)), serde_json::to_vec(&foreign).unwrap())
                .unwrap();
        }

        let next = store.append(StageKind::Extract, json!({"questions": []})).await.unwrap();
        assert_eq!(next.sequence_id, 4);
    }

    #[tokio::test]
    async fn empty_stage_is_not_found_and_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Workspace::open(dir.path()).artifacts();
        let err = store.latest(StageKind::Answer).await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {err}");
        assert!(store.list(StageKind::Answer).await.unwrap().is_empty());
        assert!(store.get(StageKind::Answer, 7).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unparseable_file_is_corrupt_not_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Workspace::open(dir.path()).artifacts();
        let stage_dir = dir.path().join("data/artifacts/extract");
        std::fs::create_dir_all(&stage_dir).unwrap();
        std::fs::write(stage_dir.join(file_name(1)), b"{not json").unwrap();

        let err = store.latest(StageKind::Extract).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn misplaced_artifact_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Workspace::open(dir.path()).artifacts();
        let a = store.append(StageKind::Extract, json!({"questions": []})).await.unwrap();
        let stage_dir = dir.path().join("data/artifacts/extract");
        std::fs::copy(stage_dir.join(file_name(a.sequence_id)), stage_dir.join(file_name(5)))
            .unwrap();

        let err = store.get(StageKind::Extract, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn temp_and_foreign_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Workspace::open(dir.path()).artifacts();
        let stage_dir = dir.path().join("data/artifacts/transcribe");
        std::fs::create_dir_all(&stage_dir).unwrap();
        std::fs::write(stage_dir.join(".tmp-abc.json"), b"partial").unwrap();
        std::fs::write(stage_dir.join("notes.txt"), b"hi").unwrap();

        assert!(store.list(StageKind::Transcribe).await.unwrap().is_empty());
        let a = store.append(StageKind::Transcribe, json!({"text": "x"})).await.unwrap();
        assert_eq!(a.sequence_id, 1);
    }

    #[tokio::test]
    async fn unusable_root_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").unwrap();
        let store = Workspace::open(&file).artifacts();

        let err = store.append(StageKind::Extract, json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }), "unexpected error: {err}");
        let err = store.latest(StageKind::Extract).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable { .. }), "unexpected error: {err}");
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(file_name(42), "00000000000000000042.json");
        assert_eq!(parse_file_name("00000000000000000042.json"), Some(42));
        assert_eq!(parse_file_name("42.json"), None);
        assert_eq!(parse_file_name(".tmp-x.json"), None);
    }
}
