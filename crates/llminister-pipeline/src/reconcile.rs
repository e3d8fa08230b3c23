//! Question reconciliation engine: the only writer of the working set.
//!
//! Pipeline output and user edits both go through here, one operation at a
//! time per workspace root: every write holds [`Workspace::lock_writer`], so
//! engines in other handles or other processes queue behind it. Field
//! precedence lives in [`llminister_core::merge`]; this module adds matching,
//! validation and all-or-nothing persistence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use llminister_core::{
    IncomingQuestion, MergeOutcome, Question, QuestionPatch, apply_patch, merge_into,
    new_question, normalize_question,
};
use llminister_store::{QuestionStore, StoreError, Workspace};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("question {0} not found")]
    NotFound(Uuid),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("merge conflict: {0}")]
    MergeConflict(String),
}

/// Per-record result of a reconcile, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub outcomes: Vec<MergeOutcome>,
}

impl ReconcileReport {
    pub fn inserted(&self) -> usize {
        self.count(|o| matches!(o, MergeOutcome::Inserted(_)))
    }

    pub fn updated(&self) -> usize {
        self.count(|o| matches!(o, MergeOutcome::Updated(_)))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|o| matches!(o, MergeOutcome::Unchanged(_)))
    }

    fn count(&self, pred: impl Fn(&MergeOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

/// Check a batch before anything is merged. Any record without question text
/// rejects the whole batch.
pub fn validate_batch(incoming: &[IncomingQuestion]) -> Result<(), ReconcileError> {
    for (index, record) in incoming.iter().enumerate() {
        if record.match_key().is_empty() {
            return Err(ReconcileError::InvalidRecord(format!(
                "record {index} has no question text"
            )));
        }
    }
    Ok(())
}

pub struct ReconcileEngine {
    workspace: Workspace,
    questions: Arc<QuestionStore>,
}

impl ReconcileEngine {
    pub fn new(workspace: &Workspace) -> Self {
        Self {
            workspace: workspace.clone(),
            questions: workspace.questions(),
        }
    }

    /// Merge a batch of pipeline records into the working set.
    ///
    /// Records are applied in order, so a later record sees an earlier one's
    /// insert or update. If persisting fails part-way, questions already
    /// written are restored before the error is returned.
    pub async fn reconcile(
        &self,
        incoming: &[IncomingQuestion],
    ) -> Result<ReconcileReport, ReconcileError> {
        validate_batch(incoming)?;
        let _writer = self.workspace.lock_writer().await?;

        let mut working = self.questions.get_all().await?;
        let mut by_key: HashMap<String, usize> = working
            .iter()
            .enumerate()
            .map(|(i, q)| (q.match_key(), i))
            .collect();

        let now = Utc::now();
        let mut report = ReconcileReport::default();
        // First-touch snapshot of every question this batch changes; `None` for inserts.
        let mut prior: Vec<(Uuid, Option<Question>)> = Vec::new();

        for record in incoming {
            let key = record.match_key();
            let outcome = match by_key.get(&key) {
                Some(&i) => {
                    let before = working[i].clone();
                    if merge_into(&mut working[i], record, now) {
                        if !prior.iter().any(|(id, _)| *id == before.id) {
                            prior.push((before.id, Some(before)));
                        }
                        MergeOutcome::Updated(working[i].id)
                    } else {
                        MergeOutcome::Unchanged(working[i].id)
                    }
                }
                None => {
                    let question = new_question(record, now);
                    let id = question.id;
                    prior.push((id, None));
                    by_key.insert(key, working.len());
                    working.push(question);
                    MergeOutcome::Inserted(id)
                }
            };
            debug!(?outcome, text = %record.text, "record reconciled");
            report.outcomes.push(outcome);
        }

        for (n, (id, _)) in prior.iter().enumerate() {
            let Some(question) = working.iter().find(|q| q.id == *id) else {
                continue;
            };
            if let Err(e) = self.questions.upsert(question).await {
                warn!(error = %e, written = n, "reconcile write failed, rolling back");
                self.roll_back(&prior[..n]).await;
                return Err(e.into());
            }
        }

        info!(
            inserted = report.inserted(),
            updated = report.updated(),
            unchanged = report.unchanged(),
            "batch reconciled"
        );
        Ok(report)
    }

    async fn roll_back(&self, written: &[(Uuid, Option<Question>)]) {
        for (id, before) in written.iter().rev() {
            let result = match before {
                Some(question) => self.questions.upsert(question).await,
                None => self.questions.delete(*id).await,
            };
            if let Err(e) = result {
                warn!(question = %id, error = %e, "rollback of question failed");
            }
        }
    }

    /// Apply a user edit to one question, addressed by id.
    pub async fn apply_user_edit(
        &self,
        id: Uuid,
        patch: QuestionPatch,
    ) -> Result<Question, ReconcileError> {
        let _writer = self.workspace.lock_writer().await?;
        let working = self.questions.get_all().await?;
        let Some(mut question) = working.iter().find(|q| q.id == id).cloned() else {
            return Err(ReconcileError::NotFound(id));
        };

        if let Some(expected) = patch.expected_updated_at
            && expected != question.updated_at
        {
            return Err(ReconcileError::MergeConflict(format!(
                "question {id} was modified at {}, edit is based on {expected}",
                question.updated_at
            )));
        }

        if let Some(text) = &patch.text {
            let key = normalize_question(text);
            if key.is_empty() {
                return Err(ReconcileError::InvalidRecord(
                    "question text cannot be empty".into(),
                ));
            }
            if let Some(other) = working.iter().find(|q| q.id != id && q.match_key() == key) {
                return Err(ReconcileError::MergeConflict(format!(
                    "question {} already has this text",
                    other.id
                )));
            }
        }

        if patch.is_empty() {
            return Ok(question);
        }

        apply_patch(&mut question, patch, Utc::now());
        self.questions.upsert(&question).await?;
        info!(question = %id, status = %question.status, "question edited");
        Ok(question)
    }

    /// Remove a question. A later matching pipeline record inserts a new one.
    pub async fn delete(&self, id: Uuid) -> Result<(), ReconcileError> {
        let _writer = self.workspace.lock_writer().await?;
        self.questions.delete(id).await.map_err(|e| not_found(e, id))?;
        info!(question = %id, "question deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Question, ReconcileError> {
        self.questions.get(id).await.map_err(|e| not_found(e, id))
    }

    pub async fn list(&self) -> Result<Vec<Question>, ReconcileError> {
        Ok(self.questions.get_all().await?)
    }

    /// Clear artifacts and the working set together. Waits for any write in
    /// progress on this root; [`Workspace::reset`] takes the writer lock.
    pub async fn reset(&self) -> Result<(), ReconcileError> {
        self.workspace.reset().await?;
        Ok(())
    }
}

fn not_found(err: StoreError, id: Uuid) -> ReconcileError {
    match err {
        StoreError::NotFound(_) => ReconcileError::NotFound(id),
        other => other.into(),
    }
}
