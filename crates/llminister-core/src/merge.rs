//! Field precedence rules for folding pipeline output into the working set.
//!
//! A pipeline run may re-emit a question the user has already worked on. The
//! rules below let a run enrich such a question without undoing that work:
//!
//! | Field | Incoming record wins when |
//! |---|---|
//! | `speaker`, `party`, `category`, `videoTimestamp` | existing value is empty |
//! | `answer` | the record carries an `answer` field at all (empty included) |
//! | `status`, `nextAction`, `personResponsible` | never |
//!
//! These functions are pure; locking and persistence live in the engine.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::match_key::normalize_question;
use crate::question::{IncomingQuestion, Question, QuestionPatch, QuestionStatus};

/// What reconciling one incoming record did to the working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(Uuid),
    Updated(Uuid),
    Unchanged(Uuid),
}

impl MergeOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Inserted(id) | Self::Updated(id) | Self::Unchanged(id) => *id,
        }
    }
}

/// Create a new working-set question from an unmatched incoming record.
pub fn new_question(incoming: &IncomingQuestion, now: DateTime<Utc>) -> Question {
    Question {
        id: Uuid::new_v4(),
        text: normalize_question(&incoming.text),
        speaker: provided(incoming.speaker.as_deref()),
        party: provided(incoming.party.as_deref()),
        category: provided(incoming.category.as_deref()),
        video_timestamp: provided(incoming.video_timestamp.as_deref()),
        status: QuestionStatus::Draft,
        answer: incoming.answer.clone().unwrap_or_default().normalized(),
        next_action: String::new(),
        person_responsible: String::new(),
        created_at: now,
        updated_at: now,
    }
}

/// Fold an incoming record into the existing question with the same match key.
///
/// Returns `true` if any field changed; `updated_at` is bumped only then.
pub fn merge_into(existing: &mut Question, incoming: &IncomingQuestion, now: DateTime<Utc>) -> bool {
    let mut changed = false;
    changed |= fill_if_empty(&mut existing.speaker, incoming.speaker.as_deref());
    changed |= fill_if_empty(&mut existing.party, incoming.party.as_deref());
    changed |= fill_if_empty(&mut existing.category, incoming.category.as_deref());
    changed |= fill_if_empty(&mut existing.video_timestamp, incoming.video_timestamp.as_deref());

    if let Some(answer) = &incoming.answer {
        let answer = answer.clone().normalized();
        if existing.answer != answer {
            existing.answer = answer;
            changed = true;
        }
    }

    if changed {
        existing.updated_at = now;
    }
    changed
}

/// Overwrite the fields named in a user patch. Identity checks (text
/// collisions, stale `expected_updated_at`) are the caller's job.
pub fn apply_patch(question: &mut Question, patch: QuestionPatch, now: DateTime<Utc>) {
    if let Some(text) = patch.text {
        question.text = normalize_question(&text);
    }
    if let Some(status) = patch.status {
        question.status = status;
    }
    if let Some(answer) = patch.answer {
        question.answer = answer.normalized();
    }
    if let Some(next_action) = patch.next_action {
        question.next_action = next_action;
    }
    if let Some(person) = patch.person_responsible {
        question.person_responsible = person;
    }
    question.updated_at = now;
}

fn provided(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

fn fill_if_empty(slot: &mut String, incoming: Option<&str>) -> bool {
    match incoming.map(str::trim) {
        Some(value) if !value.is_empty() && slot.trim().is_empty() => {
            *slot = value.to_string();
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::question::Answer;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + secs, 0).unwrap()
    }

    fn existing() -> Question {
        let mut incoming = IncomingQuestion::new("Wat is de rol van X?");
        incoming.party = Some("CDA".into());
        new_question(&incoming, t(0))
    }

    #[test]
    fn new_question_starts_as_draft() {
        let mut incoming = IncomingQuestion::new("  Wat is   de rol van X? ");
        incoming.speaker = Some(" A. Jansen ".into());
        let q = new_question(&incoming, t(0));
        assert_eq!(q.status, QuestionStatus::Draft);
        assert_eq!(q.text, "Wat is de rol van X?");
        assert_eq!(q.speaker, "A. Jansen");
        assert_eq!(q.answer, Answer::Empty);
        assert_eq!(q.created_at, q.updated_at);
    }

    #[test]
    fn provenance_is_filled_once() {
        let mut q = existing();
        let mut incoming = IncomingQuestion::new("Wat is de rol van X?");
        incoming.party = Some("D66".into());
        assert!(!merge_into(&mut q, &incoming, t(10)));
        assert_eq!(q.party, "CDA");
        assert_eq!(q.updated_at, t(0));

        q.party.clear();
        assert!(merge_into(&mut q, &incoming, t(20)));
        assert_eq!(q.party, "D66");
        assert_eq!(q.updated_at, t(20));
    }

    #[test]
    fn blank_incoming_provenance_does_not_fill() {
        let mut q = existing();
        let mut incoming = IncomingQuestion::new("Wat is de rol van X?");
        incoming.speaker = Some("   ".into());
        assert!(!merge_into(&mut q, &incoming, t(10)));
        assert_eq!(q.speaker, "");
    }

    #[test]
    fn absent_answer_never_erases() {
        let mut q = existing();
        q.answer = Answer::Text("Concept.".into());
        let incoming = IncomingQuestion::new("Wat is de rol van X?");
        assert!(!merge_into(&mut q, &incoming, t(10)));
        assert_eq!(q.answer, Answer::Text("Concept.".into()));
    }

    #[test]
    fn explicit_empty_answer_clears() {
        let mut q = existing();
        q.answer = Answer::Text("Concept.".into());
        let mut incoming = IncomingQuestion::new("Wat is de rol van X?");
        incoming.answer = Some(Answer::Text(String::new()));
        assert!(merge_into(&mut q, &incoming, t(10)));
        assert_eq!(q.answer, Answer::Empty);
    }

    #[test]
    fn carried_answer_overwrites() {
        let mut q = existing();
        q.answer = Answer::Text("Oud.".into());
        let mut incoming = IncomingQuestion::new("Wat is de rol van X?");
        incoming.answer = Some(Answer::Text("Nieuw.".into()));
        assert!(merge_into(&mut q, &incoming, t(10)));
        assert_eq!(q.answer.text(), "Nieuw.");
    }

    #[test]
    fn user_owned_fields_survive_merge() {
        let mut q = existing();
        q.status = QuestionStatus::Final;
        q.next_action = "Afstemmen met DG".into();
        q.person_responsible = "M. de Vries".into();
        let mut incoming = IncomingQuestion::new("Wat is de rol van X?");
        incoming.speaker = Some("A. Jansen".into());
        incoming.answer = Some(Answer::Text("Nieuw.".into()));
        merge_into(&mut q, &incoming, t(10));
        assert_eq!(q.status, QuestionStatus::Final);
        assert_eq!(q.next_action, "Afstemmen met DG");
        assert_eq!(q.person_responsible, "M. de Vries");
    }

    #[test]
    fn patch_overwrites_named_fields_only() {
        let mut q = existing();
        q.next_action = "Bellen".into();
        let patch = QuestionPatch {
            status: Some(QuestionStatus::Rewritten),
            answer: Some(Answer::Text("Herschreven antwoord.".into())),
            ..Default::default()
        };
        apply_patch(&mut q, patch, t(30));
        assert_eq!(q.status, QuestionStatus::Rewritten);
        assert_eq!(q.answer.text(), "Herschreven antwoord.");
        assert_eq!(q.next_action, "Bellen");
        assert_eq!(q.party, "CDA");
        assert_eq!(q.updated_at, t(30));
    }
}
