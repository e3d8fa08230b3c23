//! Question records: the working-set entity, the pipeline's incoming record,
//! and the user edit patch.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::citation::AnswerData;
use crate::match_key::normalize_question;

/// Workflow status of a question. Not strictly ordered: users may move back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuestionStatus {
    #[default]
    Draft,
    #[serde(alias = "Herschreven", alias = "InProgress")]
    Rewritten,
    #[serde(alias = "Definitief", alias = "Completed")]
    Final,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Rewritten => "Rewritten",
            Self::Final => "Final",
        }
    }
}

impl fmt::Display for QuestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "rewritten" | "herschreven" | "inprogress" => Ok(Self::Rewritten),
            "final" | "definitief" | "completed" => Ok(Self::Final),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// A question's answer: nothing yet, free text, or text with citations.
///
/// Serialized untagged: `null`, a JSON string, or an [`AnswerData`] object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    #[default]
    Empty,
    Text(String),
    Structured(AnswerData),
}

impl Answer {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.trim().is_empty(),
            Self::Structured(_) => false,
        }
    }

    /// Plain text of the answer, whichever form it takes.
    pub fn text(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::Text(text) => text,
            Self::Structured(data) => data.text(),
        }
    }

    /// Collapse blank text to [`Answer::Empty`] so equal answers compare equal.
    pub fn normalized(self) -> Self {
        if self.is_empty() { Self::Empty } else { self }
    }
}

/// A tracked question in the working set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: Uuid,
    pub text: String,
    #[serde(default)]
    pub speaker: String,
    #[serde(default)]
    pub party: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub video_timestamp: String,
    #[serde(default)]
    pub status: QuestionStatus,
    #[serde(default)]
    pub answer: Answer,
    #[serde(default)]
    pub next_action: String,
    #[serde(default)]
    pub person_responsible: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Question {
    /// Reconciliation identity of this question.
    pub fn match_key(&self) -> String {
        normalize_question(&self.text)
    }
}

/// A question record as produced by the extract or answer stage.
///
/// Carries no status or workflow fields: a pipeline run cannot set them.
/// `answer` distinguishes "field absent" (`None`) from "explicitly empty"
/// (`Some(Answer::Empty)`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawIncomingQuestion")]
pub struct IncomingQuestion {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
}

impl IncomingQuestion {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn match_key(&self) -> String {
        normalize_question(&self.text)
    }
}

/// Wire shape accepted for incoming records, including the field names used
/// by older extraction output (`question_text`, `timestamp`, `draftAnswer`).
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawIncomingQuestion {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "question_text")]
    question_text: Option<String>,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    party: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    video_timestamp: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, deserialize_with = "present")]
    answer: Option<Answer>,
    #[serde(default, deserialize_with = "present")]
    draft_answer: Option<Answer>,
}

impl From<RawIncomingQuestion> for IncomingQuestion {
    fn from(raw: RawIncomingQuestion) -> Self {
        let text = raw
            .text
            .filter(|t| !t.trim().is_empty())
            .or(raw.question_text)
            .unwrap_or_default();
        Self {
            text,
            speaker: raw.speaker,
            party: raw.party,
            category: raw.category,
            video_timestamp: raw.video_timestamp.or(raw.timestamp),
            answer: raw.answer.or(raw.draft_answer),
        }
    }
}

/// A direct user edit, addressed by question id. `None` leaves a field alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<QuestionStatus>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub answer: Option<Answer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person_responsible: Option<String>,
    /// The `updatedAt` the editor last saw. A mismatch is a conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_updated_at: Option<DateTime<Utc>>,
}

impl QuestionPatch {
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.status.is_none()
            && self.answer.is_none()
            && self.next_action.is_none()
            && self.person_responsible.is_none()
    }
}

/// Deserialize a field that is present (even as `null`) into `Some`.
/// Combined with `#[serde(default)]`, an absent field stays `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Answer>, D::Error>
where
    D: Deserializer<'de>,
{
    Answer::deserialize(deserializer).map(Some)
}
