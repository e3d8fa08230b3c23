//! Pipeline stage kinds and their fixed order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of the pipeline. Artifacts are tagged with the stage that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Transcribe,
    Extract,
    Answer,
}

#[derive(Debug, Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl StageKind {
    /// All stages in execution order.
    pub const ORDER: [StageKind; 3] = [Self::Transcribe, Self::Extract, Self::Answer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Extract => "extract",
            Self::Answer => "answer",
        }
    }

    /// The stage whose output this stage consumes. `None` for the first stage,
    /// which consumes the uploaded media instead of an artifact.
    pub fn previous(&self) -> Option<StageKind> {
        match self {
            Self::Transcribe => None,
            Self::Extract => Some(Self::Transcribe),
            Self::Answer => Some(Self::Extract),
        }
    }

    pub fn next(&self) -> Option<StageKind> {
        match self {
            Self::Transcribe => Some(Self::Extract),
            Self::Extract => Some(Self::Answer),
            Self::Answer => None,
        }
    }

    /// Whether this stage's output carries question records for reconciliation.
    pub fn yields_questions(&self) -> bool {
        matches!(self, Self::Extract | Self::Answer)
    }

    /// Stages from `from` through `to` inclusive, in order. Empty if `to` precedes `from`.
    pub fn range(from: StageKind, to: StageKind) -> Vec<StageKind> {
        Self::ORDER
            .iter()
            .copied()
            .filter(|s| *s >= from && *s <= to)
            .collect()
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transcribe" | "transcript" | "transcripts" => Ok(Self::Transcribe),
            "extract" | "questions" => Ok(Self::Extract),
            "answer" | "answers" => Ok(Self::Answer),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_follows_previous_links() {
        for pair in StageKind::ORDER.windows(2) {
            assert_eq!(pair[1].previous(), Some(pair[0]));
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(StageKind::Transcribe.previous(), None);
        assert_eq!(StageKind::Answer.next(), None);
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        assert_eq!(
            StageKind::range(StageKind::Extract, StageKind::Answer),
            vec![StageKind::Extract, StageKind::Answer]
        );
        assert_eq!(
            StageKind::range(StageKind::Transcribe, StageKind::Transcribe),
            vec![StageKind::Transcribe]
        );
        assert!(StageKind::range(StageKind::Answer, StageKind::Extract).is_empty());
    }

    #[test]
    fn parses_directory_style_names() {
        assert_eq!("transcripts".parse::<StageKind>().unwrap(), StageKind::Transcribe);
        assert_eq!("Questions".parse::<StageKind>().unwrap(), StageKind::Extract);
        assert_eq!("answer".parse::<StageKind>().unwrap(), StageKind::Answer);
        assert!("video".parse::<StageKind>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&StageKind::Extract).unwrap();
        assert_eq!(json, "\"extract\"");
        let back: StageKind = serde_json::from_str("\"answer\"").unwrap();
        assert_eq!(back, StageKind::Answer);
    }
}
