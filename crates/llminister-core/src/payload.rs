//! Typed stage payloads stored inside artifacts.

use serde::{Deserialize, Serialize};

use crate::question::IncomingQuestion;

/// Output of the transcribe stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    /// Name of the uploaded media the transcript was made from.
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub utterances: Vec<Utterance>,
}

/// One speaker turn, with offsets in milliseconds from the start of the media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    pub speaker: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl Transcript {
    /// Render the transcript with `[HH:MM:SS] Speaker X:` prefixes, falling back
    /// to the plain text when no utterances were recorded.
    pub fn to_timestamped_text(&self) -> String {
        if self.utterances.is_empty() {
            return self.text.clone();
        }
        self.utterances
            .iter()
            .map(|u| {
                format!(
                    "[{}] Spreker {}: {}",
                    format_timestamp(u.start_ms),
                    u.speaker,
                    u.text.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Format a millisecond offset as `HH:MM:SS`.
pub fn format_timestamp(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Output of the extract and answer stages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuestionBatch {
    pub questions: Vec<IncomingQuestion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_formatting() {
        assert_eq!(format_timestamp(0), "00:00:00");
        assert_eq!(format_timestamp(61_500), "00:01:01");
        assert_eq!(format_timestamp(3_723_000), "01:02:03");
    }

    #[test]
    fn timestamped_text_prefixes_each_turn() {
        let transcript = Transcript {
            source: "debat.mp4".into(),
            text: "Goedemiddag. Wat is de rol van X?".into(),
            utterances: vec![
                Utterance {
                    speaker: "A".into(),
                    start_ms: 1_000,
                    end_ms: 2_000,
                    text: "Goedemiddag.".into(),
                },
                Utterance {
                    speaker: "B".into(),
                    start_ms: 75_000,
                    end_ms: 80_000,
                    text: " Wat is de rol van X? ".into(),
                },
            ],
        };
        assert_eq!(
            transcript.to_timestamped_text(),
            "[00:00:01] Spreker A: Goedemiddag.\n[00:01:15] Spreker B: Wat is de rol van X?"
        );
    }

    #[test]
    fn plain_transcript_falls_back_to_text() {
        let transcript = Transcript {
            source: "debat.mp4".into(),
            text: "Alleen tekst.".into(),
            utterances: vec![],
        };
        assert_eq!(transcript.to_timestamped_text(), "Alleen tekst.");
    }

    #[test]
    fn batch_parses_legacy_records() {
        let json = r#"{"questions": [{"question_text": "Wat is X?", "speaker": "A"}]}"#;
        let batch: QuestionBatch = serde_json::from_str(json).unwrap();
        assert_eq!(batch.questions[0].text, "Wat is X?");
        assert_eq!(batch.questions[0].answer, None);
    }
}
