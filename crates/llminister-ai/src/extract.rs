//! Extract stage: find the questions put to the minister in a transcript.

use std::sync::Arc;

use async_trait::async_trait;
use llminister_core::{IncomingQuestion, QuestionBatch, StageKind, Transcript};
use llminister_pipeline::{StageInput, StageWorker, WorkerError};
use serde::Deserialize;
use tracing::{info, warn};

use crate::llm::{LanguageModel, strip_code_fences};

/// Category every question can fall back to.
pub const DEFAULT_CATEGORY: &str = "Algemeen";

// ── Prompt templates ──

const SYSTEM_PROMPT: &str = "\
You analyse transcripts of Dutch parliamentary debates for the staff of a minister. \
Respond ONLY with a JSON array. No markdown fences, no explanation, just raw JSON.";

fn build_user_prompt(transcript: &str, categories: &[String], speakers: Option<&str>) -> String {
    let speakers = speakers
        .map(|list| format!("Speakers in order of their speaking slot:\n{list}\n\n"))
        .unwrap_or_default();
    format!(
        "List every question directed at the minister in the transcript below.\n\
         \n\
         Count both explicit questions (ending in a question mark) and implicit ones: \
         statements that clearly expect the minister to respond, such as requests for a \
         reflection, an explanation or a commitment (\"I would like to hear from the minister...\", \
         \"Does the minister share my concern...\").\n\
         \n\
         For each question return an object with:\n\
         - \"question_text\": the question or statement, as spoken\n\
         - \"timestamp\": when it was asked, as [HH:MM:SS]\n\
         - \"speaker\": the member of parliament, or their label (A, B, ...) if no name is known\n\
         - \"party\": the member's party, or \"\" if unknown\n\
         - \"category\": one of: {categories}\n\
         \n\
         {speakers}\
         Transcript:\n\
         {transcript}",
        categories = categories.join(", "),
    )
}

// ── Worker ──

pub struct ExtractWorker {
    llm: Arc<dyn LanguageModel>,
    categories: Vec<String>,
    speakers: Option<String>,
}

impl ExtractWorker {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm,
            categories: vec![DEFAULT_CATEGORY.to_string()],
            speakers: None,
        }
    }

    /// Categories offered to the model. [`DEFAULT_CATEGORY`] is always included.
    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        let mut categories: Vec<String> = categories
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if !categories.iter().any(|c| c == DEFAULT_CATEGORY) {
            categories.push(DEFAULT_CATEGORY.to_string());
        }
        self.categories = categories;
        self
    }

    /// Speaker list (one `Name (Party)` per line) to help attribute questions.
    pub fn with_speakers(mut self, speakers: String) -> Self {
        self.speakers = Some(speakers).filter(|s| !s.trim().is_empty());
        self
    }
}

#[async_trait]
impl StageWorker for ExtractWorker {
    async fn run(&self, stage: StageKind, input: &StageInput) -> Result<serde_json::Value, WorkerError> {
        let artifact = input.artifact()?;
        let transcript: Transcript = artifact
            .decode()
            .map_err(|e| WorkerError::Input(format!("{}: {e}", artifact.label())))?;

        let prompt = build_user_prompt(
            &transcript.to_timestamped_text(),
            &self.categories,
            self.speakers.as_deref(),
        );
        let raw = self.llm.complete(SYSTEM_PROMPT, &prompt).await?;
        let questions = parse_questions(&raw)?;
        info!(stage = %stage, input = %artifact.label(), count = questions.len(), "questions extracted");

        serde_json::to_value(QuestionBatch { questions })
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExtractionOutput {
    List(Vec<IncomingQuestion>),
    Wrapped { questions: Vec<IncomingQuestion> },
}

/// Parse model output into extract-stage records.
///
/// Records never carry an answer, so re-extraction cannot touch answers in
/// the working set. Blank records are dropped; a missing category becomes
/// [`DEFAULT_CATEGORY`].
pub fn parse_questions(raw: &str) -> Result<Vec<IncomingQuestion>, WorkerError> {
    let output: ExtractionOutput = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| WorkerError::InvalidResponse(format!("expected a JSON array of questions: {e}")))?;
    let records = match output {
        ExtractionOutput::List(records) | ExtractionOutput::Wrapped { questions: records } => records,
    };

    let total = records.len();
    let questions: Vec<IncomingQuestion> = records
        .into_iter()
        .filter(|q| !q.match_key().is_empty())
        .map(|mut q| {
            q.answer = None;
            if q.category.as_deref().is_none_or(|c| c.trim().is_empty()) {
                q.category = Some(DEFAULT_CATEGORY.to_string());
            }
            q
        })
        .collect();
    if questions.len() < total {
        warn!(dropped = total - questions.len(), "model returned records without question text");
    }
    Ok(questions)
}

/// Turn a speakers CSV (`name,<ignored>,party` with a header row) into the
/// `Name (Party)` list used in the prompt. Quoted fields may contain commas;
/// rows that do not parse or have no name are skipped.
pub fn speakers_from_csv(text: &str) -> String {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    reader
        .records()
        .filter_map(|record| match record {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "skipping unreadable speaker row");
                None
            }
        })
        .filter_map(|record| {
            let name = record.get(0).filter(|n| !n.is_empty())?;
            Some(match record.get(2).filter(|p| !p.is_empty()) {
                Some(party) => format!("{name} ({party})"),
                None => name.to_string(),
            })
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use chrono::Utc;
    use llminister_core::{Artifact, Utterance};
    use std::sync::Mutex;

    /// Returns a fixed completion and keeps the prompts it was sent.
    struct Canned {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.into(),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Canned {
        async fn complete(&self, _system: &str, user: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(user.to_string());
            Ok(self.reply.clone())
        }
    }

    fn transcript_artifact() -> StageInput {
        let transcript = Transcript {
            source: "debat.mp4".into(),
            text: String::new(),
            utterances: vec![Utterance {
                speaker: "A".into(),
                start_ms: 751_000,
                end_ms: 760_000,
                text: "Wat is de rol van X?".into(),
            }],
        };
        StageInput::Artifact(Artifact {
            stage_kind: StageKind::Transcribe,
            sequence_id: 1,
            created_at: Utc::now(),
            payload: serde_json::to_value(transcript).unwrap(),
        })
    }

    #[test]
    fn parses_fenced_legacy_records() {
        let raw = r#"```json
[
  {"question_text": "Wat is de rol van X?", "timestamp": "[00:12:31]", "speaker": "A", "party": "CDA", "category": "Economie"},
  {"question_text": "Hoe verhoudt Y zich tot Z?", "timestamp": "[00:14:02]", "speaker": "B", "party": ""}
]
```"#;
        let questions = parse_questions(raw).unwrap();
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].video_timestamp.as_deref(), Some("[00:12:31]"));
        assert_eq!(questions[1].category.as_deref(), Some(DEFAULT_CATEGORY));
    }

    #[test]
    fn extraction_never_carries_answers() {
        let raw = r#"[{"text": "Wat is X?", "answer": "Verzonnen."}]"#;
        assert_eq!(parse_questions(raw).unwrap()[0].answer, None);
    }

    #[test]
    fn wrapped_output_and_blank_records() {
        let raw = r#"{"questions": [{"text": "Wat is X?"}, {"text": "  "}]}"#;
        assert_eq!(parse_questions(raw).unwrap().len(), 1);
    }

    #[test]
    fn prose_is_an_error_not_an_empty_batch() {
        let err = parse_questions("Ik heb geen vragen gevonden.").unwrap_err();
        assert!(matches!(err, WorkerError::InvalidResponse(_)));
    }

    #[test]
    fn default_category_is_always_offered() {
        let llm = Canned::new("[]");
        let worker = ExtractWorker::new(llm).with_categories(vec!["Economie".into(), " ".into()]);
        assert_eq!(worker.categories, vec!["Economie", DEFAULT_CATEGORY]);
    }

    #[test]
    fn speakers_csv_becomes_prompt_list() {
        let csv = "naam,volgorde,partij\nA. Jansen,1,CDA\nB. de Boer,2,\n\n";
        assert_eq!(speakers_from_csv(csv), "A. Jansen (CDA)\nB. de Boer");
    }

    #[test]
    fn speakers_csv_keeps_quoted_commas() {
        let csv = "naam,volgorde,partij\n\"Jansen, A.\",3,CDA\n\"de Boer, B.\",4\n";
        assert_eq!(speakers_from_csv(csv), "Jansen, A. (CDA)\nde Boer, B.");
    }

    #[tokio::test]
    async fn worker_emits_question_batch() {
        let llm = Canned::new(r#"[{"question_text": "Wat is de rol van X?", "speaker": "A"}]"#);
        let worker = ExtractWorker::new(llm.clone()).with_speakers("A. Jansen (CDA)".into());

        let payload = worker
            .run(StageKind::Extract, &transcript_artifact())
            .await
            .unwrap();
        let batch: QuestionBatch = serde_json::from_value(payload).unwrap();
        assert_eq!(batch.questions[0].text, "Wat is de rol van X?");

        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[0].contains("[00:12:31] Spreker A: Wat is de rol van X?"));
        assert!(prompts[0].contains("A. Jansen (CDA)"));
        assert!(prompts[0].contains(DEFAULT_CATEGORY));
    }

    #[tokio::test]
    async fn media_input_is_rejected() {
        let worker = ExtractWorker::new(Canned::new("[]"));
        let input = StageInput::Media(llminister_pipeline::MediaRef::new("debat.mp4"));
        assert!(matches!(
            worker.run(StageKind::Extract, &input).await,
            Err(WorkerError::Input(_))
        ));
    }
}
