//! Answer stage: draft a cited answer for every extracted question.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use llminister_core::{
    Answer, AnswerData, Citation, IncomingQuestion, QuestionBatch, Sentence, Source, StageKind,
};
use llminister_pipeline::{StageInput, StageWorker, WorkerError};
use serde::Deserialize;
use tracing::{debug, info};

use crate::knowledge::{Hit, KnowledgeBase};
use crate::llm::{LanguageModel, strip_code_fences};

const DEFAULT_TOP_K: usize = 5;
const DEFAULT_CONCURRENCY: usize = 4;

// ── Prompt templates ──

const SYSTEM_PROMPT: &str = "\
Je bent een assistent van de minister van Economische Zaken. Je schrijft conceptantwoorden \
op Kamervragen, in het Nederlands, formeel, in de ik-vorm van de minister.

Antwoord ALLEEN met een JSON-object, zonder markdown en zonder toelichting:
{\"sentences\": [{\"text\": \"een zin van het antwoord\", \"citations\": [\"S1\"]}]}

Baseer elke bewering uitsluitend op de meegegeven bronnen en verwijs per zin naar de \
bron-id's waarop de zin steunt. Gebruik geen andere id's dan die in de bronnen staan. \
Zijn er geen relevante bronnen, zeg dat dan in één zin zonder bronverwijzing. \
Houd het antwoord bondig: ongeveer 100 tot 200 woorden.";

fn build_user_prompt(question: &str, hits: &[Hit<'_>]) -> String {
    let mut prompt = format!("Vraag: {question}\n\n");
    if hits.is_empty() {
        prompt.push_str("Er zijn geen bronnen gevonden in de kennisbank.\n");
        return prompt;
    }
    prompt.push_str("Bronnen:\n\n");
    for hit in hits {
        prompt.push_str(&format!(
            "[{id}] {title}, p. {page}\n{content}\n\n",
            id = hit.source.id,
            title = hit.source.title,
            page = hit.source.page,
            content = hit.page.content,
        ));
    }
    prompt
}

// ── Worker ──

pub struct AnswerWorker {
    llm: Arc<dyn LanguageModel>,
    knowledge: Arc<KnowledgeBase>,
    top_k: usize,
    /// Questions answered at the same time.
    concurrency: usize,
}

#[derive(Deserialize)]
struct Draft {
    sentences: Vec<DraftSentence>,
}

#[derive(Deserialize)]
struct DraftSentence {
    text: String,
    #[serde(default)]
    citations: Vec<String>,
}

impl AnswerWorker {
    pub fn new(llm: Arc<dyn LanguageModel>, knowledge: Arc<KnowledgeBase>) -> Self {
        Self {
            llm,
            knowledge,
            top_k: DEFAULT_TOP_K,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    async fn answer(&self, question: &IncomingQuestion) -> Result<AnswerData, WorkerError> {
        let hits = self.knowledge.search(&question.text, self.top_k);
        debug!(question = %question.text, sources = hits.len(), "sources retrieved");

        let raw = self
            .llm
            .complete(SYSTEM_PROMPT, &build_user_prompt(&question.text, &hits))
            .await?;
        let sources: Vec<Source> = hits.into_iter().map(|h| h.source).collect();
        build_answer(&raw, sources)
    }
}

/// Turn the model's sentence list into a validated answer. A citation of an
/// id that was not offered fails the worker instead of producing an answer
/// the coordinator would reject.
fn build_answer(raw: &str, sources: Vec<Source>) -> Result<AnswerData, WorkerError> {
    let draft: Draft = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| WorkerError::InvalidResponse(format!("expected answer sentences: {e}")))?;

    let mut sentences = Vec::with_capacity(draft.sentences.len());
    for s in draft.sentences {
        let text = s.text.trim().to_string();
        if text.is_empty() {
            continue;
        }
        let mut citations = Vec::new();
        for id in s.citations {
            let Some(source) = sources.iter().find(|src| src.id == id.trim()) else {
                return Err(WorkerError::InvalidResponse(format!(
                    "answer cites unknown source {id:?}"
                )));
            };
            citations.push(Citation::to_source(source));
        }
        sentences.push(Sentence { text, citations });
    }
    if sentences.is_empty() {
        return Err(WorkerError::InvalidResponse("answer has no sentences".into()));
    }

    let text = sentences
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    AnswerData::new(text, sources, sentences).map_err(|e| WorkerError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl StageWorker for AnswerWorker {
    async fn run(&self, stage: StageKind, input: &StageInput) -> Result<serde_json::Value, WorkerError> {
        let artifact = input.artifact()?;
        let batch: QuestionBatch = artifact
            .decode()
            .map_err(|e| WorkerError::Input(format!("{}: {e}", artifact.label())))?;

        // `buffered` keeps the output in question order.
        let answered: Vec<IncomingQuestion> = stream::iter(batch.questions)
            .map(|question| async move {
                let data = self.answer(&question).await?;
                Ok::<_, WorkerError>(IncomingQuestion {
                    answer: Some(Answer::Structured(data)),
                    ..question
                })
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        info!(stage = %stage, input = %artifact.label(), count = answered.len(), "answers drafted");

        serde_json::to_value(QuestionBatch { questions: answered })
            .map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }
}
