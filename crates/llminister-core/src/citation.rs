//! Citation model: generated answer text bound to the source passages it was
//! derived from.
//!
//! An [`AnswerData`] can only exist if every citation in its sentences resolves
//! to one of its own sources. The check runs in [`AnswerData::new`] and, through
//! `serde(try_from)`, whenever an answer is parsed from an artifact or a stored
//! question. Consumers such as the source viewer can therefore call
//! [`resolve`] without handling a missing source as a normal case.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CitationError {
    #[error("citation references unknown source {source_id:?}")]
    DanglingCitation { source_id: String },
}

/// A referenced document passage (one page of a knowledge-base document).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub title: String,
    pub page: u32,
    pub file_path: String,
    /// Retrieval score, for ranking and display only.
    #[serde(default)]
    pub similarity_score: f32,
}

/// Pointer from a sentence to a source page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub page: u32,
}

impl Citation {
    /// Build a citation that mirrors the given source's title and page.
    pub fn to_source(source: &Source) -> Self {
        Self {
            source_id: source.id.clone(),
            title: source.title.clone(),
            page: source.page,
        }
    }
}

/// One unit of answer text with zero or more citations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub text: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// Structured answer: text plus the sources and per-sentence citations behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAnswerData")]
pub struct AnswerData {
    text: String,
    sources: Vec<Source>,
    sentences: Vec<Sentence>,
}

#[derive(Deserialize)]
struct RawAnswerData {
    #[serde(default)]
    text: String,
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    sentences: Vec<Sentence>,
}

impl TryFrom<RawAnswerData> for AnswerData {
    type Error = CitationError;

    fn try_from(raw: RawAnswerData) -> Result<Self, Self::Error> {
        AnswerData::new(raw.text, raw.sources, raw.sentences)
    }
}

impl AnswerData {
    /// Build an answer, rejecting it if any citation has no matching source.
    pub fn new(
        text: impl Into<String>,
        sources: Vec<Source>,
        sentences: Vec<Sentence>,
    ) -> Result<Self, CitationError> {
        for citation in sentences.iter().flat_map(|s| &s.citations) {
            resolve(citation, &sources)?;
        }
        Ok(Self {
            text: text.into(),
            sources,
            sentences,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn sentences(&self) -> &[Sentence] {
        &self.sentences
    }

    /// Sources referenced by at least one sentence, in order of first citation.
    pub fn cited_sources(&self) -> Vec<&Source> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for citation in self.sentences.iter().flat_map(|s| &s.citations) {
            if seen.insert(citation.source_id.as_str())
                && let Some(source) = self.sources.iter().find(|s| s.id == citation.source_id)
            {
                out.push(source);
            }
        }
        out
    }

    /// Resolve a citation against this answer's own sources.
    pub fn resolve(&self, citation: &Citation) -> Result<&Source, CitationError> {
        resolve(citation, &self.sources)
    }
}

/// Look up the source a citation points at.
pub fn resolve<'a>(citation: &Citation, sources: &'a [Source]) -> Result<&'a Source, CitationError> {
    sources
        .iter()
        .find(|s| s.id == citation.source_id)
        .ok_or_else(|| CitationError::DanglingCitation {
            source_id: citation.source_id.clone(),
        })
}
