//! The seam between the coordinator and whatever produces a stage's payload.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use llminister_core::{Artifact, StageKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The provider accepted the request but reported a failure.
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider returned {status}: {body}")]
    Http { status: u16, body: String },
    /// The provider answered with something the worker cannot use.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    /// The stage input could not be read or decoded.
    #[error("unusable input: {0}")]
    Input(String),
}

/// Reference to uploaded media, the input of the transcribe stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    path: PathBuf,
}

impl MediaRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the media, used as the transcript's `source`.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// What a stage consumes: the uploaded media for transcribe, otherwise the
/// previous stage's artifact.
#[derive(Debug, Clone)]
pub enum StageInput {
    Media(MediaRef),
    Artifact(Artifact),
}

impl StageInput {
    pub fn artifact(&self) -> Result<&Artifact, WorkerError> {
        match self {
            Self::Artifact(artifact) => Ok(artifact),
            Self::Media(_) => Err(WorkerError::Input("expected an artifact, got media".into())),
        }
    }

    pub fn media(&self) -> Result<&MediaRef, WorkerError> {
        match self {
            Self::Media(media) => Ok(media),
            Self::Artifact(a) => Err(WorkerError::Input(format!(
                "expected media, got artifact {}",
                a.label()
            ))),
        }
    }
}

/// Produces the payload for one stage. Implementations must not write
/// artifacts themselves; the coordinator validates and stores what they return.
#[async_trait]
pub trait StageWorker: Send + Sync {
    async fn run(&self, stage: StageKind, input: &StageInput) -> Result<serde_json::Value, WorkerError>;
}
