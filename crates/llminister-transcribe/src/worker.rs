use std::sync::Arc;

use async_trait::async_trait;
use llminister_core::StageKind;
use llminister_pipeline::{StageInput, StageWorker, WorkerError};
use tracing::info;

use crate::client::TranscriptionClient;

/// Reads the run's media file and has it transcribed.
pub struct TranscribeWorker {
    client: Arc<TranscriptionClient>,
}

impl TranscribeWorker {
    pub fn new(client: Arc<TranscriptionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StageWorker for TranscribeWorker {
    async fn run(&self, stage: StageKind, input: &StageInput) -> Result<serde_json::Value, WorkerError> {
        let media = input.media()?;
        let bytes = tokio::fs::read(media.path())
            .await
            .map_err(|e| WorkerError::Input(format!("cannot read {}: {e}", media.path().display())))?;
        if bytes.is_empty() {
            return Err(WorkerError::Input(format!("{} is empty", media.path().display())));
        }

        let transcript = self.client.transcribe(&media.name(), bytes).await?;
        info!(
            stage = %stage,
            source = %transcript.source,
            utterances = transcript.utterances.len(),
            "transcript received"
        );
        serde_json::to_value(transcript).map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TranscriptionConfig;
    use llminister_pipeline::MediaRef;

    fn worker() -> TranscribeWorker {
        // Unroutable: these tests must fail before any request is made.
        let mut config = TranscriptionConfig::new("key");
        config.base_url = "http://127.0.0.1:9".into();
        TranscribeWorker::new(Arc::new(TranscriptionClient::new(config)))
    }

    #[tokio::test]
    async fn missing_media_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = StageInput::Media(MediaRef::new(dir.path().join("ontbreekt.mp4")));
        let err = worker().run(StageKind::Transcribe, &input).await.unwrap_err();
        assert!(matches!(err, WorkerError::Input(_)));
    }

    #[tokio::test]
    async fn empty_media_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leeg.mp4");
        std::fs::write(&path, b"").unwrap();
        let err = worker()
            .run(StageKind::Transcribe, &StageInput::Media(MediaRef::new(path)))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Input(_)));
    }
}
