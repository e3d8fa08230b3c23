//! HTTP client for the AssemblyAI transcription API.

use std::time::Duration;

use llminister_core::{Transcript, Utterance};
use llminister_pipeline::WorkerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_BASE_URL: &str = "https://api.assemblyai.com/v2";

#[derive(Error, Debug)]
pub enum TranscribeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("transcription failed: {0}")]
    Failed(String),
    #[error("transcription not finished after {polls} polls")]
    TimedOut { polls: u32 },
}

impl From<TranscribeError> for WorkerError {
    fn from(err: TranscribeError) -> Self {
        match err {
            TranscribeError::Server { status, body } => WorkerError::Http { status, body },
            other => WorkerError::Provider(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub api_key: String,
    pub base_url: String,
    pub language_code: String,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl TranscriptionConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            language_code: "nl".to_string(),
            poll_interval: Duration::from_secs(5),
            max_polls: 60,
        }
    }
}

pub struct TranscriptionClient {
    client: reqwest::Client,
    config: TranscriptionConfig,
}

#[derive(Deserialize)]
struct UploadResponse {
    upload_url: String,
}

#[derive(Serialize)]
struct TranscriptRequest<'a> {
    audio_url: &'a str,
    language_code: &'a str,
    speaker_labels: bool,
}

#[derive(Debug, Deserialize)]
struct TranscriptJob {
    id: String,
    status: JobStatus,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    utterances: Option<Vec<RawUtterance>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JobStatus {
    Queued,
    Processing,
    Completed,
    Error,
}

#[derive(Debug, Deserialize)]
struct RawUtterance {
    speaker: String,
    start: u64,
    end: u64,
    text: String,
}

impl TranscriptionClient {
    pub fn new(mut config: TranscriptionConfig) -> Self {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Upload media, request a speaker-labelled transcript and wait for it.
    ///
    /// `source` is recorded in the transcript as the media's name.
    pub async fn transcribe(&self, source: &str, media: Vec<u8>) -> Result<Transcript, TranscribeError> {
        let upload_url = self.upload(media).await?;
        let job = self.submit(&upload_url).await?;
        let job = self.wait(job).await?;
        into_transcript(source, job)
    }

    async fn upload(&self, media: Vec<u8>) -> Result<String, TranscribeError> {
        let url = format!("{}/upload", self.config.base_url);
        info!(bytes = media.len(), "uploading media for transcription");
        let resp = self
            .client
            .post(&url)
            .header("authorization", &self.config.api_key)
            .header("content-type", "application/octet-stream")
            .body(media)
            .send()
            .await?;
        let upload: UploadResponse = check(resp).await?.json().await?;
        Ok(upload.upload_url)
    }

    async fn submit(&self, audio_url: &str) -> Result<TranscriptJob, TranscribeError> {
        let url = format!("{}/transcript", self.config.base_url);
        let request = TranscriptRequest {
            audio_url,
            language_code: &self.config.language_code,
            speaker_labels: true,
        };
        let resp = self
            .client
            .post(&url)
            .header("authorization", &self.config.api_key)
            .json(&request)
            .send()
            .await?;
        let job: TranscriptJob = check(resp).await?.json().await?;
        info!(job = %job.id, "transcription job submitted");
        Ok(job)
    }

    async fn wait(&self, mut job: TranscriptJob) -> Result<TranscriptJob, TranscribeError> {
        let url = format!("{}/transcript/{}", self.config.base_url, job.id);
        let mut polls = 0;
        while matches!(job.status, JobStatus::Queued | JobStatus::Processing) {
            if polls >= self.config.max_polls {
                return Err(TranscribeError::TimedOut { polls });
            }
            tokio::time::sleep(self.config.poll_interval).await;
            polls += 1;
            let resp = self
                .client
                .get(&url)
                .header("authorization", &self.config.api_key)
                .send()
                .await?;
            job = check(resp).await?.json().await?;
            debug!(job = %job.id, status = ?job.status, polls, "transcription status");
        }
        Ok(job)
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, TranscribeError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TranscribeError::Server {
        status: status.as_u16(),
        body,
    })
}

fn into_transcript(source: &str, job: TranscriptJob) -> Result<Transcript, TranscribeError> {
    match job.status {
        JobStatus::Completed => {}
        JobStatus::Error => {
            return Err(TranscribeError::Failed(
                job.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        JobStatus::Queued | JobStatus::Processing => {
            return Err(TranscribeError::Failed(format!("job {} not finished", job.id)));
        }
    }
    let Some(text) = job.text else {
        return Err(TranscribeError::Failed(format!("job {} completed without text", job.id)));
    };
    let utterances = job
        .utterances
        .unwrap_or_default()
        .into_iter()
        .map(|u| Utterance {
            speaker: u.speaker,
            start_ms: u.start,
            end_ms: u.end,
            text: u.text,
        })
        .collect();
    Ok(Transcript {
        source: source.to_string(),
        text,
        utterances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn job(json: &str) -> TranscriptJob {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn completed_job_maps_utterances() {
        let transcript = into_transcript(
            "debat.mp4",
            job(r#"{
                "id": "j1",
                "status": "completed",
                "text": "Goedemiddag. Wat is de rol van X?",
                "utterances": [
                    {"speaker": "A", "start": 0, "end": 900, "text": "Goedemiddag.", "confidence": 0.9},
                    {"speaker": "B", "start": 1000, "end": 2500, "text": "Wat is de rol van X?"}
                ]
            }"#),
        )
        .unwrap();
        assert_eq!(transcript.source, "debat.mp4");
        assert_eq!(transcript.utterances.len(), 2);
        assert_eq!(transcript.utterances[1].speaker, "B");
        assert_eq!(transcript.utterances[1].start_ms, 1000);
    }

    #[test]
    fn errored_job_carries_provider_message() {
        let err = into_transcript(
            "debat.mp4",
            job(r#"{"id": "j1", "status": "error", "error": "Audio file is empty"}"#),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Audio file is empty"));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let mut config = TranscriptionConfig::new("key");
        config.base_url = "http://localhost:9000/v2/".into();
        let client = TranscriptionClient::new(config);
        assert_eq!(client.config.base_url, "http://localhost:9000/v2");
    }

    /// Serve canned `(status, body)` responses, one per connection.
    async fn serve(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                drain_request(&mut socket).await;
                let reply = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        format!("http://{addr}")
    }

    async fn drain_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + length {
                return;
            }
        }
    }

    fn fast_config(base_url: String) -> TranscriptionConfig {
        TranscriptionConfig {
            base_url,
            poll_interval: Duration::from_millis(5),
            max_polls: 3,
            ..TranscriptionConfig::new("test-key")
        }
    }

    #[tokio::test]
    async fn upload_submit_and_poll() {
        let url = serve(vec![
            (200, r#"{"upload_url": "https://cdn.example/abc"}"#),
            (200, r#"{"id": "j1", "status": "queued"}"#),
            (200, r#"{"id": "j1", "status": "processing"}"#),
            (
                200,
                r#"{"id": "j1", "status": "completed", "text": "Wat is X?", "utterances": [{"speaker": "A", "start": 0, "end": 10, "text": "Wat is X?"}]}"#,
            ),
        ])
        .await;
        let client = TranscriptionClient::new(fast_config(url));
        let transcript = client.transcribe("debat.mp4", b"media".to_vec()).await.unwrap();
        assert_eq!(transcript.text, "Wat is X?");
        assert_eq!(transcript.utterances.len(), 1);
    }

    #[tokio::test]
    async fn polling_gives_up() {
        let url = serve(vec![
            (200, r#"{"upload_url": "https://cdn.example/abc"}"#),
            (200, r#"{"id": "j1", "status": "queued"}"#),
            (200, r#"{"id": "j1", "status": "queued"}"#),
            (200, r#"{"id": "j1", "status": "queued"}"#),
            (200, r#"{"id": "j1", "status": "queued"}"#),
        ])
        .await;
        let client = TranscriptionClient::new(fast_config(url));
        let err = client.transcribe("debat.mp4", b"media".to_vec()).await.unwrap_err();
        assert!(matches!(err, TranscribeError::TimedOut { polls: 3 }));
    }

    #[tokio::test]
    async fn rejected_upload_is_a_server_error() {
        let url = serve(vec![(401, r#"{"error": "Invalid API key"}"#)]).await;
        let client = TranscriptionClient::new(fast_config(url));
        let err = client.transcribe("debat.mp4", b"media".to_vec()).await.unwrap_err();
        assert!(matches!(err, TranscribeError::Server { status: 401, .. }));
    }
}
