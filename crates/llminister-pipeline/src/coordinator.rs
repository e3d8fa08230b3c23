//! Pipeline coordinator: runs stages in order and hands work between them
//! through stored artifacts.
//!
//! Each stage follows `Pending → Running → Succeeded | Failed`. A stage's
//! worker output is decoded into the stage's typed payload before it is
//! appended, so an artifact on disk always decodes. Extract and answer output
//! is reconciled into the working set right after it is stored.
//!
//! A run halts at its first failed stage and never retries on its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use llminister_core::{Artifact, QuestionBatch, StageKind, Transcript};
use llminister_store::{ArtifactStore, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::reconcile::{ReconcileEngine, ReconcileError, ReconcileReport, validate_batch};
use crate::worker::{MediaRef, StageInput, StageWorker};

// ── Configuration ──

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on one stage's worker call.
    pub stage_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Where the first stage of a run takes its input from. Later stages always
/// consume the artifact the previous stage of the same run produced.
#[derive(Debug, Clone, Default)]
pub enum InputSelection {
    /// The current artifact of the previous stage.
    #[default]
    Latest,
    /// A specific stored artifact of the previous stage.
    Sequence(u64),
    /// An artifact supplied by the caller.
    Artifact(Artifact),
}

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub from: StageKind,
    pub to: StageKind,
    pub input: InputSelection,
    /// Required when the run starts at the transcribe stage.
    pub media: Option<MediaRef>,
    pub cancel: CancellationToken,
    pub progress: Option<mpsc::UnboundedSender<StageEvent>>,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            from: StageKind::Transcribe,
            to: StageKind::Answer,
            input: InputSelection::Latest,
            media: None,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

impl RunRequest {
    /// A run over every stage, starting from uploaded media.
    pub fn from_media(media: MediaRef) -> Self {
        Self {
            media: Some(media),
            ..Default::default()
        }
    }

    /// A run over `from..=to`.
    pub fn stages(from: StageKind, to: StageKind) -> Self {
        Self {
            from,
            to,
            ..Default::default()
        }
    }

    pub fn with_input(mut self, input: InputSelection) -> Self {
        self.input = input;
        self
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<StageEvent>) -> Self {
        self.progress = Some(progress);
        self
    }
}

// ── Run state ──

/// Why a stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("worker failed: {0}")]
    Worker(String),
    #[error("stage timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("no input artifact available")]
    MissingInput,
    /// The artifact was stored but could not be folded into the working set.
    /// It can be replayed with [`Coordinator::reconcile_artifact`].
    #[error("artifact {sequence_id} stored but not reconciled: {message}")]
    Reconcile { sequence_id: u64, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed(FailureReason),
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// A state transition, sent to the run's progress channel if it has one.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub stage: StageKind,
    pub state: StageState,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub state: StageState,
    pub artifact: Option<Artifact>,
    pub reconcile: Option<ReconcileReport>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub stages: Vec<StageOutcome>,
}

impl RunReport {
    fn new(stages: &[StageKind]) -> Self {
        Self {
            stages: stages
                .iter()
                .map(|&stage| StageOutcome {
                    stage,
                    state: StageState::Pending,
                    artifact: None,
                    reconcile: None,
                })
                .collect(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.state == StageState::Succeeded)
    }

    /// The failing stage and its reason, if the run failed.
    pub fn failure(&self) -> Option<(StageKind, &FailureReason)> {
        self.stages.iter().find_map(|s| match &s.state {
            StageState::Failed(reason) => Some((s.stage, reason)),
            _ => None,
        })
    }

    pub fn stage(&self, stage: StageKind) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

// ── Coordinator ──

pub struct Coordinator {
    artifacts: Arc<ArtifactStore>,
    engine: Arc<ReconcileEngine>,
    workers: HashMap<StageKind, Arc<dyn StageWorker>>,
    /// One run at a time per stage, indexed like [`StageKind::ORDER`].
    gates: [Mutex<()>; 3],
    config: PipelineConfig,
}

impl Coordinator {
    pub fn new(
        artifacts: Arc<ArtifactStore>,
        engine: Arc<ReconcileEngine>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            artifacts,
            engine,
            workers: HashMap::new(),
            gates: StageKind::ORDER.map(|_| Mutex::new(())),
            config,
        }
    }

    pub fn with_worker(mut self, stage: StageKind, worker: Arc<dyn StageWorker>) -> Self {
        self.workers.insert(stage, worker);
        self
    }

    pub fn engine(&self) -> &Arc<ReconcileEngine> {
        &self.engine
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// Run the stages `request.from..=request.to`. Stages after a failure stay
    /// `Pending`.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let stages = StageKind::range(request.from, request.to);
        let mut report = RunReport::new(&stages);
        if stages.is_empty() {
            warn!(from = %request.from, to = %request.to, "empty stage range, nothing to run");
            return report;
        }
        info!(from = %request.from, to = %request.to, "pipeline run started");

        let mut carried: Option<Artifact> = None;
        for (i, outcome) in report.stages.iter_mut().enumerate() {
            let stage = outcome.stage;
            let result = self.run_stage(outcome, i == 0, carried.take(), &request).await;
            outcome.state = match result {
                Ok(()) => StageState::Succeeded,
                Err(reason) => {
                    warn!(stage = %stage, reason = %reason, "stage failed, halting run");
                    StageState::Failed(reason)
                }
            };
            notify(&request, stage, &outcome.state);
            if matches!(outcome.state, StageState::Failed(_)) {
                break;
            }
            carried = outcome.artifact.clone();
        }
        if report.succeeded() {
            info!("pipeline run succeeded");
        }
        report
    }

    async fn run_stage(
        &self,
        outcome: &mut StageOutcome,
        first: bool,
        carried: Option<Artifact>,
        request: &RunRequest,
    ) -> Result<(), FailureReason> {
        let stage = outcome.stage;
        let _gate = self.acquire_gate(stage, &request.cancel).await?;
        let input = self.resolve_input(stage, first, carried, request).await?;

        notify(request, stage, &StageState::Running);
        info!(stage = %stage, "stage running");

        let worker = self
            .workers
            .get(&stage)
            .ok_or_else(|| FailureReason::Worker(format!("no worker registered for {stage}")))?;

        let payload = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(FailureReason::Cancelled),
            result = tokio::time::timeout(self.config.stage_timeout, worker.run(stage, &input)) => {
                match result {
                    Err(_) => return Err(FailureReason::Timeout),
                    Ok(Err(e)) => return Err(FailureReason::Worker(e.to_string())),
                    Ok(Ok(payload)) => payload,
                }
            }
        };

        let batch = validate_payload(stage, &payload)?;
        if request.cancel.is_cancelled() {
            return Err(FailureReason::Cancelled);
        }

        let artifact = self
            .artifacts
            .append(stage, payload)
            .await
            .map_err(|e| FailureReason::Store(e.to_string()))?;
        let sequence_id = artifact.sequence_id;
        outcome.artifact = Some(artifact);

        if let Some(batch) = batch {
            let reconciled = self.engine.reconcile(&batch.questions).await.map_err(|e| {
                FailureReason::Reconcile {
                    sequence_id,
                    message: e.to_string(),
                }
            })?;
            outcome.reconcile = Some(reconciled);
        }
        info!(stage = %stage, sequence_id, "stage succeeded");
        Ok(())
    }

    async fn acquire_gate(
        &self,
        stage: StageKind,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, ()>, FailureReason> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FailureReason::Cancelled),
            guard = self.gates[stage as usize].lock() => Ok(guard),
        }
    }

    async fn resolve_input(
        &self,
        stage: StageKind,
        first: bool,
        carried: Option<Artifact>,
        request: &RunRequest,
    ) -> Result<StageInput, FailureReason> {
        let Some(previous) = stage.previous() else {
            if first && !matches!(request.input, InputSelection::Latest) {
                return Err(FailureReason::InvalidPayload(format!(
                    "{stage} consumes media, not a stored artifact"
                )));
            }
            return request
                .media
                .clone()
                .map(StageInput::Media)
                .ok_or(FailureReason::MissingInput);
        };

        let artifact = match (carried, first, &request.input) {
            (Some(artifact), _, _) => artifact,
            (None, true, InputSelection::Artifact(artifact)) => {
                if artifact.stage_kind != previous {
                    return Err(FailureReason::InvalidPayload(format!(
                        "{stage} consumes {previous} output, got {}",
                        artifact.label()
                    )));
                }
                artifact.clone()
            }
            (None, true, InputSelection::Sequence(seq)) => {
                self.artifacts.get(previous, *seq).await.map_err(input_error)?
            }
            _ => self.artifacts.latest(previous).await.map_err(input_error)?,
        };
        Ok(StageInput::Artifact(artifact))
    }

    /// Fold a stored extract or answer artifact into the working set again.
    /// Reconciling is idempotent, so replaying an artifact that was already
    /// applied changes nothing.
    pub async fn reconcile_artifact(
        &self,
        stage: StageKind,
        sequence_id: u64,
    ) -> Result<ReconcileReport, ReconcileError> {
        if !stage.yields_questions() {
            return Err(ReconcileError::InvalidRecord(format!(
                "{stage} artifacts carry no questions"
            )));
        }
        let artifact = self.artifacts.get(stage, sequence_id).await?;
        let batch: QuestionBatch = artifact
            .decode()
            .map_err(|e| ReconcileError::InvalidRecord(e.to_string()))?;
        info!(artifact = %artifact.label(), "replaying artifact into working set");
        self.engine.reconcile(&batch.questions).await
    }
}

fn notify(request: &RunRequest, stage: StageKind, state: &StageState) {
    if let Some(tx) = &request.progress {
        // A dropped receiver just means nobody is watching.
        let _ = tx.send(StageEvent {
            stage,
            state: state.clone(),
        });
    }
}

fn input_error(err: StoreError) -> FailureReason {
    match err {
        StoreError::NotFound(_) => FailureReason::MissingInput,
        other => FailureReason::Store(other.to_string()),
    }
}

/// Decode a worker payload into its stage's typed form. Question batches are
/// returned for reconciliation.
fn validate_payload(
    stage: StageKind,
    payload: &serde_json::Value,
) -> Result<Option<QuestionBatch>, FailureReason> {
    let invalid = |e: &dyn fmt::Display| FailureReason::InvalidPayload(e.to_string());
    match stage {
        StageKind::Transcribe => {
            serde_json::from_value::<Transcript>(payload.clone()).map_err(|e| invalid(&e))?;
            Ok(None)
        }
        StageKind::Extract | StageKind::Answer => {
            let batch = serde_json::from_value::<QuestionBatch>(payload.clone())
                .map_err(|e| invalid(&e))?;
            validate_batch(&batch.questions).map_err(|e| invalid(&e))?;
            Ok(Some(batch))
        }
    }
}
