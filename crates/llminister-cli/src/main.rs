//! LLMinister command line: run the question pipeline and manage the
//! working set of questions.

mod display;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use llminister_ai::{
    AnswerWorker, ExtractWorker, KnowledgeBase, LlmClient, LlmConfig, speakers_from_csv,
};
use llminister_core::{Answer, QuestionPatch, QuestionStatus, StageKind};
use llminister_pipeline::{
    Coordinator, InputSelection, MediaRef, PipelineConfig, ReconcileEngine, RunRequest,
};
use llminister_store::Workspace;
use llminister_transcribe::{TranscribeWorker, TranscriptionClient, TranscriptionConfig};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_MODEL: &str = "claude-3-7-sonnet-20250219";

#[derive(Parser)]
#[command(name = "llminister")]
#[command(about = "Turn debate recordings into cited draft answers for the minister")]
#[command(version)]
struct Cli {
    /// Directory holding artifacts and the question working set
    #[arg(long, global = true, env = "LLMINISTER_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, or a part of it
    Run(RunArgs),

    /// Inspect stored stage artifacts
    #[command(subcommand)]
    Artifacts(ArtifactsCommand),

    /// Inspect and edit the question working set
    #[command(subcommand)]
    Questions(QuestionsCommand),

    /// Fold a stored extract or answer artifact into the working set again
    Reconcile {
        /// Stage that produced the artifact (extract, answer)
        stage: StageKind,
        /// Sequence id of the artifact
        seq: u64,
    },

    /// Delete all artifacts and questions
    Reset {
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// First stage to run
    #[arg(long, default_value = "transcribe")]
    from: StageKind,

    /// Last stage to run
    #[arg(long, default_value = "answer")]
    to: StageKind,

    /// Recording to transcribe (required when the run starts at transcribe)
    #[arg(long)]
    media: Option<PathBuf>,

    /// Use this artifact of the preceding stage as input instead of the latest
    #[arg(long)]
    input_seq: Option<u64>,

    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    anthropic_api_key: Option<String>,

    #[arg(long, env = "ASSEMBLYAI_API_KEY", hide_env_values = true)]
    assemblyai_api_key: Option<String>,

    /// Language model for extraction and answering
    #[arg(long, env = "LLMINISTER_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Seconds a single stage may take
    #[arg(long, env = "LLMINISTER_STAGE_TIMEOUT", default_value_t = 1800)]
    stage_timeout: u64,

    /// Directory of knowledge documents (PDFs, or form-feed separated `.txt`)
    #[arg(long, env = "LLMINISTER_KNOWLEDGE_DIR", default_value = "./knowledge")]
    knowledge_dir: PathBuf,

    /// Question categories offered to the model, comma separated
    #[arg(long, env = "LLMINISTER_CATEGORIES", value_delimiter = ',')]
    categories: Vec<String>,

    /// Speakers CSV (`name,slot,party`) used to attribute questions
    #[arg(long, env = "LLMINISTER_SPEAKERS")]
    speakers: Option<PathBuf>,
}

#[derive(Subcommand)]
enum ArtifactsCommand {
    /// List artifacts, oldest first
    List {
        /// Only this stage
        #[arg(long)]
        stage: Option<StageKind>,
    },
    /// Print an artifact as JSON
    Show {
        stage: StageKind,
        /// Sequence id; the latest artifact if omitted
        seq: Option<u64>,
    },
}

#[derive(Subcommand)]
enum QuestionsCommand {
    /// List the working set
    List {
        /// Only questions with this status
        #[arg(long)]
        status: Option<QuestionStatus>,
    },
    /// Show one question as a card
    Show {
        id: Uuid,
        /// Print the stored JSON instead of a card
        #[arg(long)]
        json: bool,
    },
    /// Edit a question's text or workflow fields
    Edit(EditArgs),
    /// Remove a question from the working set
    Delete { id: Uuid },
}

#[derive(Args)]
struct EditArgs {
    id: Uuid,

    #[arg(long)]
    text: Option<String>,

    /// Draft, Rewritten or Final
    #[arg(long)]
    status: Option<QuestionStatus>,

    /// Replace the answer with plain text
    #[arg(long, conflicts_with = "clear_answer")]
    answer: Option<String>,

    /// Remove the answer
    #[arg(long)]
    clear_answer: bool,

    #[arg(long)]
    next_action: Option<String>,

    #[arg(long)]
    person_responsible: Option<String>,

    /// Refuse the edit if the question changed after this time (RFC 3339)
    #[arg(long)]
    expected_updated_at: Option<DateTime<Utc>>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let workspace = Workspace::open(&cli.data_dir);
    let engine = Arc::new(ReconcileEngine::new(&workspace));

    match cli.command {
        Commands::Run(args) => cmd_run(&workspace, engine, args).await,
        Commands::Artifacts(cmd) => cmd_artifacts(&workspace, cmd).await,
        Commands::Questions(cmd) => cmd_questions(&engine, cmd).await,
        Commands::Reconcile { stage, seq } => {
            let coordinator =
                Coordinator::new(workspace.artifacts(), engine, PipelineConfig::default());
            let report = coordinator
                .reconcile_artifact(stage, seq)
                .await
                .with_context(|| format!("failed to reconcile {stage}#{seq}"))?;
            println!(
                "{stage}#{seq}: {} new, {} updated, {} unchanged",
                report.inserted(),
                report.updated(),
                report.unchanged()
            );
            Ok(())
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!(
                    "reset deletes every artifact and question in {}; pass --yes to confirm",
                    workspace.root().display()
                );
            }
            engine.reset().await.context("reset failed")?;
            println!("Workspace {} cleared.", workspace.root().display());
            Ok(())
        }
    }
}

// ── run ──

async fn cmd_run(workspace: &Workspace, engine: Arc<ReconcileEngine>, args: RunArgs) -> Result<()> {
    let stages = StageKind::range(args.from, args.to);
    if stages.is_empty() {
        bail!("--to {} comes before --from {}", args.to, args.from);
    }
    if args.from == StageKind::Transcribe && args.input_seq.is_some() {
        bail!("--input-seq selects a stored artifact; a run from transcribe reads --media");
    }

    let config = PipelineConfig {
        stage_timeout: Duration::from_secs(args.stage_timeout),
    };
    let mut coordinator = Coordinator::new(workspace.artifacts(), engine, config);

    if stages.contains(&StageKind::Transcribe) {
        let key = args
            .assemblyai_api_key
            .clone()
            .context("ASSEMBLYAI_API_KEY is required to transcribe")?;
        let client = Arc::new(TranscriptionClient::new(TranscriptionConfig::new(key)));
        coordinator =
            coordinator.with_worker(StageKind::Transcribe, Arc::new(TranscribeWorker::new(client)));
    }

    let needs_llm = stages.iter().any(StageKind::yields_questions);
    if needs_llm {
        let key = args
            .anthropic_api_key
            .clone()
            .context("ANTHROPIC_API_KEY is required to extract and answer questions")?;
        let llm = Arc::new(LlmClient::new(LlmConfig::new(key, &args.model)));
        info!(model = llm.model(), "language model configured");

        if stages.contains(&StageKind::Extract) {
            let mut worker = ExtractWorker::new(llm.clone()).with_categories(args.categories.clone());
            if let Some(path) = &args.speakers {
                let csv = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("failed to read speakers {}", path.display()))?;
                worker = worker.with_speakers(speakers_from_csv(&csv));
            }
            coordinator = coordinator.with_worker(StageKind::Extract, Arc::new(worker));
        }
        if stages.contains(&StageKind::Answer) {
            let knowledge = KnowledgeBase::load(&args.knowledge_dir)
                .await
                .context("failed to load knowledge base")?;
            if knowledge.is_empty() {
                warn!(
                    dir = %args.knowledge_dir.display(),
                    "knowledge base is empty, answers will cite nothing"
                );
            }
            let worker = AnswerWorker::new(llm, Arc::new(knowledge));
            coordinator = coordinator.with_worker(StageKind::Answer, Arc::new(worker));
        }
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<llminister_pipeline::StageEvent>();
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            eprintln!("[{}] {}", event.stage, event.state);
        }
    });

    let mut request = RunRequest::stages(args.from, args.to)
        .with_cancel(cancel)
        .with_progress(tx);
    if let Some(path) = args.media {
        request = request.with_media(MediaRef::new(path));
    }
    if let Some(seq) = args.input_seq {
        request = request.with_input(InputSelection::Sequence(seq));
    }

    let report = coordinator.run(request).await;
    // The request, and with it the sender, is gone once the run returns.
    let _ = progress.await;

    println!();
    display::print_run_report(&report);
    if let Some((stage, reason)) = report.failure() {
        bail!("{stage} stage failed: {reason}");
    }
    Ok(())
}

// ── artifacts ──

async fn cmd_artifacts(workspace: &Workspace, cmd: ArtifactsCommand) -> Result<()> {
    let store = workspace.artifacts();
    match cmd {
        ArtifactsCommand::List { stage } => {
            let stages = match stage {
                Some(stage) => vec![stage],
                None => StageKind::ORDER.to_vec(),
            };
            for stage in stages {
                let artifacts = store
                    .list(stage)
                    .await
                    .with_context(|| format!("failed to list {stage} artifacts"))?;
                println!("{stage} ({})", artifacts.len());
                display::print_artifact_table(&artifacts);
            }
        }
        ArtifactsCommand::Show { stage, seq } => {
            let artifact = match seq {
                Some(seq) => store.get(stage, seq).await,
                None => store.latest(stage).await,
            }
            .with_context(|| format!("failed to read {stage} artifact"))?;
            println!("{}", serde_json::to_string_pretty(&artifact)?);
        }
    }
    Ok(())
}

// ── questions ──

async fn cmd_questions(engine: &ReconcileEngine, cmd: QuestionsCommand) -> Result<()> {
    match cmd {
        QuestionsCommand::List { status } => {
            let mut questions = engine.list().await.context("failed to read working set")?;
            if let Some(status) = status {
                questions.retain(|q| q.status == status);
            }
            display::print_question_table(&questions);
        }
        QuestionsCommand::Show { id, json } => {
            let question = engine.get(id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&question)?);
            } else {
                display::print_question_card(&question);
            }
        }
        QuestionsCommand::Edit(args) => {
            let id = args.id;
            let patch = args.into_patch();
            if patch.is_empty() {
                bail!("nothing to edit; pass at least one field");
            }
            let question = engine
                .apply_user_edit(id, patch)
                .await
                .with_context(|| format!("failed to edit question {id}"))?;
            display::print_question_card(&question);
        }
        QuestionsCommand::Delete { id } => {
            engine.delete(id).await?;
            println!("Deleted {id}.");
        }
    }
    Ok(())
}

impl EditArgs {
    fn into_patch(self) -> QuestionPatch {
        let answer = if self.clear_answer {
            Some(Answer::Empty)
        } else {
            self.answer.map(Answer::Text)
        };
        QuestionPatch {
            text: self.text,
            status: self.status,
            answer,
            next_action: self.next_action,
            person_responsible: self.person_responsible,
            expected_updated_at: self.expected_updated_at,
        }
    }
}
