//! bundlelab - conversational bundle discovery
//!
//! Detects product bundles and their purchase intents in shopping sessions by
//! refining a model dialogue on a related training session, then scores the
//! bundles it finds in held-out sessions against ground truth.

use anyhow::{Context, Result};
use bundlelab_adapters::cache::{Artifact, ArtifactStore};
use bundlelab_adapters::config::{Provider, RunConfig};
use bundlelab_adapters::dataset::Dataset;
use bundlelab_adapters::keyring;
use bundlelab_core::protocol::ModelClient;
use bundlelab_engine::lab::{self, RunReport};
use bundlelab_engine::llm::{ChatClient, ParseOptions, Usage};
use bundlelab_engine::pipeline::{Pipeline, PipelineSettings, SessionRecord};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "bundlelab",
    about = "Bundle and intent discovery with self-correcting model dialogues",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the refinement pipeline on every pending test session, then evaluate
    Run {
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Sessions processed at once
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Recompute metrics from the persisted bundles without calling any model
    Evaluate {
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Manage stored API keys
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
    /// Delete persisted stage files so the next run recomputes them
    Reset {
        #[arg(long)]
        dataset: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, conflicts_with = "stage")]
        all: bool,
        #[arg(long, value_enum, required_unless_present = "all")]
        stage: Vec<StageArg>,
    },
}

#[derive(Subcommand, Debug)]
enum CredentialsAction {
    /// Read an API key from stdin and store it
    Set {
        #[arg(long, value_enum)]
        provider: ProviderArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ProviderArg {
    Openai,
    Anthropic,
}

impl From<ProviderArg> for Provider {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Openai => Provider::OpenAi,
            ProviderArg::Anthropic => Provider::Anthropic,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StageArg {
    SelfCorrection,
    Parsed,
    Feedback,
    Intents,
    RatingInputs,
    RatingScores,
    TestTranscripts,
    Bundles,
    Hallucinated,
    Excluded,
    Metrics,
    Run,
}

impl From<StageArg> for Artifact {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::SelfCorrection => Artifact::SelfCorrection,
            StageArg::Parsed => Artifact::Parsed,
            StageArg::Feedback => Artifact::Feedback,
            StageArg::Intents => Artifact::Intents,
            StageArg::RatingInputs => Artifact::RatingInputs,
            StageArg::RatingScores => Artifact::RatingScores,
            StageArg::TestTranscripts => Artifact::TestTranscripts,
            StageArg::Bundles => Artifact::Bundles,
            StageArg::Hallucinated => Artifact::Hallucinated,
            StageArg::Excluded => Artifact::Excluded,
            StageArg::Metrics => Artifact::Metrics,
            StageArg::Run => Artifact::Run,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            dataset,
            config,
            concurrency,
        } => {
            let mut config = load_config(config.as_deref(), dataset)?;
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            config.validate()?;
            init_tracing(config.log_path.as_deref())?;
            run(config).await
        }
        Command::Evaluate { dataset, config } => {
            let config = load_config(config.as_deref(), dataset)?;
            init_tracing(config.log_path.as_deref())?;
            evaluate(&config)
        }
        Command::Credentials {
            action: CredentialsAction::Set { provider },
        } => {
            init_tracing(None)?;
            set_credentials(provider.into())
        }
        Command::Reset {
            dataset,
            config,
            all,
            stage,
        } => {
            let config = load_config(config.as_deref(), dataset)?;
            init_tracing(config.log_path.as_deref())?;
            let artifacts = if all {
                Artifact::all()
            } else {
                stage.into_iter().map(Artifact::from).collect()
            };
            reset(&config, &artifacts)
        }
    }
}

fn load_config(path: Option<&Path>, dataset: Option<String>) -> Result<RunConfig> {
    let mut config = RunConfig::load(path)?;
    if let Some(dataset) = dataset {
        config.dataset = dataset;
    }
    Ok(config)
}

/// Console output filtered by `RUST_LOG` (default `info`), plus a plain-text
/// copy appended to `log_path` when one is configured.
fn init_tracing(log_path: Option<&Path>) -> Result<()> {
    let file_layer = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;
    Ok(())
}

async fn run(config: RunConfig) -> Result<()> {
    let models = config.resolve_models()?;
    tracing::info!(
        dataset = %config.dataset,
        data_path = %config.data_path.display(),
        artifacts = %config.artifact_dir().display(),
        feedback_iteration = config.feedback_iteration,
        concurrency = config.concurrency,
        permissive_parsing = config.permissive_parsing,
        primary = ?models.primary,
        raters = ?models.raters,
        "resolved configuration"
    );
    if models.raters_fell_back {
        tracing::info!("no intent raters configured, the primary model rates intents");
    }

    let dataset = Dataset::load(&config.data_path, &config.dataset)?;
    let store = Arc::new(ArtifactStore::new(config.artifact_dir()));
    let finished = store.resumable_ids()?;
    let all_pairings = dataset.pairings();
    let pending: Vec<_> = all_pairings
        .into_iter()
        .filter(|pairing| !finished.contains(&pairing.test_id))
        .collect();
    let resumed = dataset.test_count().saturating_sub(pending.len());
    if !finished.is_empty() {
        tracing::info!(
            finished = finished.len(),
            pending = pending.len(),
            "resuming earlier run"
        );
    }

    let primary = Arc::new(ChatClient::new(models.primary.clone())?);
    let raters = models
        .raters
        .iter()
        .cloned()
        .map(|model| ChatClient::new(model).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    let settings = PipelineSettings {
        feedback_iterations: config.feedback_iteration,
        parse: ParseOptions {
            permissive: config.permissive_parsing,
        },
        concurrency: config.concurrency,
    };
    let pipeline = Pipeline::new(
        primary.clone(),
        raters
            .iter()
            .map(|rater| rater.clone() as Arc<dyn ModelClient>)
            .collect(),
        Arc::new(dataset.corpus.catalog.clone()),
        settings,
    );

    let mut report = RunReport::start(
        &config.dataset,
        primary.model_id(),
        raters.iter().map(|rater| rater.model_id().to_string()).collect(),
    );
    report.resumed = resumed;

    let summary = pipeline
        .run_batch(&pending, |record| persist(Arc::clone(&store), record))
        .await?;

    let mut usage = primary.usage_totals();
    for rater in &raters {
        let rater_usage = rater.usage_totals();
        if rater_usage.calls > 0 {
            usage.merge(&rater_usage);
        }
    }
    report.usage = usage;

    let outcome = lab::evaluate(&dataset.corpus, &store);
    let metrics = match &outcome {
        Ok(metrics) => Some(metrics.clone()),
        Err(err) if lab::is_no_valid_bundles(err) => {
            report.notes.push(err.to_string());
            None
        }
        Err(_) => None,
    };
    report.finish(summary, metrics);
    store.write_document(Artifact::Run, &report)?;

    println!();
    match report.duration_secs() {
        Some(secs) => println!("  Run {} ({}s)", report.run_id, secs),
        None => println!("  Run {}", report.run_id),
    }
    println!(
        "  {} sessions: {} completed, {} hallucinated, {} excluded ({} resumed)",
        summary.sessions, summary.completed, summary.hallucinated, summary.excluded, resumed
    );
    print_usage(&usage);
    let metrics = outcome?;
    print_metrics(&metrics);
    Ok(())
}

/// Write a finished session's stage files. The store's file lock may wait on
/// another process, so the write runs on the blocking pool.
async fn persist(store: Arc<ArtifactStore>, record: SessionRecord) -> Result<()> {
    let entries = record.stage_entries()?;
    let test_id = record.test_id;
    tokio::task::spawn_blocking(move || {
        store
            .record_many(&test_id, &entries)
            .with_context(|| format!("Failed to persist session {}", test_id))
    })
    .await
    .context("Persistence task failed")?
}

fn evaluate(config: &RunConfig) -> Result<()> {
    let corpus = Dataset::load(&config.data_path, &config.dataset)?.corpus;
    let store = ArtifactStore::new(config.artifact_dir());
    let metrics = lab::evaluate(&corpus, &store)?;
    print_metrics(&metrics);
    Ok(())
}

fn set_credentials(provider: Provider) -> Result<()> {
    eprint!("  {} API key: ", provider);
    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .context("Failed to read the key from stdin")?;
    let key = input.trim();
    if key.is_empty() {
        return Err(anyhow::anyhow!("No key given"));
    }

    keyring::set_provider_key(provider, key).map_err(|e| anyhow::anyhow!("{}", e))?;
    keyring::verify_provider_key(provider, key).map_err(|e| anyhow::anyhow!("{}", e))?;
    println!(
        "  + {} key saved to {}",
        provider,
        keyring::credentials_store_label()
    );
    Ok(())
}

fn reset(config: &RunConfig, artifacts: &[Artifact]) -> Result<()> {
    let store = ArtifactStore::new(config.artifact_dir());
    let cleared = store.clear_selective(artifacts)?;
    if cleared.is_empty() {
        println!("  Nothing to reset in {}", store.dir().display());
    } else {
        for name in &cleared {
            println!("  - {}", name);
        }
        println!("  Cleared {} file(s) in {}", cleared.len(), store.dir().display());
    }
    Ok(())
}

fn print_usage(usage: &Usage) {
    if usage.calls == 0 {
        return;
    }
    println!(
        "  {} model calls, {} tokens ({} prompt, {} completion)",
        usage.calls,
        usage.total(),
        usage.prompt_tokens,
        usage.completion_tokens
    );
}

fn print_metrics(metrics: &bundlelab_core::metrics::MetricsReport) {
    println!();
    println!("  Precision  {:.4}", metrics.precision);
    println!("  Recall     {:.4}", metrics.recall);
    println!("  Coverage   {:.4}", metrics.coverage);
    println!(
        "  {} valid sessions, {} scored, {} hits",
        metrics.valid_sessions, metrics.scored_sessions, metrics.total_hits
    );
}
