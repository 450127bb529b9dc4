use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arbiter_runner::{Cli, Command, MemoryCommand, OpenAiCompatClient, RunArgs, RunnerConfig};
use arbitration::{
    new_task_id, ArbitrationConfig, ArbitrationPipeline, ArtifactStore, CacheConfig,
    CachedModelClient, LexicalEmbedder, ModelClient, ModelQualityMemory, StabilityEngine,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Memory { command, out } => memory(command, out),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.build_config()?;
    let problem = args.problem(&config)?;
    let task_id = args.task_id.clone().unwrap_or_else(new_task_id);

    let backend = RunnerConfig::from_env().context("Invalid backend configuration")?;
    if backend.api_key.is_none() {
        warn!(base_url = %backend.base_url, "No API key set (ARBITER_API_KEY / OPENROUTER_API_KEY)");
    }
    let http = OpenAiCompatClient::new(backend).context("Failed to build HTTP client")?;
    let client: Arc<dyn ModelClient> = if args.cache {
        Arc::new(CachedModelClient::new(http, CacheConfig::default()))
    } else {
        Arc::new(http)
    };

    let store = ArtifactStore::new(&config.out_dir);
    let memory = ModelQualityMemory::load(store.memory_path())
        .context("Failed to load model quality memory")?
        .shared();
    let embedder = Arc::new(LexicalEmbedder::default());

    info!(
        task_id = %task_id,
        pool = %config.pool.name,
        solvers = config.pool.solvers.len(),
        max_runs = config.max_runs,
        out = %config.out_dir.display(),
        "Arbiter starting"
    );

    let domain = problem.domain.clone();
    let pipeline = ArbitrationPipeline::with_model_scorer(
        config.clone(),
        client,
        embedder.clone(),
        memory,
        &domain,
    );
    let engine = StabilityEngine::new(pipeline, embedder).with_artifacts(store.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding calls");
            on_signal.cancel();
        }
    });

    let outcome = engine
        .run_task(&task_id, &problem, &cancel)
        .await
        .with_context(|| format!("Task {task_id} failed"))?;

    let record = outcome.to_record(&config);
    println!("{}", serde_json::to_string_pretty(&record)?);
    info!(
        task_id = %task_id,
        artifacts = %store.task_dir(&task_id).display(),
        "Decision written"
    );
    Ok(())
}

fn memory(command: MemoryCommand, out: Option<PathBuf>) -> Result<()> {
    let config = ArbitrationConfig::default()
        .apply_env()
        .context("Invalid ARBITER_* environment override")?;
    let store = ArtifactStore::new(out.unwrap_or(config.out_dir));
    let memory = ModelQualityMemory::load(store.memory_path())
        .context("Failed to load model quality memory")?;

    match command {
        MemoryCommand::Show => {
            let records = memory.snapshot()?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        MemoryCommand::Reset { model: Some(model) } => {
            if memory.reset(&model)? {
                memory.flush()?;
                info!(model_id = %model, "Reset model to neutral prior");
            } else {
                warn!(model_id = %model, "Model has no record");
            }
        }
        MemoryCommand::Reset { model: None } => {
            let cleared = memory.reset_all()?;
            memory.flush()?;
            info!(cleared, "Reset all models to neutral prior");
        }
    }
    Ok(())
}
