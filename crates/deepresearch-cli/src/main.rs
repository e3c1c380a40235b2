use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deepresearch_core::{ModelEndpoint, ResearchTask};
use deepresearch_local::agent::Agent;
use deepresearch_local::completion::CompletionClient;
use deepresearch_local::config::{load_env_file, AgentConfig};
use deepresearch_local::openai_compat::OpenAiCompatClient;
use deepresearch_local::registry::CapabilityRegistry;
use deepresearch_local::tokens::default_estimator;
use deepresearch_local::visit::VisitPipeline;
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "deepresearch")]
#[command(about = "Multi-step research agent over an OpenAI-compatible model", long_about = None)]
struct Cli {
    /// KEY=VALUE file loaded before configuration is read. Never overrides the process env.
    #[arg(long, global = true, env = "DEEPRESEARCH_ENV_FILE")]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Research one question and print the run record (json).
    Run(RunCmd),
    /// Research every question of a JSONL file; one run record per line, in input order.
    Batch(BatchCmd),
    /// Visit URL(s) for a goal and print the summary records.
    Visit(VisitCmd),
    /// Print the tool catalogue shown to the planner (json).
    Tools,
    /// Print version info (json).
    Version,
}

#[derive(clap::Args, Debug, Clone, Default)]
struct PlannerArgs {
    /// Planner base URL (overrides DEEPRESEARCH_PLANNER_BASE_URL).
    #[arg(long)]
    planner_url: Option<String>,
    /// Planner model name (overrides DEEPRESEARCH_PLANNER_MODEL).
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_rounds: Option<u32>,
    #[arg(long)]
    max_llm_calls: Option<u32>,
    /// Wall-clock ceiling per run, in seconds.
    #[arg(long)]
    max_runtime_s: Option<u64>,
}

#[derive(clap::Args, Debug)]
struct RunCmd {
    #[arg(long)]
    question: String,
    /// Reference answer copied into the record for offline scoring.
    #[arg(long)]
    reference_answer: Option<String>,
    #[arg(long, default_value_t = 1)]
    rollout_id: u64,
    /// Output format: json|text
    #[arg(long, default_value = "json")]
    output: String,
    #[command(flatten)]
    planner: PlannerArgs,
}

#[derive(clap::Args, Debug)]
struct BatchCmd {
    /// JSONL with one `{"question": ..., "answer": ...}` object per line.
    #[arg(long)]
    input: PathBuf,
    /// Output JSONL path (default: stdout).
    #[arg(long)]
    out: Option<PathBuf>,
    /// Rollouts per question; rollout ids run 1..=N.
    #[arg(long, default_value_t = 1)]
    rollouts: u64,
    /// Runs in flight at once.
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
    #[command(flatten)]
    planner: PlannerArgs,
}

#[derive(clap::Args, Debug)]
struct VisitCmd {
    /// URL to visit (repeatable; visited in order).
    #[arg(long, required = true)]
    url: Vec<String>,
    #[arg(long)]
    goal: String,
}

fn init_tracing() {
    // stdout carries results; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .ok();
}

fn apply_planner_args(cfg: &mut AgentConfig, args: &PlannerArgs) {
    if let Some(u) = &args.planner_url {
        cfg.planner.base_url = u.clone();
    }
    if let Some(m) = &args.model {
        cfg.planner.model = m.clone();
    }
    if let Some(n) = args.max_rounds {
        cfg.limits.max_rounds = n.max(1);
    }
    if let Some(n) = args.max_llm_calls {
        cfg.limits.max_llm_calls = n.max(1);
    }
    if let Some(s) = args.max_runtime_s {
        cfg.limits.max_runtime = std::time::Duration::from_secs(s);
    }
}

fn build_agent(cfg: &AgentConfig) -> Result<Agent> {
    let registry = CapabilityRegistry::from_config(cfg).context("building tool registry")?;
    let backend = Arc::new(OpenAiCompatClient::with_default_client()?);
    Ok(Agent::new(
        Arc::new(CompletionClient::new(backend)),
        Arc::new(registry),
        default_estimator(),
        cfg.limits.clone(),
    ))
}

fn read_tasks(path: &std::path::Path) -> Result<Vec<ResearchTask>> {
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut tasks = Vec::new();
    for (i, line) in txt.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let task: ResearchTask = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: not a task object", path.display(), i + 1))?;
        tasks.push(task);
    }
    Ok(tasks)
}

async fn run_batch(agent: Arc<Agent>, endpoint: ModelEndpoint, args: &BatchCmd) -> Result<()> {
    let tasks = read_tasks(&args.input)?;
    let rollouts = args.rollouts.max(1);
    let jobs: Vec<ResearchTask> = tasks
        .iter()
        .flat_map(|t| {
            (1..=rollouts).map(move |rollout_id| ResearchTask {
                rollout_id,
                ..t.clone()
            })
        })
        .collect();
    tracing::info!(questions = tasks.len(), runs = jobs.len(), "batch started");

    let mut sink: Box<dyn Write> = match &args.out {
        Some(p) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(p).with_context(|| format!("creating {}", p.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };

    // `buffered` keeps results in input order while up to `concurrency` runs proceed.
    let mut results = futures::stream::iter(jobs)
        .map(|task| {
            let agent = agent.clone();
            let endpoint = endpoint.clone();
            async move { agent.run(&task, &endpoint).await }
        })
        .buffered(args.concurrency.max(1));
    while let Some(result) = results.next().await {
        writeln!(sink, "{}", serde_json::to_string(&result)?)?;
        sink.flush()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Some(p) = &cli.env_file {
        match load_env_file(p) {
            Ok(n) => tracing::debug!(path = %p.display(), vars = n, "env file loaded"),
            Err(e) => tracing::warn!(path = %p.display(), error = %e, "env file not loaded"),
        }
    }

    match cli.command {
        Commands::Run(args) => {
            let mut cfg = AgentConfig::from_env()?;
            apply_planner_args(&mut cfg, &args.planner);
            let agent = build_agent(&cfg)?;
            let task = ResearchTask {
                question: args.question,
                answer: args.reference_answer,
                rollout_id: args.rollout_id,
            };
            let result = agent.run(&task, &cfg.planner).await;
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("{}", result.prediction),
                _ => println!("{}", serde_json::to_string_pretty(&result)?),
            }
        }
        Commands::Batch(args) => {
            let mut cfg = AgentConfig::from_env()?;
            apply_planner_args(&mut cfg, &args.planner);
            let agent = Arc::new(build_agent(&cfg)?);
            run_batch(agent, cfg.planner.clone(), &args).await?;
        }
        Commands::Visit(args) => {
            let cfg = AgentConfig::from_env()?;
            let pipeline = VisitPipeline::from_config(&cfg)?;
            println!("{}", pipeline.visit(&args.url, &args.goal).await);
        }
        Commands::Tools => {
            let cfg = AgentConfig::from_env()?;
            let registry = CapabilityRegistry::from_config(&cfg)?;
            let payload = serde_json::json!({
                "schema_version": 1,
                "kind": "tools",
                "tools": registry.catalogue(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Version => {
            let payload = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "deepresearch",
                "version": env!("CARGO_PKG_VERSION"),
            });
            println!("{}", serde_json::to_string(&payload)?);
        }
    }
    Ok(())
}
