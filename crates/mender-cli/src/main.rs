//! CLI binary for running Mender validation on a repository.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use mender_pipeline::{
    DirectorySnapshotManager, EventEmitter, GitSnapshotManager, MenderConfig, PipelineController,
    PipelineEvent, RunReport, SnapshotManager,
};
use mender_tools::{ExecutionEnvironment, LocalExecutionEnvironment};

#[derive(Parser)]
#[command(name = "mender", version, about = "Self-healing validation for automated code changes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the working tree, repairing failures and rolling back on defeat
    Run {
        /// Repository to validate (default: current directory)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Configuration file (default: <workdir>/mender.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Maximum outer iterations before giving up
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Overall run deadline in seconds
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// Snapshot strategy (default: git when the workdir is a git repository)
        #[arg(long, value_enum)]
        snapshot: Option<SnapshotKind>,

        /// Write the JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,

        /// Do not call the fixer agent; only deterministic auto-fixes run
        #[arg(long)]
        no_agent: bool,

        /// Agent program to use instead of the configured one
        #[arg(long)]
        agent: Option<String>,
    },

    /// List the configured checks in execution order
    Checks {
        /// Repository whose configuration to read (default: current directory)
        #[arg(short, long)]
        workdir: Option<PathBuf>,

        /// Configuration file (default: <workdir>/mender.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the wait schedule between fixer retries
    Backoff {
        /// Number of retries to show
        #[arg(long, default_value = "4")]
        retries: u32,

        /// Configuration file providing backoff_base / backoff_max
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SnapshotKind {
    Git,
    Dir,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            workdir,
            config,
            max_iterations,
            deadline_secs,
            snapshot,
            report,
            no_agent,
            agent,
        } => {
            let options = RunOptions {
                max_iterations,
                deadline: deadline_secs.map(Duration::from_secs),
                snapshot,
                report,
                use_agent: !no_agent,
                agent,
            };
            cmd_run(workdir.as_deref(), config.as_deref(), options).await
        }
        Commands::Checks { workdir, config } => {
            cmd_checks(workdir.as_deref(), config.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Backoff { retries, config } => {
            cmd_backoff(retries, config.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

struct RunOptions {
    max_iterations: Option<u32>,
    deadline: Option<Duration>,
    snapshot: Option<SnapshotKind>,
    report: Option<PathBuf>,
    use_agent: bool,
    agent: Option<String>,
}

fn resolve_workdir(workdir: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = match workdir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir()?,
    };
    std::fs::canonicalize(&dir).map_err(|e| anyhow::anyhow!("cannot open {}: {}", dir.display(), e))
}

fn load_config(workdir: &Path, config: Option<&Path>) -> anyhow::Result<MenderConfig> {
    let loaded = match config {
        Some(path) => MenderConfig::load(path)?,
        None => MenderConfig::discover(workdir)?,
    };
    Ok(loaded)
}

async fn cmd_run(
    workdir: Option<&Path>,
    config_path: Option<&Path>,
    options: RunOptions,
) -> anyhow::Result<ExitCode> {
    let workdir = resolve_workdir(workdir)?;
    let mut config = load_config(&workdir, config_path)?;
    if let Some(agent) = options.agent {
        config.agent.program = agent;
    }

    let mut controller_config = config.controller_config()?;
    if let Some(max) = options.max_iterations {
        anyhow::ensure!(max > 0, "--max-iterations must be at least 1");
        controller_config.max_pipeline_iterations = max;
    }
    if let Some(deadline) = options.deadline {
        controller_config.run_deadline = Some(deadline);
    }

    let env: Arc<dyn ExecutionEnvironment> = Arc::new(LocalExecutionEnvironment::new(&workdir));
    let registry = config.build_registry(env.clone(), options.use_agent)?;

    let kind = options.snapshot.unwrap_or(if workdir.join(".git").exists() {
        SnapshotKind::Git
    } else {
        SnapshotKind::Dir
    });
    tracing::debug!(?kind, workdir = %workdir.display(), "selected snapshot strategy");
    let snapshots: Arc<dyn SnapshotManager> = match kind {
        SnapshotKind::Git => Arc::new(GitSnapshotManager::new(env.clone())),
        SnapshotKind::Dir => Arc::new(DirectorySnapshotManager::new(&workdir)),
    };

    println!("Validating: {}", workdir.display());
    println!(
        "Checks: {} | Max iterations: {} | Snapshot: {:?}",
        registry.len(),
        controller_config.max_pipeline_iterations,
        kind
    );
    if let Some(deadline) = controller_config.run_deadline {
        println!("Deadline: {}s", deadline.as_secs());
    }
    if !options.use_agent || !config.agent.enabled {
        println!("(agent disabled -- only auto-fixes will run)");
    }

    let events = EventEmitter::default();
    let progress = tokio::spawn(print_progress(events.subscribe()));
    let mut controller =
        PipelineController::new(&workdir, registry, snapshots, controller_config).with_events(events);
    if let Some(analyzer) = config.build_analyzer(env.clone(), options.use_agent) {
        controller = controller.with_analyzer(analyzer);
    }
    let result = controller.run().await;
    drop(controller);
    let _ = progress.await;

    let report = result?;
    print_report(&report);
    if let Some(path) = &options.report {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        tracing::info!(path = %path.display(), "report written");
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Print one line per notable event until the emitter is dropped.
async fn print_progress(mut rx: tokio::sync::broadcast::Receiver<PipelineEvent>) {
    use tokio::sync::broadcast::error::RecvError;
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event {
            PipelineEvent::IterationStarted { iteration } => println!("\n== Iteration {iteration} =="),
            PipelineEvent::PhaseStarted { phase, .. } => println!("-- {} --", phase.title()),
            PipelineEvent::CheckRetrying { check, attempt, delay_ms } => {
                println!("   {check}: fix attempt {attempt}, re-checking in {}s", delay_ms / 1000)
            }
            PipelineEvent::CheckCompleted { check, outcome, .. } => println!("   {check}: {outcome}"),
            PipelineEvent::SnapshotRestored { .. } => println!("\nWorking tree restored to its pre-run state"),
            _ => {}
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    for line in &report.analysis {
        println!("{line}");
    }
    if let Some(analysis) = &report.agent_analysis {
        println!("\nAgent analysis:\n{analysis}");
    }
    if !report.files_modified.is_empty() {
        println!("\nFiles modified:");
        for file in &report.files_modified {
            println!("  {file}");
        }
    }
    if !report.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  {warning}");
        }
    }
}

fn cmd_checks(workdir: Option<&Path>, config_path: Option<&Path>) -> anyhow::Result<()> {
    let workdir = resolve_workdir(workdir)?;
    let config = load_config(&workdir, config_path)?;
    let checks = config.resolve_checks()?;

    let mut current = None;
    for check in &checks {
        if current != Some(check.phase) {
            println!("{} ({})", check.phase.title(), check.phase);
            current = Some(check.phase);
        }
        if config.reviews(check, true) {
            println!("  {:<16} agent review ({})", check.name, config.agent.program);
            println!("  {:<16} without agent: {}", "", check.command);
        } else {
            println!("  {:<16} {}", check.name, check.command);
        }
        if let Some(fix) = &check.auto_fix {
            println!("  {:<16} auto-fix: {}", "", fix);
        }
        println!(
            "  {:<16} retries: {}, timeout: {}s, agent: {}",
            "",
            check.retry_budget,
            check.timeout.as_secs(),
            if check.agent && config.agent.enabled { config.agent.program.as_str() } else { "off" }
        );
    }
    Ok(())
}

fn cmd_backoff(retries: u32, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => MenderConfig::load(path)?,
        None => MenderConfig::default(),
    };
    let policy = config.controller_config()?.backoff;
    let mut total = Duration::ZERO;
    for (retry, delay) in policy.schedule(retries).into_iter().enumerate() {
        total += delay;
        println!("retry {retry}: wait {}s (cumulative {}s)", delay.as_secs_f64(), total.as_secs_f64());
    }
    Ok(())
}
