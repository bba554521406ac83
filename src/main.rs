use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sea_runner::orchestrator::RunOrchestrator;
use sea_runner::server::{self, AppState};
use sea_runner::state::RunState;
use sea_runner::store::{ConfigurationStore, JsonFileStore, ResultStore, Stores, ToolStore};
use sea_runner::supervisor::OsSupervisor;
use sea_runner::types::{RunConfiguration, RunResult, ToolConfiguration};

/// sea-runner: run groups of external security tools as supervised, pausable scans.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "sea-runner",
    version,
    about = "Run groups of external security tools as supervised, pausable scans.",
    long_about = None
)]
struct Cli {
    /// Directory holding run configurations and run results.
    #[arg(long, default_value = "sea-store")]
    store: PathBuf,

    /// Debug-level logging (RUST_LOG overrides).
    #[arg(long, short, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Add a run configuration from a JSON file to the store.
    Import { file: PathBuf },
    /// List stored run configurations.
    List,
    /// Execute a stored run until every scan finishes (Ctrl+C stops it).
    Run {
        name: String,
        /// Write the run result as pretty JSON to this path (optional).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the execution history of a run.
    History { name: String },
    /// Add a tool configuration from a JSON file to the tool library.
    AddTool { file: PathBuf },
    /// List the tool library.
    Tools,
    /// Remove a tool from the tool library.
    RemoveTool { name: String },
    /// Serve the HTTP control API.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "sea_runner=debug"
    } else {
        "sea_runner=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let store = Arc::new(JsonFileStore::open(&cli.store)?);
    let stores = Stores::shared(store.clone());

    match cli.command {
        Command::Import { file } => import(store.as_ref(), &file),
        Command::List => list(store.as_ref()),
        Command::Run { name, output } => run(&name, stores, output.as_deref()).await,
        Command::History { name } => history(store.as_ref(), &name),
        Command::AddTool { file } => add_tool(store.as_ref(), &file),
        Command::Tools => tools(store.as_ref()),
        Command::RemoveTool { name } => remove_tool(store.as_ref(), &name),
        Command::Serve { bind } => serve(&bind, stores).await,
    }
}

fn import(store: &dyn ConfigurationStore, file: &Path) -> Result<()> {
    let f = File::open(file).with_context(|| format!("failed to open {}", file.display()))?;
    let mut config: RunConfiguration = serde_json::from_reader(f)
        .with_context(|| format!("failed to parse run configuration {}", file.display()))?;
    config.settle_run_state();
    let ack = store.create_run_configuration(&config)?;
    if !ack.acknowledged {
        bail!("a run named {} already exists", config.name);
    }
    println!(
        "Imported run {} ({} scans)",
        config.name,
        config.scan_configurations.len()
    );
    Ok(())
}

fn list(store: &dyn ConfigurationStore) -> Result<()> {
    let all = store.read_all_run_configurations()?;
    let name_w = all.iter().map(|c| c.name.len()).max().unwrap_or(0).max("name".len());
    println!("{:<name_w$}  {:<12}  {:>5}", "name", "state", "scans", name_w = name_w);
    println!("{:-<name_w$}  {:-<12}  {:-<5}", "", "", "", name_w = name_w);
    for c in &all {
        println!(
            "{:<name_w$}  {:<12}  {:>5}",
            c.name,
            c.run_state.to_string(),
            c.scan_configurations.len(),
            name_w = name_w
        );
    }
    Ok(())
}

async fn run(name: &str, stores: Stores, output: Option<&Path>) -> Result<()> {
    let Some(orch) = RunOrchestrator::load(name, stores, Arc::new(OsSupervisor::new()))? else {
        bail!("no run named {name} in the store");
    };

    // Ctrl-C stops the run.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    orch.play().await;
    ensure_started(name, orch.state())?;
    info!(run = name, state = %orch.state(), "run started");

    tokio::select! {
        _ = orch.wait_terminated() => {}
        _ = cancel.cancelled() => {
            warn!(run = name, "interrupted; stopping scans");
            orch.stop().await;
        }
    }

    let (_, result) = orch.snapshot().await;
    let Some(result) = result else {
        println!("Run {name} did not start (state {}).", orch.state());
        return Ok(());
    };
    print_result_table(&result);
    if let Some(path) = output {
        if let Err(e) = write_result_json(path, &result) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON result to {}", path.display());
        }
    }
    Ok(())
}

/// A run that `play` left anywhere but `Active` or `Terminated` would never finish.
fn ensure_started(name: &str, state: RunState) -> Result<()> {
    match state {
        RunState::Active | RunState::Terminated => Ok(()),
        other => bail!("run {name} did not start (state {other}); does it have any scans?"),
    }
}

fn history(store: &dyn ResultStore, name: &str) -> Result<()> {
    let results = store.read_run_results(name)?;
    if results.is_empty() {
        println!("No results recorded for {name}.");
        return Ok(());
    }
    for r in &results {
        print_result_table(r);
    }
    Ok(())
}

fn add_tool(store: &dyn ToolStore, file: &Path) -> Result<()> {
    let f = File::open(file).with_context(|| format!("failed to open {}", file.display()))?;
    let tool: ToolConfiguration = serde_json::from_reader(f)
        .with_context(|| format!("failed to parse tool configuration {}", file.display()))?;
    if !store.create_tool_configuration(&tool)?.acknowledged {
        bail!("a tool named {} already exists", tool.name);
    }
    println!("Added tool {} ({})", tool.name, tool.path);
    Ok(())
}

fn tools(store: &dyn ToolStore) -> Result<()> {
    for t in store.read_all_tool_configurations()? {
        println!("{}  {} {}", t.name, t.path, t.arg_list().join(" "));
    }
    Ok(())
}

fn remove_tool(store: &dyn ToolStore, name: &str) -> Result<()> {
    if !store.delete_tool_configuration(name)? {
        bail!("no tool named {name}");
    }
    println!("Removed tool {name}");
    Ok(())
}

async fn serve(bind: &str, stores: Stores) -> Result<()> {
    let state = AppState::new(stores, Arc::new(OsSupervisor::new()));
    let shutdown = CancellationToken::new();
    let shutdown_ctrlc = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_ctrlc.cancel();
    });
    println!("Press Ctrl+C to stop the server...");
    server::spawn_server(bind, state.clone(), shutdown).await?;
    state.stop_all().await;
    Ok(())
}

fn print_result_table(result: &RunResult) {
    let mut scan_w = "scan".len();
    for s in &result.scan_results {
        scan_w = scan_w.max(s.scan_name.len());
    }
    let time_w = 20usize.max("started".len());
    let status_w = "status".len().max("failed".len());

    println!(
        "\nRun {} @ {} ({} scans)",
        result.run_name(),
        result.timestamp,
        result.scan_results.len()
    );
    println!(
        "{:<scan_w$}  {:<status_w$}  {:<time_w$}  {:<time_w$}  {:>8}",
        "scan",
        "status",
        "started",
        "ended",
        "output_b",
        scan_w = scan_w,
        status_w = status_w,
        time_w = time_w
    );
    println!(
        "{:-<scan_w$}  {:-<status_w$}  {:-<time_w$}  {:-<time_w$}  {:-<8}",
        "",
        "",
        "",
        "",
        "",
        scan_w = scan_w,
        status_w = status_w,
        time_w = time_w
    );
    for s in &result.scan_results {
        let status = if s.execution_status { "ok" } else { "failed" };
        println!(
            "{:<scan_w$}  {:<status_w$}  {:<time_w$}  {:<time_w$}  {:>8}",
            s.scan_name,
            status,
            s.start_time.as_deref().unwrap_or("-"),
            s.end_time.as_deref().unwrap_or("-"),
            s.formatted_scan_output.len(),
            scan_w = scan_w,
            status_w = status_w,
            time_w = time_w
        );
    }
}

fn write_result_json(path: &Path, result: &RunResult) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    Ok(())
}
