use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use stage_exec::executor::{CommandRunner, ShellRunner};
use stage_exec::recovery::restore;
use stage_exec::tracker::JobSummary;
use stage_exec::{
    BackendConfig, BackendType, Command, CommandStatus, ExecutionResult, ExecutorSettings,
    JobTracker, PollPolicy, RecoveryStore,
};

#[derive(Parser, Debug)]
#[command(name = "stage-exec")]
#[command(version)]
#[command(about = "Run pipeline stage commands locally or on SGE/Slurm")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a command and wait for its exit code
    Run(RunArgs),

    /// Show every in-flight command recorded under the workroot
    Status {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Reattach to in-flight commands left by an earlier run and wait for them
    Recover {
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Cancel an in-flight command
    Stop {
        /// Command ID
        id: String,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct GlobalArgs {
    /// Root directory for job directories and recovery snapshots
    #[arg(long, global = true, default_value = ".stage-exec")]
    workroot: PathBuf,

    /// Poll interval while the exit file is absent (milliseconds)
    #[arg(long, global = true, default_value = "5000")]
    poll_interval_ms: u64,

    /// Retry interval while the exit file is present but unreadable (milliseconds)
    #[arg(long, global = true, default_value = "100")]
    exit_retry_interval_ms: u64,

    /// Attempts to parse an existing exit file before giving up
    #[arg(long, global = true, default_value = "10")]
    exit_read_retries: u32,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Execution backend
    #[arg(long, short = 'b', default_value = "local")]
    backend: BackendType,

    /// Command ID (defaults to a random UUID)
    #[arg(long)]
    id: Option<String>,

    /// Human-readable name, also used as the scheduler job name
    #[arg(long, default_value = "")]
    name: String,

    /// Working directory of the command
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Backend configuration, repeatable (e.g. -c queue=long -c procs="orte 4")
    #[arg(long = "config", short = 'c', value_parser = parse_config_pair)]
    config: Vec<(String, String)>,

    /// Cancel the job when interrupted instead of leaving it in flight
    #[arg(long)]
    stop_on_interrupt: bool,

    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Shell command text
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    text: Vec<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn parse_config_pair(s: &str) -> Result<(String, String), String> {
    BackendConfig::parse_pair(s).map_err(|e| e.to_string())
}

impl GlobalArgs {
    fn settings(&self) -> ExecutorSettings {
        ExecutorSettings::new(&self.workroot).with_poll(PollPolicy {
            coarse_interval: Duration::from_millis(self.poll_interval_ms),
            fine_interval: Duration::from_millis(self.exit_retry_interval_ms),
            exit_read_retries: self.exit_read_retries,
        })
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = args.global.settings();
    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);

    match args.command {
        Commands::Run(run) => handle_run(settings, runner, run).await,
        Commands::Status { output } => handle_status(settings, runner, &output).await,
        Commands::Recover { output } => handle_recover(settings, runner, &output).await,
        Commands::Stop { id } => handle_stop(settings, runner, &id).await,
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(
    settings: ExecutorSettings,
    runner: Arc<dyn CommandRunner>,
    args: RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = args
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let command = Command::new(&id, &args.name, args.text.join(" ")).with_workdir(&args.workdir);
    let config: BackendConfig = args.config.into_iter().collect();

    let tracker = JobTracker::new(settings, runner);
    let shutdown = stage_exec::shutdown::install_shutdown_handler();

    let executor = tracker.submit(args.backend, command, &config).await?;
    tracing::info!(
        command_id = %id,
        backend = %args.backend,
        job_id = ?executor.job_id(),
        "Waiting for command"
    );

    let result = tokio::select! {
        result = tracker.wait(&id) => result?,
        _ = shutdown.cancelled() => {
            if !args.stop_on_interrupt {
                eprintln!(
                    "Interrupted; command {} is still in flight. Use `stage-exec recover` to reattach.",
                    id
                );
                return Ok(());
            }
            tracing::info!(command_id = %id, "Stopping command after interrupt");
            if let Err(e) = tracker.stop(&id).await {
                tracing::warn!(command_id = %id, error = %e, "Stop failed");
            }
            tracker.wait(&id).await?
        }
    };

    print_results(std::slice::from_ref(&result), &args.output)?;
    if !result.success() {
        std::process::exit(process_exit_code(result.exit_code));
    }
    Ok(())
}

async fn handle_status(
    settings: ExecutorSettings,
    runner: Arc<dyn CommandRunner>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = RecoveryStore::new(&settings);
    let mut summaries = Vec::new();
    for snapshot in store.load_all().await? {
        let executor = restore(&snapshot, settings.clone(), runner.clone());
        let status = executor.status();
        summaries.push(JobSummary {
            command_id: snapshot.command_id.clone(),
            name: snapshot.name.clone(),
            backend: snapshot.backend,
            job_id: snapshot.job_id.clone(),
            status,
            message: executor.status_message(),
        });
    }

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
        OutputFormat::Table => {
            if summaries.is_empty() {
                println!("No commands in flight.");
            } else {
                println!(
                    "{:<38} {:<8} {:<12} {:<10} NAME",
                    "COMMAND ID", "BACKEND", "JOB ID", "STATUS"
                );
                println!("{}", "-".repeat(80));
                for s in &summaries {
                    println!(
                        "{:<38} {:<8} {:<12} {:<10} {}",
                        s.command_id,
                        s.backend,
                        s.job_id.as_deref().unwrap_or("-"),
                        s.status,
                        s.name
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_recover(
    settings: ExecutorSettings,
    runner: Arc<dyn CommandRunner>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let tracker = JobTracker::new(settings, runner);
    let shutdown = stage_exec::shutdown::install_shutdown_handler();

    let ids = tracker.recover().await?;
    if ids.is_empty() {
        println!("Nothing to recover.");
        return Ok(());
    }
    tracing::info!(count = ids.len(), "Waiting for recovered commands");

    let results = tokio::select! {
        results = tracker.wait_all() => results,
        _ = shutdown.cancelled() => {
            eprintln!("Interrupted; recovered commands are still in flight.");
            return Ok(());
        }
    };

    let mut finished = Vec::new();
    for result in results {
        match result {
            Ok(r) => finished.push(r),
            Err(e) => eprintln!("Error: {}", e),
        }
    }
    print_results(&finished, output_format)?;
    Ok(())
}

async fn handle_stop(
    settings: ExecutorSettings,
    runner: Arc<dyn CommandRunner>,
    id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = RecoveryStore::new(&settings);
    let Some(snapshot) = store.load(id).await? else {
        eprintln!("Error: no in-flight command with id {}", id);
        std::process::exit(1);
    };

    let executor = restore(&snapshot, settings, runner);
    match executor.stop().await {
        Ok(()) => {
            store.remove(id).await?;
            println!("Stopped: {}", executor.status_message());
        }
        Err(e) => {
            // A failed cancellation may still mean the job is gone.
            if executor.status() == CommandStatus::Complete {
                store.remove(id).await?;
                println!("Already finished: {}", executor.status_message());
            } else {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

#[derive(Serialize)]
struct ResultsOutput<'a> {
    results: &'a [ExecutionResult],
}

fn print_results(
    results: &[ExecutionResult],
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            let output = ResultsOutput { results };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            for result in results {
                println!("Command ID:  {}", result.command_id);
                println!("Status:      {}", result.status);
                println!("Exit Code:   {}", result.exit_code);
                if let Some(out) = result.output.as_deref().filter(|s| !s.is_empty()) {
                    println!("Output:");
                    for line in out.lines() {
                        println!("  {}", line);
                    }
                }
                if let Some(err) = result.error.as_deref().filter(|s| !s.is_empty()) {
                    println!("Error:");
                    for line in err.lines() {
                        println!("  {}", line);
                    }
                }
            }
        }
    }
    Ok(())
}

fn process_exit_code(code: i32) -> i32 {
    if (1..=255).contains(&code) {
        code
    } else {
        1
    }
}
