use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use hpc_monitor::backend::local::{CommandRunner, LocalBackend, ShellRunner};
use hpc_monitor::backend::squeue::{parse_output, squeue_command};
use hpc_monitor::backend::{Backend, SqueueRow};
use hpc_monitor::client::DashboardClient;
use hpc_monitor::config::{LocalBackendConfig, MonitorConfig, TestJobConfig};
use hpc_monitor::dashboard::{run_dashboard, DashboardState};
use hpc_monitor::session::FileStore;
use hpc_monitor::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "hpc-monitor")]
#[command(version)]
#[command(about = "Dashboard core for monitoring and driving SLURM jobs")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the dashboard API against the SLURM tools on this host
    Serve(ServeArgs),

    /// Print the current queue once
    Squeue {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Build an OCEL event log from the newest sampling-loop folder
    Ocel {
        /// Directory holding the squeue_results_* folders
        #[arg(long, default_value = ".")]
        output_root: PathBuf,
    },
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port for the dashboard API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Directory receiving the sampling loop's output folders
    #[arg(long, default_value = ".")]
    output_root: PathBuf,

    /// Directory of the saved login credential
    #[arg(long, default_value = ".hpc-monitor")]
    store_dir: PathBuf,

    /// Seconds between status polls of the tracked test job
    #[arg(long, default_value = "3")]
    job_poll_secs: u64,

    /// Snapshots kept in the chart history
    #[arg(long, default_value = "10000")]
    history_capacity: usize,

    /// Seconds between background loop-status refreshes
    #[arg(long, default_value = "5")]
    loop_refresh_secs: u64,

    // === Test job ===
    /// Remote directory receiving one folder per test job
    #[arg(long, default_value = "hpc_experiments")]
    test_job_root: String,

    /// CPUs requested by the test job
    #[arg(long, default_value = "1")]
    test_job_cpus: usize,

    /// SLURM time limit of the test job
    #[arg(long, default_value = "0-00:01:00")]
    test_job_time: String,

    /// Command run by the test job
    #[arg(long, default_value = "sleep 30")]
    test_job_command: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SqueueOutput {
    jobs: Vec<SqueueRow>,
    total_count: usize,
}

// =============================================================================
// Commands
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;

    let config = MonitorConfig::default()
        .with_store_dir(args.store_dir)
        .with_history_capacity(args.history_capacity)
        .with_job_poll_interval(Duration::from_secs(args.job_poll_secs.max(1)));
    let backend_config = LocalBackendConfig::new(args.output_root).with_test_job(TestJobConfig {
        root_dir: args.test_job_root,
        num_cpus: args.test_job_cpus,
        time: args.test_job_time,
        command: args.test_job_command,
    });

    let backend: Arc<dyn Backend> = Arc::new(LocalBackend::new(backend_config));
    let store = Arc::new(FileStore::new(config.store_dir.clone()));
    tracing::info!(dir = %store.dir().display(), "Using credential store");
    let client = Arc::new(DashboardClient::new(config, backend, store));

    client.start().await;
    client.spawn_loop_refresher(Duration::from_secs(args.loop_refresh_secs.max(1)));

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let state = DashboardState {
        client: Arc::clone(&client),
    };
    run_dashboard(addr, state, shutdown.clone()).await;

    // The server also returns early on bind failure
    shutdown.cancel();
    client.shutdown().await;
    Ok(())
}

async fn handle_squeue(output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let raw = ShellRunner.run(&squeue_command()).await?;
    let rows = parse_output(&raw);

    match output {
        OutputFormat::Json => {
            let out = SqueueOutput {
                total_count: rows.len(),
                jobs: rows,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!(
                "{:<12} {:<14} {:<12} {:<14} {:<20} {:>5}",
                "JOB ID", "ACCOUNT", "PARTITION", "STATE", "NAME", "CPUS"
            );
            println!("{}", "-".repeat(82));
            for row in &rows {
                let name: String = row.name.chars().take(20).collect();
                println!(
                    "{:<12} {:<14} {:<12} {:<14} {:<20} {:>5}",
                    row.job_id, row.account, row.partition, row.state, name, row.cpus
                );
            }
            println!("\n{} job(s)", rows.len());
        }
    }
    Ok(())
}

async fn handle_ocel(output_root: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let backend = LocalBackend::new(LocalBackendConfig::new(output_root));
    let path = backend.extract_ocel().await?;
    println!("OCEL written to {path}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match args.command {
        Commands::Serve(serve_args) => {
            run_serve(serve_args).await?;
        }
        Commands::Squeue { output } => {
            handle_squeue(&output).await?;
        }
        Commands::Ocel { output_root } => {
            handle_ocel(output_root).await?;
        }
    }

    Ok(())
}
