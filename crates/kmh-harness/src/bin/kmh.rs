//! `kmh` command line: batch runs and the internal worker entry point.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kmh_harness::{run_worker, BatchDriver, WorkerCommand};
use kmh_types::{CheckpointGranularity, HarnessConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kmh", version, about = "Isolated k-medoids optimization batch runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CheckpointArg {
    #[value(name = "per-job")]
    PerJob,
    #[value(name = "per-instance")]
    PerInstance,
}

impl From<CheckpointArg> for CheckpointGranularity {
    fn from(value: CheckpointArg) -> Self {
        match value {
            CheckpointArg::PerJob => CheckpointGranularity::PerJob,
            CheckpointArg::PerInstance => CheckpointGranularity::PerInstance,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Solve every instance for every k and checkpoint the results
    Run {
        /// JSON config file; flags below override its fields
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Directory holding the instance files
        #[arg(long)]
        instances: Option<PathBuf>,
        /// Cluster counts, comma separated
        #[arg(long, value_delimiter = ',')]
        k: Option<Vec<usize>>,
        /// Solver budget per job, seconds
        #[arg(long)]
        time_limit: Option<f64>,
        /// Extra seconds before a worker is killed
        #[arg(long)]
        grace: Option<f64>,
        /// Worker processes alive at once
        #[arg(long)]
        pool: Option<usize>,
        #[arg(long, value_enum)]
        checkpoint: Option<CheckpointArg>,
        /// Skip (file, k) pairs already in the checkpoint
        #[arg(long)]
        resume: bool,
        /// Solver strategy: exact or grasp
        #[arg(long)]
        solver: Option<String>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Use only the first N points of each instance
        #[arg(long)]
        max_points: Option<usize>,
        /// Output directory for the checkpoint
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Solve a single job request (spawned by `run`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value_t = 30.0)]
        io_timeout: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            instances,
            k,
            time_limit,
            grace,
            pool,
            checkpoint,
            resume,
            solver,
            threads,
            seed,
            max_points,
            output,
        } => {
            let mut cfg = match config {
                Some(path) => HarnessConfig::from_json_file(&path)
                    .with_context(|| format!("reading config {}", path.display()))?,
                None => HarnessConfig::default(),
            };
            if let Some(dir) = instances {
                cfg = cfg.with_instance_dir(dir);
            }
            if let Some(ks) = k {
                cfg = cfg.with_ks(ks);
            }
            if let Some(seconds) = time_limit {
                cfg = cfg.with_time_limit(seconds);
            }
            if let Some(seconds) = grace {
                cfg = cfg.with_grace_period(seconds);
            }
            if let Some(n) = pool {
                cfg = cfg.with_pool_size(n);
            }
            if let Some(granularity) = checkpoint {
                cfg = cfg.with_checkpoint(granularity.into());
            }
            if resume {
                cfg = cfg.with_resume(true);
            }
            if let Some(name) = solver {
                cfg.solver.name = name;
            }
            if threads.is_some() {
                cfg.solver.threads = threads;
            }
            if seed.is_some() {
                cfg.solver.seed = seed;
            }
            if max_points.is_some() {
                cfg.max_points = max_points;
            }
            if let Some(dir) = output {
                cfg = cfg.with_output_dir(dir);
            }

            let driver = BatchDriver::new(cfg, WorkerCommand::current_exe()?)?;
            let cancel = driver.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, finishing running jobs");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let status = driver.run().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Worker {
            input,
            output,
            io_timeout,
        } => {
            let timeout = Duration::from_secs_f64(io_timeout.max(0.0));
            run_worker(&input, &output, timeout)
                .await
                .with_context(|| format!("worker for {}", input.display()))?;
            Ok(())
        }
    }
}
