use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use smrload::config::Config;
use smrload::harness::Harness;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Number of simulated clients.
    #[arg(short, long)]
    threads: Option<usize>,
    /// Send every request to this replica instead of asking for the leader.
    #[arg(short, long)]
    leader: Option<usize>,
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
    #[arg(short, long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut cfg = Config::new(&args.config).with_context(|| format!("loading {}", args.config))?;
    if let Some(threads) = args.threads {
        cfg.threads = threads;
    }
    if args.leader.is_some() {
        cfg.force_leader = args.leader;
    }
    if let Some(dir) = args.output_dir {
        cfg.output_dir = dir;
    }
    if args.seed.is_some() {
        cfg.seed = args.seed;
    }
    cfg.validate()?;

    let harness = Harness::from_config(cfg)?;
    tokio::select! {
        res = harness.run() => {
            if let Err(err) = &res {
                error!(error = format!("{err:#}"), "load generator failed");
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    }
}
