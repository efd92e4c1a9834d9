use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use smrload::analysis::analyze;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Summarizes the logs of a load generator run", long_about = None)]
struct Args {
    /// Directory holding lattput.txt and the latency files.
    #[arg(default_value = ".")]
    dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let metrics = analyze(&args.dir)?;
    println!("{}", serde_json::to_string(&metrics)?);
    Ok(())
}
