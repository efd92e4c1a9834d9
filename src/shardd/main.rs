use anyhow::Result;
use clap::Parser;
use smrload::api::shard::shard_store_server::ShardStoreServer;
use smrload::shard::server::MemoryShardStore;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "In-memory shard store", long_about = None)]
struct Args {
    #[arg(long, default_value = "[::1]")]
    host: String,
    #[arg(short, long)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port).parse()?;
    info!(%addr, "serving shard store");
    Server::builder()
        .add_service(ShardStoreServer::new(MemoryShardStore::new()))
        .serve(addr)
        .await?;

    Ok(())
}
