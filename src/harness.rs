//! Wires discovery, shard stores, simulated clients and the reporter into one run.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::client::{spawn_client, ClientHandle};
use crate::config::Config;
use crate::control::{ControlPlane, Discovery, GrpcControlPlane};
use crate::shard::{ErasureStorage, GrpcShardStore, ShardStore};
use crate::stats::{RampFilter, ReportMode, Reporter};

/// Opens the connection a simulated client talks to its replica over.
#[tonic::async_trait]
pub trait Dialer: Send + Sync {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, addr: &str) -> Result<(Self::Reader, Self::Writer)>;
}

pub struct TcpDialer;

#[tonic::async_trait]
impl Dialer for TcpDialer {
    type Reader = BufReader<OwnedReadHalf>;
    type Writer = BufWriter<OwnedWriteHalf>;

    async fn dial(&self, addr: &str) -> Result<(Self::Reader, Self::Writer)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (rd, wr) = stream.into_split();
        Ok((BufReader::new(rd), BufWriter::new(wr)))
    }
}

pub struct Harness<C, D> {
    cfg: Config,
    discovery: Discovery<C>,
    dialer: D,
    stores: Vec<Arc<dyn ShardStore>>,
}

impl Harness<GrpcControlPlane, TcpDialer> {
    pub fn from_config(cfg: Config) -> Result<Self> {
        let control = GrpcControlPlane::new(&cfg.control_addr)?;
        let stores = cfg
            .shards
            .iter()
            .map(|addr| Ok(Arc::new(GrpcShardStore::new(addr)?) as Arc<dyn ShardStore>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(cfg, control, TcpDialer, stores))
    }
}

impl<C: ControlPlane, D: Dialer> Harness<C, D> {
    pub fn new(cfg: Config, control: C, dialer: D, stores: Vec<Arc<dyn ShardStore>>) -> Self {
        let discovery = Discovery::new(control, cfg.backoff.clone());
        Self {
            cfg,
            discovery,
            dialer,
            stores,
        }
    }

    /// Connects every simulated client and starts the reporter. Fails if a replica can't
    /// be reached.
    pub async fn start(self) -> Result<Running> {
        let Harness {
            cfg,
            mut discovery,
            dialer,
            stores,
        } = self;

        let replicas = discovery.resolve_replica_list().await;
        if replicas.is_empty() {
            bail!("control plane reported an empty replica set");
        }
        let leader = if cfg.single_cluster {
            None
        } else {
            let leader = discovery.resolve_leader(cfg.force_leader).await;
            if leader >= replicas.len() {
                bail!("leader {leader} is not in the replica set of {}", replicas.len());
            }
            Some(leader)
        };
        // ramps count from here, not from the first discovery attempt
        let experiment_start = SystemTime::now();

        let storage = Arc::new(ErasureStorage::new(stores, cfg.payload_size)?);
        let (tx, rx) = mpsc::channel(cfg.channel_capacity);
        let mut clients = Vec::with_capacity(cfg.threads);
        for client in 0..cfg.threads {
            let replica = leader.unwrap_or(client % replicas.len());
            let addr = &replicas[replica];
            let conn = dialer
                .dial(addr)
                .await
                .with_context(|| format!("connecting to replica {replica} at {addr}"))?;
            clients.push(spawn_client(&cfg, client, replica, conn, storage.clone(), tx.clone())?);
        }
        drop(tx);
        info!(
            clients = clients.len(),
            replicas = replicas.len(),
            data_shards = storage.data_shards(),
            "all clients connected"
        );

        let mode = if cfg.single_cluster {
            ReportMode::PerTarget(RampFilter {
                experiment_start,
                ramp_up: cfg.ramp_up(),
                ramp_down: cfg.ramp_down(),
                timeout: cfg.timeout(),
            })
        } else {
            ReportMode::Aggregate
        };
        let tables = clients.iter().map(|c| c.table.clone()).collect();
        let reporter = tokio::spawn(Reporter::new(rx, tables, cfg.output_dir.clone(), mode).run());
        Ok(Running { clients, reporter })
    }

    pub async fn run(self) -> Result<()> {
        self.start().await?.wait().await;
        Ok(())
    }
}

pub struct Running {
    pub clients: Vec<ClientHandle>,
    pub reporter: JoinHandle<Result<()>>,
}

impl Running {
    /// Waits for the reporter, which finishes once every client is done, then for the
    /// clients themselves.
    pub async fn wait(self) {
        match self.reporter.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = format!("{err:#}"), "statistics reporter failed"),
            Err(err) => error!(error = %err, "statistics reporter panicked"),
        }
        for client in self.clients {
            client.join().await;
        }
    }
}
