//! Client of the control plane that knows the replica set of the replicated core.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use tokio::time;
use tonic::transport::Channel;
use tracing::{info, warn};

use crate::api::control::{master_client::MasterClient, GetLeaderRequest, GetReplicaListRequest};
use crate::config::BackoffCfg;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaList {
    pub ready: bool,
    pub replicas: Vec<String>,
}

#[tonic::async_trait]
pub trait ControlPlane: Send + Sync {
    async fn get_replica_list(&self) -> Result<ReplicaList>;
    async fn get_leader(&self) -> Result<usize>;
}

pub struct GrpcControlPlane {
    client: MasterClient<Channel>,
}

impl GrpcControlPlane {
    pub fn new(addr: &str) -> Result<Self> {
        let ch = Channel::from_shared(addr.to_string())
            .with_context(|| format!("parsing control plane address {addr}"))?
            .connect_lazy();
        Ok(Self {
            client: MasterClient::new(ch),
        })
    }
}

#[tonic::async_trait]
impl ControlPlane for GrpcControlPlane {
    async fn get_replica_list(&self) -> Result<ReplicaList> {
        let resp = self
            .client
            .clone()
            .get_replica_list(GetReplicaListRequest {})
            .await
            .context("GetReplicaList")?
            .into_inner();
        Ok(ReplicaList {
            ready: resp.ready,
            replicas: resp.replica_list,
        })
    }

    async fn get_leader(&self) -> Result<usize> {
        let resp = self
            .client
            .clone()
            .get_leader(GetLeaderRequest {})
            .await
            .context("GetLeader")?
            .into_inner();
        usize::try_from(resp.leader_id).map_err(|_| anyhow!("invalid leader id {}", resp.leader_id))
    }
}

/// Exponential backoff with jitter, capped at `max`.
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(cfg: &BackoffCfg) -> Self {
        Self {
            next: cfg.initial(),
            max: cfg.max(),
        }
    }

    /// Picks a delay in the upper half of the current step and doubles the step.
    pub fn next_delay(&mut self) -> Duration {
        let step = self.next.min(self.max);
        self.next = (step * 2).min(self.max);
        let half = step / 2;
        half + rand::rng().random_range(Duration::ZERO..=step - half)
    }
}

pub struct Discovery<C> {
    control: C,
    backoff: BackoffCfg,
    leader: Option<usize>,
}

impl<C: ControlPlane> Discovery<C> {
    pub fn new(control: C, backoff: BackoffCfg) -> Self {
        Self {
            control,
            backoff,
            leader: None,
        }
    }

    /// Polls the control plane until it reports a ready replica set. Never gives up.
    pub async fn resolve_replica_list(&self) -> Vec<String> {
        let mut backoff = Backoff::new(&self.backoff);
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            match self.control.get_replica_list().await {
                Ok(list) if list.ready => {
                    info!(replicas = list.replicas.len(), attempt, "replica set is ready");
                    return list.replicas;
                }
                Ok(_) => info!(attempt, "replica set not ready yet"),
                Err(err) => {
                    warn!(attempt, error = format!("{err:#}"), "fetching replica list");
                }
            }
            time::sleep(backoff.next_delay()).await;
        }
    }

    /// Replica index to send requests to. The control plane is asked at most once.
    pub async fn resolve_leader(&mut self, forced: Option<usize>) -> usize {
        if let Some(leader) = forced {
            return leader;
        }
        if let Some(leader) = self.leader {
            return leader;
        }
        let leader = match self.control.get_leader().await {
            Ok(leader) => leader,
            Err(err) => {
                warn!(error = format!("{err:#}"), "fetching leader, falling back to replica 0");
                0
            }
        };
        info!(leader, "resolved leader");
        self.leader = Some(leader);
        leader
    }
}
