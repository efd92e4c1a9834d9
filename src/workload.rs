//! Per-client workload: which key to touch, whether to read or write it, and when to send.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Exp, Zipf};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time;

use crate::config::Config;
use crate::wire::OpKind;

/// Key shared by all clients when a request is picked to conflict.
pub const CONTENTION_KEY: i64 = 42;

// Key space reserved for every client's private keys.
const CLIENT_KEY_STRIDE: i64 = 1 << 32;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KeyPolicy {
    /// `contention` percent of requests hit [`CONTENTION_KEY`], the rest get fresh keys.
    Hotspot { contention: u32 },
    Zipfian { keys: u64, theta: f64 },
}

impl KeyPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        if cfg.conflicts < 0 {
            KeyPolicy::Zipfian {
                keys: cfg.zipf_keys,
                theta: cfg.zipf_theta,
            }
        } else {
            KeyPolicy::Hotspot {
                contention: cfg.conflicts as u32,
            }
        }
    }
}

enum KeySource {
    Hotspot {
        contention: u32,
        offset: i64,
        counter: i64,
    },
    Zipfian(Zipf<f64>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operation {
    pub key: i64,
    pub op: OpKind,
}

pub struct WorkloadGenerator {
    keys: KeySource,
    write_fraction: f64,
    key_rng: StdRng,
    op_rng: StdRng,
}

impl WorkloadGenerator {
    pub fn new(
        policy: KeyPolicy,
        write_fraction: f64,
        key_range_start: i64,
        client: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        let keys = match policy {
            KeyPolicy::Hotspot { contention } => {
                if contention > 100 {
                    bail!("contention must be a percentage, got {contention}");
                }
                KeySource::Hotspot {
                    contention,
                    offset: key_range_start + CONTENTION_KEY + 1 + client as i64 * CLIENT_KEY_STRIDE,
                    counter: 0,
                }
            }
            KeyPolicy::Zipfian { keys, theta } => KeySource::Zipfian(
                Zipf::new(keys as f64, theta).map_err(|err| anyhow!("zipfian keys: {err}"))?,
            ),
        };
        Ok(Self {
            keys,
            write_fraction,
            key_rng: client_rng(seed, client, 0),
            op_rng: client_rng(seed, client, 1),
        })
    }

    pub fn from_config(cfg: &Config, client: usize) -> Result<Self> {
        Self::new(
            KeyPolicy::from_config(cfg),
            cfg.write_fraction,
            cfg.key_range_start,
            client,
            cfg.seed,
        )
    }

    pub fn next_key(&mut self) -> i64 {
        match &mut self.keys {
            KeySource::Hotspot {
                contention,
                offset,
                counter,
            } => {
                if self.key_rng.random_range(0..100) < *contention {
                    return CONTENTION_KEY;
                }
                let key = *offset + *counter;
                *counter += 1;
                key
            }
            // zipf samples start at 1
            KeySource::Zipfian(zipf) => zipf.sample(&mut self.key_rng) as i64 - 1,
        }
    }

    pub fn next_op(&mut self) -> OpKind {
        if self.write_fraction > self.op_rng.random::<f64>() {
            OpKind::Write
        } else {
            OpKind::Read
        }
    }

    pub fn next_operation(&mut self) -> Operation {
        Operation {
            key: self.next_key(),
            op: self.next_op(),
        }
    }
}

/// Decides when the next request may leave, given the client's concurrency gate.
///
/// Closed loop sends as soon as a slot is free. Open loop draws exponential inter-arrival
/// times; departures missed while the gate is saturated are counted and later sent
/// back-to-back, without sleeping, as slots become available.
pub struct Pacer {
    arrivals: Option<Exp<f64>>,
    rng: StdRng,
    deficit: u64,
}

impl Pacer {
    pub fn new(poisson_mean_us: Option<u64>, client: usize, seed: Option<u64>) -> Result<Self> {
        let arrivals = match poisson_mean_us {
            Some(mean) if mean > 0 => Some(
                Exp::new(1.0 / mean as f64).map_err(|err| anyhow!("poisson arrivals: {err}"))?,
            ),
            Some(_) => bail!("poisson mean must be positive"),
            None => None,
        };
        Ok(Self {
            arrivals,
            rng: client_rng(seed, client, 2),
            deficit: 0,
        })
    }

    pub fn deficit(&self) -> u64 {
        self.deficit
    }

    pub async fn acquire(&mut self, gate: &Arc<Semaphore>) -> Result<OwnedSemaphorePermit> {
        let Self {
            arrivals,
            rng,
            deficit,
        } = self;
        let Some(exp) = arrivals else {
            return Ok(gate.clone().acquire_owned().await?);
        };
        loop {
            match gate.clone().try_acquire_owned() {
                Ok(permit) => {
                    if *deficit == 0 {
                        time::sleep(next_arrival(exp, rng)).await;
                    } else {
                        *deficit -= 1;
                    }
                    return Ok(permit);
                }
                Err(TryAcquireError::NoPermits) => {
                    time::sleep(next_arrival(exp, rng)).await;
                    *deficit += 1;
                }
                Err(TryAcquireError::Closed) => bail!("concurrency gate closed"),
            }
        }
    }
}

fn next_arrival(exp: &Exp<f64>, rng: &mut StdRng) -> Duration {
    Duration::from_secs_f64(exp.sample(rng) / 1e6)
}

// Every client gets its own streams for keys, operations and arrivals.
fn client_rng(seed: Option<u64>, client: usize, stream: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ ((client as u64) << 8 | stream)),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}
