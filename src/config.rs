use std::path::PathBuf;
use std::{fs, time::Duration};

use anyhow::{bail, Result};
use serde::Deserialize;

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BackoffCfg {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffCfg {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_ms: 5000,
        }
    }
}

impl BackoffCfg {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Size of the payload written to the shard stores on every write, in bytes.
    pub payload_size: usize,
    /// Shard store endpoints. The last fragment of every payload is parity.
    pub shards: Vec<String>,
    pub control_addr: String,
    /// Max outstanding requests per simulated client.
    pub outstanding: usize,
    /// Percentage of requests hitting the contention key, -1 switches to zipfian keys.
    pub conflicts: i32,
    pub key_range_start: i64,
    pub zipf_theta: f64,
    pub zipf_keys: u64,
    /// Mean inter-arrival time in microseconds, closed loop when unset.
    pub poisson_mean_us: Option<u64>,
    pub write_fraction: f64,
    pub threads: usize,
    pub ramp_up_secs: u64,
    pub ramp_down_secs: u64,
    pub timeout_secs: u64,
    pub force_leader: Option<usize>,
    /// Spread clients over all replicas and split latency logs per replica.
    pub single_cluster: bool,
    pub channel_capacity: usize,
    pub ops_per_thread: Option<u64>,
    pub seed: Option<u64>,
    pub output_dir: PathBuf,
    pub backoff: BackoffCfg,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payload_size: 4_000_000,
            shards: Vec::new(),
            control_addr: "http://127.0.0.1:7087".to_string(),
            outstanding: 1,
            conflicts: 0,
            key_range_start: 0,
            zipf_theta: 0.99,
            zipf_keys: 1_000_000_000,
            poisson_mean_us: None,
            write_fraction: 1.0,
            threads: 16,
            ramp_up_secs: 15,
            ramp_down_secs: 15,
            timeout_secs: 180,
            force_leader: None,
            single_cluster: true,
            channel_capacity: 100_000,
            ops_per_thread: None,
            seed: None,
            output_dir: PathBuf::from("."),
            backoff: BackoffCfg::default(),
        }
    }
}

impl Config {
    pub fn new(file: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(&fs::read_to_string(file)?)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.conflicts > 100 {
            bail!("conflicts percentage must be between 0 and 100");
        }
        if !(0.0..=1.0).contains(&self.write_fraction) {
            bail!("write fraction must be between 0 and 1");
        }
        if self.shards.len() < 2 {
            bail!("need at least 2 shard stores, got {}", self.shards.len());
        }
        if self.outstanding == 0 {
            bail!("outstanding must be at least 1");
        }
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.channel_capacity == 0 {
            bail!("channel capacity must be at least 1");
        }
        if self.backoff.initial_ms == 0 {
            bail!("initial backoff must be positive");
        }
        Ok(())
    }

    pub fn ramp_up(&self) -> Duration {
        Duration::from_secs(self.ramp_up_secs)
    }

    pub fn ramp_down(&self) -> Duration {
        Duration::from_secs(self.ramp_down_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
