//! Latency samples and the once-per-second reporter that turns them into log files.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::client::OutstandingTable;

pub const SUMMARY_FILE: &str = "lattput.txt";
pub const LATENCY_FILE: &str = "latency.txt";

/// One completed operation.
#[derive(Clone, Debug)]
pub struct Sample {
    /// Wall clock time the request was sent. `received_at` is always `issued_at + rtt`.
    pub issued_at: SystemTime,
    pub received_at: SystemTime,
    pub rtt: Duration,
    /// Not measured by the replicas yet, always zero.
    pub commit_latency: Duration,
    pub is_read: bool,
    pub replica: usize,
}

pub fn unix_nanos(t: SystemTime) -> u128 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos()
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl Sample {
    pub fn log_line(&self) -> String {
        format!(
            "{} {:.6} {:.6}\n",
            unix_nanos(self.received_at),
            ms(self.rtt),
            ms(self.commit_latency)
        )
    }
}

/// Summary of the samples drained in one reporting interval.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    pub end: SystemTime,
    pub mean_ms: f64,
    pub throughput: f64,
    pub count: u64,
    pub outstanding: usize,
    pub mean_commit_ms: f64,
}

impl Summary {
    pub fn log_line(&self) -> String {
        format!(
            "{} {:.6} {:.6} {} {} {:.6}\n",
            unix_nanos(self.end),
            self.mean_ms,
            self.throughput,
            self.count,
            self.outstanding,
            self.mean_commit_ms
        )
    }
}

#[derive(Default, Debug)]
pub struct Window {
    count: u64,
    rtt_sum_ms: f64,
    commit_sum_ms: f64,
    last: Option<SystemTime>,
}

impl Window {
    pub fn add(&mut self, s: &Sample) {
        self.count += 1;
        self.rtt_sum_ms += ms(s.rtt);
        self.commit_sum_ms += ms(s.commit_latency);
        self.last = Some(s.received_at);
    }

    /// Throughput is measured from `start` to the last sample of the window, or to `now`
    /// when the window is empty.
    pub fn summarize(&self, start: SystemTime, now: SystemTime, outstanding: usize) -> Summary {
        let end = self.last.unwrap_or(now);
        let mut summary = Summary {
            end,
            mean_ms: 0.0,
            throughput: 0.0,
            count: self.count,
            outstanding,
            mean_commit_ms: 0.0,
        };
        if self.count > 0 {
            summary.mean_ms = self.rtt_sum_ms / self.count as f64;
            summary.mean_commit_ms = self.commit_sum_ms / self.count as f64;
            let elapsed = end.duration_since(start).unwrap_or_default().as_secs_f64();
            if elapsed > 0.0 {
                summary.throughput = self.count as f64 / elapsed;
            }
        }
        summary
    }
}

/// Keeps only samples received in the steady state of the experiment.
#[derive(Clone, Copy, Debug)]
pub struct RampFilter {
    pub experiment_start: SystemTime,
    pub ramp_up: Duration,
    pub ramp_down: Duration,
    pub timeout: Duration,
}

impl RampFilter {
    pub fn includes(&self, s: &Sample) -> bool {
        let offset = s
            .received_at
            .duration_since(self.experiment_start)
            .unwrap_or_default();
        offset > self.ramp_up && offset < self.timeout.saturating_sub(self.ramp_down)
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ReportMode {
    /// Every sample goes to one latency file.
    Aggregate,
    /// Samples are split per replica and operation kind, outside the ramps only.
    PerTarget(RampFilter),
}

struct LogSink {
    dir: PathBuf,
    summary: BufWriter<File>,
    latency: Option<BufWriter<File>>,
    reads: HashMap<usize, BufWriter<File>>,
    writes: HashMap<usize, BufWriter<File>>,
}

async fn create(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let path = dir.join(name);
    let f = File::create(&path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    Ok(BufWriter::new(f))
}

impl LogSink {
    async fn new(dir: &Path, mode: &ReportMode) -> Result<Self> {
        let latency = match mode {
            ReportMode::Aggregate => Some(create(dir, LATENCY_FILE).await?),
            ReportMode::PerTarget(_) => None,
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            summary: create(dir, SUMMARY_FILE).await?,
            latency,
            reads: HashMap::new(),
            writes: HashMap::new(),
        })
    }

    async fn sample(&mut self, s: &Sample) -> Result<()> {
        let line = s.log_line();
        if let Some(latency) = &mut self.latency {
            return Ok(latency.write_all(line.as_bytes()).await?);
        }
        let (files, name) = if s.is_read {
            (&mut self.reads, format!("latFileRead-{}.txt", s.replica))
        } else {
            (&mut self.writes, format!("latFileWrite-{}.txt", s.replica))
        };
        let f = match files.entry(s.replica) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(create(&self.dir, &name).await?),
        };
        f.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn summary(&mut self, summary: &Summary) -> Result<()> {
        self.summary
            .write_all(summary.log_line().as_bytes())
            .await?;
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        self.summary.flush().await?;
        if let Some(latency) = &mut self.latency {
            latency.flush().await?;
        }
        for f in self.reads.values_mut().chain(self.writes.values_mut()) {
            f.flush().await?;
        }
        Ok(())
    }
}

pub struct Reporter {
    samples: mpsc::Receiver<Sample>,
    tables: Vec<Arc<OutstandingTable>>,
    dir: PathBuf,
    mode: ReportMode,
    period: Duration,
}

impl Reporter {
    pub fn new(
        samples: mpsc::Receiver<Sample>,
        tables: Vec<Arc<OutstandingTable>>,
        dir: PathBuf,
        mode: ReportMode,
    ) -> Self {
        Self {
            samples,
            tables,
            dir,
            mode,
            period: Duration::from_secs(1),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Writes one summary per period until every sample producer is gone.
    pub async fn run(mut self) -> Result<()> {
        let mut sink = LogSink::new(&self.dir, &self.mode).await?;
        info!(dir = %self.dir.display(), mode = ?self.mode, "reporting statistics");

        let mut ticker = time::interval_at(time::Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut window_start = SystemTime::now();
        loop {
            ticker.tick().await;
            let (summary, closed) = self.drain(&mut sink, window_start).await?;
            sink.summary(&summary).await?;
            window_start = summary.end;
            if closed {
                info!("all clients are gone, reporter done");
                return Ok(());
            }
        }
    }

    async fn drain(&mut self, sink: &mut LogSink, window_start: SystemTime) -> Result<(Summary, bool)> {
        let mut window = Window::default();
        let mut closed = false;
        loop {
            let s = match self.samples.try_recv() {
                Ok(s) => s,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            };
            if let ReportMode::PerTarget(filter) = &self.mode {
                if !filter.includes(&s) {
                    continue;
                }
            }
            sink.sample(&s).await?;
            window.add(&s);
        }
        let outstanding = self.tables.iter().map(|t| t.len()).sum();
        let summary = window.summarize(window_start, SystemTime::now(), outstanding);
        debug!(
            count = summary.count,
            mean_ms = summary.mean_ms,
            throughput = summary.throughput,
            outstanding,
            "window"
        );
        Ok((summary, closed))
    }
}
