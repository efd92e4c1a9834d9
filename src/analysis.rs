//! Offline summary of a run's output directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::stats::{LATENCY_FILE, SUMMARY_FILE};

/// Percentile of sorted `values` with linear interpolation between closest ranks.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = p / 100.0 * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct LatencyStats {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub p9999: f64,
}

impl LatencyStats {
    pub fn new(mut values: Vec<f64>) -> Self {
        values.sort_by(f64::total_cmp);
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        Self {
            count: values.len(),
            mean,
            p50: percentile(&values, 50.0),
            p90: percentile(&values, 90.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
            p999: percentile(&values, 99.9),
            p9999: percentile(&values, 99.99),
        }
    }

    fn insert_into(&self, label: &str, out: &mut BTreeMap<String, f64>) {
        let fields = [
            ("count", self.count as f64),
            ("mean", self.mean),
            ("p50", self.p50),
            ("p90", self.p90),
            ("p95", self.p95),
            ("p99", self.p99),
            ("p999", self.p999),
            ("p9999", self.p9999),
        ];
        for (name, v) in fields {
            out.insert(format!("{name}_{label}"), v);
        }
    }
}

#[derive(Serialize, Debug)]
pub struct Metrics {
    pub avg_tput: f64,
    #[serde(flatten)]
    pub latencies: BTreeMap<String, f64>,
}

/// Reads whitespace separated column `col` of every non-empty line.
fn column(path: &Path, col: usize) -> Result<Vec<f64>> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(n, l)| {
            let field = l
                .split_whitespace()
                .nth(col)
                .with_context(|| format!("{}:{}: missing column {col}", path.display(), n + 1))?;
            field
                .parse::<f64>()
                .with_context(|| format!("{}:{}: bad number {field:?}", path.display(), n + 1))
        })
        .collect()
}

// latency.txt -> "latency", latFileRead-3.txt -> "Read3"
fn label(file_name: &str) -> Option<String> {
    if file_name == LATENCY_FILE {
        return Some("latency".to_string());
    }
    let stem = file_name.strip_prefix("latFile")?.strip_suffix(".txt")?;
    let (kind, replica) = stem.split_once('-')?;
    if !matches!(kind, "Read" | "Write") || replica.parse::<usize>().is_err() {
        return None;
    }
    Some(format!("{kind}{replica}"))
}

/// Summarizes every latency file in `dir` plus the throughput column of the summary file.
pub fn analyze(dir: &Path) -> Result<Metrics> {
    let tputs = column(&dir.join(SUMMARY_FILE), 2)?;
    let avg_tput = if tputs.is_empty() {
        0.0
    } else {
        tputs.iter().sum::<f64>() / tputs.len() as f64
    };

    let mut latencies = BTreeMap::new();
    let entries = fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(tag) = name.to_str().and_then(label) else {
            continue;
        };
        let stats = LatencyStats::new(column(&entry.path(), 1)?);
        stats.insert_into(&tag, &mut latencies);
    }
    if latencies.is_empty() {
        bail!("no latency files in {}", dir.display());
    }
    Ok(Metrics {
        avg_tput,
        latencies,
    })
}
