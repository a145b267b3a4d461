//! Artifact benchmarking.
//!
//! Loads a compiled artifact, runs it end to end on the CPU executor and
//! collects latency statistics and per-kernel profiles in a JSON report.
//! Reports from two runs can be diffed to spot regressions after retuning.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tunebridge_autotune::unix_millis;
use tunebridge_backend_cpu::CpuExecutor;
use tunebridge_ir::{Error, Result};
use tunebridge_kernels::KernelProfile;

pub const DEFAULT_BENCH_WARMUP: usize = 5;
pub const DEFAULT_BENCH_ITERATIONS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub lib_path: PathBuf,
    pub target: String,
    pub opt_level: u8,
    pub generated_at_unix_ms: u128,
    pub iterations: usize,
    pub avg_ms: f64,
    pub std_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Mean per-kernel profile over the timed iterations.
    pub kernels: Vec<KernelProfile>,
}

impl BenchmarkReport {
    pub fn as_map(&self) -> BTreeMap<&str, &KernelProfile> {
        self.kernels
            .iter()
            .map(|profile| (profile.kernel.as_str(), profile))
            .collect()
    }

    /// Per-kernel latency change relative to `baseline`, for kernels present in both.
    pub fn diff<'a>(&'a self, baseline: &'a BenchmarkReport) -> BTreeMap<&'a str, f64> {
        let previous = baseline.as_map();
        self.as_map()
            .into_iter()
            .filter_map(|(kernel, profile)| {
                previous
                    .get(kernel)
                    .map(|base| (kernel, profile.average_time_ms - base.average_time_ms))
            })
            .collect()
    }
}

/// Run the artifact at `path` `warmup` times untimed, then `iterations` times timed.
pub fn benchmark_artifact(path: &Path, warmup: usize, iterations: usize) -> Result<BenchmarkReport> {
    if iterations == 0 {
        return Err(Error::InvalidArgument("iterations must be positive".into()));
    }
    let executor = CpuExecutor::load(path)?;

    for _ in 0..warmup {
        executor.run()?;
    }

    let mut samples = Vec::with_capacity(iterations);
    let mut per_kernel: Vec<(String, f64, f64)> = Vec::new();
    for _ in 0..iterations {
        let start = Instant::now();
        let report = executor.run()?;
        samples.push(start.elapsed().as_secs_f64() * 1000.0);

        if per_kernel.is_empty() {
            per_kernel = report
                .profiles
                .iter()
                .map(|profile| (profile.kernel.clone(), profile.flops, 0.0))
                .collect();
        }
        for (slot, profile) in per_kernel.iter_mut().zip(&report.profiles) {
            slot.2 += profile.average_time_ms;
        }
    }

    let count = samples.len() as f64;
    let avg_ms = samples.iter().sum::<f64>() / count;
    let variance = samples.iter().map(|s| (s - avg_ms).powi(2)).sum::<f64>() / count;
    let min_ms = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = samples.iter().copied().fold(0.0, f64::max);

    let artifact = executor.artifact();
    let report = BenchmarkReport {
        lib_path: path.to_path_buf(),
        target: artifact.target.to_string(),
        opt_level: artifact.opt_level,
        generated_at_unix_ms: unix_millis(),
        iterations,
        avg_ms,
        std_ms: variance.sqrt(),
        min_ms,
        max_ms,
        kernels: per_kernel
            .into_iter()
            .map(|(kernel, flops, total)| KernelProfile::new(&kernel, flops, total / count))
            .collect(),
    };
    info!(
        path = %path.display(),
        iterations,
        avg_ms = report.avg_ms,
        std_ms = report.std_ms,
        "benchmarked artifact"
    );
    Ok(report)
}
