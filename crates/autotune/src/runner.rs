//! Candidate measurement on the host.

use anyhow::Result;
use std::time::Instant;
use tunebridge_kernels::BuiltKernel;

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub mean_ms: f64,
    pub samples: Vec<f64>,
}

/// Times built kernels: untimed warmup runs, then `repeat_runs` timed runs.
#[derive(Debug, Clone, Copy)]
pub struct LocalRunner {
    warmup_runs: usize,
    repeat_runs: usize,
}

impl LocalRunner {
    pub fn new(warmup_runs: usize, repeat_runs: usize) -> Self {
        Self {
            warmup_runs,
            repeat_runs: repeat_runs.max(1),
        }
    }

    pub fn measure(&self, kernel: &BuiltKernel) -> Result<Measurement> {
        // Warmup runs to avoid cold-start noise.
        for _ in 0..self.warmup_runs {
            let _ = kernel.run()?;
        }

        let mut samples = Vec::with_capacity(self.repeat_runs);
        for _ in 0..self.repeat_runs {
            let start = Instant::now();
            let _ = kernel.run()?;
            samples.push(start.elapsed().as_secs_f64() * 1000.0);
        }

        let mean_ms = samples.iter().sum::<f64>() / samples.len() as f64;
        Ok(Measurement { mean_ms, samples })
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new(1, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunebridge_ir::{simple_matmul_module, CPU_TILE_FOOTPRINT_LIMIT};
    use tunebridge_kernels::build;

    #[test]
    fn measurement_collects_repeat_samples() {
        let task = simple_matmul_module().tasks.remove(0);
        let kernel = build(&task, CPU_TILE_FOOTPRINT_LIMIT).expect("build");
        let measurement = LocalRunner::new(0, 4).measure(&kernel).expect("measure");
        assert_eq!(measurement.samples.len(), 4);
        assert!(measurement.mean_ms >= 0.0);
        let max = measurement.samples.iter().cloned().fold(0.0, f64::max);
        assert!(measurement.mean_ms <= max);
    }
}
