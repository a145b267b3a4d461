//! Bounded local builder: candidate builds on a fixed set of worker threads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::debug;
use tunebridge_ir::{Error, Result, Task};
use tunebridge_kernels::{build, BuiltKernel};

/// Tracks how many builds are running and the highest concurrency seen.
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightGauge {
    pub fn enter(&self) -> InFlightGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct BuildResult {
    /// Position of the job in the submitted batch.
    pub index: usize,
    pub task: Task,
    pub kernel: Result<BuiltKernel>,
}

/// Runs candidate builds on at most `max_workers` threads at a time.
pub struct LocalBuilder {
    max_workers: usize,
    footprint_limit: usize,
    gauge: Arc<InFlightGauge>,
}

impl LocalBuilder {
    pub fn new(max_workers: usize, footprint_limit: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            footprint_limit,
            gauge: Arc::new(InFlightGauge::default()),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn gauge(&self) -> Arc<InFlightGauge> {
        Arc::clone(&self.gauge)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.gauge.peak()
    }

    /// Build every task in `jobs`; results come back in submission order.
    pub fn build_batch(&self, jobs: Vec<Task>) -> Vec<BuildResult> {
        let total = jobs.len();
        if total == 0 {
            return Vec::new();
        }
        let workers = self.max_workers.min(total);
        let (job_tx, job_rx) = flume::unbounded::<(usize, Task)>();
        let (result_tx, result_rx) = flume::unbounded::<BuildResult>();
        for job in jobs.into_iter().enumerate() {
            // Receivers outlive this loop, so sending cannot fail.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let gauge = &self.gauge;
                let limit = self.footprint_limit;
                scope.spawn(move || {
                    for (index, task) in job_rx.iter() {
                        let kernel = {
                            let _guard = gauge.enter();
                            panic::catch_unwind(AssertUnwindSafe(|| build(&task, limit)))
                                .unwrap_or_else(|_| {
                                    Err(Error::Engine(format!(
                                        "build of task '{}' panicked",
                                        task.name
                                    )))
                                })
                        };
                        if let Err(err) = &kernel {
                            debug!(worker, task = %task.name, error = %err, "candidate build failed");
                        }
                        if result_tx.send(BuildResult { index, task, kernel }).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut results: Vec<BuildResult> = result_rx.drain().collect();
        results.sort_by_key(|result| result.index);
        results
    }
}
