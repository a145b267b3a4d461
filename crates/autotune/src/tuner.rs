//! Trial-search orchestration.
//!
//! [`tune`] extracts the distinct workloads of a normalized module, hands out
//! the trial budget round-robin, builds candidates on the bounded
//! [`LocalBuilder`], measures them sequentially with the [`LocalRunner`] and
//! appends every attempt to the [`TuningDatabase`].

use crate::builder::LocalBuilder;
use crate::database::TuningDatabase;
use crate::record::{unix_millis, TrialOutcome, TrialRecord};
use crate::runner::LocalRunner;
use crate::scheduler::{TaskScheduler, TaskState};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tunebridge_ir::{host_cores, Capabilities, Error, Module, Result, Schedule, Target, Task};

pub const DEFAULT_MAX_TRIALS_PER_TASK: usize = 200;
pub const DEFAULT_TRIALS_PER_ITER: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneConfig {
    /// Hard cap on trials across all tasks.
    pub max_trials_global: usize,
    pub max_trials_per_task: usize,
    /// Candidates a task may receive per turn.
    pub num_trials_per_iter: usize,
    pub max_workers: usize,
    pub warmup_runs: usize,
    pub repeat_runs: usize,
    pub seed: u64,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            max_trials_global: 64,
            max_trials_per_task: DEFAULT_MAX_TRIALS_PER_TASK,
            num_trials_per_iter: DEFAULT_TRIALS_PER_ITER,
            max_workers: host_cores(),
            warmup_runs: 1,
            repeat_runs: 3,
            seed: 0,
        }
    }
}

impl TuneConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_trials_global", self.max_trials_global),
            ("max_trials_per_task", self.max_trials_per_task),
            ("num_trials_per_iter", self.num_trials_per_iter),
            ("max_workers", self.max_workers),
            ("repeat_runs", self.repeat_runs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidArgument(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub name: String,
    pub signature: String,
    pub trials: usize,
    pub successes: usize,
    pub best_latency_ms: Option<f64>,
    pub best_schedule: Option<Schedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneSummary {
    pub work_dir: PathBuf,
    pub target: String,
    pub trials_requested: usize,
    pub trials_run: usize,
    pub successful: usize,
    pub failed: usize,
    pub workers: usize,
    pub peak_in_flight: usize,
    pub database_records: usize,
    pub tasks: Vec<TaskSummary>,
}

/// One task per distinct signature, in first-seen order.
pub fn extract_tasks(module: &Module) -> Vec<Task> {
    let mut seen = HashSet::new();
    module
        .tasks
        .iter()
        .filter(|task| seen.insert(task.signature()))
        .cloned()
        .collect()
}

/// Run the trial search for `module` on `target`, appending to the database in `work_dir`.
pub fn tune(
    module: &Module,
    target: &Target,
    work_dir: &Path,
    config: &TuneConfig,
    capabilities: &Capabilities,
) -> Result<TuneSummary> {
    config.validate()?;
    capabilities.ensure_runnable(target)?;

    let mut db = TuningDatabase::open_or_create(work_dir)?;
    db.ensure_target(target.kind)?;

    let tasks = extract_tasks(module);
    if tasks.is_empty() {
        return Err(Error::InvalidArgument("module has no tasks to tune".into()));
    }

    let mut states = Vec::with_capacity(tasks.len());
    for (position, task) in tasks.into_iter().enumerate() {
        let workload_id = db.commit_workload(&task.signature(), target.kind)?;
        let mut state = TaskState::new(task, workload_id, config.seed.wrapping_add(position as u64));
        let best = db
            .best_for(&state.signature)
            .and_then(|record| record.latency_ms().map(|latency| (record.schedule, latency)));
        state.resume(
            db.stats_for(&state.signature).trials,
            db.tried_schedules(&state.signature),
            best,
        );
        states.push(state);
    }

    let target_string = target.to_string();
    let builder = LocalBuilder::new(config.max_workers, target.tile_footprint_limit());
    let runner = LocalRunner::new(config.warmup_runs, config.repeat_runs);
    let mut scheduler = TaskScheduler::new(
        states,
        config.max_trials_global,
        config.max_trials_per_task,
        config.num_trials_per_iter,
    );

    info!(
        target = %target_string,
        work_dir = %work_dir.display(),
        tasks = scheduler.tasks().len(),
        max_trials = config.max_trials_global,
        workers = builder.max_workers(),
        "starting trial search"
    );

    let mut trials_run = 0;
    let mut successful = 0;
    let mut failed = 0;

    while let Some((index, candidates)) = scheduler.next_turn() {
        let jobs = {
            let base = &scheduler.tasks()[index].task;
            candidates
                .iter()
                .map(|schedule| Task {
                    schedule: *schedule,
                    ..base.clone()
                })
                .collect::<Vec<_>>()
        };
        let results = builder.build_batch(jobs);

        for result in results {
            let schedule = result.task.schedule;
            let outcome = match result.kernel {
                Ok(kernel) => match runner.measure(&kernel) {
                    Ok(measurement) => TrialOutcome::Built {
                        latency_ms: measurement.mean_ms,
                        samples: measurement.samples,
                    },
                    Err(err) => TrialOutcome::BuildFailed {
                        reason: format!("measurement failed: {err:#}"),
                    },
                },
                Err(err) => TrialOutcome::BuildFailed {
                    reason: err.to_string(),
                },
            };

            let state = scheduler.task_mut(index);
            let latency = match &outcome {
                TrialOutcome::Built { latency_ms, .. } => Some(*latency_ms),
                TrialOutcome::BuildFailed { reason } => {
                    debug!(task = %state.task.name, %schedule, %reason, "trial failed");
                    None
                }
            };
            let record = TrialRecord {
                workload_id: state.workload_id,
                signature: state.signature.clone(),
                task: state.task.name.clone(),
                schedule,
                outcome,
                target: target_string.clone(),
                target_kind: target.kind,
                trial: state.next_trial_index(),
                timestamp_ms: unix_millis(),
            };
            state.observe(schedule, latency);
            db.commit_record(record)?;

            trials_run += 1;
            if latency.is_some() {
                successful += 1;
            } else {
                failed += 1;
            }
        }
    }

    if successful == 0 && trials_run > 0 {
        warn!(trials_run, "no candidate built successfully");
    }

    let tasks = scheduler
        .into_tasks()
        .into_iter()
        .map(|state| TaskSummary {
            best_latency_ms: state.best.map(|(_, latency)| latency),
            best_schedule: state.best_schedule(),
            name: state.task.name,
            signature: state.signature,
            trials: state.trials,
            successes: state.successes,
        })
        .collect();

    let summary = TuneSummary {
        work_dir: work_dir.to_path_buf(),
        target: target_string,
        trials_requested: config.max_trials_global,
        trials_run,
        successful,
        failed,
        workers: builder.max_workers(),
        peak_in_flight: builder.peak_in_flight(),
        database_records: db.len(),
        tasks,
    };
    info!(
        trials_run = summary.trials_run,
        successful = summary.successful,
        failed = summary.failed,
        peak_in_flight = summary.peak_in_flight,
        "trial search finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunebridge_ir::{normalize, simple_matmul_module, two_task_module};

    fn quick(max_trials_global: usize, max_workers: usize) -> TuneConfig {
        TuneConfig {
            max_trials_global,
            max_workers,
            warmup_runs: 0,
            repeat_runs: 1,
            seed: 11,
            ..TuneConfig::default()
        }
    }

    fn normalized(mut module: Module) -> Module {
        normalize(&mut module).expect("normalize");
        module
    }

    #[test]
    fn duplicate_signatures_are_tuned_once() {
        let mut module = simple_matmul_module();
        let mut copy = module.tasks[0].clone();
        copy.name = "matmul_copy".into();
        module.tasks.push(copy);
        assert_eq!(extract_tasks(&module).len(), 1);
    }

    #[test]
    fn tuning_respects_budget_and_worker_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = normalized(two_task_module());
        let summary = tune(
            &module,
            &Target::resolve("cpu", Some(2)).expect("target"),
            dir.path(),
            &quick(8, 4),
            &Capabilities::detect(),
        )
        .expect("tune");

        assert!(summary.trials_run <= 8);
        assert_eq!(summary.trials_run, summary.successful + summary.failed);
        assert!(summary.peak_in_flight <= 4);
        assert_eq!(summary.database_records, summary.trials_run);
        assert_eq!(summary.tasks.len(), 2);
        assert!(summary.tasks.iter().all(|task| task.trials > 0));
    }

    #[test]
    fn repeated_tuning_appends_and_never_regresses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = normalized(two_task_module());
        let target = Target::cpu();
        let caps = Capabilities::detect();

        let first = tune(&module, &target, dir.path(), &quick(4, 2), &caps).expect("first");
        let db = TuningDatabase::open_existing(dir.path()).expect("db");
        let best_before: Vec<_> = module
            .tasks
            .iter()
            .map(|task| db.stats_for(&task.signature()).best_latency_ms)
            .collect();

        let second = tune(&module, &target, dir.path(), &quick(4, 2), &caps).expect("second");
        assert_eq!(second.database_records, first.database_records + second.trials_run);

        let db = TuningDatabase::open_existing(dir.path()).expect("db");
        for (task, before) in module.tasks.iter().zip(best_before) {
            let after = db.stats_for(&task.signature()).best_latency_ms;
            if let (Some(before), Some(after)) = (before, after) {
                assert!(after <= before);
            }
        }

        // Trial indices keep counting across runs instead of restarting.
        for task in &module.tasks {
            let signature = task.signature();
            let mut indices: Vec<_> = db.records_for(&signature).map(|record| record.trial).collect();
            let count = indices.len();
            indices.sort_unstable();
            indices.dedup();
            assert_eq!(indices.len(), count, "{signature}");
            assert_eq!(indices, (0..count).collect::<Vec<_>>());
        }
    }

    #[test]
    fn accelerator_targets_have_no_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = tune(
            &normalized(simple_matmul_module()),
            &Target::resolve("cuda", None).expect("target"),
            dir.path(),
            &quick(4, 1),
            &Capabilities::detect(),
        )
        .unwrap_err();
        assert_eq!(err.kind_name(), "EngineError");
    }

    #[test]
    fn zero_budget_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = tune(
            &normalized(simple_matmul_module()),
            &Target::cpu(),
            dir.path(),
            &quick(0, 1),
            &Capabilities::detect(),
        )
        .unwrap_err();
        assert_eq!(err.kind_name(), "InvalidArgumentError");
    }
}
