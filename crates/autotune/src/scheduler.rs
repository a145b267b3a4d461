//! Round-robin distribution of the trial budget across tasks.

use std::collections::HashSet;
use tunebridge_ir::{Schedule, Task};

use crate::search::CandidateGenerator;

/// Candidates one task receives on its turn.
///
/// The global remainder is the hard limit: a per-task cap or batch size can
/// only lower the allocation, never raise it above what the global budget has
/// left.
pub fn turn_allocation(
    batch_size: usize,
    per_task_remaining: usize,
    global_remaining: usize,
    active_tasks: usize,
) -> usize {
    if global_remaining == 0 || active_tasks == 0 {
        return 0;
    }
    let fair_share = (global_remaining / active_tasks).max(1);
    batch_size
        .min(per_task_remaining)
        .min(fair_share)
        .min(global_remaining)
}

/// Search state of one distinct workload.
pub struct TaskState {
    pub task: Task,
    pub signature: String,
    pub workload_id: usize,
    pub generator: CandidateGenerator,
    /// Trials recorded for this signature by earlier runs.
    pub prior_trials: usize,
    pub trials: usize,
    pub successes: usize,
    pub best: Option<(Schedule, f64)>,
    pub active: bool,
}

impl TaskState {
    pub fn new(task: Task, workload_id: usize, seed: u64) -> Self {
        let signature = task.signature();
        let generator = CandidateGenerator::for_task(&task, seed);
        Self {
            task,
            signature,
            workload_id,
            generator,
            prior_trials: 0,
            trials: 0,
            successes: 0,
            best: None,
            active: true,
        }
    }

    /// Seed with results from earlier runs against the same database.
    pub fn resume(
        &mut self,
        prior_trials: usize,
        tried: HashSet<Schedule>,
        best: Option<(Schedule, f64)>,
    ) {
        self.prior_trials = prior_trials;
        self.generator.mark_tried(tried);
        self.best = best;
    }

    /// Database-wide index of the next trial for this signature.
    pub fn next_trial_index(&self) -> usize {
        self.prior_trials + self.trials
    }

    pub fn best_schedule(&self) -> Option<Schedule> {
        self.best.map(|(schedule, _)| schedule)
    }

    pub fn observe(&mut self, schedule: Schedule, latency_ms: Option<f64>) {
        self.trials += 1;
        if let Some(latency) = latency_ms {
            self.successes += 1;
            if self.best.map_or(true, |(_, best)| latency < best) {
                self.best = Some((schedule, latency));
            }
        }
    }
}

/// Hands out turns to active tasks in a fixed rotation.
pub struct TaskScheduler {
    tasks: Vec<TaskState>,
    cursor: usize,
    max_trials_global: usize,
    max_trials_per_task: usize,
    batch_size: usize,
    trials_issued: usize,
}

impl TaskScheduler {
    pub fn new(
        tasks: Vec<TaskState>,
        max_trials_global: usize,
        max_trials_per_task: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            tasks,
            cursor: 0,
            max_trials_global,
            max_trials_per_task,
            batch_size: batch_size.max(1),
            trials_issued: 0,
        }
    }

    pub fn tasks(&self) -> &[TaskState] {
        &self.tasks
    }

    pub fn into_tasks(self) -> Vec<TaskState> {
        self.tasks
    }

    pub fn task_mut(&mut self, index: usize) -> &mut TaskState {
        &mut self.tasks[index]
    }

    pub fn global_remaining(&self) -> usize {
        self.max_trials_global.saturating_sub(self.trials_issued)
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.iter().filter(|task| task.active).count()
    }

    /// Next task index and its fresh candidates, or `None` once the budget is
    /// spent or no task can propose anything.
    pub fn next_turn(&mut self) -> Option<(usize, Vec<Schedule>)> {
        loop {
            let global_remaining = self.global_remaining();
            let active = self.active_tasks();
            if global_remaining == 0 || active == 0 {
                return None;
            }

            let index = self.cursor % self.tasks.len();
            self.cursor = (self.cursor + 1) % self.tasks.len();
            let per_task_cap = self.max_trials_per_task;
            let batch_size = self.batch_size;
            let state = &mut self.tasks[index];
            if !state.active {
                continue;
            }

            let per_task_remaining = per_task_cap.saturating_sub(state.trials);
            let count = turn_allocation(batch_size, per_task_remaining, global_remaining, active);
            let best = state.best_schedule();
            let candidates = if count == 0 {
                Vec::new()
            } else {
                state.generator.next_batch(count, best)
            };
            if candidates.is_empty() {
                state.active = false;
                continue;
            }
            if state.trials + candidates.len() >= per_task_cap {
                state.active = false;
            }
            self.trials_issued += candidates.len();
            return Some((index, candidates));
        }
    }
}
