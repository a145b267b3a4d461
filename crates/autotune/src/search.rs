//! Candidate schedule generation for one task.

use std::collections::HashSet;
use tunebridge_ir::{Schedule, ScheduleSpace, Task};

/// Random draws attempted before falling back to a linear scan.
const MAX_RANDOM_ATTEMPTS: usize = 64;

/// Proposes schedules a task has not tried yet.
///
/// The first proposal is the task's canonical default schedule. Afterwards
/// each candidate is either a one-knob mutation of the best measured
/// schedule or a uniform sample of the space, with equal probability.
pub struct CandidateGenerator {
    space: ScheduleSpace,
    default: Schedule,
    tried: HashSet<Schedule>,
    rng: fastrand::Rng,
}

impl CandidateGenerator {
    pub fn new(extents: [usize; 3], default: Schedule, seed: u64) -> Self {
        Self::with_space(ScheduleSpace::for_extents(extents), default.canonicalize(extents), seed)
    }

    /// Generator over the knobs `task`'s kernel actually reads.
    pub fn for_task(task: &Task, seed: u64) -> Self {
        let extents = task.op.loop_extents();
        Self::with_space(
            ScheduleSpace::for_operation(&task.op, task.schedule),
            task.schedule.canonicalize(extents),
            seed,
        )
    }

    fn with_space(space: ScheduleSpace, default: Schedule, seed: u64) -> Self {
        Self {
            space,
            default,
            tried: HashSet::new(),
            rng: fastrand::Rng::with_seed(seed),
        }
    }

    /// Mark schedules measured by earlier runs so they are not proposed again.
    pub fn mark_tried<I: IntoIterator<Item = Schedule>>(&mut self, schedules: I) {
        self.tried.extend(schedules);
    }

    pub fn tried(&self) -> usize {
        self.tried.len()
    }

    pub fn space_size(&self) -> usize {
        self.space.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.space
            .len()
            .checked_sub(self.tried_in_space())
            .map_or(true, |left| left == 0)
    }

    fn tried_in_space(&self) -> usize {
        // Defaults that fall outside the enumerated tile choices still count as tried.
        self.tried
            .iter()
            .filter(|schedule| self.in_space(schedule))
            .count()
    }

    fn in_space(&self, schedule: &Schedule) -> bool {
        self.space.tiles_m().contains(&schedule.tile_m)
            && self.space.tiles_n().contains(&schedule.tile_n)
            && self.space.tiles_k().contains(&schedule.tile_k)
            && self.space.vector_widths().contains(&schedule.vector_width)
    }

    /// Up to `count` fresh candidates; fewer only when the space runs out.
    pub fn next_batch(&mut self, count: usize, best: Option<Schedule>) -> Vec<Schedule> {
        let mut batch = Vec::with_capacity(count);
        while batch.len() < count {
            match self.next_candidate(best) {
                Some(schedule) => batch.push(schedule),
                None => break,
            }
        }
        batch
    }

    fn next_candidate(&mut self, best: Option<Schedule>) -> Option<Schedule> {
        if self.tried.insert(self.default) {
            return Some(self.default);
        }
        if self.is_exhausted() {
            return None;
        }
        for _ in 0..MAX_RANDOM_ATTEMPTS {
            let candidate = match best {
                Some(base) if self.rng.bool() => self.mutate(base),
                _ => self.sample(),
            };
            if let Some(candidate) = candidate {
                if self.tried.insert(candidate) {
                    return Some(candidate);
                }
            }
        }
        self.scan()
    }

    fn sample(&mut self) -> Option<Schedule> {
        let len = self.space.len();
        if len == 0 {
            return None;
        }
        self.space.get(self.rng.usize(..len))
    }

    /// Move one knob of `base` to a neighbouring choice.
    fn mutate(&mut self, base: Schedule) -> Option<Schedule> {
        fn step(choices: &[usize], current: usize, up: bool) -> usize {
            let position = choices
                .iter()
                .position(|choice| *choice == current)
                .unwrap_or(0);
            let next = if up {
                (position + 1).min(choices.len().saturating_sub(1))
            } else {
                position.saturating_sub(1)
            };
            choices.get(next).copied().unwrap_or(current)
        }

        // Pinned knobs have a single choice; never spend a draw on them.
        let knobs: Vec<usize> = [
            self.space.tiles_m().len(),
            self.space.tiles_n().len(),
            self.space.tiles_k().len(),
            self.space.vector_widths().len(),
            2,
        ]
        .iter()
        .enumerate()
        .filter(|(_, choices)| **choices > 1)
        .map(|(knob, _)| knob)
        .collect();

        let up = self.rng.bool();
        let mut candidate = base;
        match knobs[self.rng.usize(..knobs.len())] {
            0 => candidate.tile_m = step(self.space.tiles_m(), base.tile_m, up),
            1 => candidate.tile_n = step(self.space.tiles_n(), base.tile_n, up),
            2 => candidate.tile_k = step(self.space.tiles_k(), base.tile_k, up),
            3 => {
                candidate.vector_width = step(self.space.vector_widths(), base.vector_width, up)
            }
            _ => candidate.parallel = !base.parallel,
        }
        Some(candidate)
    }

    /// First untried schedule, scanning from a random offset.
    fn scan(&mut self) -> Option<Schedule> {
        let len = self.space.len();
        if len == 0 {
            return None;
        }
        let start = self.rng.usize(..len);
        for offset in 0..len {
            let schedule = self.space.get((start + offset) % len)?;
            if self.tried.insert(schedule) {
                return Some(schedule);
            }
        }
        None
    }
}
