//! Schedules: the tunable implementation choices of a task.

use crate::dialect::Operation;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest tile edge the search space will propose.
pub const MAX_TILE: usize = 256;
/// Largest vector width a kernel accepts.
pub const MAX_VECTOR_WIDTH: usize = 16;

const VECTOR_WIDTHS: [usize; 5] = [1, 2, 4, 8, 16];

/// Loop tiling, vectorization and parallelization for one task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Schedule {
    pub tile_m: usize,
    pub tile_n: usize,
    pub tile_k: usize,
    pub vector_width: usize,
    pub parallel: bool,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            tile_m: 32,
            tile_n: 32,
            tile_k: 32,
            vector_width: 1,
            parallel: false,
        }
    }
}

impl Schedule {
    /// Clamp tiles into `[1, extent]` and round the vector width down to a
    /// supported power of two. Applying it twice is a no-op.
    pub fn canonicalize(self, extents: [usize; 3]) -> Self {
        let clamp = |tile: usize, extent: usize| tile.clamp(1, extent.max(1));
        let vector_width = VECTOR_WIDTHS
            .iter()
            .rev()
            .copied()
            .find(|width| *width <= self.vector_width.max(1))
            .unwrap_or(1);
        Self {
            tile_m: clamp(self.tile_m, extents[0]),
            tile_n: clamp(self.tile_n, extents[1]),
            tile_k: clamp(self.tile_k, extents[2]),
            vector_width,
            parallel: self.parallel,
        }
    }

    /// Working set of one `tile_m x tile_k`, `tile_k x tile_n`, `tile_m x tile_n` block triple.
    /// `None` when the byte count overflows `usize`.
    pub fn tile_footprint_bytes(&self, element_bytes: usize) -> Option<usize> {
        let (m, n, k) = (self.tile_m, self.tile_n, self.tile_k);
        m.checked_mul(k)?
            .checked_add(k.checked_mul(n)?)?
            .checked_add(m.checked_mul(n)?)?
            .checked_mul(element_bytes)
    }

    /// Legality against a loop nest; `Err` carries the reason.
    pub fn check(&self, extents: [usize; 3]) -> Result<(), String> {
        let tiles = [self.tile_m, self.tile_n, self.tile_k];
        for ((axis, tile), extent) in ["m", "n", "k"].iter().zip(tiles).zip(extents) {
            if tile == 0 {
                return Err(format!("tile_{axis} must be > 0"));
            }
            if tile > extent.max(1) {
                return Err(format!("tile_{axis}={tile} exceeds loop extent {extent}"));
            }
        }
        if !self.vector_width.is_power_of_two() || self.vector_width > MAX_VECTOR_WIDTH {
            return Err(format!(
                "vector_width={} must be a power of two <= {}",
                self.vector_width, MAX_VECTOR_WIDTH
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tile={}x{}x{} vw={}{}",
            self.tile_m,
            self.tile_n,
            self.tile_k,
            self.vector_width,
            if self.parallel { " par" } else { "" }
        )
    }
}

/// Enumerable set of schedules for one loop nest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpace {
    tiles_m: Vec<usize>,
    tiles_n: Vec<usize>,
    tiles_k: Vec<usize>,
    vector_widths: Vec<usize>,
}

impl ScheduleSpace {
    pub fn for_extents(extents: [usize; 3]) -> Self {
        Self {
            tiles_m: tile_choices(extents[0]),
            tiles_n: tile_choices(extents[1]),
            tiles_k: tile_choices(extents[2]),
            vector_widths: VECTOR_WIDTHS.to_vec(),
        }
    }

    /// Space of an operation with the knobs its kernel ignores pinned to
    /// `base`. Matmul and MLP read every knob. Layer norm reads `tile_m`,
    /// `vector_width` and `parallel`; attention reads `tile_m` and `parallel`.
    pub fn for_operation(op: &Operation, base: Schedule) -> Self {
        let extents = op.loop_extents();
        let base = base.canonicalize(extents);
        let mut space = Self::for_extents(extents);
        match op {
            Operation::Matmul(_) | Operation::Mlp(_) => {}
            Operation::LayerNorm(_) => {
                space.tiles_n = vec![base.tile_n];
                space.tiles_k = vec![base.tile_k];
            }
            Operation::Attention(_) => {
                space.tiles_n = vec![base.tile_n];
                space.tiles_k = vec![base.tile_k];
                space.vector_widths = vec![base.vector_width];
            }
        }
        space
    }

    pub fn len(&self) -> usize {
        self.tiles_m.len()
            * self.tiles_n.len()
            * self.tiles_k.len()
            * self.vector_widths.len()
            * 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode a flat index in `0..len()` into a schedule.
    pub fn get(&self, index: usize) -> Option<Schedule> {
        if index >= self.len() {
            return None;
        }
        let mut rest = index;
        let mut take = |choices: usize| {
            let pick = rest % choices;
            rest /= choices;
            pick
        };
        let parallel = take(2) == 1;
        let vector_width = self.vector_widths[take(self.vector_widths.len())];
        let tile_k = self.tiles_k[take(self.tiles_k.len())];
        let tile_n = self.tiles_n[take(self.tiles_n.len())];
        let tile_m = self.tiles_m[take(self.tiles_m.len())];
        Some(Schedule {
            tile_m,
            tile_n,
            tile_k,
            vector_width,
            parallel,
        })
    }

    pub fn tiles_m(&self) -> &[usize] {
        &self.tiles_m
    }

    pub fn tiles_n(&self) -> &[usize] {
        &self.tiles_n
    }

    pub fn tiles_k(&self) -> &[usize] {
        &self.tiles_k
    }

    pub fn vector_widths(&self) -> &[usize] {
        &self.vector_widths
    }
}

/// Powers of two up to the extent (capped at [`MAX_TILE`]), plus the extent
/// itself when it is small enough to be a whole-loop tile.
fn tile_choices(extent: usize) -> Vec<usize> {
    let extent = extent.max(1);
    let mut choices = Vec::new();
    let mut tile = 1;
    while tile <= extent && tile <= MAX_TILE {
        choices.push(tile);
        tile *= 2;
    }
    if extent <= MAX_TILE && !choices.contains(&extent) {
        choices.push(extent);
    }
    choices
}
