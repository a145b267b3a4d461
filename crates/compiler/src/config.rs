//! Workflow configuration loaded from TOML files or constructed programmatically.
//!
//! # TOML Format
//! ```toml
//! target = "llvm"
//! work_dir = "tuning_database"
//! num_trials = 64
//! max_workers = 4
//! opt_level = 2
//! use_auto_tuning = true
//!
//! [tuning]
//! max_trials_per_task = 200
//! num_trials_per_iter = 64
//! warmup_runs = 1
//! repeat_runs = 3
//! seed = 0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tunebridge_autotune::{TuneConfig, DEFAULT_MAX_TRIALS_PER_TASK, DEFAULT_TRIALS_PER_ITER};
use tunebridge_ir::{host_cores, Error, Result, MAX_OPT_LEVEL};

pub const DEFAULT_TARGET: &str = "llvm";
pub const DEFAULT_WORK_DIR: &str = "tuning_database";
pub const DEFAULT_NUM_TRIALS: usize = 64;

/// Search knobs that rarely change between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningOptions {
    pub max_trials_per_task: usize,
    /// Candidates a task receives per turn.
    pub num_trials_per_iter: usize,
    pub warmup_runs: usize,
    pub repeat_runs: usize,
    pub seed: u64,
}

impl Default for TuningOptions {
    fn default() -> Self {
        Self {
            max_trials_per_task: DEFAULT_MAX_TRIALS_PER_TASK,
            num_trials_per_iter: DEFAULT_TRIALS_PER_ITER,
            warmup_runs: 1,
            repeat_runs: 3,
            seed: 0,
        }
    }
}

/// Defaults for every pipeline stage. Bridge parameters and CLI flags
/// override individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub target: String,
    pub work_dir: PathBuf,
    /// Global trial budget for one tuning run.
    pub num_trials: usize,
    /// Concurrent candidate builds (defaults to the host's logical cores).
    pub max_workers: Option<usize>,
    pub opt_level: u8,
    pub use_auto_tuning: bool,
    pub tuning: TuningOptions,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET.to_string(),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            num_trials: DEFAULT_NUM_TRIALS,
            max_workers: None,
            opt_level: 0,
            use_auto_tuning: true,
            tuning: TuningOptions::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|err| Error::InvalidArgument(format!("TOML parse error: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|err| Error::InvalidArgument(format!("TOML serialise error: {err}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.opt_level > MAX_OPT_LEVEL {
            return Err(Error::InvalidArgument(format!(
                "opt_level must be between 0 and {MAX_OPT_LEVEL}, got {}",
                self.opt_level
            )));
        }
        if self.max_workers == Some(0) {
            return Err(Error::InvalidArgument("max_workers must be positive".into()));
        }
        Ok(())
    }

    pub fn resolve_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(host_cores)
    }

    /// Search configuration for one tuning run with this workflow's budget.
    pub fn tune_config(&self) -> TuneConfig {
        TuneConfig {
            max_trials_global: self.num_trials,
            max_trials_per_task: self.tuning.max_trials_per_task,
            num_trials_per_iter: self.tuning.num_trials_per_iter,
            max_workers: self.resolve_workers(),
            warmup_runs: self.tuning.warmup_runs,
            repeat_runs: self.tuning.repeat_runs,
            seed: self.tuning.seed,
        }
    }
}
