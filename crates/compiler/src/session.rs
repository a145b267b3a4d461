//! Compiler session: the pipeline stages behind the bridge.
//!
//! Every stage reads the serialized module text, resolves the target and
//! normalizes the module before doing its own work. Stages return typed
//! reports; turning errors into failure mappings is the bridge's job.

use crate::config::WorkflowConfig;
use crate::pipeline::{AppliedSchedule, CompilerPipeline};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};
use tunebridge_autotune::{tune, TuneSummary, TuningDatabase};
use tunebridge_ir::{normalize, Capabilities, Module, Result, Target};

/// Resolve a target name. CPU targets take their core count from
/// `max_workers`, then a `-num-cores` attribute, then the host.
pub fn resolve_target(name: &str, max_workers: Option<usize>) -> Result<Target> {
    Target::resolve(name, max_workers)
}

/// Deserialize a module and run the baseline normalization on it.
pub fn load_module(text: &str) -> Result<Module> {
    let mut module = Module::from_json(text)?;
    normalize(&mut module)?;
    Ok(module)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneOutcome {
    pub work_dir: PathBuf,
    pub num_trials: usize,
    pub max_workers: usize,
    pub target: String,
    pub summary: TuneSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyOutcome {
    pub lib_path: PathBuf,
    pub work_dir: PathBuf,
    pub opt_level: u8,
    pub target: String,
    pub applied: Vec<AppliedSchedule>,
    pub defaulted: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningStatus {
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompileOutcome {
    pub lib_path: PathBuf,
    pub work_dir: PathBuf,
    pub auto_tuning: bool,
    /// Trial budget spent on tuning; zero when tuning was disabled.
    pub num_trials: usize,
    pub opt_level: u8,
    pub target: String,
    pub tuning_status: TuningStatus,
    pub tuning_error: Option<String>,
    pub trials_run: usize,
    pub applied: Vec<AppliedSchedule>,
    pub defaulted: Vec<String>,
}

pub struct CompilerSession {
    config: WorkflowConfig,
    capabilities: Capabilities,
}

impl CompilerSession {
    pub fn new(config: WorkflowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            capabilities: Capabilities::detect(),
        })
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Trial search into the configured work directory.
    pub fn tune_with_database(&self, module_text: &str) -> Result<TuneOutcome> {
        let target = resolve_target(&self.config.target, self.config.max_workers)?;
        let module = load_module(module_text)?;
        self.tune_module(&module, &target)
    }

    fn tune_module(&self, module: &Module, target: &Target) -> Result<TuneOutcome> {
        let tune_config = self.config.tune_config();
        let summary = tune(
            module,
            target,
            &self.config.work_dir,
            &tune_config,
            &self.capabilities,
        )?;
        Ok(TuneOutcome {
            work_dir: self.config.work_dir.clone(),
            num_trials: self.config.num_trials,
            max_workers: tune_config.max_workers,
            target: target.to_string(),
            summary,
        })
    }

    /// Rebuild with the best recorded schedules. The database must exist and
    /// belong to the same target kind.
    pub fn apply_tuning_database(&self, module_text: &str) -> Result<ApplyOutcome> {
        let target = resolve_target(&self.config.target, self.config.max_workers)?;
        let module = load_module(module_text)?;
        let db = TuningDatabase::open_existing(&self.config.work_dir)?;
        db.ensure_target(target.kind)?;

        let pipeline = CompilerPipeline::new(target, self.config.opt_level)?;
        let artifacts = pipeline.compile(module, Some(&db), &self.config.work_dir)?;
        Ok(ApplyOutcome {
            lib_path: artifacts.lib_path,
            work_dir: self.config.work_dir.clone(),
            opt_level: self.config.opt_level,
            target: pipeline.target().to_string(),
            applied: artifacts.application.applied,
            defaulted: artifacts.application.defaulted,
        })
    }

    /// Resolve, load, optionally tune, then apply and build.
    ///
    /// A failed tuning stage is reported in the outcome and the build goes
    /// ahead with whatever database the work directory holds, or with default
    /// schedules when there is none.
    pub fn compile_module(&self, module_text: &str) -> Result<CompileOutcome> {
        let target = resolve_target(&self.config.target, self.config.max_workers)?;
        let module = load_module(module_text)?;
        let work_dir = &self.config.work_dir;

        let (tuning_status, tuning_error, trials_run) = if self.config.use_auto_tuning {
            match self.tune_module(&module, &target) {
                Ok(outcome) => (TuningStatus::Success, None, outcome.summary.trials_run),
                Err(err) => {
                    warn!(error = %err, kind = err.kind_name(), "tuning failed, building without it");
                    (TuningStatus::Error, Some(err.to_string()), 0)
                }
            }
        } else {
            (TuningStatus::Skipped, None, 0)
        };

        let db = if TuningDatabase::exists(work_dir) {
            let db = TuningDatabase::open_existing(work_dir)?;
            db.ensure_target(target.kind)?;
            Some(db)
        } else {
            info!(work_dir = %work_dir.display(), "no tuning database, using default schedules");
            None
        };

        let pipeline = CompilerPipeline::new(target, self.config.opt_level)?;
        let artifacts = pipeline.compile(module, db.as_ref(), work_dir)?;
        Ok(CompileOutcome {
            lib_path: artifacts.lib_path,
            work_dir: work_dir.clone(),
            auto_tuning: self.config.use_auto_tuning,
            num_trials: if self.config.use_auto_tuning {
                self.config.num_trials
            } else {
                0
            },
            opt_level: self.config.opt_level,
            target: pipeline.target().to_string(),
            tuning_status,
            tuning_error,
            trials_run,
            applied: artifacts.application.applied,
            defaulted: artifacts.application.defaulted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunebridge_ir::{artifact_path, two_task_module, TargetKind};

    fn session(work_dir: PathBuf, target: &str) -> CompilerSession {
        CompilerSession::new(WorkflowConfig {
            target: target.to_string(),
            work_dir,
            num_trials: 4,
            max_workers: Some(2),
            tuning: crate::config::TuningOptions {
                warmup_runs: 0,
                repeat_runs: 1,
                ..Default::default()
            },
            ..WorkflowConfig::default()
        })
        .expect("session")
    }

    fn module_text() -> String {
        two_task_module().to_json().expect("json")
    }

    #[test]
    fn load_module_normalizes() {
        let module = load_module(&module_text()).expect("load");
        assert_eq!(module.tasks.len(), 2);
        let err = load_module("{ not json").unwrap_err();
        assert_eq!(err.kind_name(), "ModuleParseError");
    }

    #[test]
    fn unknown_target_fails_before_touching_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let work_dir = dir.path().join("db");
        let err = session(work_dir.clone(), "quantum")
            .tune_with_database(&module_text())
            .unwrap_err();
        assert_eq!(err.kind_name(), "InvalidTargetError");
        assert!(!work_dir.exists());
    }

    #[test]
    fn worker_override_reaches_the_target() {
        let target = resolve_target("llvm -num-cores=2", Some(3)).expect("target");
        assert_eq!(target.num_cores, Some(3));
        let target = resolve_target("llvm -num-cores=2", None).expect("target");
        assert_eq!(target.num_cores, Some(2));
        assert_eq!(resolve_target("cuda", Some(3)).expect("cuda").num_cores, None);
    }

    #[test]
    fn tune_then_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let session = session(dir.path().join("db"), "llvm");
        let tuned = session.tune_with_database(&module_text()).expect("tune");
        assert!(tuned.summary.trials_run <= 4);
        assert_eq!(tuned.max_workers, 2);
        assert!(tuned.target.starts_with("llvm"));
        assert!(tuned.target.contains("-num-cores=2"), "{}", tuned.target);

        let applied = session.apply_tuning_database(&module_text()).expect("apply");
        assert_eq!(applied.lib_path, artifact_path(&session.config().work_dir));
        assert!(applied.lib_path.is_file());
        assert_eq!(applied.applied.len() + applied.defaulted.len(), 2);
    }

    #[test]
    fn apply_without_database_creates_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let work_dir = dir.path().join("missing");
        let err = session(work_dir.clone(), "llvm")
            .apply_tuning_database(&module_text())
            .unwrap_err();
        assert_eq!(err.kind_name(), "DatabaseNotFoundError");
        assert!(!work_dir.exists());
    }

    #[test]
    fn failed_tuning_is_not_fatal_to_compile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = session(dir.path().join("db"), "cuda")
            .compile_module(&module_text())
            .expect("compile");
        assert_eq!(outcome.tuning_status, TuningStatus::Error);
        assert!(outcome.tuning_error.is_some());
        assert!(outcome.lib_path.is_file());
        assert_eq!(outcome.defaulted.len(), 2);
        assert!(outcome.target.starts_with(TargetKind::Cuda.as_str()));
    }
}
