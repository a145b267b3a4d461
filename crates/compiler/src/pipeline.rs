//! Database application and the final build.
//!
//! [`CompilerPipeline::compile`] takes a normalized module, substitutes the
//! best recorded schedule for every task the database knows, runs the
//! optimization-level passes on top, checks every task against the target
//! and writes the compiled artifact into the work directory.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tunebridge_autotune::TuningDatabase;
use tunebridge_ir::{
    artifact_path, CompiledArtifact, Error, Module, PassContext, PassPipeline, Result, Schedule,
    Target,
};
use tunebridge_kernels::validate;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedSchedule {
    pub task: String,
    pub schedule: Schedule,
    pub latency_ms: f64,
}

/// Which tasks took a tuned schedule and which kept their default.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApplicationReport {
    pub applied: Vec<AppliedSchedule>,
    pub defaulted: Vec<String>,
}

impl ApplicationReport {
    pub fn applied_names(&self) -> impl Iterator<Item = &str> {
        self.applied.iter().map(|applied| applied.task.as_str())
    }
}

/// Replace each task's schedule with the fastest successful record for its
/// signature. Tasks without a record keep their schedule.
pub fn apply_database(module: &mut Module, db: &TuningDatabase) -> ApplicationReport {
    let mut report = ApplicationReport::default();
    for task in &mut module.tasks {
        let best = db
            .best_for(&task.signature())
            .and_then(|record| record.latency_ms().map(|latency| (record.schedule, latency)));
        match best {
            Some((schedule, latency_ms)) => {
                task.schedule = schedule.canonicalize(task.op.loop_extents());
                debug!(task = %task.name, schedule = %task.schedule, latency_ms, "applied tuned schedule");
                report.applied.push(AppliedSchedule {
                    task: task.name.clone(),
                    schedule: task.schedule,
                    latency_ms,
                });
            }
            None => report.defaulted.push(task.name.clone()),
        }
    }
    report
}

#[derive(Debug)]
pub struct CompileArtifacts {
    pub module: Module,
    pub artifact: CompiledArtifact,
    pub lib_path: PathBuf,
    pub application: ApplicationReport,
}

pub struct CompilerPipeline {
    target: Target,
    passes: PassPipeline,
    opt_level: u8,
}

impl CompilerPipeline {
    pub fn new(target: Target, opt_level: u8) -> Result<Self> {
        let passes = PassPipeline::for_opt_level(opt_level)?;
        Ok(Self {
            target,
            passes,
            opt_level,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn opt_level(&self) -> u8 {
        self.opt_level
    }

    /// Apply `db` (when given), optimize, check and export to `work_dir`.
    pub fn compile(
        &self,
        mut module: Module,
        db: Option<&TuningDatabase>,
        work_dir: &Path,
    ) -> Result<CompileArtifacts> {
        let application = match db {
            Some(db) => apply_database(&mut module, db),
            None => ApplicationReport {
                applied: Vec::new(),
                defaulted: module.tasks.iter().map(|task| task.name.clone()).collect(),
            },
        };

        let ctx = PassContext::new(self.opt_level).with_tuned(application.applied_names());
        self.passes.run(&mut module, &ctx)?;

        let limit = self.target.tile_footprint_limit();
        for task in &module.tasks {
            validate(task, limit)?;
        }

        let artifact = CompiledArtifact::lower(&module, &self.target, &ctx);
        fs::create_dir_all(work_dir).map_err(|err| Error::io(work_dir, err))?;
        let lib_path = artifact_path(work_dir);
        artifact.save(&lib_path)?;

        info!(
            target = %self.target,
            opt_level = self.opt_level,
            tasks = artifact.tasks.len(),
            tuned = artifact.tuned_count(),
            path = %lib_path.display(),
            "exported compiled artifact"
        );
        Ok(CompileArtifacts {
            module,
            artifact,
            lib_path,
            application,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunebridge_autotune::{unix_millis, TrialOutcome, TrialRecord};
    use tunebridge_ir::{normalize, two_task_module, TargetKind};

    fn normalized() -> Module {
        let mut module = two_task_module();
        normalize(&mut module).expect("normalize");
        module
    }

    fn record(db: &mut TuningDatabase, module: &Module, task: &str, schedule: Schedule, outcome: TrialOutcome) {
        let task = module.task(task).expect("task");
        let signature = task.signature();
        let workload_id = db.commit_workload(&signature, TargetKind::Cpu).expect("workload");
        db.commit_record(TrialRecord {
            workload_id,
            signature,
            task: task.name.clone(),
            schedule,
            outcome,
            target: Target::cpu().to_string(),
            target_kind: TargetKind::Cpu,
            trial: 0,
            timestamp_ms: unix_millis(),
        })
        .expect("record");
    }

    #[test]
    fn partial_database_leaves_other_tasks_at_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = normalized();
        let tuned = Schedule {
            tile_m: 16,
            tile_n: 32,
            tile_k: 8,
            vector_width: 4,
            parallel: true,
        };
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("db");
        record(&mut db, &module, "proj", tuned, TrialOutcome::Built { latency_ms: 0.5, samples: vec![0.5] });
        record(
            &mut db,
            &module,
            "proj",
            Schedule::default(),
            TrialOutcome::BuildFailed { reason: "boom".into() },
        );

        let default_norm = module.task("norm").expect("norm").schedule;
        let pipeline = CompilerPipeline::new(Target::cpu(), 0).expect("pipeline");
        let artifacts = pipeline.compile(module, Some(&db), dir.path()).expect("compile");

        assert_eq!(artifacts.application.applied.len(), 1);
        assert_eq!(artifacts.application.applied[0].task, "proj");
        assert_eq!(artifacts.application.defaulted, vec!["norm".to_string()]);
        assert_eq!(artifacts.module.task("proj").expect("proj").schedule, tuned);
        assert_eq!(artifacts.module.task("norm").expect("norm").schedule, default_norm);
        assert_eq!(artifacts.artifact.tuned_count(), 1);
        assert!(artifacts.lib_path.is_file());
    }

    #[test]
    fn opt_level_passes_do_not_touch_tuned_tasks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let module = normalized();
        let tuned = Schedule {
            tile_m: 8,
            tile_n: 8,
            tile_k: 8,
            vector_width: 1,
            parallel: false,
        };
        let mut db = TuningDatabase::open_or_create(dir.path()).expect("db");
        record(&mut db, &module, "proj", tuned, TrialOutcome::Built { latency_ms: 1.0, samples: vec![1.0] });

        let pipeline = CompilerPipeline::new(Target::cpu(), 3).expect("pipeline");
        let artifacts = pipeline.compile(module, Some(&db), dir.path()).expect("compile");
        assert_eq!(artifacts.module.task("proj").expect("proj").schedule, tuned);
        let norm = artifacts.module.task("norm").expect("norm").schedule;
        assert!(norm.parallel);
        assert_eq!(artifacts.artifact.opt_level, 3);
    }

    #[test]
    fn compiling_without_database_overwrites_the_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = artifact_path(dir.path());
        fs::write(&path, "stale").expect("write");

        let pipeline = CompilerPipeline::new(Target::cpu(), 1).expect("pipeline");
        let artifacts = pipeline.compile(normalized(), None, dir.path()).expect("compile");
        assert_eq!(artifacts.application.defaulted.len(), 2);
        let loaded = CompiledArtifact::load(&path).expect("load");
        assert_eq!(loaded.tasks.len(), 2);
        assert_eq!(loaded.tuned_count(), 0);
    }

    #[test]
    fn illegal_final_schedule_is_a_build_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut module = normalized();
        module.tasks[0].schedule = Schedule {
            tile_m: 64,
            tile_n: 64,
            tile_k: 96,
            vector_width: 1,
            parallel: false,
        };
        let target = Target::resolve("cuda", None).expect("cuda");
        let pipeline = CompilerPipeline::new(target, 0).expect("pipeline");
        let err = pipeline.compile(module, None, dir.path()).unwrap_err();
        assert_eq!(err.kind_name(), "BuildFailure");
        assert!(!artifact_path(dir.path()).exists());
    }

    #[test]
    fn unknown_opt_level_is_rejected() {
        let err = CompilerPipeline::new(Target::cpu(), 4).err().expect("should fail");
        assert_eq!(err.kind_name(), "InvalidArgumentError");
    }
}
