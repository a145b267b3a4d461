//! Flat-mapping call surface.
//!
//! Every operation takes a flat JSON object of named parameters and returns a
//! flat JSON object carrying `status`. Failures never escape as errors: they
//! come back as `{"status": "error", "error_kind": ..., "error_message": ...}`.

use crate::config::WorkflowConfig;
use crate::eval::{benchmark_artifact, DEFAULT_BENCH_ITERATIONS, DEFAULT_BENCH_WARMUP};
use crate::session::{resolve_target, CompilerSession};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{debug, warn};
use tunebridge_autotune::TuningDatabase;
use tunebridge_ir::{
    artifact_path, simple_matmul_module, transformer_block_module, two_task_module, Capabilities,
    Error, Module, Result, TargetKind, ARTIFACT_VERSION, MODULE_FORMAT,
};

pub type Mapping = Map<String, Value>;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOp {
    TuneWithDatabase,
    ApplyTuningDatabase,
    CompileModule,
    TargetInfo,
    TuningConfig,
    BuildConfig,
    CheckTuningDatabase,
    SampleModule,
    BenchmarkArtifact,
    Version,
}

impl BridgeOp {
    pub const ALL: [BridgeOp; 10] = [
        BridgeOp::TuneWithDatabase,
        BridgeOp::ApplyTuningDatabase,
        BridgeOp::CompileModule,
        BridgeOp::TargetInfo,
        BridgeOp::TuningConfig,
        BridgeOp::BuildConfig,
        BridgeOp::CheckTuningDatabase,
        BridgeOp::SampleModule,
        BridgeOp::BenchmarkArtifact,
        BridgeOp::Version,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeOp::TuneWithDatabase => "tune_with_database",
            BridgeOp::ApplyTuningDatabase => "apply_tuning_database",
            BridgeOp::CompileModule => "compile_module",
            BridgeOp::TargetInfo => "target_info",
            BridgeOp::TuningConfig => "tuning_config",
            BridgeOp::BuildConfig => "build_config",
            BridgeOp::CheckTuningDatabase => "check_tuning_database",
            BridgeOp::SampleModule => "sample_module",
            BridgeOp::BenchmarkArtifact => "benchmark_artifact",
            BridgeOp::Version => "version",
        }
    }
}

impl FromStr for BridgeOp {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let op = match name {
            "tune_with_database" => BridgeOp::TuneWithDatabase,
            "apply_tuning_database" => BridgeOp::ApplyTuningDatabase,
            "compile_module" => BridgeOp::CompileModule,
            "target_info" => BridgeOp::TargetInfo,
            "tuning_config" => BridgeOp::TuningConfig,
            "build_config" => BridgeOp::BuildConfig,
            "check_tuning_database" => BridgeOp::CheckTuningDatabase,
            "sample_module" => BridgeOp::SampleModule,
            "benchmark_artifact" => BridgeOp::BenchmarkArtifact,
            "version" => BridgeOp::Version,
            other => {
                return Err(Error::InvalidArgument(format!("unknown operation '{other}'")));
            }
        };
        Ok(op)
    }
}

impl fmt::Display for BridgeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named parameters shared by all operations. Absent fields fall back to the
/// workflow configuration (`config`, a TOML path) and then to its defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallParams {
    pub module: Option<String>,
    #[serde(alias = "target_name")]
    pub target: Option<String>,
    pub num_trials: Option<usize>,
    pub max_workers: Option<usize>,
    pub work_dir: Option<PathBuf>,
    pub opt_level: Option<u8>,
    pub use_auto_tuning: Option<bool>,
    pub seed: Option<u64>,
    pub config: Option<PathBuf>,
    /// `sample_module`: `matmul`, `two_task` or `transformer`.
    pub kind: Option<String>,
    pub seq_len: Option<usize>,
    pub d_model: Option<usize>,
    /// `benchmark_artifact`: defaults to the artifact in `work_dir`.
    pub lib_path: Option<PathBuf>,
    pub warmup: Option<usize>,
    pub iterations: Option<usize>,
}

impl CallParams {
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|err| Error::InvalidArgument(format!("invalid parameters: {err}")))
    }

    pub fn workflow(&self) -> Result<WorkflowConfig> {
        let mut config = match &self.config {
            Some(path) => WorkflowConfig::from_file(path)?,
            None => WorkflowConfig::default(),
        };
        if let Some(target) = &self.target {
            config.target = target.clone();
        }
        if let Some(num_trials) = self.num_trials {
            config.num_trials = num_trials;
        }
        if self.max_workers.is_some() {
            config.max_workers = self.max_workers;
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(opt_level) = self.opt_level {
            config.opt_level = opt_level;
        }
        if let Some(use_auto_tuning) = self.use_auto_tuning {
            config.use_auto_tuning = use_auto_tuning;
        }
        if let Some(seed) = self.seed {
            config.tuning.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }

    fn module_text(&self) -> Result<&str> {
        self.module
            .as_deref()
            .ok_or_else(|| Error::InvalidArgument("missing required parameter 'module'".into()))
    }
}

/// Run `op` with `params`. Always returns a mapping with `status`.
pub fn call(op: &str, params: &Value) -> Value {
    let result = op
        .parse::<BridgeOp>()
        .and_then(|op| CallParams::from_value(params).and_then(|params| dispatch(op, &params)));
    match result {
        Ok(mut mapping) => {
            debug!(op, "bridge call succeeded");
            mapping.insert("status".into(), Value::from(STATUS_SUCCESS));
            Value::Object(mapping)
        }
        Err(err) => {
            warn!(op, kind = err.kind_name(), error = %err, "bridge call failed");
            error_mapping(&err)
        }
    }
}

/// [`call`] with JSON text in and out. Unparseable input is an
/// `InvalidArgumentError` mapping.
pub fn call_json(op: &str, params_json: &str) -> String {
    let response = if params_json.trim().is_empty() {
        call(op, &Value::Null)
    } else {
        match serde_json::from_str::<Value>(params_json) {
            Ok(params) => call(op, &params),
            Err(err) => error_mapping(&Error::InvalidArgument(format!(
                "parameters are not valid JSON: {err}"
            ))),
        }
    };
    response.to_string()
}

pub fn error_mapping(err: &Error) -> Value {
    json!({
        "status": STATUS_ERROR,
        "error_kind": err.kind_name(),
        "error_message": err.to_string(),
    })
}

pub fn dispatch(op: BridgeOp, params: &CallParams) -> Result<Mapping> {
    let value = match op {
        BridgeOp::TuneWithDatabase => {
            let session = CompilerSession::new(params.workflow()?)?;
            let outcome = session.tune_with_database(params.module_text()?)?;
            let summary = &outcome.summary;
            json!({
                "work_dir": outcome.work_dir,
                "num_trials": outcome.num_trials,
                "max_workers": outcome.max_workers,
                "target": outcome.target,
                "trials_run": summary.trials_run,
                "successful": summary.successful,
                "failed": summary.failed,
                "peak_in_flight": summary.peak_in_flight,
                "database_records": summary.database_records,
                "tasks": summary.tasks,
            })
        }
        BridgeOp::ApplyTuningDatabase => {
            let session = CompilerSession::new(params.workflow()?)?;
            let outcome = session.apply_tuning_database(params.module_text()?)?;
            to_value(&outcome)?
        }
        BridgeOp::CompileModule => {
            let session = CompilerSession::new(params.workflow()?)?;
            let outcome = session.compile_module(params.module_text()?)?;
            to_value(&outcome)?
        }
        BridgeOp::TargetInfo => {
            let config = params.workflow()?;
            let target = resolve_target(&config.target, config.max_workers)?;
            json!({
                "kind": target.kind,
                "keys": target.keys_list(),
                "str": target.to_string(),
                "num_cores": target.num_cores,
                "is_accelerator": target.is_accelerator(),
            })
        }
        BridgeOp::TuningConfig => {
            let caps = Capabilities::detect();
            let defaults = WorkflowConfig::default();
            json!({
                "available_cores": caps.host_cores,
                "default_work_dir": defaults.work_dir,
                "default_num_trials": defaults.num_trials,
                "supported_targets": caps.target_names,
                "runtimes": caps.runtimes,
                "tuning_available": true,
            })
        }
        BridgeOp::BuildConfig => {
            let caps = Capabilities::detect();
            let mut mapping = Mapping::new();
            mapping.insert("llvm".into(), Value::from(caps.can_run(TargetKind::Cpu)));
            for kind in TargetKind::ALL {
                mapping.insert(kind.as_str().into(), Value::from(caps.can_run(kind)));
            }
            Value::Object(mapping)
        }
        BridgeOp::CheckTuningDatabase => {
            let config = params.workflow()?;
            to_value(&TuningDatabase::summarize(&config.work_dir)?)?
        }
        BridgeOp::SampleModule => {
            let module = sample_module(params)?;
            json!({
                "module": module.to_json()?,
                "format": MODULE_FORMAT,
                "tasks": module.tasks.len(),
            })
        }
        BridgeOp::BenchmarkArtifact => {
            let lib_path = match &params.lib_path {
                Some(path) => path.clone(),
                None => artifact_path(&params.workflow()?.work_dir),
            };
            let report = benchmark_artifact(
                &lib_path,
                params.warmup.unwrap_or(DEFAULT_BENCH_WARMUP),
                params.iterations.unwrap_or(DEFAULT_BENCH_ITERATIONS),
            )?;
            to_value(&report)?
        }
        BridgeOp::Version => json!({
            "name": "tunebridge",
            "version": env!("CARGO_PKG_VERSION"),
            "artifact_version": ARTIFACT_VERSION,
            "module_format": MODULE_FORMAT,
            "operations": BridgeOp::ALL.iter().map(BridgeOp::as_str).collect::<Vec<_>>(),
        }),
    };

    match value {
        Value::Object(mapping) => Ok(mapping),
        other => Err(Error::Engine(format!(
            "operation '{op}' produced a non-object result: {other}"
        ))),
    }
}

fn sample_module(params: &CallParams) -> Result<Module> {
    match params.kind.as_deref().unwrap_or("matmul") {
        "matmul" => Ok(simple_matmul_module()),
        "two_task" => Ok(two_task_module()),
        "transformer" => Ok(transformer_block_module(
            params.seq_len.unwrap_or(16),
            params.d_model.unwrap_or(32),
        )),
        other => Err(Error::InvalidArgument(format!(
            "unknown sample module '{other}', expected matmul, two_task or transformer"
        ))),
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|err| Error::Engine(format!("failed to encode result: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(value: &Value) -> &str {
        value["status"].as_str().expect("status")
    }

    #[test]
    fn every_operation_name_parses() {
        for op in BridgeOp::ALL {
            assert_eq!(op.as_str().parse::<BridgeOp>().expect("parse"), op);
        }
        assert!("compile".parse::<BridgeOp>().is_err());
    }

    #[test]
    fn unknown_operation_is_an_error_mapping() {
        let response = call("launch_rockets", &Value::Null);
        assert_eq!(status(&response), "error");
        assert_eq!(response["error_kind"], "InvalidArgumentError");
        assert!(response["error_message"].as_str().expect("message").contains("launch_rockets"));
    }

    #[test]
    fn target_info_reports_the_resolved_descriptor() {
        let response = call("target_info", &json!({"target_name": "llvm"}));
        assert_eq!(status(&response), "success");
        assert_eq!(response["kind"], "cpu");
        assert!(response["num_cores"].as_u64().expect("cores") >= 1);
        assert!(response["str"].as_str().expect("str").starts_with("llvm"));

        let response = call("target_info", &json!({"target": "tpu"}));
        assert_eq!(response["error_kind"], "InvalidTargetError");
    }

    #[test]
    fn max_workers_sets_the_target_core_count() {
        let response = call("target_info", &json!({"target": "llvm", "max_workers": 3}));
        assert_eq!(status(&response), "success");
        assert_eq!(response["num_cores"], 3);
        assert!(response["str"].as_str().expect("str").ends_with("-num-cores=3"));

        let dir = tempfile::tempdir().expect("tempdir");
        let response = call(
            "tune_with_database",
            &json!({
                "module": two_task_module().to_json().expect("json"),
                "target": "llvm",
                "max_workers": 3,
                "num_trials": 1,
                "work_dir": dir.path(),
            }),
        );
        assert_eq!(status(&response), "success", "{response}");
        assert_eq!(response["max_workers"], 3);
        assert!(response["target"].as_str().expect("target").contains("-num-cores=3"));
    }

    #[test]
    fn build_config_lists_every_kind() {
        let response = call("build_config", &Value::Null);
        assert_eq!(response["llvm"], true);
        assert_eq!(response["cpu"], true);
        assert_eq!(response["cuda"], false);
    }

    #[test]
    fn sample_module_round_trips_through_compile_params() {
        let response = call("sample_module", &json!({"kind": "two_task"}));
        assert_eq!(status(&response), "success");
        assert_eq!(response["tasks"], 2);
        let text = response["module"].as_str().expect("module");
        assert_eq!(Module::from_json(text).expect("parse"), two_task_module());
    }

    #[test]
    fn bad_parameters_are_rejected() {
        let response = call("target_info", &json!({"targte": "llvm"}));
        assert_eq!(response["error_kind"], "InvalidArgumentError");

        let response = call_json("version", "{ nope");
        let value: Value = serde_json::from_str(&response).expect("json");
        assert_eq!(value["error_kind"], "InvalidArgumentError");

        let response = call("compile_module", &json!({"opt_level": 2}));
        assert_eq!(response["error_kind"], "InvalidArgumentError");
    }

    #[test]
    fn check_database_on_missing_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let work_dir = dir.path().join("nothing_here");
        let response = call("check_tuning_database", &json!({"work_dir": work_dir}));
        assert_eq!(status(&response), "success");
        assert_eq!(response["exists"], false);
        assert_eq!(response["file_count"], 0);
        assert!(!work_dir.exists());
    }

    #[test]
    fn version_lists_operations() {
        let response = call_json("version", "");
        let value: Value = serde_json::from_str(&response).expect("json");
        assert_eq!(value["status"], "success");
        assert_eq!(value["operations"].as_array().expect("ops").len(), BridgeOp::ALL.len());
    }
}
