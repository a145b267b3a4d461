//! CLI wiring for tunebridge.

use crate::bridge::{call, STATUS_SUCCESS};
use crate::config::WorkflowConfig;
use crate::eval::BenchmarkReport;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tunebridge", about = "Schedule auto-tuning and database-driven rebuilds")]
pub struct Cli {
    /// Workflow configuration (TOML); flags override its values.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub target: Option<String>,

    #[arg(long, global = true)]
    pub work_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve a target name and print its descriptor.
    Target,
    /// Print the effective workflow configuration as TOML.
    Config,
    /// Write a sample module in the serialized module format.
    SampleModule {
        #[arg(long, default_value = "two_task")]
        kind: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the trial search and record results in the work directory.
    Tune {
        module: PathBuf,
        #[arg(long)]
        num_trials: Option<usize>,
        #[arg(long)]
        max_workers: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Rebuild with the best recorded schedules.
    Apply {
        module: PathBuf,
        #[arg(long)]
        opt_level: Option<u8>,
    },
    /// Tune (unless disabled), apply and build in one go.
    Compile {
        module: PathBuf,
        #[arg(long)]
        num_trials: Option<usize>,
        #[arg(long)]
        max_workers: Option<usize>,
        #[arg(long)]
        opt_level: Option<u8>,
        #[arg(long, default_value_t = false)]
        no_tuning: bool,
    },
    /// Summarize the tuning database in the work directory.
    CheckDb,
    /// Benchmark a compiled artifact.
    Bench {
        #[arg(long)]
        lib_path: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        warmup: usize,
        #[arg(long, default_value_t = 10)]
        iterations: usize,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        baseline: Option<PathBuf>,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let Cli {
        config,
        target,
        work_dir,
        command,
    } = cli;

    let mut params = Map::new();
    insert(&mut params, "config", config.as_ref());
    insert(&mut params, "target", target.as_ref());
    insert(&mut params, "work_dir", work_dir.as_ref());

    match command {
        Command::Target => print_call("target_info", params),
        Command::Config => {
            let mut workflow = match &config {
                Some(path) => WorkflowConfig::from_file(path)?,
                None => WorkflowConfig::default(),
            };
            if let Some(target) = target {
                workflow.target = target;
            }
            if let Some(work_dir) = work_dir {
                workflow.work_dir = work_dir;
            }
            print!("{}", workflow.to_toml()?);
            Ok(())
        }
        Command::SampleModule { kind, output } => {
            params.insert("kind".into(), Value::from(kind));
            let response = checked(call("sample_module", &Value::Object(params)))?;
            let module = response["module"].as_str().unwrap_or_default();
            match output {
                Some(path) => {
                    fs::write(&path, module)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    info!(path = %path.display(), "wrote sample module");
                }
                None => println!("{module}"),
            }
            Ok(())
        }
        Command::Tune {
            module,
            num_trials,
            max_workers,
            seed,
        } => {
            params.insert("module".into(), Value::from(read_module(&module)?));
            insert(&mut params, "num_trials", num_trials.as_ref());
            insert(&mut params, "max_workers", max_workers.as_ref());
            insert(&mut params, "seed", seed.as_ref());
            print_call("tune_with_database", params)
        }
        Command::Apply { module, opt_level } => {
            params.insert("module".into(), Value::from(read_module(&module)?));
            insert(&mut params, "opt_level", opt_level.as_ref());
            print_call("apply_tuning_database", params)
        }
        Command::Compile {
            module,
            num_trials,
            max_workers,
            opt_level,
            no_tuning,
        } => {
            params.insert("module".into(), Value::from(read_module(&module)?));
            insert(&mut params, "num_trials", num_trials.as_ref());
            insert(&mut params, "max_workers", max_workers.as_ref());
            insert(&mut params, "opt_level", opt_level.as_ref());
            if no_tuning {
                params.insert("use_auto_tuning".into(), Value::from(false));
            }
            print_call("compile_module", params)
        }
        Command::CheckDb => print_call("check_tuning_database", params),
        Command::Bench {
            lib_path,
            warmup,
            iterations,
            output,
            baseline,
        } => {
            insert(&mut params, "lib_path", lib_path.as_ref());
            params.insert("warmup".into(), Value::from(warmup));
            params.insert("iterations".into(), Value::from(iterations));
            let response = checked(call("benchmark_artifact", &Value::Object(params)))?;
            let report: BenchmarkReport = serde_json::from_value(response.clone())?;
            info!(
                avg_ms = report.avg_ms,
                min_ms = report.min_ms,
                max_ms = report.max_ms,
                "benchmark completed"
            );

            if let Some(path) = output {
                fs::write(&path, serde_json::to_string_pretty(&report)?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                info!(path = %path.display(), "wrote benchmark report");
            }
            if let Some(path) = baseline {
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read baseline {}", path.display()))?;
                let previous: BenchmarkReport = serde_json::from_str(&text)?;
                for (kernel, delta_ms) in report.diff(&previous) {
                    info!(kernel, delta_ms, "latency change against baseline");
                }
            }
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
    }
}

fn insert<T: serde::Serialize>(params: &mut Map<String, Value>, key: &str, value: Option<&T>) {
    if let Some(value) = value {
        params.insert(key.into(), json!(value));
    }
}

fn read_module(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read module {}", path.display()))
}

fn checked(response: Value) -> Result<Value> {
    if response["status"] == STATUS_SUCCESS {
        Ok(response)
    } else {
        bail!(
            "{}: {}",
            response["error_kind"].as_str().unwrap_or("EngineError"),
            response["error_message"].as_str().unwrap_or("unknown error")
        )
    }
}

fn print_call(op: &str, params: Map<String, Value>) -> Result<()> {
    let response = call(op, &Value::Object(params));
    println!("{}", serde_json::to_string_pretty(&response)?);
    checked(response).map(|_| ())
}
