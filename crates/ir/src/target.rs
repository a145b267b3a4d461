//! Compute target descriptors and host capability detection.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Tile working-set limit for CPU builds (a conservative L2 slice).
pub const CPU_TILE_FOOTPRINT_LIMIT: usize = 512 * 1024;
/// Tile working-set limit for accelerator builds (shared memory per block).
pub const ACCELERATOR_TILE_FOOTPRINT_LIMIT: usize = 48 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Cpu,
    Cuda,
    Metal,
    OpenCl,
    Vulkan,
}

impl TargetKind {
    pub const ALL: [TargetKind; 5] = [
        TargetKind::Cpu,
        TargetKind::Cuda,
        TargetKind::Metal,
        TargetKind::OpenCl,
        TargetKind::Vulkan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Cpu => "cpu",
            TargetKind::Cuda => "cuda",
            TargetKind::Metal => "metal",
            TargetKind::OpenCl => "opencl",
            TargetKind::Vulkan => "vulkan",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        !matches!(self, TargetKind::Cpu)
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "llvm" | "cpu" | "x86" | "x86_64" | "arm" | "aarch64" | "c" => Some(TargetKind::Cpu),
            "cuda" | "nvidia" | "gpu" => Some(TargetKind::Cuda),
            "metal" | "apple" => Some(TargetKind::Metal),
            "opencl" => Some(TargetKind::OpenCl),
            "vulkan" => Some(TargetKind::Vulkan),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved compute target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub keys: BTreeSet<String>,
    /// Worker-thread count for CPU targets; accelerators carry none.
    pub num_cores: Option<usize>,
}

impl Target {
    /// Resolve a target from its name and an optional core-count override.
    ///
    /// The first whitespace-separated token selects the kind; a
    /// `-num-cores=N` (or `-num-cores N`) attribute is honoured for CPU
    /// targets. An explicit override beats the attribute, which beats the
    /// host's logical core count.
    pub fn resolve(name: &str, num_cores: Option<usize>) -> Result<Self> {
        let lowered = name.trim().to_ascii_lowercase();
        let mut tokens = lowered.split_whitespace();
        let head = tokens
            .next()
            .ok_or_else(|| Error::InvalidTarget(name.to_string()))?;
        let kind = TargetKind::from_name(head).ok_or_else(|| Error::InvalidTarget(name.to_string()))?;

        let mut attribute_cores = None;
        let rest: Vec<&str> = tokens.collect();
        let mut index = 0;
        while index < rest.len() {
            let token = rest[index];
            if let Some(value) = token.strip_prefix("-num-cores=") {
                attribute_cores = Some(parse_cores(name, value)?);
            } else if token == "-num-cores" {
                let value = rest
                    .get(index + 1)
                    .ok_or_else(|| Error::InvalidTarget(name.to_string()))?;
                attribute_cores = Some(parse_cores(name, value)?);
                index += 1;
            }
            index += 1;
        }

        if num_cores == Some(0) {
            return Err(Error::InvalidArgument("num_cores must be positive".into()));
        }

        let num_cores = match kind {
            TargetKind::Cpu => Some(num_cores.or(attribute_cores).unwrap_or_else(host_cores)),
            _ => None,
        };

        let mut keys = BTreeSet::new();
        keys.insert(kind.as_str().to_string());
        if kind.is_accelerator() {
            keys.insert("gpu".to_string());
        }

        Ok(Self {
            kind,
            keys,
            num_cores,
        })
    }

    pub fn cpu() -> Self {
        // "llvm" always resolves.
        Self::resolve("llvm", None).unwrap_or(Self {
            kind: TargetKind::Cpu,
            keys: BTreeSet::from(["cpu".to_string()]),
            num_cores: Some(1),
        })
    }

    pub fn is_accelerator(&self) -> bool {
        self.kind.is_accelerator()
    }

    pub fn tile_footprint_limit(&self) -> usize {
        if self.is_accelerator() {
            ACCELERATOR_TILE_FOOTPRINT_LIMIT
        } else {
            CPU_TILE_FOOTPRINT_LIMIT
        }
    }

    pub fn keys_list(&self) -> Vec<String> {
        self.keys.iter().cloned().collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.keys_list().join(",");
        match (self.kind, self.num_cores) {
            (TargetKind::Cpu, Some(cores)) => write!(f, "llvm -keys={keys} -num-cores={cores}"),
            (kind, _) => write!(f, "{kind} -keys={keys}"),
        }
    }
}

fn parse_cores(name: &str, value: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(cores) if cores > 0 => Ok(cores),
        _ => Err(Error::InvalidTarget(name.to_string())),
    }
}

/// Logical core count of the host.
pub fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// What this process can build and run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub host_cores: usize,
    /// Target kinds with an in-process runtime able to measure candidates.
    pub runtimes: BTreeSet<TargetKind>,
    /// Target names accepted by [`Target::resolve`].
    pub target_names: Vec<&'static str>,
}

impl Capabilities {
    /// Probe the host. Pure: every call returns the same answer for the same
    /// process, so callers construct it once and pass it around.
    pub fn detect() -> Self {
        Self {
            host_cores: host_cores(),
            runtimes: BTreeSet::from([TargetKind::Cpu]),
            target_names: vec!["llvm", "cpu", "cuda", "metal", "opencl", "vulkan"],
        }
    }

    pub fn can_run(&self, kind: TargetKind) -> bool {
        self.runtimes.contains(&kind)
    }

    pub fn ensure_runnable(&self, target: &Target) -> Result<()> {
        if self.can_run(target.kind) {
            Ok(())
        } else {
            Err(Error::Engine(format!(
                "no runtime available for target kind '{}' in this build",
                target.kind
            )))
        }
    }
}
