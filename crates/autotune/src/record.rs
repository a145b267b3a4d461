//! Workload and trial record types persisted in the tuning database.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tunebridge_ir::{Schedule, TargetKind};

/// One distinct task signature known to a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub id: usize,
    pub signature: String,
    pub target_kind: TargetKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Built { latency_ms: f64, samples: Vec<f64> },
    BuildFailed { reason: String },
}

/// One measured (or failed) candidate. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub workload_id: usize,
    pub signature: String,
    pub task: String,
    pub schedule: Schedule,
    pub outcome: TrialOutcome,
    pub target: String,
    pub target_kind: TargetKind,
    pub trial: usize,
    pub timestamp_ms: u128,
}

impl TrialRecord {
    pub fn latency_ms(&self) -> Option<f64> {
        match &self.outcome {
            TrialOutcome::Built { latency_ms, .. } => Some(*latency_ms),
            TrialOutcome::BuildFailed { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.latency_ms().is_some()
    }
}

pub fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis()
}
