//! Kernel timing profiles.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KernelProfile {
    pub kernel: String,
    pub flops: f64,
    pub average_time_ms: f64,
    pub gflops: f64,
}

impl KernelProfile {
    pub fn new(kernel: &str, flops: f64, average_time_ms: f64) -> Self {
        let gflops = if average_time_ms > 0.0 {
            flops / (average_time_ms * 1.0e6)
        } else {
            0.0
        };

        Self {
            kernel: kernel.to_string(),
            flops,
            average_time_ms,
            gflops,
        }
    }
}
