//! CPU backend: plans and executes compiled artifacts on the host.

pub mod planner;
pub mod runtime;

pub use planner::*;
pub use runtime::*;
