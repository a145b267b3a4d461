//! tunebridge: schedule auto-tuning, database application and rebuild.
//!
//! The workspace crates are re-exported here so integration tests and
//! downstream users can depend on a single package.

pub use tunebridge_autotune as autotune;
pub use tunebridge_backend_cpu as backend_cpu;
pub use tunebridge_compiler as compiler;
pub use tunebridge_ir as ir;
pub use tunebridge_kernels as kernels;
