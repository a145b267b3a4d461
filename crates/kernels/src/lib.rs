//! Schedule-driven kernels used to measure tuning candidates and run compiled artifacts.

pub mod attention;
pub mod build;
pub mod config;
pub mod layernorm;
pub mod matmul;
pub mod utils;

pub use attention::*;
pub use build::*;
pub use config::*;
pub use layernorm::*;
pub use matmul::*;
pub use utils::*;
