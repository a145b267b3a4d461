//! tunebridge compiler facade: pipeline stages and the flat-mapping bridge.

pub mod bridge;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod eval;
pub mod pipeline;
pub mod session;

pub use bridge::*;
#[cfg(feature = "cli")]
pub use cli::*;
pub use config::*;
pub use eval::*;
pub use pipeline::*;
pub use session::*;
