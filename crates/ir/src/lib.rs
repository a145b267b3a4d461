//! tunebridge intermediate representation: modules, schedules, targets and passes.

pub mod builder;
pub mod dialect;
pub mod error;
pub mod lowering;
pub mod passes;
pub mod schedule;
pub mod target;

pub use builder::*;
pub use dialect::*;
pub use error::{Error, Result};
pub use lowering::*;
pub use passes::*;
pub use schedule::*;
pub use target::*;
