//! Schedule auto-tuning for tunebridge modules.

pub mod builder;
pub mod database;
pub mod record;
pub mod runner;
pub mod scheduler;
pub mod search;
pub mod tuner;

pub use builder::*;
pub use database::*;
pub use record::*;
pub use runner::*;
pub use scheduler::*;
pub use search::*;
pub use tuner::*;
