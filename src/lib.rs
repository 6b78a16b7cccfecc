//! kiln: a general-purpose incremental build engine configured by
//! executable build scripts.
//!
//! The crate is organized the way the spec's own component list reads:
//! a Variant/Config data model, a template expander, the Task state
//! machine and its rerun oracle, a Job Pool, a Scheduler/Executor that
//! drives tasks through both, and a Script Context that loads the scripts
//! which instantiate tasks in the first place. [`engine`] threads all of
//! it together as one explicit value rather than ambient global state.

pub mod cli;
pub mod config_helpers;
pub mod constants;
pub mod depfile;
pub mod engine;
pub mod error;
pub mod expander;
pub mod job_pool;
pub mod logging;
pub mod process;
pub mod rerun;
pub mod scheduler;
pub mod script_context;
pub mod task;
pub mod variant;

pub use engine::{Engine, EngineOptions};
pub use error::KilnError;
pub use scheduler::BuildSummary;
pub use task::{Task, TaskState};
pub use variant::{Config, Variant};
