//! The error taxonomy (spec §7).
//!
//! Internal modules return `Result<T, KilnError>` so the specific variant is
//! preserved for the state machine (a [`KilnError`] tells the scheduler which
//! terminal [`crate::task::TaskState`] a failing task should land in). Public
//! entry points on [`crate::engine::Engine`] and [`crate::script_context::ScriptApi`]
//! return `anyhow::Result<T>`, matching the teacher's own split between a
//! typed core and an `anyhow`-flavored edge.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KilnError {
    /// Invariant 1 or 4 violations, unknown `depformat`, invalid `command`
    /// value type, or a requested job count exceeding the pool size.
    #[error("configuration error: {0}")]
    Config(String),

    /// A declared input file, or `task_dir`, does not exist at TASK_INIT time.
    #[error("not found: {path} ({context})")]
    NotFound { path: PathBuf, context: String },

    /// Macro recursion exceeded [`crate::constants::MAX_EXPAND_DEPTH`].
    #[error("expansion error: {0}")]
    Expansion(String),

    /// A command exited non-zero (or zero when `should_fail` was set).
    #[error("command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    /// The task could not proceed because an upstream dependency did not
    /// finish (failed, was cancelled, or broke).
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Any other exception encountered during TASK_INIT.
    #[error("broken: {0}")]
    Broken(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KilnError>;
