//! Command-phase execution (spec §4.C RUNNING_COMMANDS): running one
//! flattened `command` entry — a shell string or a callable — against a
//! task's resolved `task_dir`.
//!
//! Async and cooperative (`tokio::process::Command`), unlike the teacher's
//! `execute_command()` (a blocking `std::process::Command` plus a
//! `try_wait()`/`sleep(100ms)` poll loop for cancellation) — spec §5's
//! single-threaded driver model means kiln can simply `.await` a child
//! process directly and let `tokio::select!` at the scheduler level handle
//! cancellation, with no polling loop needed. The per-line `-` prefix
//! override and the success-is-XOR-with-should_fail rule are carried over
//! unchanged (supplemented feature C.1, grounded in the teacher's
//! `strip_prefix('-')` handling).
//!
//! Spec §4.C is explicit that a string `command` entry "launches a
//! subprocess in a shell" — build commands routinely lean on shell syntax
//! (`>` redirects, `&&` chains, globs the shell itself expands), so the line
//! is handed to the platform shell verbatim rather than tokenized and
//! exec'd directly the way [`crate::config_helpers::dispatch`]'s `run_cmd`
//! helper does for simple capture-output calls.

use std::path::Path;
use std::sync::Arc;

use crate::error::KilnError;
use crate::task::Task;
use crate::variant::Callable;

/// The result of running one command line.
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub return_code: Option<i32>,
    /// `true` if the command counts as successful — `return_code == 0`
    /// XOR the line's `should_fail` flag (spec §4.C).
    pub passed: bool,
}

/// One line of a task's flattened `command` list, already split into its
/// shell text and the per-line `should_fail` override (spec §C.1: a line
/// beginning with `-` is expected to fail).
pub struct CommandLine<'a> {
    pub text: &'a str,
    pub should_fail: bool,
}

impl<'a> CommandLine<'a> {
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        let trimmed = raw.trim();
        match trimmed.strip_prefix('-') {
            Some(rest) => Self {
                text: rest.trim_start(),
                should_fail: true,
            },
            None => Self {
                text: trimmed,
                should_fail: false,
            },
        }
    }
}

/// Runs a single shell command line against `cwd`, capturing both streams.
///
/// # Errors
///
/// Returns [`KilnError::Command`] only if the shell itself can't be spawned
/// at all (not found, permission denied, …) — a non-zero exit, including one
/// caused by the shell rejecting malformed syntax, is NOT an error here, it's
/// reflected in [`CommandOutcome::passed`].
pub async fn run_shell(line: &CommandLine<'_>, cwd: &Path) -> Result<CommandOutcome, KilnError> {
    if line.text.is_empty() {
        return Ok(CommandOutcome {
            stdout: String::new(),
            stderr: String::new(),
            return_code: Some(0),
            passed: true,
        });
    }

    let (shell, shell_flag) = if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let output = tokio::process::Command::new(shell)
        .arg(shell_flag)
        .arg(line.text)
        .current_dir(cwd)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| KilnError::Command {
            command: line.text.to_string(),
            reason: format!("failed to spawn {shell}: {e}"),
        })?;

    let return_code = output.status.code();
    let succeeded_normally = output.status.success();
    let passed = succeeded_normally != line.should_fail;

    Ok(CommandOutcome {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        return_code,
        passed,
    })
}

/// Invokes a callable `command` entry with the owning task (spec §4.C "If
/// callable: invoke it with the Task as argument").
///
/// # Errors
///
/// Propagates whatever the callable itself returns.
pub async fn run_callable(callable: &Callable, task: Arc<Task>) -> anyhow::Result<()> {
    callable(task).await
}

/// Prints what a command *would* do without running it (spec §C.5, dry
/// run). Mirrors the teacher's status-line formatting (`desc` first,
/// command text indented below) rather than inventing a new layout.
pub fn announce_dry_run(desc: &str, command_text: &str) {
    use colored::Colorize;
    println!("{} {}", "(DRY RUN)".yellow(), desc);
    println!("  {command_text}");
}
