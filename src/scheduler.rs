//! The Scheduler / Executor (spec §4.F): drives every queued task through
//! the state machine, awaiting upstream results, launching commands, and
//! enforcing the keep-going/cancellation policy.
//!
//! Grounded in the teacher's own split between a synchronous dispatcher
//! (`bin/axes.rs::run_cli`) and the thing it dispatches to — here the
//! dispatched unit is a `tokio::spawn`ed task driver per build task rather
//! than a CLI command handler, but the shape (a registry loop that hands
//! each unit of work to its own driver, then waits on the result) is the
//! same. Cancellation borrows the teacher's `CancellationToken`
//! (`Arc<AtomicBool>` plus a `tokio::select!`) generalized to a
//! wake-all [`tokio::sync::Notify`] so many suspended task drivers can all
//! observe the same signal (spec §4.F "Cancellation semantics").

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rand::seq::SliceRandom;
use tokio::sync::Notify;

use crate::engine::Engine;
use crate::error::KilnError;
use crate::process;
use crate::rerun::{self, RerunInputs};
use crate::task::{self, Task, TaskState};
use crate::variant::{Callable, Variant};

/// A wake-all cancellation flag (spec §4.F, §9 "thundering herd"): every
/// suspended task driver races its current await against
/// [`CancellationSignal::cancelled`], so a single `trigger()` reaches all of
/// them regardless of what each one happens to be waiting on.
#[derive(Default)]
pub struct CancellationSignal {
    notify: Notify,
    flag: AtomicBool,
}

impl CancellationSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Races `fut` against the cancellation signal; a suspension point wrapped
/// in this returns [`KilnError::Cancelled`] the instant `signal` fires,
/// rather than whenever `fut` itself would next yield (spec §4.F "A
/// cancellation of task T takes effect at T's next suspension point").
async fn race_cancellable<T>(
    signal: &CancellationSignal,
    fut: impl Future<Output = Result<T, KilnError>>,
) -> Result<T, KilnError> {
    tokio::select! {
        biased;
        () = signal.cancelled() => Err(KilnError::Cancelled("build was cancelled".to_string())),
        result = fut => result,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuildSummary {
    pub finished: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub broken: usize,
}

impl BuildSummary {
    #[must_use]
    pub fn exit_ok(&self) -> bool {
        self.failed == 0 && self.broken == 0
    }

    fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Finished => self.finished += 1,
            TaskState::Skipped => self.skipped += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Broken => self.broken += 1,
            TaskState::Cancelled => self.cancelled += 1,
            other => log::warn!("task ended in an unexpected non-terminal state {other:?}"),
        }
    }
}

/// Owns the three lists named in spec §4.F.
#[derive(Default)]
pub struct Scheduler {
    queued: Mutex<VecDeque<Arc<Task>>>,
    finished: Mutex<Vec<Arc<Task>>>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotently queues `task` and recursively queues every `Task`
    /// embedded in its config (spec §4.C "Queue"). Idempotency rides on the
    /// state machine itself: a task past `Declared` is already queued (or
    /// further along) and is left alone.
    pub fn queue_task(&self, task: &Arc<Task>) {
        if task.state() != TaskState::Declared {
            return;
        }
        task.set_state(TaskState::Queued);
        self.queued.lock().unwrap_or_else(PoisonError::into_inner).push_back(task.clone());
        for embedded in task.embedded_tasks() {
            self.queue_task(&embedded);
        }
    }

    fn shuffle_queued(&self) {
        let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items: Vec<_> = queued.drain(..).collect();
        items.shuffle(&mut rand::thread_rng());
        queued.extend(items);
    }

    #[must_use]
    pub fn finished_snapshot(&self) -> Vec<Arc<Task>> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Main driver loop (spec §4.F). Single-threaded in the sense that only
    /// this loop ever decides what runs next; the tasks it spawns may
    /// progress concurrently (their subprocesses run concurrently on the
    /// OS), but no two pieces of *user* code ever run at the same instant
    /// (spec §5).
    pub async fn run(&self, engine: Arc<Engine>) -> BuildSummary {
        if engine.options.shuffle {
            self.shuffle_queued();
        }

        let mut started: VecDeque<tokio::task::JoinHandle<Arc<Task>>> = VecDeque::new();
        let mut failure_count = 0usize;
        let mut summary = BuildSummary::default();
        let mut stopped = false;

        loop {
            if stopped {
                // The keep_going threshold was already reached: anything
                // still queued never gets a coroutine. It is cancelled
                // outright rather than spawned and immediately raced
                // against the signal.
                let drained: Vec<_> = self
                    .queued
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain(..)
                    .collect();
                for task in drained {
                    if !task.state().is_terminal() {
                        task.record_termination_reason(
                            "cancelled: keep_going threshold reached".to_string(),
                        );
                        task.set_state(TaskState::Cancelled);
                    }
                    summary.record(task.state());
                    self.finished.lock().unwrap_or_else(PoisonError::into_inner).push(task);
                }
            } else {
                let drained: Vec<_> = self
                    .queued
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain(..)
                    .collect();
                for task in drained {
                    let eng = engine.clone();
                    started.push_back(tokio::spawn(drive_task(task, eng)));
                }
            }

            let Some(handle) = started.pop_front() else {
                break;
            };
            let task = match handle.await {
                Ok(task) => task,
                Err(join_err) => {
                    log::error!("task driver panicked: {join_err}");
                    continue;
                }
            };

            let state = task.state();
            summary.record(state);
            if state.counts_toward_keep_going() {
                failure_count += 1;
            }
            self.finished.lock().unwrap_or_else(PoisonError::into_inner).push(task);

            if !stopped && engine.options.keep_going > 0 && failure_count >= engine.options.keep_going {
                log::warn!(
                    "keep_going threshold ({}) reached after {failure_count} failure(s); cancelling remaining work",
                    engine.options.keep_going
                );
                engine.cancellation.trigger();
                stopped = true;
            }
        }

        summary
    }
}

/// Drives one task from STARTED through to a terminal state (spec §4.C,
/// §4.F). Runs as its own `tokio::spawn`ed unit so the OS-level concurrency
/// of sibling tasks' subprocesses (spec §5) is real, even though only one
/// `Scheduler::run` loop ever decides what to drain next.
async fn drive_task(task: Arc<Task>, engine: Arc<Engine>) -> Arc<Task> {
    task.set_state(TaskState::Started);
    task.set_state(TaskState::AwaitingInputs);

    if let Err(err) = race_cancellable(&engine.cancellation, task.await_inputs()).await {
        if !task.state().is_terminal() {
            task.record_termination_reason(err.to_string());
            task.set_state(TaskState::Cancelled);
        }
        return task;
    }

    task.set_state(TaskState::TaskInit);
    if let Err(err) = task::task_init(&task, &engine.claimed_outputs, engine.options.dry_run) {
        task.record_termination_reason(err.to_string());
        // Spec §7 keeps NotFound a distinct category from "any other
        // exception during TASK_INIT" (§7's own definition of Broken), and
        // §8 scenario 2 is explicit that a missing declared input lands the
        // task in FAILED, not BROKEN. Every other TASK_INIT exception
        // (invariant violation, macro recursion, I/O failure) is BROKEN.
        let terminal = match err {
            KilnError::NotFound { .. } => TaskState::Failed,
            _ => TaskState::Broken,
        };
        task.set_state(terminal);
        return task;
    }

    let command_value = task.get_field("command").unwrap_or(Variant::Null);
    if command_value.is_null() {
        task.set_state(TaskState::Finished);
        return task;
    }

    let reason = match compute_rerun_reason(&task, &engine) {
        Ok(reason) => reason,
        Err(err) => {
            task.record_termination_reason(err.to_string());
            task.set_state(TaskState::Broken);
            return task;
        }
    };

    if reason.is_empty() {
        task.set_state(TaskState::Skipped);
        return task;
    }
    task.record_termination_reason(reason.clone());
    log::debug!("task {} reruns: {reason}", task.id());

    if engine.options.dry_run {
        let desc = task
            .get_field("desc")
            .map(|v| v.display_value())
            .unwrap_or_default();
        process::announce_dry_run(&desc, &command_value.display_value());
        task.set_state(TaskState::Finished);
        return task;
    }

    task.set_state(TaskState::AwaitingJobs);
    let job_count = job_count_of(&task);
    let token = task.id().to_string();
    if let Err(err) = race_cancellable(
        &engine.cancellation,
        engine.job_pool.acquire(job_count, &token),
    )
    .await
    {
        task.record_termination_reason(err.to_string());
        task.set_state(TaskState::Cancelled);
        return task;
    }

    task.set_state(TaskState::RunningCommands);
    let outcome = race_cancellable(&engine.cancellation, run_commands(&task, &command_value)).await;
    engine.job_pool.release(job_count, &token);

    match outcome {
        Ok(()) => task.set_state(TaskState::Finished),
        Err(KilnError::Cancelled(reason)) => {
            task.record_termination_reason(reason);
            task.set_state(TaskState::Cancelled);
        }
        Err(err) => {
            task.record_termination_reason(err.to_string());
            task.set_state(TaskState::Failed);
        }
    }
    task
}

fn job_count_of(task: &Arc<Task>) -> usize {
    match task.get_field("job_count") {
        Ok(Variant::Int(n)) if n > 0 => usize::try_from(n).unwrap_or(1),
        _ => 1,
    }
}

fn task_dir_of(task: &Arc<Task>) -> Result<PathBuf, KilnError> {
    task.get_field("task_dir")
        .ok()
        .and_then(|v| v.as_str().map(PathBuf::from))
        .ok_or_else(|| KilnError::Broken("task has no resolved task_dir at command time".to_string()))
}

fn compute_rerun_reason(task: &Arc<Task>, engine: &Engine) -> Result<String, KilnError> {
    let explicit_force = matches!(task.get_field("force"), Ok(Variant::Bool(true)));
    let force = engine.options.force || explicit_force;
    let in_files = task.in_files();
    let out_files = task.out_files();
    let loaded_scripts = task.loaded_scripts().to_vec();
    let task_dir = task_dir_of(task)?;
    let depformat = task
        .get_field("depformat")
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| crate::constants::DEFAULT_DEPFORMAT.to_string());
    let in_depfile = task
        .get_field("in_depfile")
        .ok()
        .and_then(|v| v.as_str().map(PathBuf::from));

    let inputs = RerunInputs {
        force,
        in_files: &in_files,
        out_files: &out_files,
        loaded_scripts: &loaded_scripts,
        engine_mtime: engine.options.engine_mtime,
        in_depfile: in_depfile.as_deref(),
        depformat: &depformat,
        task_dir: &task_dir,
    };
    rerun::needs_rerun(&inputs)
}

enum CommandEntry {
    Shell(String),
    Callable(Callable),
}

fn flatten_commands(value: &Variant, out: &mut Vec<CommandEntry>) -> Result<(), KilnError> {
    match value {
        Variant::Null => {}
        Variant::Str(s) => out.push(CommandEntry::Shell(s.clone())),
        Variant::Callable(c) => out.push(CommandEntry::Callable(c.clone())),
        Variant::Seq(items) => {
            for item in items {
                flatten_commands(item, out)?;
            }
        }
        other => {
            return Err(KilnError::Config(format!(
                "command field contains a value that is neither a string nor a callable: {other:?}"
            )));
        }
    }
    Ok(())
}

/// Runs a task's flattened `command` sequence (spec §4.C "Command phase").
/// Stops at the first non-success entry.
async fn run_commands(task: &Arc<Task>, command_value: &Variant) -> Result<(), KilnError> {
    let mut entries = Vec::new();
    flatten_commands(command_value, &mut entries)?;
    let task_dir = task_dir_of(task)?;
    let task_should_fail = matches!(task.get_field("should_fail"), Ok(Variant::Bool(true)));

    let mut stdout_all = String::new();
    let mut stderr_all = String::new();

    for entry in entries {
        match entry {
            CommandEntry::Callable(callable) => {
                process::run_callable(&callable, task.clone())
                    .await
                    .map_err(|err| KilnError::Command {
                        command: "<callable>".to_string(),
                        reason: err.to_string(),
                    })?;
            }
            CommandEntry::Shell(line) => {
                let parsed = process::CommandLine::parse(&line);
                let should_fail = parsed.should_fail || task_should_fail;
                let command_line = process::CommandLine {
                    text: parsed.text,
                    should_fail,
                };
                let outcome = process::run_shell(&command_line, &task_dir).await?;
                stdout_all.push_str(&outcome.stdout);
                stderr_all.push_str(&outcome.stderr);
                task.record_command_output(stdout_all.clone(), stderr_all.clone(), outcome.return_code);
                if !outcome.passed {
                    return Err(KilnError::Command {
                        command: line,
                        reason: format!("exited with code {:?}", outcome.return_code),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Used by [`crate::engine::Engine::queue_initial`] to avoid re-queueing
/// the same task twice when a target filter and embedded-task discovery
/// both reach it.
#[must_use]
pub fn dedupe_by_id(tasks: Vec<Arc<Task>>) -> Vec<Arc<Task>> {
    let mut seen = HashSet::new();
    tasks
        .into_iter()
        .filter(|t| seen.insert(t.id()))
        .collect()
}
