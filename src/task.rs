//! The `Task` entity and its state machine (spec §4.C), plus `Promise`
//! (spec §3).
//!
//! A `Task` is shared via `Arc` and mutated through interior mutability —
//! the scheduler, the expander and any number of `Promise`s referencing the
//! same task all hold the same `Arc<Task>`. This mirrors the teacher's own
//! `ResolvedConfig` (`Arc<Mutex<HashMap<...>>>` memoization fields,
//! `Arc<OnceLock<LayerResult>>` promises): identity matters more than
//! ownership here, exactly as `models.rs` documents for its own `layers`/
//! `hierarchy` bookkeeping. Per spec §5 only the driver (and things it is
//! directly awaiting) ever mutates a `Task`'s `Config`, so a `std::sync`
//! `Mutex` — never actually contended — is enough; state itself rides a
//! `tokio::sync::watch` channel so awaiters never miss a transition.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::KilnError;
use crate::expander;
use crate::variant::{BoxFuture, Config, Variant};

/// The set of output paths already claimed by a finished TASK_INIT pass,
/// shared across every task so invariant 1 (one producer per output) can be
/// enforced as each task materializes its outputs (spec §3 invariant 1,
/// §4.C step 8). Owned by [`crate::engine::Engine`] and handed to
/// [`task_init`] by reference.
pub type ClaimedOutputs = Mutex<HashSet<PathBuf>>;

/// Legal states, in the order spec §4.C lays them out. Terminal states are
/// [`TaskState::is_terminal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    Declared,
    Queued,
    Started,
    AwaitingInputs,
    TaskInit,
    AwaitingJobs,
    RunningCommands,
    Finished,
    Skipped,
    Failed,
    Cancelled,
    Broken,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Skipped | Self::Failed | Self::Cancelled | Self::Broken
        )
    }

    /// Finished or Skipped — the two terminal states a downstream
    /// `Promise`/embedded `Task` reference may safely read outputs from.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Finished | Self::Skipped)
    }

    /// True for the terminal states that count toward the `keep_going`
    /// threshold (spec §7: "Cancelled is reported but not counted toward
    /// keep_going").
    #[must_use]
    pub fn counts_toward_keep_going(self) -> bool {
        matches!(self, Self::Failed | Self::Broken)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A declared unit of work (spec §3). Always held behind `Arc`.
pub struct Task {
    id: Uuid,
    config: Mutex<Config>,
    in_files: Mutex<Vec<PathBuf>>,
    out_files: Mutex<Vec<PathBuf>>,
    state_tx: watch::Sender<TaskState>,
    termination_reason: Mutex<Option<String>>,
    /// Snapshot, at creation time, of every script file loaded so far —
    /// used by the rerun oracle's step 7 (spec §4.D).
    loaded_scripts: Vec<PathBuf>,
    stdout: Mutex<String>,
    stderr: Mutex<String>,
    return_code: Mutex<Option<i32>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Task {
    #[must_use]
    pub fn new(config: Config, loaded_scripts: Vec<PathBuf>) -> std::sync::Arc<Self> {
        let (state_tx, _rx) = watch::channel(TaskState::Declared);
        std::sync::Arc::new(Self {
            id: Uuid::new_v4(),
            config: Mutex::new(config),
            in_files: Mutex::new(Vec::new()),
            out_files: Mutex::new(Vec::new()),
            state_tx,
            termination_reason: Mutex::new(None),
            loaded_scripts,
            stdout: Mutex::new(String::new()),
            stderr: Mutex::new(String::new()),
            return_code: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        *self.state_tx.borrow()
    }

    /// Transitions the task's state and wakes every current waiter of
    /// [`Self::wait_terminal`]. Transition legality is enforced by the
    /// scheduler (spec §4.F drives the sequence); this setter only records
    /// and broadcasts.
    pub fn set_state(&self, new: TaskState) {
        log::debug!("task {} {:?} -> {new:?}", self.id, self.state());
        let _ = self.state_tx.send(new);
    }

    /// Suspends until the task reaches a terminal state (spec §5
    /// suspension point (a), and the basis of [`Promise::resolve`]).
    pub async fn wait_terminal(&self) -> TaskState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let current = *rx.borrow();
            if current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    #[must_use]
    pub fn config_snapshot(&self) -> Config {
        lock(&self.config).clone()
    }

    pub fn replace_config(&self, new: Config) {
        *lock(&self.config) = new;
    }

    pub fn with_config_mut<R>(&self, f: impl FnOnce(&mut Config) -> R) -> R {
        f(&mut lock(&self.config))
    }

    /// Reads one field from the task's (post-expansion) config — the basis
    /// of a single-field `Promise` (spec §3).
    pub fn get_field(&self, name: &str) -> anyhow::Result<Variant> {
        lock(&self.config)
            .get(name)
            .cloned()
            .ok_or_else(|| KilnError::Config(format!("task {} has no field '{name}'", self.id)).into())
    }

    #[must_use]
    pub fn in_files(&self) -> Vec<PathBuf> {
        lock(&self.in_files).clone()
    }

    #[must_use]
    pub fn out_files(&self) -> Vec<PathBuf> {
        lock(&self.out_files).clone()
    }

    pub fn set_in_out_files(&self, in_files: Vec<PathBuf>, out_files: Vec<PathBuf>) {
        *lock(&self.in_files) = in_files;
        *lock(&self.out_files) = out_files;
    }

    #[must_use]
    pub fn loaded_scripts(&self) -> &[PathBuf] {
        &self.loaded_scripts
    }

    pub fn record_termination_reason(&self, reason: impl Into<String>) {
        *lock(&self.termination_reason) = Some(reason.into());
    }

    #[must_use]
    pub fn termination_reason(&self) -> Option<String> {
        lock(&self.termination_reason).clone()
    }

    pub fn record_command_output(&self, stdout: String, stderr: String, return_code: Option<i32>) {
        *lock(&self.stdout) = stdout;
        *lock(&self.stderr) = stderr;
        *lock(&self.return_code) = return_code;
    }

    #[must_use]
    pub fn stdout(&self) -> String {
        lock(&self.stdout).clone()
    }

    #[must_use]
    pub fn stderr(&self) -> String {
        lock(&self.stderr).clone()
    }

    #[must_use]
    pub fn return_code(&self) -> Option<i32> {
        *lock(&self.return_code)
    }

    /// Every `Task`/`Promise` reachable inside this task's current config,
    /// found by a depth-first walk — the basis of recursive queueing (spec
    /// §4.C "Queue").
    #[must_use]
    pub fn embedded_tasks(&self) -> Vec<std::sync::Arc<Task>> {
        let snapshot = self.config_snapshot();
        let mut out = Vec::new();
        for (_, value) in snapshot.iter() {
            collect_embedded_tasks(value, &mut out);
        }
        out
    }

    /// Walks the task's config depth-first, awaiting every `Task` or
    /// `Promise` encountered and replacing it with its resolved value
    /// (spec §4.C "Await-inputs phase"). On failure the task is marked
    /// CANCELLED and the error is returned so the scheduler can propagate
    /// it downstream.
    pub async fn await_inputs(self: &std::sync::Arc<Self>) -> Result<(), KilnError> {
        let snapshot = self.config_snapshot();
        let mut resolved = Config::new();
        for (key, value) in snapshot.iter() {
            match await_variant(value.clone()).await {
                Ok(awaited) => {
                    resolved.insert(key.to_string(), awaited);
                }
                Err(err) => {
                    self.record_termination_reason(err.to_string());
                    self.set_state(TaskState::Cancelled);
                    return Err(err);
                }
            }
        }
        self.replace_config(resolved);
        Ok(())
    }
}

fn collect_embedded_tasks(value: &Variant, out: &mut Vec<std::sync::Arc<Task>>) {
    match value {
        Variant::Task(t) => out.push(t.clone()),
        Variant::Promise(p) => out.push(p.task.clone()),
        Variant::Seq(items) => {
            for item in items {
                collect_embedded_tasks(item, out);
            }
        }
        Variant::Map(c) => {
            for (_, v) in c.iter() {
                collect_embedded_tasks(v, out);
            }
        }
        _ => {}
    }
}

fn await_variant(value: Variant) -> BoxFuture<'static, Result<Variant, KilnError>> {
    Box::pin(async move {
        match value {
            Variant::Task(task) => {
                let final_state = task.wait_terminal().await;
                if !final_state.is_success() {
                    return Err(KilnError::Cancelled(format!(
                        "upstream task {} ended in {final_state:?}",
                        task.id()
                    )));
                }
                Ok(Variant::Seq(
                    task.out_files().into_iter().map(Variant::from).collect(),
                ))
            }
            Variant::Promise(promise) => promise.resolve().await.map_err(|err| {
                err.downcast::<KilnError>()
                    .unwrap_or_else(|other| KilnError::Broken(other.to_string()))
            }),
            Variant::Seq(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(await_variant(item).await?);
                }
                Ok(Variant::Seq(out))
            }
            Variant::Map(config) => {
                let mut resolved = Config::new();
                for (key, value) in config.iter() {
                    resolved.insert(key.to_string(), await_variant(value.clone()).await?);
                }
                Ok(Variant::Map(resolved))
            }
            other => Ok(other),
        }
    })
}

/// A handle to `(task, field_names…)` — awaiting it waits for the task to
/// finish, then projects out its outputs (spec §3).
#[derive(Clone)]
pub struct Promise {
    pub task: std::sync::Arc<Task>,
    pub fields: Vec<String>,
}

impl Promise {
    #[must_use]
    pub fn whole(task: std::sync::Arc<Task>) -> Self {
        Self {
            task,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(task: std::sync::Arc<Task>, field: impl Into<String>) -> Self {
        Self {
            task,
            fields: vec![field.into()],
        }
    }

    #[must_use]
    pub fn of_fields(task: std::sync::Arc<Task>, fields: Vec<String>) -> Self {
        Self { task, fields }
    }

    pub async fn resolve(&self) -> anyhow::Result<Variant> {
        let final_state = self.task.wait_terminal().await;
        if !final_state.is_success() {
            return Err(KilnError::Cancelled(format!(
                "upstream task {} ended in {final_state:?}",
                self.task.id()
            ))
            .into());
        }
        match self.fields.as_slice() {
            [] => Ok(Variant::Seq(
                self.task
                    .out_files()
                    .into_iter()
                    .map(Variant::from)
                    .collect(),
            )),
            [single] => self.task.get_field(single),
            many => {
                let mut out = Vec::with_capacity(many.len());
                for field in many {
                    out.push(self.task.get_field(field)?);
                }
                Ok(Variant::Seq(out))
            }
        }
    }
}

/// Performs the TASK_INIT phase (spec §4.C) for a task whose AWAITING_INPUTS
/// walk has already completed. Synchronous, as the spec requires ("performed
/// once, atomically") — every step here is pure computation or a filesystem
/// check, never a suspension point.
///
/// # Errors
///
/// Returns [`KilnError::Config`] for invariant violations (steps 2, 8, 10),
/// [`KilnError::NotFound`] for a missing declared input (step 9), or
/// propagates an [`KilnError::Expansion`] from a `desc`/`command`/path macro
/// that recursed past the bound.
pub fn task_init(
    task: &std::sync::Arc<Task>,
    claimed_outputs: &ClaimedOutputs,
    dry_run: bool,
) -> Result<(), KilnError> {
    let mut config = task.config_snapshot();

    // Step 1: resolve task_dir and build_dir to absolute paths.
    let task_dir = resolve_task_dir(&config)?;
    config.insert("task_dir", Variant::from(task_dir.clone()));
    let build_dir = resolve_build_dir(&config, &task_dir)?;
    config.insert("build_dir", Variant::from(build_dir.clone()));

    // Step 2: repo_dir containment.
    if let Some(raw_repo_dir) = config.get_str("repo_dir") {
        let expanded = expander::expand_str(&config, raw_repo_dir)?;
        let repo_dir = normalize_lexically(&absolutize(&PathBuf::from(expanded), &task_dir)?);
        if !build_dir.starts_with(&repo_dir) {
            return Err(KilnError::Config(format!(
                "build_dir {} is not under repo_dir {}",
                build_dir.display(),
                repo_dir.display()
            )));
        }
    }

    // Steps 3-5 are two strictly separate passes over `keys`, not one
    // combined loop: `Config` is a `HashMap` (key order carries no meaning,
    // variant.rs), so expanding and absolutizing a field in the same pass
    // would make the result depend on whether some other field had already
    // been absolutized when this one's macro read it.
    let keys: Vec<String> = config
        .keys()
        .filter(|k| *k != "task_dir" && *k != "build_dir")
        .map(String::from)
        .collect();

    // Step 3: expand every in_*/out_* field, still relative.
    for key in &keys {
        let is_out_like = key.starts_with("out_") || key == "in_depfile";
        let is_in = key.starts_with("in_");
        if !is_out_like && !is_in {
            continue;
        }
        let raw = config.get(key).cloned().expect("key came from config.keys()");
        let expanded = expander::expand(&config, &raw)?;
        config.insert(key.clone(), expanded);
    }

    // Steps 4-5: absolutize every now-fully-expanded in_*/out_* field.
    for key in &keys {
        let is_out_like = key.starts_with("out_") || key == "in_depfile";
        let is_in = key.starts_with("in_");
        if !is_out_like && !is_in {
            continue;
        }
        let expanded = config.get(key).cloned().expect("key came from config.keys()");
        let resolved = if is_out_like {
            map_path_strings(&expanded, |s| resolve_out_path(s, &task_dir, &build_dir))?
        } else {
            Ok(map_path_strings_infallible(&expanded, |s| {
                resolve_in_path(s, &task_dir)
            }))
        }?;
        config.insert(key.clone(), resolved);
    }

    // Step 6: gather in_files / out_files.
    let mut in_files = Vec::new();
    let mut out_files = Vec::new();
    for (key, value) in config.iter() {
        if key == "in_depfile" {
            let mut strs = Vec::new();
            value.flatten_to_strings(&mut strs);
            // Conditional inclusion: only if it already exists on disk (spec
            // §4.C step 6, Open Question (b)).
            in_files.extend(strs.into_iter().map(PathBuf::from).filter(|p| p.exists()));
        } else if key.starts_with("in_") {
            let mut strs = Vec::new();
            value.flatten_to_strings(&mut strs);
            in_files.extend(strs.into_iter().map(PathBuf::from));
        } else if key.starts_with("out_") {
            let mut strs = Vec::new();
            value.flatten_to_strings(&mut strs);
            out_files.extend(strs.into_iter().map(PathBuf::from));
        }
    }

    // Step 7: expand desc and command.
    if let Some(desc) = config.get("desc").cloned() {
        let expanded = expander::expand(&config, &desc)?;
        config.insert("desc", expanded);
    }
    if let Some(command) = config.get("command").cloned() {
        let expanded = expander::expand(&config, &command)?;
        config.insert("command", expanded);
    }

    // Step 8: one-producer-per-output invariant.
    {
        let mut claimed = claimed_outputs.lock().unwrap_or_else(PoisonError::into_inner);
        for out in &out_files {
            if !claimed.insert(out.clone()) {
                return Err(KilnError::Config(format!(
                    "output {} is produced by more than one task",
                    out.display()
                )));
            }
        }
    }

    // Step 9: every input must already exist.
    for input in &in_files {
        if !input.exists() {
            return Err(KilnError::NotFound {
                path: input.clone(),
                context: "declared task input".to_string(),
            });
        }
    }

    // Step 10: every output must be under build_dir.
    for out in &out_files {
        if !out.starts_with(&build_dir) {
            return Err(KilnError::Config(format!(
                "output {} is not under build_dir {}",
                out.display(),
                build_dir.display()
            )));
        }
    }

    // Step 11: create output directories, unless this is a dry run.
    if !dry_run {
        for out in &out_files {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    task.set_in_out_files(in_files, out_files);
    task.replace_config(config);
    Ok(())
}

fn resolve_task_dir(config: &Config) -> Result<PathBuf, KilnError> {
    let raw = config.get_str("task_dir").unwrap_or(".");
    let expanded = expander::expand_str(config, raw)?;
    let base = std::env::current_dir()?;
    Ok(normalize_lexically(&absolutize(
        &PathBuf::from(expanded),
        &base,
    )?))
}

/// Resolves `build_dir`, defaulting to `{build_root}/{build_tag}` (the
/// `build_tag` supplemented feature, §SPEC_FULL C.5) or `task_dir/build` when
/// neither `build_dir` nor `build_root` is set.
fn resolve_build_dir(config: &Config, task_dir: &Path) -> Result<PathBuf, KilnError> {
    if let Some(raw) = config.get_str("build_dir") {
        let expanded = expander::expand_str(config, raw)?;
        return Ok(normalize_lexically(&absolutize(
            &PathBuf::from(expanded),
            task_dir,
        )?));
    }
    let default = if let Some(root) = config.get_str("build_root") {
        let root = expander::expand_str(config, root)?;
        let tag = config.get_str("build_tag").unwrap_or("default");
        PathBuf::from(root).join(tag)
    } else {
        task_dir.join("build")
    };
    Ok(normalize_lexically(&absolutize(&default, task_dir)?))
}

fn absolutize(p: &Path, base: &Path) -> Result<PathBuf, KilnError> {
    Ok(if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    })
}

/// Collapses `.`/`..` components lexically, without touching the filesystem
/// (the path usually doesn't exist yet — `build_dir` is created in step 11).
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolution rule for `out_*`/`in_depfile` paths (spec §4.C step 4): already
/// under `build_dir` → left alone; under `task_dir` → rebased to the same
/// relative location under `build_dir`; absolute elsewhere → rejected;
/// relative → prefixed with `build_dir`.
fn resolve_out_path(raw: &str, task_dir: &Path, build_dir: &Path) -> Result<PathBuf, KilnError> {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        let normalized = normalize_lexically(&p);
        if normalized.starts_with(build_dir) {
            return Ok(normalized);
        }
        if let Ok(rel) = normalized.strip_prefix(task_dir) {
            return Ok(normalize_lexically(&build_dir.join(rel)));
        }
        return Err(KilnError::Config(format!(
            "output path {} is absolute but not under build_dir ({}) or task_dir ({})",
            normalized.display(),
            build_dir.display(),
            task_dir.display()
        )));
    }
    Ok(normalize_lexically(&build_dir.join(p)))
}

/// Resolution rule for ordinary `in_*` paths (spec §4.C step 5): relative
/// paths are prefixed with `task_dir`; absolute paths pass through unchanged
/// (e.g. system headers reached via an absolute include path).
fn resolve_in_path(raw: &str, task_dir: &Path) -> PathBuf {
    let p = PathBuf::from(raw);
    if p.is_absolute() {
        normalize_lexically(&p)
    } else {
        normalize_lexically(&task_dir.join(p))
    }
}

fn map_path_strings(
    value: &Variant,
    f: impl Fn(&str) -> Result<PathBuf, KilnError> + Copy,
) -> Result<Variant, KilnError> {
    match value {
        Variant::Str(s) => Ok(Variant::from(f(s)?)),
        Variant::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(map_path_strings(item, f)?);
            }
            Ok(Variant::Seq(out))
        }
        other => Ok(other.clone()),
    }
}

fn map_path_strings_infallible(value: &Variant, f: impl Fn(&str) -> PathBuf + Copy) -> Variant {
    match value {
        Variant::Str(s) => Variant::from(f(s)),
        Variant::Seq(items) => {
            Variant::Seq(items.iter().map(|item| map_path_strings_infallible(item, f)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_terminal_returns_immediately_once_finished() {
        let task = Task::new(Config::new(), Vec::new());
        task.set_state(TaskState::Finished);
        let state = task.wait_terminal().await;
        assert_eq!(state, TaskState::Finished);
    }

    #[tokio::test]
    async fn wait_terminal_observes_a_later_transition() {
        let task = Task::new(Config::new(), Vec::new());
        let waiter_task = task.clone();
        let waiter = tokio::spawn(async move { waiter_task.wait_terminal().await });
        tokio::task::yield_now().await;
        task.set_state(TaskState::Failed);
        let state = waiter.await.expect("waiter task panicked");
        assert_eq!(state, TaskState::Failed);
    }

    #[tokio::test]
    async fn promise_whole_resolves_to_out_files() {
        let task = Task::new(Config::new(), Vec::new());
        task.set_in_out_files(Vec::new(), vec![PathBuf::from("/build/a.o")]);
        task.set_state(TaskState::Finished);
        let promise = Promise::whole(task);
        let resolved = promise.resolve().await.unwrap();
        let seq = resolved.as_seq().unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq[0].display_value(), "/build/a.o");
    }

    #[tokio::test]
    async fn promise_on_cancelled_task_is_an_error() {
        let task = Task::new(Config::new(), Vec::new());
        task.set_state(TaskState::Cancelled);
        let promise = Promise::whole(task);
        assert!(promise.resolve().await.is_err());
    }

    #[tokio::test]
    async fn await_inputs_replaces_embedded_task_with_its_outputs() {
        let mut config = Config::new();
        let upstream = Task::new(Config::new(), Vec::new());
        upstream.set_in_out_files(Vec::new(), vec![PathBuf::from("/build/a.h")]);
        upstream.set_state(TaskState::Finished);
        config.insert("in_header", Variant::Task(upstream));
        let downstream = Task::new(config, Vec::new());
        downstream.await_inputs().await.unwrap();
        let resolved = downstream.get_field("in_header").unwrap();
        assert_eq!(resolved.display_value(), "/build/a.h");
    }

    fn fresh_claimed() -> ClaimedOutputs {
        Mutex::new(HashSet::new())
    }

    #[test]
    fn task_init_rejects_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config.insert("build_dir", Variant::from(dir.path().join("build")));
        config.insert("in_src", Variant::str("a.cpp"));
        config.insert("out_obj", Variant::str("a.o"));
        let task = Task::new(config, Vec::new());
        let err = task_init(&task, &fresh_claimed(), false).unwrap_err();
        assert!(matches!(err, KilnError::NotFound { .. }));
    }

    #[test]
    fn task_init_resolves_relative_in_and_out_against_task_dir_and_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// src").unwrap();
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config.insert("build_dir", Variant::from(dir.path().join("build")));
        config.insert("in_src", Variant::str("a.cpp"));
        config.insert("out_obj", Variant::str("a.o"));
        let task = Task::new(config, Vec::new());
        task_init(&task, &fresh_claimed(), false).unwrap();
        assert_eq!(task.in_files(), vec![dir.path().join("a.cpp")]);
        assert_eq!(task.out_files(), vec![dir.path().join("build").join("a.o")]);
        assert!(dir.path().join("build").is_dir());
    }

    #[test]
    fn task_init_rejects_duplicate_output_across_tasks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// src").unwrap();
        let claimed = fresh_claimed();

        let mut config_a = Config::new();
        config_a.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config_a.insert("build_dir", Variant::from(dir.path().join("build")));
        config_a.insert("in_src", Variant::str("a.cpp"));
        config_a.insert("out_obj", Variant::str("a.o"));
        let task_a = Task::new(config_a, Vec::new());
        task_init(&task_a, &claimed, false).unwrap();

        let mut config_b = Config::new();
        config_b.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config_b.insert("build_dir", Variant::from(dir.path().join("build")));
        config_b.insert("in_src", Variant::str("a.cpp"));
        config_b.insert("out_obj", Variant::str("a.o"));
        let task_b = Task::new(config_b, Vec::new());
        let err = task_init(&task_b, &claimed, false).unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));
    }

    #[test]
    fn task_init_rebases_absolute_task_dir_output_under_build_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// src").unwrap();
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config.insert("build_dir", Variant::from(dir.path().join("build")));
        config.insert("in_src", Variant::str("a.cpp"));
        // Absolute path under task_dir, not build_dir — must be rebased.
        config.insert(
            "out_obj",
            Variant::from(dir.path().join("a.o")),
        );
        let task = Task::new(config, Vec::new());
        task_init(&task, &fresh_claimed(), false).unwrap();
        assert_eq!(task.out_files(), vec![dir.path().join("build").join("a.o")]);
    }

    #[test]
    fn task_init_rejects_absolute_output_outside_build_and_task_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// src").unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config.insert("build_dir", Variant::from(dir.path().join("build")));
        config.insert("in_src", Variant::str("a.cpp"));
        config.insert("out_obj", Variant::from(elsewhere.path().join("a.o")));
        let task = Task::new(config, Vec::new());
        let err = task_init(&task, &fresh_claimed(), false).unwrap_err();
        assert!(matches!(err, KilnError::Config(_)));
    }

    #[test]
    fn task_init_dry_run_does_not_create_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// src").unwrap();
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config.insert("build_dir", Variant::from(dir.path().join("build")));
        config.insert("in_src", Variant::str("a.cpp"));
        config.insert("out_obj", Variant::str("a.o"));
        let task = Task::new(config, Vec::new());
        task_init(&task, &fresh_claimed(), true).unwrap();
        assert!(!dir.path().join("build").exists());
    }

    #[test]
    fn task_init_in_depfile_only_counted_as_input_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// src").unwrap();
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config.insert("build_dir", Variant::from(dir.path().join("build")));
        config.insert("in_src", Variant::str("a.cpp"));
        config.insert("out_obj", Variant::str("a.o"));
        config.insert("in_depfile", Variant::str("a.d"));
        let task = Task::new(config, Vec::new());
        task_init(&task, &fresh_claimed(), false).unwrap();
        // a.d does not exist on disk, so it is resolved (under build_dir) but
        // not added to in_files.
        assert_eq!(task.in_files(), vec![dir.path().join("a.cpp")]);
    }

    #[test]
    fn task_init_expands_desc_and_command() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// src").unwrap();
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        config.insert("build_dir", Variant::from(dir.path().join("build")));
        config.insert("in_src", Variant::str("a.cpp"));
        config.insert("out_obj", Variant::str("a.o"));
        config.insert("name", Variant::str("compile"));
        config.insert("desc", Variant::str("building {name}"));
        config.insert("command", Variant::str("cc -c {in_src} -o {out_obj}"));
        let task = Task::new(config, Vec::new());
        task_init(&task, &fresh_claimed(), false).unwrap();
        let desc = task.get_field("desc").unwrap();
        assert_eq!(desc.display_value(), "building compile");
    }
}
