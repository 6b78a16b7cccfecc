//! `Engine`: the process-wide bookkeeping the original keeps in a global
//! singleton, re-architected as an explicit value threaded through the API
//! (spec §9 "Global engine state"). Scripts receive a `&Engine` (via
//! [`crate::script_context::ScriptApi`]) rather than reaching for ambient
//! state, the way the teacher's `GlobalIndex` is passed by reference into
//! `ConfigLoader`/`ConfigResolver` rather than read from a `lazy_static`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use regex::Regex;

use crate::job_pool::JobPool;
use crate::scheduler::{BuildSummary, CancellationSignal, Scheduler};
use crate::task::{ClaimedOutputs, Task};
use crate::variant::Config;

/// The engine's configuration knobs (spec §6 CLI surface, populated by
/// [`crate::cli::RunOptions`] or directly by an embedder/test).
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub root_file: PathBuf,
    pub root_dir: PathBuf,
    pub verbosity: u8,
    pub debug: bool,
    pub force: bool,
    pub trace: bool,
    pub jobs: usize,
    pub quiet: bool,
    pub dry_run: bool,
    pub shuffle: bool,
    pub tool: Option<String>,
    pub keep_going: usize,
    pub target: Option<String>,
    /// mtime the rerun oracle compares outputs against to detect "the
    /// engine itself changed" (spec §4.D step 5). Defaults to the current
    /// build's start time when not overridden, which is deliberately
    /// conservative: it never forces a rerun on its own unless the caller
    /// supplies the engine binary's real mtime.
    pub engine_mtime: SystemTime,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            root_file: PathBuf::from("build.kiln"),
            root_dir: PathBuf::from("."),
            verbosity: 0,
            debug: false,
            force: false,
            trace: false,
            jobs: default_job_count(),
            quiet: false,
            dry_run: false,
            shuffle: false,
            tool: None,
            keep_going: 0,
            target: None,
            engine_mtime: SystemTime::UNIX_EPOCH,
        }
    }
}

#[must_use]
pub fn default_job_count() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Owns the Job Pool, the claimed-output set, the cancellation signal, the
/// scheduler's lists, and the running log of loaded script files — every
/// piece of shared state spec §5 says is "accessed only by the driver task
/// or by awaiters resuming on the driver".
pub struct Engine {
    pub options: EngineOptions,
    pub job_pool: JobPool,
    pub claimed_outputs: ClaimedOutputs,
    pub cancellation: CancellationSignal,
    scheduler: Scheduler,
    all_tasks: Mutex<Vec<Arc<Task>>>,
    loaded_scripts: Mutex<Vec<PathBuf>>,
    loaded_repo_paths: Mutex<HashSet<PathBuf>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("jobs", &self.job_pool.capacity())
            .field("dry_run", &self.options.dry_run)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn new(options: EngineOptions) -> Arc<Self> {
        let jobs = options.jobs.max(1);
        Arc::new(Self {
            job_pool: JobPool::new(jobs),
            claimed_outputs: Mutex::new(HashSet::new()),
            cancellation: CancellationSignal::new(),
            scheduler: Scheduler::new(),
            all_tasks: Mutex::new(Vec::new()),
            loaded_scripts: Mutex::new(Vec::new()),
            loaded_repo_paths: Mutex::new(HashSet::new()),
            options,
        })
    }

    /// Records that `path` has been loaded (spec §4.G), so later tasks'
    /// `loaded_scripts` snapshot includes it and the rerun oracle's step 7
    /// can see that a build script itself changed.
    pub fn record_loaded_script(&self, path: PathBuf) {
        let mut scripts = self.loaded_scripts.lock().unwrap_or_else(PoisonError::into_inner);
        if !scripts.contains(&path) {
            log::debug!("loaded build script {}", path.display());
            scripts.push(path);
        }
    }

    #[must_use]
    pub fn loaded_scripts_snapshot(&self) -> Vec<PathBuf> {
        self.loaded_scripts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns `true` the first time `canonical` is seen, `false` on every
    /// subsequent call — the dedup rule for repo-root script loading (spec
    /// §4.G "deduplicated by real filesystem path").
    pub fn claim_repo_path(&self, canonical: &std::path::Path) -> bool {
        self.loaded_repo_paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(canonical.to_path_buf())
    }

    /// Creates a Task from zero or more Configs merged in order (spec §6
    /// "Create a Task"), snapshotting the current loaded-scripts list onto
    /// it (spec §3 Task field, used by rerun oracle step 7).
    #[must_use]
    pub fn create_task(&self, configs: &[Config]) -> Arc<Task> {
        let merged = Config::merge_all(configs);
        let task = Task::new(merged, self.loaded_scripts_snapshot());
        self.all_tasks.lock().unwrap_or_else(PoisonError::into_inner).push(task.clone());
        task
    }

    /// Queues a single task (and transitively, everything it embeds).
    pub fn queue(&self, task: &Arc<Task>) {
        self.scheduler.queue_task(task);
    }

    /// Queues the initial working set (spec §4.F "Target selection"): every
    /// created task if no target filter was given, or only the tasks whose
    /// `name` field matches the filter regex — each such task still
    /// transitively queues its own dependencies once it is queued.
    pub fn queue_initial(&self) {
        let all = self.all_tasks.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match &self.options.target {
            Some(pattern) => {
                let re = Regex::new(pattern).unwrap_or_else(|err| {
                    log::warn!("invalid target pattern '{pattern}': {err}; matching everything");
                    Regex::new(".*").expect("'.*' is always a valid regex")
                });
                for task in &all {
                    let name = task
                        .config_snapshot()
                        .get_str("name")
                        .unwrap_or_default()
                        .to_string();
                    if re.is_match(&name) {
                        self.scheduler.queue_task(task);
                    }
                }
            }
            None => {
                for task in &all {
                    self.scheduler.queue_task(task);
                }
            }
        }
    }

    /// Runs the scheduler to completion (spec §4.F main loop).
    pub async fn run(self: &Arc<Self>) -> BuildSummary {
        self.scheduler.run(self.clone()).await
    }

    #[must_use]
    pub fn finished_tasks(&self) -> Vec<Arc<Task>> {
        self.scheduler.finished_snapshot()
    }
}

/// Process exit code rule (spec §6): 0 unless some task is FAILED or
/// BROKEN.
#[must_use]
pub fn exit_code(summary: &BuildSummary) -> i32 {
    i32::from(!summary.exit_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::Variant;

    #[tokio::test]
    async fn basic_map_reduce_build_runs_link_after_both_compiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cpp"), b"// a").unwrap();
        std::fs::write(dir.path().join("b.cpp"), b"// b").unwrap();

        let engine = Engine::new(EngineOptions {
            root_dir: dir.path().to_path_buf(),
            ..EngineOptions::default()
        });

        let build_dir = dir.path().join("build");
        let mut base = Config::new();
        base.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        base.insert("build_dir", Variant::from(build_dir.clone()));

        let mut compile_a = base.clone();
        compile_a.insert("in_src", Variant::str("a.cpp"));
        compile_a.insert("out_obj", Variant::str("a.o"));
        compile_a.insert("command", Variant::str("cp {in_src} {out_obj}"));
        let task_a = engine.create_task(&[compile_a]);

        let mut compile_b = base.clone();
        compile_b.insert("in_src", Variant::str("b.cpp"));
        compile_b.insert("out_obj", Variant::str("b.o"));
        compile_b.insert("command", Variant::str("cp {in_src} {out_obj}"));
        let task_b = engine.create_task(&[compile_b]);

        let mut link = base.clone();
        link.insert(
            "in_objs",
            Variant::Seq(vec![Variant::Task(task_a.clone()), Variant::Task(task_b.clone())]),
        );
        link.insert("out_bin", Variant::str("prog"));
        link.insert("command", Variant::str("cat {in_objs} > {out_bin}"));
        let task_link = engine.create_task(&[link]);

        engine.queue(&task_link);
        let summary = engine.run().await;

        assert_eq!(summary.finished, 3);
        assert_eq!(exit_code(&summary), 0);
        assert!(build_dir.join("prog").exists());
    }

    #[tokio::test]
    async fn missing_input_cancels_downstream() {
        let dir = tempfile::tempdir().unwrap();
        // a.cpp is deliberately never created.

        let engine = Engine::new(EngineOptions {
            root_dir: dir.path().to_path_buf(),
            ..EngineOptions::default()
        });

        let mut base = Config::new();
        base.insert("task_dir", Variant::from(dir.path().to_path_buf()));
        base.insert("build_dir", Variant::from(dir.path().join("build")));

        let mut compile = base.clone();
        compile.insert("in_src", Variant::str("a.cpp"));
        compile.insert("out_obj", Variant::str("a.o"));
        compile.insert("command", Variant::str("cp {in_src} {out_obj}"));
        let task_compile = engine.create_task(&[compile]);

        let mut link = base.clone();
        link.insert("in_objs", Variant::Task(task_compile.clone()));
        link.insert("out_bin", Variant::str("prog"));
        link.insert("command", Variant::str("cat {in_objs} > {out_bin}"));
        let task_link = engine.create_task(&[link]);

        engine.queue(&task_link);
        let summary = engine.run().await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_ne!(exit_code(&summary), 0);
        assert!(!dir.path().join("build").join("prog").exists());
    }
}
