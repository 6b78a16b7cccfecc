//! Command-line surface (spec §6), mirroring the teacher's `Cli` derive
//! (`examples/RetypeOS-axes/src/cli.rs`): one flat `clap::Parser` struct with
//! a doc comment per field, converted into the engine's own options type
//! rather than consumed directly by the engine.

use std::path::PathBuf;
use std::time::SystemTime;

use clap::Parser;

use crate::engine::{default_job_count, EngineOptions};

/// kiln — a general-purpose incremental build engine configured by
/// executable build scripts.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Regex matched against each declared task's `name` field; only
    /// matching tasks (and their transitive dependencies) are queued. When
    /// omitted, every task reachable from the root script is built.
    pub target: Option<String>,

    /// Path to the root build script, resolved relative to `root_dir`.
    #[arg(short = 'f', long = "root-file", default_value = "build.kiln")]
    pub root_file: PathBuf,

    /// Directory the build is rooted at; the engine changes into it before
    /// loading the root script.
    #[arg(short = 'C', long = "root-dir", default_value = ".")]
    pub root_dir: PathBuf,

    /// Increases log verbosity; repeatable (`-vv` for trace-level).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Enables debug-level diagnostics regardless of `-v`.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Forces every queued task to run its command phase, bypassing the
    /// rerun oracle.
    #[arg(long)]
    pub force: bool,

    /// Emits the resolved command line for each task as it runs, in
    /// addition to its `desc`.
    #[arg(long)]
    pub trace: bool,

    /// Job pool capacity; defaults to the detected parallelism.
    #[arg(short = 'j', long)]
    pub jobs: Option<usize>,

    /// Suppresses non-essential output; only warnings and errors are
    /// logged.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Runs the rerun oracle and reports what would run, without executing
    /// any command or creating output directories.
    #[arg(short = 'n', long = "dry-run")]
    pub dry_run: bool,

    /// Randomizes the initial queue order, to surface dependency bugs that
    /// a deterministic order would hide.
    #[arg(short = 's', long)]
    pub shuffle: bool,

    /// Runs a maintenance tool (e.g. a cleaner) instead of a build. Tools
    /// themselves are outside the core engine's scope.
    #[arg(short = 't', long)]
    pub tool: Option<String>,

    /// Number of task failures to tolerate before cancelling the rest of
    /// the build. `0` (the default) stops at the first failure.
    #[arg(short = 'k', long = "keep-going", default_value_t = 0)]
    pub keep_going: usize,
}

impl Cli {
    /// Converts the parsed arguments into [`EngineOptions`], stamping
    /// `engine_mtime` with the running `kiln` executable's own mtime (spec
    /// §4.D step 5 — "the engine's own source file's mtime"), not the
    /// current time: the CLI invocation's own start time is always newer
    /// than every prior build's outputs, which would force a full rebuild
    /// on every single run and defeat incrementality entirely. Falls back to
    /// `UNIX_EPOCH` (never forces a rerun on its own) if the executable's
    /// own metadata can't be read.
    #[must_use]
    pub fn into_engine_options(self) -> EngineOptions {
        EngineOptions {
            root_file: self.root_file,
            root_dir: self.root_dir,
            verbosity: self.verbose,
            debug: self.debug,
            force: self.force,
            trace: self.trace,
            jobs: self.jobs.unwrap_or_else(default_job_count),
            quiet: self.quiet,
            dry_run: self.dry_run,
            shuffle: self.shuffle,
            tool: self.tool,
            keep_going: self.keep_going,
            target: self.target,
            engine_mtime: current_executable_mtime(),
        }
    }
}

/// Reads the currently running `kiln` executable's own last-modified time —
/// the closest real-world analogue to "the build engine's own source file's
/// mtime" for a compiled binary rather than an interpreted script.
fn current_executable_mtime() -> SystemTime {
    std::env::current_exe()
        .and_then(|p| std::fs::metadata(p))
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
