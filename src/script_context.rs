//! Script Context (spec §4.G): cycle-deduplicated loading of the user build
//! scripts that instantiate tasks.
//!
//! The script-loading *front end* — reading a `build.kiln` file off disk and
//! parsing it into executable instructions — is named in spec §1 as an
//! out-of-scope external collaborator. What belongs here is everything the
//! spec actually describes: the dedup-by-canonical-path rule for repo
//! roots, the inherited-vs-fresh Config distinction between `module` and
//! `repo`, and the per-script working-directory change. A "script" is
//! therefore modeled as a plain Rust closure (`ScriptFn`) that receives a
//! [`ScriptApi`] — the same shape a real front end would hand to a parsed
//! script's generated code, the way the teacher's `handlers::run::handle`
//! receives a resolved [`crate::variant::Config`]-like context rather than
//! re-parsing anything itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::engine::Engine;
use crate::task::Task;
use crate::variant::Config;

/// What a build script returns to its caller: the non-underscore,
/// non-import bindings it defined, exposed as a Config (spec §4.G "After
/// execution... returned as a Config to the caller").
pub type ScriptResult = anyhow::Result<Config>;

/// A build script, modeled as a closure rather than parsed text (see the
/// module doc comment) — `Fn`, not `FnOnce`, since a `repo()` load may be
/// attempted more than once before the dedup check short-circuits it.
pub type ScriptFn = Arc<dyn Fn(&ScriptApi<'_>) -> ScriptResult + Send + Sync>;

/// The API surface a running script sees (spec §6 "Script API surface").
pub struct ScriptApi<'a> {
    engine: &'a Engine,
    inherited: Config,
    script_path: PathBuf,
}

impl<'a> ScriptApi<'a> {
    /// The Config this script inherited from its caller — empty for a
    /// `repo()` load, the caller's bindings for a `module()` load.
    #[must_use]
    pub fn context(&self) -> &Config {
        &self.inherited
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        self.engine
    }

    #[must_use]
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Creates a Task from zero or more Configs merged in order, layered on
    /// top of this script's inherited context (spec §6 "Create a Task").
    /// The returned Task is not queued — queueing happens once, after every
    /// script has finished running, via [`Engine::queue_initial`].
    pub fn task(&self, configs: &[Config]) -> Arc<Task> {
        let mut layers = Vec::with_capacity(configs.len() + 1);
        layers.push(self.inherited.clone());
        layers.extend(configs.iter().cloned());
        self.engine.create_task(&layers)
    }

    /// Loads a submodule script relative to this one's directory, inheriting
    /// the current Config (spec §4.G "module"). Since a script here is a
    /// plain closure rather than parsed source the interpreter can track
    /// incrementally, "the current Config" is whatever bindings the calling
    /// script has built up by the time it calls `module` — it passes that
    /// explicitly as `current`, layered on top of what it itself inherited.
    ///
    /// # Errors
    ///
    /// Propagates whatever `script` itself returns, and any failure to
    /// change into the submodule's directory.
    pub fn module(&self, relative: impl AsRef<Path>, current: &Config, script: ScriptFn) -> ScriptResult {
        let path = self.resolve_sibling(relative.as_ref());
        let inherited = self.inherited.merge(current);
        run_script(self.engine, &path, inherited, &script)
    }

    /// Loads a repository root script relative to this one's directory,
    /// starting a fresh Config root, deduplicated by canonical filesystem
    /// path (spec §4.G "repo"): a diamond import returns an empty Config
    /// the second and subsequent time, without re-running the script or
    /// re-instantiating its tasks.
    ///
    /// # Errors
    ///
    /// Propagates whatever `script` itself returns.
    pub fn repo(&self, relative: impl AsRef<Path>, script: ScriptFn) -> ScriptResult {
        let path = self.resolve_sibling(relative.as_ref());
        load_repo_at(self.engine, &path, script)
    }

    fn resolve_sibling(&self, relative: &Path) -> PathBuf {
        let dir = self.script_path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(relative)
    }
}

fn canonical_or_self(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn load_repo_at(engine: &Engine, path: &Path, script: ScriptFn) -> ScriptResult {
    let canonical = canonical_or_self(path);
    if !engine.claim_repo_path(&canonical) {
        log::debug!(
            "repo script {} already loaded; skipping diamond import",
            canonical.display()
        );
        return Ok(Config::new());
    }
    run_script(engine, path, Config::new(), &script)
}

/// The entry point a binary (or a test) uses to load the very first build
/// script. Equivalent to a `repo()` load with no parent script, so the root
/// itself participates in the same dedup set as any `repo()` it transitively
/// loads.
///
/// # Errors
///
/// Propagates whatever `script` itself returns.
pub fn load_root(engine: &Engine, path: &Path, script: ScriptFn) -> ScriptResult {
    load_repo_at(engine, path, script)
}

/// Runs `script` with the working directory set to its own directory for
/// the duration of the call (spec §4.G), restoring the previous directory
/// afterward regardless of outcome.
fn run_script(engine: &Engine, path: &Path, inherited: Config, script: &ScriptFn) -> ScriptResult {
    engine.record_loaded_script(path.to_path_buf());
    let script_dir = path
        .parent()
        .map(Path::to_path_buf)
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from("."));

    let previous_cwd = std::env::current_dir()?;
    std::env::set_current_dir(&script_dir)?;
    let api = ScriptApi {
        engine,
        inherited,
        script_path: path.to_path_buf(),
    };
    let result = script(&api);
    std::env::set_current_dir(&previous_cwd)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;
    use crate::variant::Variant;
    use std::sync::Mutex;

    #[test]
    fn repo_is_loaded_only_once_for_a_diamond_import() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineOptions {
            root_dir: dir.path().to_path_buf(),
            ..EngineOptions::default()
        });

        let call_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = call_count.clone();
        let script: ScriptFn = Arc::new(move |_api| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Config::new())
        });

        let path = dir.path().join("shared.kiln");
        load_root(&engine, &path, script.clone()).unwrap();
        load_root(&engine, &path, script).unwrap();

        assert_eq!(call_count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn module_inherits_the_callers_context() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineOptions {
            root_dir: dir.path().to_path_buf(),
            ..EngineOptions::default()
        });

        let seen_greeting = Arc::new(Mutex::new(String::new()));
        let seen = seen_greeting.clone();
        let path = dir.path().join("root.kiln");
        let result = load_root(
            &engine,
            &path,
            Arc::new(move |api: &ScriptApi<'_>| {
                let mut ctx = Config::new();
                ctx.insert("greeting", Variant::str("hi"));
                let seen = seen.clone();
                api.module(
                    "child.kiln",
                    &ctx,
                    Arc::new(move |child_api: &ScriptApi<'_>| {
                        let greeting = child_api.context().get_str("greeting").map(str::to_string);
                        *seen.lock().unwrap() = greeting.clone().unwrap_or_default();
                        Ok(Config::from_pairs([(
                            "seen",
                            Variant::str(greeting.unwrap_or_default()),
                        )]))
                    }),
                )
            }),
        );

        assert!(result.is_ok());
        assert_eq!(*seen_greeting.lock().unwrap(), "hi");
    }

    #[test]
    fn script_runs_with_cwd_set_to_its_own_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let engine = Engine::new(EngineOptions {
            root_dir: dir.path().to_path_buf(),
            ..EngineOptions::default()
        });

        let path = sub.join("build.kiln");
        let observed_cwd = Arc::new(Mutex::new(PathBuf::new()));
        let observed = observed_cwd.clone();
        load_root(
            &engine,
            &path,
            Arc::new(move |_api| {
                *observed.lock().unwrap() = std::env::current_dir().unwrap();
                Ok(Config::new())
            }),
        )
        .unwrap();

        let seen = observed_cwd.lock().unwrap().clone();
        assert_eq!(seen.canonicalize().unwrap(), sub.canonicalize().unwrap());
    }
}
