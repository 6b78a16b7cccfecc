//! The Rerun Oracle (spec §4.D): decides whether a task's command phase
//! needs to run again, or can be skipped as already up to date.
//!
//! Grounded directly in the original `needs_rerun()` check order — a
//! straight-line series of early-exit staleness tests, cheapest and most
//! decisive first, falling through to the depfile-driven transitive check
//! last. Every mtime comparison is `>=`, not `>`: a dependency stamped at
//! exactly the same instant as its output still forces a rerun (spec §4.D).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::depfile;
use crate::error::KilnError;

/// Inputs the oracle needs about one task; kept separate from [`crate::task::Task`]
/// so the decision function stays a pure, independently testable unit.
pub struct RerunInputs<'a> {
    pub force: bool,
    pub in_files: &'a [PathBuf],
    pub out_files: &'a [PathBuf],
    pub loaded_scripts: &'a [PathBuf],
    pub engine_mtime: SystemTime,
    pub in_depfile: Option<&'a Path>,
    pub depformat: &'a str,
    pub task_dir: &'a Path,
}

/// Returns a non-empty, human-readable reason to rerun, or an empty string
/// if the task's outputs are already up to date (spec §4.D contract —
/// mirrors the original's "return a reason string, or `\"\"` to skip").
///
/// # Errors
///
/// Only the depfile step can fail: a declared `in_depfile` that exists on
/// disk but is unparsable under `depformat` is a configuration error, not a
/// staleness signal.
pub fn needs_rerun(inputs: &RerunInputs<'_>) -> Result<String, KilnError> {
    if inputs.force {
        return Ok("--force was set".to_string());
    }
    if inputs.in_files.is_empty() {
        return Ok("task has no listed inputs".to_string());
    }
    if inputs.out_files.is_empty() {
        return Ok("task has no listed outputs".to_string());
    }
    for out in inputs.out_files {
        if !out.exists() {
            return Ok(format!("output {} is missing", out.display()));
        }
    }

    let min_out = inputs
        .out_files
        .iter()
        .filter_map(|p| mtime(p))
        .min()
        .ok_or_else(|| {
            KilnError::Broken("every declared output exists but none has a readable mtime".to_string())
        })?;

    if inputs.engine_mtime >= min_out {
        return Ok(format!(
            "{} is newer than its outputs",
            crate::constants::ENGINE_SELF_LABEL
        ));
    }

    for input in inputs.in_files {
        if let Some(t) = mtime(input) {
            if t >= min_out {
                return Ok(format!("input {} is newer than its outputs", input.display()));
            }
        }
    }

    for script in inputs.loaded_scripts {
        if let Some(t) = mtime(script) {
            if t >= min_out {
                return Ok(format!(
                    "build script {} changed since the last run",
                    script.display()
                ));
            }
        }
    }

    if let Some(depfile_path) = inputs.in_depfile {
        if depfile_path.exists() {
            let content = std::fs::read_to_string(depfile_path)?;
            let deps = depfile::parse(inputs.depformat, &content)?;
            for dep in deps {
                let resolved = inputs.task_dir.join(&dep);
                if let Some(t) = mtime(&resolved) {
                    if t >= min_out {
                        return Ok(format!(
                            "depfile dependency {} is newer than its outputs",
                            resolved.display()
                        ));
                    }
                }
            }
        }
    }

    Ok(String::new())
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn touch(path: &Path, offset: Duration) {
        fs::write(path, b"x").unwrap();
        let stamp = filetime::FileTime::from_system_time(SystemTime::now() - offset);
        filetime::set_file_mtime(path, stamp).unwrap();
    }

    #[test]
    fn force_always_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = RerunInputs {
            force: true,
            in_files: &[],
            out_files: &[],
            loaded_scripts: &[],
            engine_mtime: SystemTime::UNIX_EPOCH,
            in_depfile: None,
            depformat: "gcc",
            task_dir: dir.path(),
        };
        assert!(!needs_rerun(&inputs).unwrap().is_empty());
    }

    #[test]
    fn missing_output_forces_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.cpp");
        touch(&input, Duration::from_secs(10));
        let in_files = vec![input];
        let out_files = vec![dir.path().join("a.o")];
        let inputs = RerunInputs {
            force: false,
            in_files: &in_files,
            out_files: &out_files,
            loaded_scripts: &[],
            engine_mtime: SystemTime::UNIX_EPOCH,
            in_depfile: None,
            depformat: "gcc",
            task_dir: dir.path(),
        };
        let reason = needs_rerun(&inputs).unwrap();
        assert!(reason.contains("missing"));
    }

    #[test]
    fn newer_output_than_input_skips() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.cpp");
        let output = dir.path().join("a.o");
        touch(&input, Duration::from_secs(20));
        touch(&output, Duration::from_secs(10));
        let in_files = vec![input];
        let out_files = vec![output];
        let inputs = RerunInputs {
            force: false,
            in_files: &in_files,
            out_files: &out_files,
            loaded_scripts: &[],
            engine_mtime: SystemTime::UNIX_EPOCH,
            in_depfile: None,
            depformat: "gcc",
            task_dir: dir.path(),
        };
        assert_eq!(needs_rerun(&inputs).unwrap(), "");
    }

    #[test]
    fn newer_input_than_output_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.cpp");
        let output = dir.path().join("a.o");
        touch(&output, Duration::from_secs(20));
        touch(&input, Duration::from_secs(10));
        let in_files = vec![input];
        let out_files = vec![output];
        let inputs = RerunInputs {
            force: false,
            in_files: &in_files,
            out_files: &out_files,
            loaded_scripts: &[],
            engine_mtime: SystemTime::UNIX_EPOCH,
            in_depfile: None,
            depformat: "gcc",
            task_dir: dir.path(),
        };
        let reason = needs_rerun(&inputs).unwrap();
        assert!(reason.contains("newer"));
    }

    #[test]
    fn stale_depfile_dependency_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.cpp");
        let output = dir.path().join("a.o");
        let header = dir.path().join("a.h");
        let depfile_path = dir.path().join("a.d");
        touch(&input, Duration::from_secs(30));
        touch(&output, Duration::from_secs(20));
        touch(&header, Duration::from_secs(5));
        fs::write(&depfile_path, "a.o: a.cpp a.h\n").unwrap();
        let in_files = vec![input];
        let out_files = vec![output];
        let inputs = RerunInputs {
            force: false,
            in_files: &in_files,
            out_files: &out_files,
            loaded_scripts: &[],
            engine_mtime: SystemTime::UNIX_EPOCH,
            in_depfile: Some(&depfile_path),
            depformat: "gcc",
            task_dir: dir.path(),
        };
        let reason = needs_rerun(&inputs).unwrap();
        assert!(reason.contains("depfile"));
    }
}
