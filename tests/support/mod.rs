//! Shared helpers for the end-to-end scenario tests (spec §8). Lives under
//! `tests/support/mod.rs` rather than `tests/support.rs` so cargo treats it
//! as a shared module, not its own test binary.

use std::path::Path;
use std::sync::Arc;

use kiln::engine::{Engine, EngineOptions};

#[must_use]
pub fn engine_in(dir: &Path) -> Arc<Engine> {
    Engine::new(EngineOptions {
        root_dir: dir.to_path_buf(),
        ..EngineOptions::default()
    })
}

#[must_use]
pub fn engine_with_keep_going(dir: &Path, keep_going: usize) -> Arc<Engine> {
    Engine::new(EngineOptions {
        root_dir: dir.to_path_buf(),
        keep_going,
        ..EngineOptions::default()
    })
}
