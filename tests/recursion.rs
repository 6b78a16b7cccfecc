//! Scenario 3 (spec §8): a field whose expansion refers back to itself
//! exceeds the recursion bound and breaks the task, rather than hanging or
//! panicking.

mod support;

use std::sync::Arc;

use kiln::engine::exit_code;
use kiln::script_context::{self, ScriptApi};
use kiln::variant::{Config, Variant};

#[tokio::test]
async fn self_referential_template_breaks_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let engine = support::engine_in(dir.path());
    let dir_path = dir.path().to_path_buf();

    let script: script_context::ScriptFn = Arc::new(move |api: &ScriptApi<'_>| {
        let mut config = Config::new();
        config.insert("task_dir", Variant::from(dir_path.clone()));
        config.insert("build_dir", Variant::from(dir_path.join("build")));
        config.insert("x", Variant::str("{x}"));
        config.insert("command", Variant::str("{x}"));
        api.task(&[config]);
        Ok(Config::new())
    });

    let root_path = dir.path().join("build.kiln");
    script_context::load_root(&engine, &root_path, script).unwrap();

    engine.queue_initial();
    let summary = engine.run().await;

    assert_eq!(summary.broken, 1);
    assert_ne!(exit_code(&summary), 0);
}
