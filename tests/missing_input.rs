//! Scenario 2 (spec §8): a missing declared input fails the task at
//! TASK_INIT and cancels everything downstream of it.

mod support;

use std::sync::Arc;

use kiln::engine::exit_code;
use kiln::script_context::{self, ScriptApi};
use kiln::variant::{Config, Variant};

#[tokio::test]
async fn missing_input_fails_compile_and_cancels_link() {
    let dir = tempfile::tempdir().unwrap();
    // a.cpp is deliberately never created.

    let engine = support::engine_in(dir.path());
    let dir_path = dir.path().to_path_buf();

    let script: script_context::ScriptFn = Arc::new(move |api: &ScriptApi<'_>| {
        let mut base = Config::new();
        base.insert("task_dir", Variant::from(dir_path.clone()));
        base.insert("build_dir", Variant::from(dir_path.join("build")));

        let mut compile = base.clone();
        compile.insert("in_src", Variant::str("a.cpp"));
        compile.insert("out_obj", Variant::str("a.o"));
        compile.insert("command", Variant::str("cp {in_src} {out_obj}"));
        let task_compile = api.task(&[compile]);

        let mut link = base.clone();
        link.insert("in_objs", Variant::Task(task_compile));
        link.insert("out_bin", Variant::str("prog"));
        link.insert("command", Variant::str("cat {in_objs} > {out_bin}"));
        api.task(&[link]);

        Ok(Config::new())
    });

    let root_path = dir.path().join("build.kiln");
    script_context::load_root(&engine, &root_path, script).unwrap();

    engine.queue_initial();
    let summary = engine.run().await;

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.cancelled, 1);
    assert_ne!(exit_code(&summary), 0);
    assert!(!dir.path().join("build").join("prog").exists());
}
