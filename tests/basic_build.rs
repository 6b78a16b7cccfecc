//! Scenario 1 (spec §8): a two-compile, one-link "map/reduce" build runs
//! both compiles before linking and finishes green.

mod support;

use std::path::Path;
use std::sync::Arc;

use kiln::engine::exit_code;
use kiln::script_context::{self, ScriptApi};
use kiln::variant::{Config, Variant};

fn root_script(dir: &Path) -> script_context::ScriptFn {
    let dir = dir.to_path_buf();
    Arc::new(move |api: &ScriptApi<'_>| {
        let build_dir = dir.join("build");
        let mut base = Config::new();
        base.insert("task_dir", Variant::from(dir.clone()));
        base.insert("build_dir", Variant::from(build_dir.clone()));

        let mut compile_a = base.clone();
        compile_a.insert("in_src", Variant::str("a.cpp"));
        compile_a.insert("out_obj", Variant::str("a.o"));
        compile_a.insert("command", Variant::str("cp {in_src} {out_obj}"));
        let task_a = api.task(&[compile_a]);

        let mut compile_b = base.clone();
        compile_b.insert("in_src", Variant::str("b.cpp"));
        compile_b.insert("out_obj", Variant::str("b.o"));
        compile_b.insert("command", Variant::str("cp {in_src} {out_obj}"));
        let task_b = api.task(&[compile_b]);

        let mut link = base.clone();
        link.insert(
            "in_objs",
            Variant::Seq(vec![Variant::Task(task_a.clone()), Variant::Task(task_b.clone())]),
        );
        link.insert("out_bin", Variant::str("prog"));
        link.insert("command", Variant::str("cat {in_objs} > {out_bin}"));
        api.task(&[link]);

        Ok(Config::new())
    })
}

#[tokio::test]
async fn basic_map_reduce_build_links_after_both_compiles() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.cpp"), b"// a").unwrap();
    std::fs::write(dir.path().join("b.cpp"), b"// b").unwrap();

    let engine = support::engine_in(dir.path());
    let root_path = dir.path().join("build.kiln");
    script_context::load_root(&engine, &root_path, root_script(dir.path())).unwrap();

    engine.queue_initial();
    let summary = engine.run().await;

    assert_eq!(summary.finished, 3);
    assert_eq!(exit_code(&summary), 0);
    assert!(dir.path().join("build").join("prog").exists());
}
