//! The `kiln` binary: thin CLI wiring around the library, the way the
//! teacher's `bin/axes.rs` stays a dispatcher around `axes::core`.
//!
//! Reading and parsing a `build.kiln` script off disk is an out-of-scope
//! external collaborator (spec §1) — this binary wires the pieces that
//! *are* in scope (CLI parsing, logging, the engine, the scheduler) and
//! says so plainly when no script-loading front end is registered, rather
//! than silently doing nothing. Embedders drive a real build by calling
//! [`kiln::script_context::load_root`] directly with their own
//! [`kiln::script_context::ScriptFn`], the way the integration tests under
//! `tests/` do.

use clap::Parser;
use colored::Colorize;

use kiln::cli::Cli;
use kiln::engine::Engine;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    kiln::logging::init(&cli);
    log::debug!("parsed CLI arguments: {cli:?}");

    if let Some(tool) = &cli.tool {
        eprintln!(
            "{}",
            format!("tool '{tool}' requested, but no maintenance tools are registered in this binary").yellow()
        );
        std::process::exit(2);
    }

    let root_path = cli.root_dir.join(&cli.root_file);
    let options = cli.into_engine_options();
    let _engine = Engine::new(options);

    eprintln!(
        "{}",
        format!(
            "kiln's engine is wired up, but this binary has no script-loading front end to read \
             '{}' — that collaborator is out of scope for the core engine. Call \
             `kiln::script_context::load_root` with your own script closure to drive a build.",
            root_path.display()
        )
        .yellow()
    );
    std::process::exit(2);
}
