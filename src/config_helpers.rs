//! The pure helper functions a macro body can call as pseudo-attributes of
//! the context `Config` (spec §3, §4.A, §6).
//!
//! These are plain, synchronous functions — none of them touch a `Task` or
//! `Promise`, so [`crate::expander::Expander`] can call [`dispatch`] directly
//! while evaluating a macro body, with no suspension point involved. This
//! mirrors the teacher's own split between `core/compiler.rs`'s token
//! evaluation (synchronous) and `core/interpolator.rs`'s `<axes::run(...)>`
//! handling (also synchronous — it shells out and blocks, exactly like
//! [`run_cmd`] below).

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use colored::Colorize;
use regex::Regex;

use crate::error::KilnError;
use crate::variant::{Config, Variant};

/// Dispatches a helper call named in a macro body. `ctx` supplies the base
/// directory for path-relative helpers (`task_dir`, falling back to the
/// current directory when absent — e.g. while a Script Context is still
/// loading a script and no Task exists yet).
pub fn dispatch(ctx: &Config, name: &str, args: &[Variant]) -> Result<Variant, KilnError> {
    match name {
        "abs_path" => abs_path(ctx, args),
        "rel_path" => rel_path(ctx, args),
        "join_path" => join_path(args),
        "join_prefix" => join_prefix(args),
        "join_suffix" => join_suffix(args),
        "flatten" => flatten(args),
        "glob" => glob_helper(ctx, args),
        "stem" => stem(args),
        "swap_ext" => swap_ext(args),
        "color" => color(args),
        "run_cmd" => run_cmd(ctx, args),
        "re" => re_match(args),
        "path" => path_helper(args),
        "log" => log_helper(args),
        "len" => len_helper(args),
        "print" => print_helper(args),
        other => Err(KilnError::Expansion(format!("unknown helper '{other}'"))),
    }
}

fn one_str(args: &[Variant], helper: &str) -> Result<&str, KilnError> {
    match args {
        [Variant::Str(s)] => Ok(s.as_str()),
        _ => Err(KilnError::Expansion(format!(
            "{helper}() expects exactly one string argument"
        ))),
    }
}

fn base_dir(ctx: &Config) -> PathBuf {
    ctx.get_str("task_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn abs_path(ctx: &Config, args: &[Variant]) -> Result<Variant, KilnError> {
    let s = one_str(args, "abs_path")?;
    let p = Path::new(s);
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir(ctx).join(p)
    };
    Ok(Variant::from(dunce::simplified(&abs).to_path_buf()))
}

fn rel_path(ctx: &Config, args: &[Variant]) -> Result<Variant, KilnError> {
    let s = one_str(args, "rel_path")?;
    Ok(Variant::from(ctx.rel(Path::new(s))))
}

fn join_path(args: &[Variant]) -> Result<Variant, KilnError> {
    if args.is_empty() {
        return Err(KilnError::Expansion(
            "join_path() requires at least one argument".to_string(),
        ));
    }
    let mut joined = PathBuf::new();
    for arg in args {
        let part = arg
            .as_str()
            .ok_or_else(|| KilnError::Expansion("join_path() arguments must be strings".into()))?;
        joined.push(part);
    }
    Ok(Variant::from(joined))
}

fn join_prefix(args: &[Variant]) -> Result<Variant, KilnError> {
    let [Variant::Str(prefix), Variant::Seq(items)] = args else {
        return Err(KilnError::Expansion(
            "join_prefix(prefix, list) expects a string and a sequence".to_string(),
        ));
    };
    let out = items
        .iter()
        .map(|item| Variant::str(format!("{prefix}{}", item.display_value())))
        .collect();
    Ok(Variant::Seq(out))
}

fn join_suffix(args: &[Variant]) -> Result<Variant, KilnError> {
    let [Variant::Seq(items), Variant::Str(suffix)] = args else {
        return Err(KilnError::Expansion(
            "join_suffix(list, suffix) expects a sequence and a string".to_string(),
        ));
    };
    let out = items
        .iter()
        .map(|item| Variant::str(format!("{}{suffix}", item.display_value())))
        .collect();
    Ok(Variant::Seq(out))
}

fn flatten(args: &[Variant]) -> Result<Variant, KilnError> {
    let [value] = args else {
        return Err(KilnError::Expansion(
            "flatten() expects exactly one argument".to_string(),
        ));
    };
    let mut out = Vec::new();
    value.flatten_to_strings(&mut out);
    Ok(Variant::Seq(out.into_iter().map(Variant::Str).collect()))
}

fn glob_helper(ctx: &Config, args: &[Variant]) -> Result<Variant, KilnError> {
    let pattern = one_str(args, "glob")?;
    let base = base_dir(ctx);
    let full_pattern = base.join(pattern);
    let pattern_str = full_pattern.to_string_lossy().into_owned();
    let entries = glob::glob(&pattern_str)
        .map_err(|e| KilnError::Expansion(format!("invalid glob pattern '{pattern}': {e}")))?;
    let mut matches = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| KilnError::Expansion(format!("glob error: {e}")))?;
        matches.push(Variant::from(path));
    }
    matches.sort_by(|a, b| a.display_value().cmp(&b.display_value()));
    Ok(Variant::Seq(matches))
}

fn stem(args: &[Variant]) -> Result<Variant, KilnError> {
    let s = one_str(args, "stem")?;
    let stem = Path::new(s)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Variant::str(stem))
}

fn swap_ext(args: &[Variant]) -> Result<Variant, KilnError> {
    let [Variant::Str(path), Variant::Str(new_ext)] = args else {
        return Err(KilnError::Expansion(
            "swap_ext(path, ext) expects two strings".to_string(),
        ));
    };
    let mut p = PathBuf::from(path);
    p.set_extension(new_ext.trim_start_matches('.'));
    Ok(Variant::from(p))
}

fn color(args: &[Variant]) -> Result<Variant, KilnError> {
    let [Variant::Str(name), Variant::Str(text)] = args else {
        return Err(KilnError::Expansion(
            "color(name, text) expects two strings".to_string(),
        ));
    };
    let styled = match name.as_str() {
        "red" => text.red().to_string(),
        "green" => text.green().to_string(),
        "yellow" => text.yellow().to_string(),
        "blue" => text.blue().to_string(),
        "cyan" => text.cyan().to_string(),
        "magenta" => text.magenta().to_string(),
        "bold" => text.bold().to_string(),
        "dim" => text.dimmed().to_string(),
        other => {
            return Err(KilnError::Expansion(format!("unknown color '{other}'")));
        }
    };
    Ok(Variant::str(styled))
}

/// Runs a shell command synchronously and substitutes its trimmed stdout
/// (supplemented feature C.2, grounded in the teacher's
/// `<axes::run(...)>` token).
fn run_cmd(ctx: &Config, args: &[Variant]) -> Result<Variant, KilnError> {
    let cmd_str = one_str(args, "run_cmd")?;
    let parts = shlex::split(cmd_str)
        .ok_or_else(|| KilnError::Expansion(format!("cannot parse command '{cmd_str}'")))?;
    let (program, rest) = parts
        .split_first()
        .ok_or_else(|| KilnError::Expansion("run_cmd() given an empty command".to_string()))?;
    let output = Command::new(program)
        .args(rest)
        .current_dir(base_dir(ctx))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| KilnError::Expansion(format!("run_cmd('{cmd_str}') failed to spawn: {e}")))?;
    if !output.status.success() {
        return Err(KilnError::Expansion(format!(
            "run_cmd('{cmd_str}') exited with {}",
            output.status
        )));
    }
    let stdout = String::from_utf8(output.stdout)
        .map_err(|e| KilnError::Expansion(format!("run_cmd('{cmd_str}') produced non-UTF8 output: {e}")))?;
    Ok(Variant::str(stdout.trim().to_string()))
}

/// `re(pattern, text)` — true if `pattern` matches anywhere in `text`. The
/// "regex object" named in spec §3 collapses to this single predicate form
/// since `Variant` has no dedicated regex tag; every observed use of the
/// helper in the original is a match test.
fn re_match(args: &[Variant]) -> Result<Variant, KilnError> {
    let [Variant::Str(pattern), Variant::Str(text)] = args else {
        return Err(KilnError::Expansion(
            "re(pattern, text) expects two strings".to_string(),
        ));
    };
    let re = Regex::new(pattern)
        .map_err(|e| KilnError::Expansion(format!("invalid regex '{pattern}': {e}")))?;
    Ok(Variant::Bool(re.is_match(text)))
}

fn path_helper(args: &[Variant]) -> Result<Variant, KilnError> {
    let s = one_str(args, "path")?;
    Ok(Variant::from(dunce::simplified(Path::new(s)).to_path_buf()))
}

fn log_helper(args: &[Variant]) -> Result<Variant, KilnError> {
    let [value] = args else {
        return Err(KilnError::Expansion(
            "log() expects exactly one argument".to_string(),
        ));
    };
    log::info!("{}", value.display_value());
    Ok(Variant::Null)
}

fn len_helper(args: &[Variant]) -> Result<Variant, KilnError> {
    let [value] = args else {
        return Err(KilnError::Expansion(
            "len() expects exactly one argument".to_string(),
        ));
    };
    let n = match value {
        Variant::Seq(items) => items.len(),
        Variant::Str(s) => s.chars().count(),
        Variant::Null => 0,
        other => {
            return Err(KilnError::Expansion(format!(
                "len() not supported for {other:?}"
            )));
        }
    };
    i64::try_from(n)
        .map(Variant::Int)
        .map_err(|_| KilnError::Expansion("len() overflowed i64".to_string()))
}

fn print_helper(args: &[Variant]) -> Result<Variant, KilnError> {
    let [value] = args else {
        return Err(KilnError::Expansion(
            "print() expects exactly one argument".to_string(),
        ));
    };
    let rendered = value.display_value();
    println!("{rendered}");
    Ok(Variant::str(rendered))
}
