//! Compiler-emitted dependency file parsing (spec §6, used by
//! [`crate::rerun`] step 8).

use serde_json::Value;

use crate::error::KilnError;

/// Parses `content` according to `format` (`"gcc"` or `"msvc"`), returning
/// the listed secondary dependency paths verbatim (not yet resolved against
/// `task_dir` — that's the caller's job, per spec §4.D step 8).
pub fn parse(format: &str, content: &str) -> Result<Vec<String>, KilnError> {
    match format {
        "gcc" => Ok(parse_gcc(content)),
        "msvc" => parse_msvc(content),
        other => Err(KilnError::Config(format!(
            "unknown depfile format '{other}' (expected 'gcc' or 'msvc')"
        ))),
    }
}

/// `<target>: <dep1> <dep2> \\\n  <dep3>…` — whitespace-separated tokens,
/// the target (first token before the first unescaped `:`) dropped, and
/// line-continuation backslashes collapsed away before tokenizing.
fn parse_gcc(content: &str) -> Vec<String> {
    let joined = content.replace("\\\r\n", " ").replace("\\\n", " ");

    let mut deps = Vec::new();
    for (line_index, line) in joined.lines().enumerate() {
        let rest = if line_index == 0 {
            match line.split_once(':') {
                Some((_target, rest)) => rest,
                None => line,
            }
        } else {
            line
        };
        for token in rest.split_whitespace() {
            deps.push(token.to_string());
        }
    }
    deps
}

/// MSVC `/sourceDependencies` JSON: dependencies live at `Data.Includes`.
fn parse_msvc(content: &str) -> Result<Vec<String>, KilnError> {
    let root: Value = serde_json::from_str(content)
        .map_err(|e| KilnError::Config(format!("invalid msvc depfile JSON: {e}")))?;
    let includes = root
        .get("Data")
        .and_then(|d| d.get("Includes"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            KilnError::Config("msvc depfile missing Data.Includes array".to_string())
        })?;
    includes
        .iter()
        .map(|v| {
            v.as_str()
                .map(ToString::to_string)
                .ok_or_else(|| KilnError::Config("Data.Includes entry is not a string".to_string()))
        })
        .collect()
}
