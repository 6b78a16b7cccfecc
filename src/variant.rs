//! The universal value type and the `Config` store built on top of it
//! (spec §3, §4.A).
//!
//! `Variant` is a small tagged union rather than an open `dyn Any` — every
//! place that inspects one (the expander, the task-init normalizer, the
//! rerun oracle) matches on the tag directly, the way the teacher's
//! `TemplateComponent`/`CommandAction` enums are matched rather than
//! downcast.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use crate::task::{Promise, Task};

/// A boxed, `Send`-able future — used for the one genuinely dynamic corner
/// of `Variant`: user-supplied callables (spec §4.C command phase).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An opaque callable a build script can embed in a `command` list. Invoked
/// with the owning `Task` so it can read the task's resolved `in_files`/
/// `out_files` (spec §4.C: "If callable: invoke it with the Task as
/// argument").
pub type Callable = Arc<dyn Fn(Arc<Task>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The universal value. See spec §3.
#[derive(Clone)]
pub enum Variant {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Seq(Vec<Variant>),
    Map(Config),
    Task(Arc<Task>),
    Promise(Promise),
    Callable(Callable),
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Float(x) => write!(f, "Float({x})"),
            Self::Str(s) => write!(f, "Str({s:?})"),
            Self::Seq(items) => f.debug_list().entries(items).finish(),
            Self::Map(c) => write!(f, "{c:?}"),
            Self::Task(t) => write!(f, "Task({})", t.id()),
            Self::Promise(p) => write!(f, "Promise({}, {:?})", p.task.id(), p.fields),
            Self::Callable(_) => write!(f, "Callable(..)"),
        }
    }
}

impl Variant {
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True when this value (recursively) still contains a `Task` or
    /// `Promise` that hasn't been awaited yet. Used by the AWAITING_INPUTS
    /// walk (spec §4.C) to decide whether a field needs a suspension point.
    #[must_use]
    pub fn contains_awaitable(&self) -> bool {
        match self {
            Self::Task(_) | Self::Promise(_) => true,
            Self::Seq(items) => items.iter().any(Self::contains_awaitable),
            Self::Map(c) => c.entries.values().any(Self::contains_awaitable),
            _ => false,
        }
    }

    /// Best-effort path coercion, used when a `{…}` macro or an `in_`/`out_`
    /// field produces a bare string that must be treated as a filesystem
    /// path.
    #[must_use]
    pub fn as_path_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_seq(&self) -> Option<&[Variant]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&Config> {
        match self {
            Self::Map(c) => Some(c),
            _ => None,
        }
    }

    /// Recursively flattens into a list of plain path strings: a sequence is
    /// flattened element-wise, a scalar string becomes a single-element
    /// list, `Null` contributes nothing. Mirrors the `flatten` helper named
    /// in spec §6 and the `in_files`/`out_files` gathering step of TASK_INIT
    /// (spec §4.C step 6).
    pub fn flatten_to_strings(&self, out: &mut Vec<String>) {
        match self {
            Self::Null => {}
            Self::Str(s) => out.push(s.clone()),
            Self::Seq(items) => {
                for item in items {
                    item.flatten_to_strings(out);
                }
            }
            other => out.push(other.display_value()),
        }
    }

    /// Stringification used outside macro expansion (logging, `print()`,
    /// debug dumps): null becomes the empty string, sequences are
    /// space-joined, everything else uses its natural textual form. A
    /// `Task` renders as an opaque reference rather than its `out_files` —
    /// callers that need the spec §4.B macro-substitution rendering (a
    /// `Task` stringifying to its out files) go through
    /// [`crate::expander`]'s own `stringify` instead.
    #[must_use]
    pub fn display_value(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(x) => x.to_string(),
            Self::Str(s) => s.clone(),
            Self::Seq(items) => items
                .iter()
                .map(Self::display_value)
                .collect::<Vec<_>>()
                .join(" "),
            Self::Map(c) => c.display_value(),
            Self::Task(t) => format!("<task {}>", t.id()),
            Self::Promise(p) => format!("<promise {}>", p.task.id()),
            Self::Callable(_) => "<callable>".to_string(),
        }
    }
}

impl From<&str> for Variant {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Variant {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Variant {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<PathBuf> for Variant {
    fn from(p: PathBuf) -> Self {
        Self::Str(p.to_string_lossy().into_owned())
    }
}

/// A string-keyed mapping to `Variant`s, with structural merge semantics
/// (spec §3, §4.A). Key order carries no meaning, so a plain `HashMap`
/// (the teacher's own choice throughout `models.rs`) is the right backing
/// store — there is no ordering invariant to preserve.
#[derive(Clone, Default)]
pub struct Config {
    entries: HashMap<String, Variant>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Variant)>,
        K: Into<String>,
    {
        Self {
            entries: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Variant>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Lookup "by key" — the primal access idiom named in spec §3. "By
    /// name" is the same lookup from the macro evaluator's point of view
    /// (an identifier in a macro body resolves through this same map), so a
    /// single method backs both idioms.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Variant::as_str)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Variant)> {
        self.entries.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Structural merge (spec §3, §4.A). Left-biased for nulls, right-biased
    /// otherwise; nested `Map`s merge recursively, everything else is
    /// replaced wholesale (and, being an ordinary `Clone`, deep-copied —
    /// invariant 6).
    #[must_use]
    pub fn merge(&self, other: &Config) -> Config {
        let mut result = self.clone();
        for (key, right_value) in &other.entries {
            match result.entries.get(key) {
                None => {
                    result.entries.insert(key.clone(), right_value.clone());
                }
                Some(left_value) => {
                    if right_value.is_null() {
                        // Left-biased for nulls: keep the existing left value.
                        continue;
                    }
                    if let (Variant::Map(left_map), Variant::Map(right_map)) =
                        (left_value, right_value)
                    {
                        let merged = left_map.merge(right_map);
                        result.entries.insert(key.clone(), Variant::Map(merged));
                    } else {
                        result.entries.insert(key.clone(), right_value.clone());
                    }
                }
            }
        }
        result
    }

    /// Merges a sequence of configs in order, left to right, each one
    /// layered on top of the accumulated result. Used when a script
    /// instantiates a task from several config fragments (spec §6: "accepts
    /// zero or more Configs/mappings which are merged in order").
    #[must_use]
    pub fn merge_all<'a>(configs: impl IntoIterator<Item = &'a Config>) -> Config {
        configs
            .into_iter()
            .fold(Config::new(), |acc, next| acc.merge(next))
    }

    /// Returns `p` expressed relative to this config's resolved `task_dir`,
    /// falling back to `p` unchanged if `task_dir` is absent or not a plain
    /// string (spec §4.A `rel(p)` helper).
    #[must_use]
    pub fn rel(&self, p: &Path) -> PathBuf {
        let Some(task_dir) = self.get_str("task_dir") else {
            return p.to_path_buf();
        };
        pathdiff(p, Path::new(task_dir)).unwrap_or_else(|| p.to_path_buf())
    }

    #[must_use]
    pub fn display_value(&self) -> String {
        let mut parts: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{k}={}", v.display_value()))
            .collect();
        parts.sort();
        parts.join(" ")
    }
}

/// Minimal relative-path diff (no `pathdiff` dependency needed): strips the
/// common ancestor of `base` from `path`, prefixing `..` for each remaining
/// base component. Returns `None` when the two paths share no common
/// ancestor at all (e.g. different Windows drives).
fn pathdiff(path: &Path, base: &Path) -> Option<PathBuf> {
    use std::path::Component;

    let path_components: Vec<Component<'_>> = path.components().collect();
    let base_components: Vec<Component<'_>> = base.components().collect();

    let common = path_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    if common == 0 && !base_components.is_empty() && !path_components.is_empty() {
        // Differing roots/prefixes (e.g. `C:\` vs `D:\`) — no sensible relative path.
        if path_components[0] != base_components[0] {
            return None;
        }
    }

    let mut result = PathBuf::new();
    for _ in common..base_components.len() {
        result.push("..");
    }
    for component in &path_components[common..] {
        result.push(component.as_os_str());
    }
    if result.as_os_str().is_empty() {
        result.push(".");
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_right_biased_for_non_nulls() {
        let a = Config::from_pairs([("x", Variant::str("a")), ("y", Variant::str("keep"))]);
        let b = Config::from_pairs([("x", Variant::str("b")), ("y", Variant::Null)]);
        let merged = a.merge(&b);
        assert_eq!(merged.get_str("x"), Some("b"));
        assert_eq!(merged.get_str("y"), Some("keep"));
    }

    #[test]
    fn merge_recurses_into_nested_maps() {
        let inner_a = Config::from_pairs([("k1", Variant::str("a1")), ("k2", Variant::str("a2"))]);
        let inner_b = Config::from_pairs([("k2", Variant::str("b2"))]);
        let a = Config::from_pairs([("nested", Variant::Map(inner_a))]);
        let b = Config::from_pairs([("nested", Variant::Map(inner_b))]);
        let merged = a.merge(&b);
        let nested = merged.get("nested").and_then(Variant::as_map).unwrap();
        assert_eq!(nested.get_str("k1"), Some("a1"));
        assert_eq!(nested.get_str("k2"), Some("b2"));
    }

    #[test]
    fn rel_resolves_against_task_dir() {
        let config =
            Config::from_pairs([("task_dir", Variant::str("/repo/project"))]);
        let rel = config.rel(Path::new("/repo/project/src/main.c"));
        assert_eq!(rel, PathBuf::from("src/main.c"));
    }

    #[test]
    fn flatten_to_strings_handles_nesting() {
        let v = Variant::Seq(vec![
            Variant::str("a.o"),
            Variant::Seq(vec![Variant::str("b.o"), Variant::str("c.o")]),
            Variant::Null,
        ]);
        let mut out = Vec::new();
        v.flatten_to_strings(&mut out);
        assert_eq!(out, vec!["a.o", "b.o", "c.o"]);
    }
}
