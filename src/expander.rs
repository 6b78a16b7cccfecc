//! The Template Expander (spec §4.B): lazy, context-bound text expansion with
//! bounded recursion and TEFINAE.
//!
//! Macro bodies are a small host-language expression subset — bare
//! identifiers (a field read against the current `Config`), string/number/
//! bool literals, list literals, and calls into [`crate::config_helpers`] —
//! rather than a full embedded interpreter. This covers every macro shape
//! named in spec §3/§6 and every one the teacher's own `hancho.py` reference
//! implementation actually uses (`{build_root}/{build_tag}/{rel_path(...)}`,
//! `{swap_ext(in_src, '.o')}`, `{join_prefix('-I', in_includes)}`, …) without
//! reaching for a general-purpose `eval`, which Rust has no analogue for.
//!
//! Recursion is tracked with an explicit depth parameter threaded through
//! every recursive call rather than the teacher-inspired global counter —
//! this keeps depth-exceeded a genuine, deterministic error (spec §4.B
//! "Recursion bound") instead of leaking across unrelated expansions, while
//! every *other* macro-evaluation failure (missing field, unknown helper,
//! bad argument count) is caught locally and leaves the macro verbatim
//! (TEFINAE, spec §4.B).

use crate::config_helpers;
use crate::constants::MAX_EXPAND_DEPTH;
use crate::error::KilnError;
use crate::variant::{Config, Variant};

/// Top-level entry point (spec §4.B contract): expand every reachable macro
/// in `value` against `ctx`, returning a fully deep-copied result. The only
/// way this returns `Err` is genuine recursion-depth exhaustion — every
/// other evaluation failure is TEFINAE and silently leaves the offending
/// macro unexpanded.
pub fn expand(ctx: &Config, value: &Variant) -> Result<Variant, KilnError> {
    expand_value(ctx, value, 0)
}

/// Convenience for expanding a single string field (`desc`, `command`, …).
pub fn expand_str(ctx: &Config, text: &str) -> Result<String, KilnError> {
    expand_text(ctx, text, 0)
}

fn expand_value(ctx: &Config, value: &Variant, depth: u32) -> Result<Variant, KilnError> {
    match value {
        Variant::Str(s) => Ok(Variant::Str(expand_text(ctx, s, depth)?)),
        Variant::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_value(ctx, item, depth)?);
            }
            Ok(Variant::Seq(out))
        }
        // A nested Config is re-bound: reads of its fields during expansion
        // resolve against *it*, not the outer context (spec §4.B "Structural
        // expansion").
        Variant::Map(inner) => {
            let mut out = Config::new();
            for (key, val) in inner.iter() {
                out.insert(key.to_string(), expand_value(inner, val, depth)?);
            }
            Ok(Variant::Map(out))
        }
        other => Ok(other.clone()),
    }
}

/// Signals distinguishing a real recursion-depth failure (propagated) from
/// every other macro-evaluation failure (TEFINAE, swallowed at the point of
/// the enclosing `{…}` span).
enum Signal {
    Tefinae,
    Recursion(KilnError),
}

type EvalResult = Result<Variant, Signal>;

fn expand_text(ctx: &Config, text: &str, depth: u32) -> Result<String, KilnError> {
    if !has_macro(text) {
        return Ok(text.to_string());
    }
    if depth >= MAX_EXPAND_DEPTH {
        return Err(KilnError::Expansion(format!(
            "macro recursion exceeded {MAX_EXPAND_DEPTH} levels while expanding '{text}'"
        )));
    }

    let mut result = String::new();
    let mut rest = text;
    while let Some((pre, body, post)) = find_macro(rest) {
        result.push_str(pre);
        match eval_macro(ctx, body, depth + 1) {
            Ok(value) => result.push_str(&stringify(&value)),
            Err(Signal::Recursion(err)) => return Err(err),
            Err(Signal::Tefinae) => {
                result.push('{');
                result.push_str(body);
                result.push('}');
            }
        }
        rest = post;
    }
    result.push_str(rest);

    // If expansion changed the text, re-run it (spec §4.B "If the resulting
    // string differs from the original, re-run expansion on the result").
    if result != text {
        expand_text(ctx, &result, depth + 1)
    } else {
        Ok(result)
    }
}

/// True if `text` contains a `{…}` span (the shortest one, with no nested
/// braces — spec §4.B "Macro syntax").
fn has_macro(text: &str) -> bool {
    find_macro(text).is_some()
}

/// Finds the first macro span using the same matching rule as the regex
/// `\{[^{}]*\}` would: take the first `}` in the text, then the nearest
/// preceding `{` — this is exactly the leftmost, innermost, non-nested
/// match a `[^{}]*`-bodied regex produces.
fn find_macro(text: &str) -> Option<(&str, &str, &str)> {
    let close = text.find('}')?;
    let open = text[..close].rfind('{')?;
    Some((&text[..open], &text[open + 1..close], &text[close + 1..]))
}

/// Evaluates one macro body (the text strictly between `{` and `}`) against
/// `ctx`. Lookup misses, parse failures, and helper errors all collapse to
/// `Signal::Tefinae`; only a propagated recursion-depth error from expanding
/// a looked-up field's own value is `Signal::Recursion`.
fn eval_macro(ctx: &Config, body: &str, depth: u32) -> EvalResult {
    let expr = parse(body).map_err(|_| Signal::Tefinae)?;
    eval_expr(ctx, &expr, depth)
}

fn eval_expr(ctx: &Config, expr: &Expr, depth: u32) -> EvalResult {
    match expr {
        Expr::Ident(name) => {
            // Reading a field from C (spec §4.B step 1): absence is a
            // lookup failure, caught here (TEFINAE).
            let value = ctx.get(name).cloned().ok_or(Signal::Tefinae)?;
            // The value read is itself recursively expanded before being
            // returned (spec §4.B step 2) — this is the one place a real
            // recursion-depth error can surface.
            expand_value(ctx, &value, depth).map_err(Signal::Recursion)
        }
        Expr::Str(s) => Ok(Variant::Str(s.clone())),
        Expr::Int(i) => Ok(Variant::Int(*i)),
        Expr::Float(f) => Ok(Variant::Float(*f)),
        Expr::Bool(b) => Ok(Variant::Bool(*b)),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(ctx, item, depth)?);
            }
            Ok(Variant::Seq(out))
        }
        Expr::Call(name, args) => {
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval_expr(ctx, arg, depth)?);
            }
            config_helpers::dispatch(ctx, name, &evaluated).map_err(|_| Signal::Tefinae)
        }
    }
}

/// Stringification used when substituting an evaluated macro back into its
/// surrounding text (spec §4.B "String expansion"). Differs from
/// [`Variant::display_value`] only in how it handles a `Task`: a task
/// reference stringifies to its (space-joined) `out_files`, which by the
/// time macro expansion ever sees one has already been replaced during
/// AWAITING_INPUTS — this path exists for the rare case a script calls
/// `ctx.expand(...)` directly on a value still carrying a live `Task`.
fn stringify(value: &Variant) -> String {
    match value {
        Variant::Task(t) => t
            .out_files()
            .into_iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        Variant::Promise(_) => String::new(),
        other => other.display_value(),
    }
}

// ---------------------------------------------------------------------------
// A minimal expression parser for macro bodies: identifiers, string/number/
// bool literals, list literals, and calls (`name(arg, arg, ...)`).

#[derive(Debug, Clone)]
enum Expr {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.char_indices().peekable(),
            src,
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.peek().map(|(_, c)| *c)
    }

    fn parse_expr(&mut self) -> Result<Expr, ()> {
        self.skip_ws();
        match self.peek_char().ok_or(())? {
            '\'' | '"' => self.parse_string(),
            '[' => self.parse_list(),
            c if c.is_ascii_digit() || c == '-' => self.parse_number(),
            c if c.is_alphabetic() || c == '_' => self.parse_ident_or_call(),
            _ => Err(()),
        }
    }

    fn parse_string(&mut self) -> Result<Expr, ()> {
        let (_, quote) = self.chars.next().ok_or(())?;
        let mut out = String::new();
        loop {
            let (_, c) = self.chars.next().ok_or(())?;
            if c == quote {
                break;
            }
            if c == '\\' {
                let (_, escaped) = self.chars.next().ok_or(())?;
                out.push(escaped);
            } else {
                out.push(c);
            }
        }
        Ok(Expr::Str(out))
    }

    fn parse_number(&mut self) -> Result<Expr, ()> {
        let start = self.chars.peek().ok_or(())?.0;
        if matches!(self.chars.peek(), Some((_, '-'))) {
            self.chars.next();
        }
        let mut is_float = false;
        while let Some((_, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                self.chars.next();
            } else if *c == '.' && !is_float {
                is_float = true;
                self.chars.next();
            } else {
                break;
            }
        }
        let end = self.chars.peek().map_or(self.src.len(), |(i, _)| *i);
        let text = &self.src[start..end];
        if is_float {
            text.parse::<f64>().map(Expr::Float).map_err(|_| ())
        } else {
            text.parse::<i64>().map(Expr::Int).map_err(|_| ())
        }
    }

    fn parse_ident_or_call(&mut self) -> Result<Expr, ()> {
        let start = self.chars.peek().ok_or(())?.0;
        while matches!(self.chars.peek(), Some((_, c)) if c.is_alphanumeric() || *c == '_') {
            self.chars.next();
        }
        let end = self.chars.peek().map_or(self.src.len(), |(i, _)| *i);
        let name = self.src[start..end].to_string();

        match self.peek_char() {
            Some('(') => {
                self.chars.next();
                let args = self.parse_args(')')?;
                Ok(Expr::Call(name, args))
            }
            _ => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                _ => Ok(Expr::Ident(name)),
            },
        }
    }

    fn parse_list(&mut self) -> Result<Expr, ()> {
        self.chars.next(); // consume '['
        let items = self.parse_args(']')?;
        Ok(Expr::List(items))
    }

    fn parse_args(&mut self, close: char) -> Result<Vec<Expr>, ()> {
        let mut args = Vec::new();
        self.skip_ws();
        if self.peek_char() == Some(close) {
            self.chars.next();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            self.skip_ws();
            match self.chars.next() {
                Some((_, ',')) => continue,
                Some((_, c)) if c == close => break,
                _ => return Err(()),
            }
        }
        Ok(args)
    }
}

fn parse(body: &str) -> Result<Expr, ()> {
    let mut parser = Parser::new(body.trim());
    let expr = parser.parse_expr()?;
    parser.skip_ws();
    if parser.chars.peek().is_some() {
        return Err(());
    }
    Ok(expr)
}
