//! Token expansion for metric ids and tag values
//!
//! Configuration strings may embed `${VAR}` or `$VAR` tokens. Tokens are
//! resolved against an explicit environment map, optionally falling back to
//! process environment variables. Unresolved tokens either expand to the
//! empty string or are kept as a normalized `${VAR}` literal — the metric id
//! pipeline relies on the latter to detect ids that still need to be split
//! by label.

use std::collections::HashMap;

/// Lookup environment and missing-key policy for one expansion pass.
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
    /// Explicit key/value environment, consulted first.
    pub env: HashMap<String, String>,
    /// Whether process environment variables are consulted as a fallback.
    pub use_os_env: bool,
    /// Keep unresolved tokens as `${VAR}` instead of expanding to "".
    pub keep_unresolved: bool,
}

impl ExpansionContext {
    pub fn new(env: HashMap<String, String>) -> Self {
        Self {
            env,
            use_os_env: false,
            keep_unresolved: false,
        }
    }

    pub fn with_os_env(mut self) -> Self {
        self.use_os_env = true;
        self
    }

    pub fn keeping_unresolved(mut self) -> Self {
        self.keep_unresolved = true;
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Some(v) = self.env.get(name) {
            return Some(v.clone());
        }
        if self.use_os_env {
            return std::env::var(name).ok();
        }
        None
    }
}

/// Expand all `${VAR}` and `$VAR` tokens in `input` against `ctx`.
///
/// The braced form may contain any characters up to the closing brace
/// (including `:`); the bare form stops at the first character that is not
/// alphanumeric or `_`. A `$` not followed by a token is passed through.
pub fn expand_tokens(input: &str, ctx: &ExpansionContext) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&(_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, nc) in chars.by_ref() {
                    if nc == '}' {
                        closed = true;
                        break;
                    }
                    name.push(nc);
                }
                if !closed {
                    // unterminated token, emit what we consumed
                    out.push_str("${");
                    out.push_str(&name);
                } else {
                    out.push_str(&resolve(&name, ctx));
                }
            }
            Some(&(_, nc)) if nc.is_ascii_alphanumeric() || nc == '_' => {
                let mut name = String::new();
                while let Some(&(_, nc)) = chars.peek() {
                    if nc.is_ascii_alphanumeric() || nc == '_' {
                        name.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&resolve(&name, ctx));
            }
            _ => out.push('$'),
        }
    }

    out
}

fn resolve(name: &str, ctx: &ExpansionContext) -> String {
    if name.is_empty() {
        return String::new();
    }
    match ctx.lookup(name) {
        Some(v) => v,
        None if ctx.keep_unresolved => format!("${{{name}}}"),
        None => String::new(),
    }
}
