//! Substitution templates for tag strings, context values, and device
//! aliases.
//!
//! A template is ordinary text with `{{ ... }}` regions. Each region
//! holds one expression which is resolved when the owning object is
//! built, never at query time, so anything derived from the result
//! (device ids in particular) stays stable for the life of the
//! process. The expressions a call site accepts are determined by the
//! resolver it passes in; `env_resolver` handles the common
//! `env "NAME"` form.

use crate::types::Error;
use crate::Result;

/// Replaces every `{{ ... }}` region in `text` using `resolve`, which
/// receives the trimmed inner expression. An unterminated region is a
/// parse error.
pub fn substitute<F>(text: &str, resolve: F) -> Result<String>
where
    F: Fn(&str) -> Result<String>,
{
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);

        let after = &rest[start + 2..];

        match after.find("}}") {
            Some(end) => {
                out.push_str(&resolve(after[..end].trim())?);
                rest = &after[end + 2..];
            }
            None => {
                return Err(Error::Parse(format!(
                    "unterminated template in \"{}\"",
                    text
                )))
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolves the `env "NAME"` template function against the process
/// environment. Any other function name is a parse error, as is an
/// unset or badly quoted variable.
pub fn env_resolver(expr: &str) -> Result<String> {
    match expr.strip_prefix("env") {
        Some(arg) => {
            let arg = arg.trim();

            match arg.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
                Some(name) if !name.is_empty() => std::env::var(name)
                    .map_err(|_| {
                        Error::Parse(format!(
                            "environment variable \"{}\" is not set",
                            name
                        ))
                    }),
                _ => Err(Error::Parse(format!(
                    "env argument must be a quoted name, found \"{}\"",
                    arg
                ))),
            }
        }
        None => Err(Error::Parse(format!(
            "unknown template function \"{}\"",
            expr
        ))),
    }
}
