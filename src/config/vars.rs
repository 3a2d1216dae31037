//! Environment variable interpolation for config files.
//!
//! Supported syntax:
//! - `$VAR` or `${VAR}`: value of VAR, error if unset
//! - `${VAR:-default}`: default if VAR is unset or empty
//! - `${VAR-default}`: default only if VAR is unset
//! - `$$`: literal `$`
//!
//! Substituted values that are not plain tokens are written as double-quoted
//! YAML scalars, so characters such as `#`, `*` or `: ` in a password reach
//! the parser as text. Such a reference must therefore make up a whole
//! value, not part of a larger string.

use regex::{Captures, Regex};
use std::env;
use std::sync::LazyLock;

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        |
        \$\{
            (?P<braced>[A-Za-z_][A-Za-z0-9_]*)
            (?: (?P<op>:?-) (?P<default>[^}]*) )?
        \}
        |
        \$(?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("Invalid regex pattern")
});

static PLAIN_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_./][A-Za-z0-9_./+-]*$").expect("Invalid regex pattern")
});

/// Result of environment variable interpolation.
#[derive(Debug)]
pub struct InterpolationResult {
    pub text: String,
    /// Every problem found, so all missing variables are reported at once.
    pub errors: Vec<String>,
}

impl InterpolationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Interpolate environment variables in the given text.
pub fn interpolate(input: &str) -> InterpolationResult {
    let mut errors = Vec::new();
    let text = ENV_VAR_PATTERN
        .replace_all(input, |caps: &Captures| match resolve(caps) {
            Ok(value) => value,
            Err(message) => {
                errors.push(message);
                caps[0].to_string()
            }
        })
        .into_owned();

    InterpolationResult { text, errors }
}

fn resolve(caps: &Captures) -> Result<String, String> {
    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return Ok("$".to_string());
    };
    let name = name.as_str();
    let default = caps.name("default").map(|m| m.as_str());
    let empty_uses_default = caps.name("op").is_some_and(|op| op.as_str() == ":-");

    let value = match env::var(name) {
        Ok(value) if value.contains(['\n', '\r']) => {
            return Err(format!(
                "environment variable '{name}' contains newlines, which is not allowed"
            ));
        }
        Ok(value) if value.is_empty() && empty_uses_default => default.unwrap_or_default(),
        Ok(value) => return Ok(yaml_scalar(&value)),
        Err(_) => default.ok_or_else(|| format!("environment variable '{name}' is not set"))?,
    };
    Ok(yaml_scalar(value))
}

/// Render `value` so YAML reads it back as exactly that string.
fn yaml_scalar(value: &str) -> String {
    if value.is_empty() || PLAIN_TOKEN.is_match(value) {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
