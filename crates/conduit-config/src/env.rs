//! `${VAR}` and `${VAR:-default}` substitution for configuration values.
//!
//! - `${VAR}` expands to the variable's value. An unset variable expands to the
//!   empty string and logs a warning.
//! - `${VAR:-default}` expands to the value when it is set and non-empty,
//!   otherwise to `default`.
//!
//! Anything else, including a bare `$VAR`, is left untouched.

use std::sync::LazyLock;

use regex::{Captures, Regex};

static VAR_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok());

/// Expand variables in `input` using the process environment.
pub fn substitute(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

/// Expand variables in `input`, resolving names through `lookup`.
pub fn substitute_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let Some(pattern) = VAR_PATTERN.as_ref().filter(|_| input.contains("${")) else {
        return input.to_string();
    };

    pattern
        .replace_all(input, |caps: &Captures<'_>| {
            let name = &caps[1];
            let value = lookup(name);
            match caps.get(2) {
                Some(default) => match value {
                    Some(v) if !v.is_empty() => v,
                    _ => default.as_str().to_string(),
                },
                None => value.unwrap_or_else(|| {
                    tracing::warn!(variable = %name, "environment variable not set, substituting empty string");
                    String::new()
                }),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_plain_text_untouched() {
        assert_eq!(substitute_with("no vars here", vars(&[])), "no vars here");
        assert_eq!(substitute_with("$HOME/bin", vars(&[])), "$HOME/bin");
    }

    #[test]
    fn test_required_variable() {
        let lookup = vars(&[("DB_PATH", "/data/app.db")]);
        assert_eq!(
            substitute_with("--db=${DB_PATH}", lookup),
            "--db=/data/app.db"
        );
    }

    #[test]
    fn test_unset_required_variable_is_empty() {
        assert_eq!(substitute_with("key=${MISSING}!", vars(&[])), "key=!");
    }

    #[test]
    fn test_default_used_when_unset_or_empty() {
        assert_eq!(
            substitute_with("${PORT:-8080}", vars(&[])),
            "8080"
        );
        assert_eq!(
            substitute_with("${PORT:-8080}", vars(&[("PORT", "")])),
            "8080"
        );
        assert_eq!(
            substitute_with("${PORT:-8080}", vars(&[("PORT", "9000")])),
            "9000"
        );
    }

    #[test]
    fn test_empty_default() {
        assert_eq!(substitute_with("a${X:-}b", vars(&[])), "ab");
    }

    #[test]
    fn test_multiple_occurrences() {
        let lookup = vars(&[("HOST", "localhost"), ("PORT", "11434")]);
        assert_eq!(
            substitute_with("http://${HOST}:${PORT}/v1", lookup),
            "http://localhost:11434/v1"
        );
    }
}
