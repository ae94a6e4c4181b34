//! `${VAR}` / `${VAR:-default}` interpolation over raw TOML text (spec §6).
//!
//! Figment has no built-in support for shell-style variable expansion, so
//! this runs as a text pre-processing pass before the TOML is handed to
//! `figment::providers::Toml`. Interpolation only ever touches string
//! scalars -- it operates on the raw source text, not parsed values, so it
//! cannot reach into non-string TOML tokens by construction.

use crate::error::ConfigError;

/// Expands every `${VAR}` and `${VAR:-default}` occurrence in `source`
/// using `std::env::var`. `${VAR}` with no default is required: a missing
/// environment variable is a [`ConfigError::Validation`]. `${VAR:-default}`
/// falls back to `default` (which may itself be empty) when unset.
pub fn interpolate(source: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < source.len() {
        if source[i..].starts_with("${") {
            let Some(end) = source[i + 2..].find('}') else {
                out.push_str(&source[i..]);
                break;
            };
            let inner = &source[i + 2..i + 2 + end];
            out.push_str(&resolve(inner)?);
            i += 2 + end + 1;
        } else {
            let ch = source[i..].chars().next().expect("i < source.len()");
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    Ok(out)
}

fn resolve(inner: &str) -> Result<String, ConfigError> {
    if let Some((name, default)) = inner.split_once(":-") {
        Ok(std::env::var(name).unwrap_or_else(|_| default.to_string()))
    } else {
        std::env::var(inner).map_err(|_| ConfigError::Validation {
            field: format!("${{{inner}}}"),
            reason: format!("environment variable {inner} is not set and no default was given"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_var_is_substituted_when_present() {
        std::env::set_var("POLARIS_TEST_REQUIRED", "hello");
        let out = interpolate("value = \"${POLARIS_TEST_REQUIRED}\"").unwrap();
        assert_eq!(out, "value = \"hello\"");
        std::env::remove_var("POLARIS_TEST_REQUIRED");
    }

    #[test]
    fn required_var_errors_when_missing() {
        std::env::remove_var("POLARIS_TEST_MISSING");
        let err = interpolate("value = \"${POLARIS_TEST_MISSING}\"").unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn optional_var_falls_back_to_default() {
        std::env::remove_var("POLARIS_TEST_OPTIONAL");
        let out = interpolate("value = \"${POLARIS_TEST_OPTIONAL:-fallback}\"").unwrap();
        assert_eq!(out, "value = \"fallback\"");
    }

    #[test]
    fn optional_var_prefers_environment_over_default() {
        std::env::set_var("POLARIS_TEST_OPTIONAL2", "env-value");
        let out = interpolate("value = \"${POLARIS_TEST_OPTIONAL2:-fallback}\"").unwrap();
        assert_eq!(out, "value = \"env-value\"");
        std::env::remove_var("POLARIS_TEST_OPTIONAL2");
    }

    #[test]
    fn text_without_interpolation_passes_through_unchanged() {
        let out = interpolate("plain = \"text\"\nnum = 5\n").unwrap();
        assert_eq!(out, "plain = \"text\"\nnum = 5\n");
    }

    #[test]
    fn multiple_interpolations_in_one_line() {
        std::env::set_var("POLARIS_TEST_A", "a");
        std::env::set_var("POLARIS_TEST_B", "b");
        let out = interpolate("v = \"${POLARIS_TEST_A}-${POLARIS_TEST_B}\"").unwrap();
        assert_eq!(out, "v = \"a-b\"");
        std::env::remove_var("POLARIS_TEST_A");
        std::env::remove_var("POLARIS_TEST_B");
    }
}
