//! Shared utility functions for the privado launcher.
//!
//! This module provides small helpers used across multiple modules,
//! including boolean flag parsing, browser launching and confirmation prompts.

pub mod browser;
pub mod prompt;

pub use browser::{extract_url, open_url_in_browser};
pub use prompt::{confirm, confirm_with};

/// Parses a boolean the way environment flags are conventionally written.
///
/// Accepts `1`, `t`, `T`, `true`, `TRUE`, `True` and their false
/// counterparts. Anything else yields `None`.
pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Formats a boolean for container environment variables.
pub fn env_bool(value: bool) -> String {
    value.to_string().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_flag() {
        for truthy in ["1", "t", "T", "true", "TRUE", "True"] {
            assert_eq!(parse_bool_flag(truthy), Some(true), "{truthy}");
        }
        for falsy in ["0", "f", "F", "false", "FALSE", "False"] {
            assert_eq!(parse_bool_flag(falsy), Some(false), "{falsy}");
        }
        assert_eq!(parse_bool_flag("yes"), None);
        assert_eq!(parse_bool_flag(""), None);
        assert_eq!(parse_bool_flag("tRuE"), None);
    }

    #[test]
    fn test_env_bool() {
        assert_eq!(env_bool(true), "TRUE");
        assert_eq!(env_bool(false), "FALSE");
    }
}
