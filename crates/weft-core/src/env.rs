//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.
//!
//! ```ignore
//! use weft_core::env::{env_get, env_get_bool};
//!
//! let stack: usize = env_get("WEFT_STACK_SIZE", 128 * 1024);
//! let flush: bool = env_get_bool("WEFT_FLUSH_EPRINT", false);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default.
///
/// Works with any type that implements `FromStr`; parse failures fall
/// back to the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true.
/// Everything else (including unset) returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as string, or return default.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__WEFT_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__WEFT_TEST_NUM__", "123");
        let val: usize = env_get("__WEFT_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__WEFT_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__WEFT_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__WEFT_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__WEFT_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__WEFT_TEST_BOOL__", "yes");
        assert!(env_get_bool("__WEFT_TEST_BOOL__", false));
        std::env::set_var("__WEFT_TEST_BOOL__", "0");
        assert!(!env_get_bool("__WEFT_TEST_BOOL__", true));
        std::env::remove_var("__WEFT_TEST_BOOL__");
        assert!(env_get_bool("__WEFT_TEST_BOOL__", true));
    }

    #[test]
    fn test_env_get_str_default() {
        assert_eq!(env_get_str("__WEFT_TEST_UNSET__", "hello"), "hello");
    }
}
