//! Config values that may be given literally or as a reference to an environment
//! variable, so that router credentials stay out of the config file:
//!
//! ```json
//! {
//!   "username": "api",
//!   "password": "$ROUTER_PASSWORD"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// Resolves `$VAR` and `${VAR}` during deserialization; any other string is parsed as `T`.
#[derive(Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    fn env_var_name(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return Some(braced);
        }
        let name = s.strip_prefix('$')?;
        let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        valid.then_some(name)
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Values resolved from the environment are frequently secrets.
impl<T> fmt::Debug for LiteralOrEnv<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LiteralOrEnv(..)")
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let value = match Self::env_var_name(&raw) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{var_name}' not found (referenced as '{raw}')"
                ))
            })?,
            None => raw,
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_value_is_kept() {
        let value: LiteralOrEnv<String> = serde_json::from_str("\"admin\"").unwrap();
        assert_eq!(value.inner(), "admin");
    }

    #[test]
    fn test_env_var_syntax() {
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$ROUTER_PASSWORD"), Some("ROUTER_PASSWORD"));
        assert_eq!(LiteralOrEnv::<String>::env_var_name("${ROUTER_PASSWORD}"), Some("ROUTER_PASSWORD"));
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$"), None);
        assert_eq!(LiteralOrEnv::<String>::env_var_name("pa$$word"), None);
        assert_eq!(LiteralOrEnv::<String>::env_var_name("$not-a-var"), None);
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let result: Result<LiteralOrEnv<String>, _> =
            serde_json::from_str("\"$HOTSPOT_VOUCHER_SURELY_UNSET_VARIABLE\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_does_not_leak_value() {
        let value = LiteralOrEnv::from_literal("s3cret".to_string());
        assert!(!format!("{value:?}").contains("s3cret"));
    }
}
