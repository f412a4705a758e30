// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub mod environment_names;

/// Check if a string is truthy
/// This will be used to evaluate environment variables or any other subjective
/// configuration parameters that can be set by the user that should be evaluated
/// as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey (opposite of [`is_truthy`]).
pub fn is_falsey(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

pub fn parse_bool(val: &str) -> anyhow::Result<bool> {
    if is_truthy(val) {
        Ok(true)
    } else if is_falsey(val) {
        Ok(false)
    } else {
        anyhow::bail!(
            "Invalid boolean value: '{}'. Expected one of: true/false, 1/0, on/off, yes/no",
            val
        )
    }
}

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

/// Check whether JSONL logging enabled
/// Set the `LLAMERO_LOGGING_JSONL` environment variable a [`is_truthy`] value
pub fn jsonl_logging_enabled() -> bool {
    env_is_truthy(environment_names::logging::LLAMERO_LOGGING_JSONL)
}

/// Check whether logging with ANSI terminal escape codes and colors is disabled.
/// Set the `LLAMERO_DISABLE_ANSI_LOGGING` environment variable a [`is_truthy`] value
pub fn disable_ansi_logging() -> bool {
    env_is_truthy(environment_names::logging::LLAMERO_DISABLE_ANSI_LOGGING)
}

/// Check whether to use local timezone for logging timestamps (default is UTC)
/// Set the `LLAMERO_LOG_USE_LOCAL_TZ` environment variable to a [`is_truthy`] value
pub fn use_local_timezone() -> bool {
    env_is_truthy(environment_names::logging::LLAMERO_LOG_USE_LOCAL_TZ)
}

/// Serde adapter for durations written as humantime strings ("5s", "1m 30s").
///
/// Use with `#[serde(with = "llamero_runtime::config::humantime_serde")]`.
pub mod humantime_serde {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("1", true)]
    #[case("TRUE", true)]
    #[case("on", true)]
    #[case("Yes", true)]
    #[case("0", false)]
    #[case("", false)]
    #[case("nope", false)]
    fn test_is_truthy(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_truthy(input), expected);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("on").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }

    #[test]
    fn test_env_is_truthy() {
        let name = environment_names::logging::LLAMERO_LOGGING_JSONL;
        temp_env::with_var(name, Some("1"), || assert!(jsonl_logging_enabled()));
        temp_env::with_var(name, Some("false"), || assert!(!jsonl_logging_enabled()));
        temp_env::with_var(name, None::<&str>, || assert!(!jsonl_logging_enabled()));
    }

    #[test]
    fn test_humantime_serde() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Holder {
            #[serde(with = "humantime_serde")]
            every: Duration,
        }
        let h: Holder = serde_json::from_str(r#"{"every":"1m 30s"}"#).unwrap();
        assert_eq!(h.every, Duration::from_secs(90));
        assert_eq!(serde_json::to_string(&h).unwrap(), r#"{"every":"1m 30s"}"#);
        assert!(serde_json::from_str::<Holder>(r#"{"every":"soon"}"#).is_err());
    }
}
