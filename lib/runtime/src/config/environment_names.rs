// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Environment variable name constants
//!
//! Every variable the workspace reads is declared here so names stay consistent
//! between the runtime, the gateway and the launcher.
//!
//! ## Organization
//!
//! - **Logging**: log level, configuration file and output format
//! - **Storage**: key-value store location
//! - **Gateway**: configuration file and the prefix for layered overrides

/// Logging environment variables
pub mod logging {
    /// Log filter directives (e.g., "debug", "llamero_gateway=trace")
    pub const LLAMERO_LOG: &str = "LLAMERO_LOG";

    /// Path to logging configuration file
    pub const LLAMERO_LOGGING_CONFIG_PATH: &str = "LLAMERO_LOGGING_CONFIG_PATH";

    /// Enable JSONL logging format
    pub const LLAMERO_LOGGING_JSONL: &str = "LLAMERO_LOGGING_JSONL";

    /// Disable ANSI terminal colors in logs
    pub const LLAMERO_DISABLE_ANSI_LOGGING: &str = "LLAMERO_DISABLE_ANSI_LOGGING";

    /// Use local timezone for logging timestamps (default is UTC)
    pub const LLAMERO_LOG_USE_LOCAL_TZ: &str = "LLAMERO_LOG_USE_LOCAL_TZ";
}

/// Storage environment variables
pub mod storage {
    /// Root directory of the file-backed key-value store when selected as plain `file`
    pub const LLAMERO_FILE_KV: &str = "LLAMERO_FILE_KV";
}

/// Gateway environment variables
pub mod gateway {
    /// Path to the gateway TOML configuration file
    pub const LLAMERO_CONFIG: &str = "LLAMERO_CONFIG";

    /// Prefix for environment overrides of any configuration key.
    /// Nested keys are separated by `__`, e.g. `LLAMERO_SERVER__PORT=9000`.
    pub const LLAMERO_ENV_PREFIX: &str = "LLAMERO_";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_share_prefix() {
        for name in [
            logging::LLAMERO_LOG,
            logging::LLAMERO_LOGGING_CONFIG_PATH,
            logging::LLAMERO_LOGGING_JSONL,
            logging::LLAMERO_DISABLE_ANSI_LOGGING,
            logging::LLAMERO_LOG_USE_LOCAL_TZ,
            storage::LLAMERO_FILE_KV,
            gateway::LLAMERO_CONFIG,
        ] {
            assert!(
                name.starts_with(gateway::LLAMERO_ENV_PREFIX),
                "{name} is missing the prefix"
            );
        }
    }
}
