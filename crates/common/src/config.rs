//! Common configuration types for testbed components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "spire_testbed=info";

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive (same syntax as `RUST_LOG`)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Read `RUST_LOG` and `TESTBED_LOG_FORMAT` from a variable map.
    ///
    /// Any `TESTBED_LOG_FORMAT` other than `json` selects the plain text
    /// formatter.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let log_filter = vars
            .get("RUST_LOG")
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json_logs = vars
            .get("TESTBED_LOG_FORMAT")
            .is_some_and(|s| s.eq_ignore_ascii_case("json"));

        Self {
            log_filter,
            json_logs,
        }
    }
}
