//! Store location and launch policy.

use serde::{Deserialize, Serialize};

/// Where the execution store lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// Store file. Relative paths resolve against the workspace root, giving
    /// one store per project.
    pub path: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: ".tether/executions.db".to_string(),
        }
    }
}

/// How launches are run and bounded.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    /// Timeout applied when a request does not carry its own.
    pub default_timeout_ms: u64,
    /// Time between the graceful termination signal and the forced kill.
    pub grace_period_ms: u64,
    /// Cap on buffered combined output per launch.
    pub max_output_bytes: usize,
    /// Prefix of the `<prefix>: <token>` marker line.
    pub marker_prefix: String,
    /// Run tools under a `sh` shim that prints the marker line first.
    pub wrap_with_marker: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 600_000,
            grace_period_ms: 5_000,
            max_output_bytes: 4 * 1024 * 1024,
            marker_prefix: "TETHER_TXN".to_string(),
            wrap_with_marker: cfg!(unix),
        }
    }
}
