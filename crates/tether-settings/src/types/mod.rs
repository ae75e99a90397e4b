//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so a settings file only needs the keys it changes.

mod execution;
mod logging;
mod tools;

pub use execution::*;
pub use logging::*;
pub use tools::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// # JSON Format
///
/// ```json
/// {
///   "execution": { "defaultTimeoutMs": 120000 },
///   "tools": { "gemini": { "binary": "/opt/gemini/bin/gemini" } }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Settings schema version.
    pub version: String,
    /// Execution store location.
    pub database: DatabaseSettings,
    /// Launch policy (timeouts, output cap, marker convention).
    pub execution: ExecutionSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Per-tool binary/argument/env overrides.
    pub tools: ToolSettings,
}

impl Default for TetherSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            database: DatabaseSettings::default(),
            execution: ExecutionSettings::default(),
            logging: LoggingSettings::default(),
            tools: ToolSettings::default(),
        }
    }
}
