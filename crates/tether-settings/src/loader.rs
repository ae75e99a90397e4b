//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge user values over defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tether_core::CliTool;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::TetherSettings;

/// Resolve the path to the user settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with process env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    load_settings_with(path, |name| std::env::var(name).ok())
}

/// Load settings from `path`, resolving overrides through `lookup`.
pub fn load_settings_with<F>(path: &Path, lookup: F) -> Result<TetherSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides_from(&mut settings, lookup);
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_env_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply `TETHER_*` overrides resolved through `lookup`.
///
/// - Integers must be valid and within the specified range
/// - Booleans accept: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
/// - Invalid values are ignored with a warning (file/default value stays)
pub fn apply_env_overrides_from<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup: &lookup };

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_DB_PATH") {
        settings.database.path = v;
    }

    // ── Execution ───────────────────────────────────────────────────
    if let Some(v) = env.u64("TETHER_DEFAULT_TIMEOUT_MS", 100, 86_400_000) {
        settings.execution.default_timeout_ms = v;
    }
    if let Some(v) = env.u64("TETHER_GRACE_PERIOD_MS", 0, 600_000) {
        settings.execution.grace_period_ms = v;
    }
    if let Some(v) = env.usize("TETHER_MAX_OUTPUT_BYTES", 1024, 1_073_741_824) {
        settings.execution.max_output_bytes = v;
    }
    if let Some(v) = env.string("TETHER_MARKER_PREFIX") {
        settings.execution.marker_prefix = v;
    }
    if let Some(v) = env.bool("TETHER_WRAP_WITH_MARKER") {
        settings.execution.wrap_with_marker = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        match v.parse() {
            Ok(level) => settings.logging.level = level,
            Err(e) => warn!(key = "TETHER_LOG_LEVEL", value = %v, error = %e, "ignoring"),
        }
    }
    if let Some(v) = env.bool("TETHER_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Tool binaries ───────────────────────────────────────────────
    for tool in CliTool::ALL {
        let key = format!("TETHER_{}_BIN", tool.as_str().to_ascii_uppercase());
        if let Some(v) = env.string(&key) {
            settings.tools.get_mut(tool).binary = Some(v);
        }
    }
}

fn validate(settings: &TetherSettings) -> Result<()> {
    let prefix = &settings.execution.marker_prefix;
    if prefix.is_empty() || prefix.chars().any(|c| c.is_whitespace() || c == ':') {
        return Err(SettingsError::InvalidValue(format!(
            "execution.markerPrefix must be non-empty without whitespace or ':' (got {prefix:?})"
        )));
    }
    if settings.execution.max_output_bytes == 0 {
        return Err(SettingsError::InvalidValue(
            "execution.maxOutputBytes must be positive".into(),
        ));
    }
    if settings.database.path.trim().is_empty() {
        return Err(SettingsError::InvalidValue("database.path is empty".into()));
    }
    Ok(())
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers (thin wrappers) ─────────────────────────────────────────────

struct EnvReader<'a, F> {
    lookup: &'a F,
}

impl<F> EnvReader<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_simple_override() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": 10});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 10);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({
            "execution": {"defaultTimeoutMs": 600000, "markerPrefix": "TETHER_TXN"}
        });
        let source = serde_json::json!({
            "execution": {"defaultTimeoutMs": 1000}
        });
        let merged = deep_merge(target, source);
        assert_eq!(merged["execution"]["defaultTimeoutMs"], 1000);
        assert_eq!(merged["execution"]["markerPrefix"], "TETHER_TXN");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"extraArgs": ["--a", "--b"]});
        let source = serde_json::json!({"extraArgs": ["--c"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["extraArgs"], serde_json::json!(["--c"]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let source = serde_json::json!({"a": 42});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 42);
    }

    #[test]
    fn merge_empty_source() {
        let target = serde_json::json!({"a": 1, "b": {"c": 2}});
        let merged = deep_merge(target.clone(), serde_json::json!({}));
        assert_eq!(merged, target);
    }

    // ── load_settings_with ──────────────────────────────────────────

    #[test]
    fn load_missing_file_returns_defaults() {
        let path = Path::new("/nonexistent/tether/settings.json");
        let settings = load_settings_with(path, no_env).unwrap();
        let defaults = TetherSettings::default();
        assert_eq!(settings.database.path, defaults.database.path);
        assert_eq!(
            settings.execution.grace_period_ms,
            defaults.execution.grace_period_ms
        );
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"execution": {"defaultTimeoutMs": 30000}, "tools": {"gemini": {"binary": "gem"}}}"#,
        )
        .unwrap();

        let settings = load_settings_with(&path, no_env).unwrap();
        assert_eq!(settings.execution.default_timeout_ms, 30_000);
        assert_eq!(settings.execution.grace_period_ms, 5_000);
        assert_eq!(settings.tools.gemini.binary.as_deref(), Some("gem"));
        assert!(settings.tools.claude.binary.is_none());
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = load_settings_with(&path, no_env).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn load_rejects_marker_prefix_with_colon() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"execution": {"markerPrefix": "A:B"}}"#).unwrap();

        let err = load_settings_with(&path, no_env).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_beat_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"database": {"path": "from-file.db"}}"#).unwrap();

        let env = env_of(&[
            ("TETHER_DB_PATH", "/var/lib/tether/exec.db"),
            ("TETHER_DEFAULT_TIMEOUT_MS", "2500"),
            ("TETHER_LOG_JSON", "yes"),
            ("TETHER_LOG_LEVEL", "debug"),
        ]);
        let settings = load_settings_with(&path, env).unwrap();
        assert_eq!(settings.database.path, "/var/lib/tether/exec.db");
        assert_eq!(settings.execution.default_timeout_ms, 2_500);
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, crate::LogLevel::Debug);
    }

    #[test]
    fn env_tool_binaries_map_to_each_tool() {
        let mut settings = TetherSettings::default();
        apply_env_overrides_from(
            &mut settings,
            env_of(&[
                ("TETHER_GEMINI_BIN", "/opt/gemini"),
                ("TETHER_CODEX_BIN", "codex-nightly"),
            ]),
        );
        assert_eq!(settings.tools.gemini.binary.as_deref(), Some("/opt/gemini"));
        assert_eq!(settings.tools.codex.binary.as_deref(), Some("codex-nightly"));
        assert!(settings.tools.qwen.binary.is_none());
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = TetherSettings::default();
        apply_env_overrides_from(
            &mut settings,
            env_of(&[
                ("TETHER_DEFAULT_TIMEOUT_MS", "soon"),
                ("TETHER_GRACE_PERIOD_MS", "99999999"),
                ("TETHER_LOG_JSON", "maybe"),
                ("TETHER_LOG_LEVEL", "loud"),
                ("TETHER_DB_PATH", ""),
            ]),
        );
        let defaults = TetherSettings::default();
        assert_eq!(
            settings.execution.default_timeout_ms,
            defaults.execution.default_timeout_ms
        );
        assert_eq!(settings.execution.grace_period_ms, 5_000);
        assert!(!settings.logging.json);
        assert_eq!(settings.logging.level, crate::LogLevel::Info);
        assert_eq!(settings.database.path, defaults.database.path);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for v in ["true", "1", "YES", "On"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "no", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("500", 100, 1000), Some(500));
        assert_eq!(parse_u64_range("50", 100, 1000), None);
        assert_eq!(parse_u64_range("-1", 0, 1000), None);
        assert_eq!(parse_usize_range("4096", 1024, 8192), Some(4096));
        assert_eq!(parse_usize_range("9000", 1024, 8192), None);
    }
}
