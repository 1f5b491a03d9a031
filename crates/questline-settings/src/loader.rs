//! Settings loading with deep merge and environment overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`QuestlineSettings::default()`]
//! 2. If `~/.questline/settings.json` exists, deep-merge user values over defaults
//! 3. Apply environment overrides (highest priority)
//!
//! Overrides go through [`apply_overrides`], which takes a lookup function
//! instead of reading the process environment directly, so tests can feed a
//! map.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::QuestlineSettings;

/// Resolve the path to the settings file (`~/.questline/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".questline").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<QuestlineSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<QuestlineSettings> {
    let mut settings = load_file(path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn load_file(path: &Path) -> Result<QuestlineSettings> {
    let defaults = serde_json::to_value(QuestlineSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides read through `lookup`.
///
/// Empty strings are ignored. Out-of-range or unparsable numbers are
/// logged and ignored.
pub fn apply_overrides<F>(settings: &mut QuestlineSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = Overrides { lookup };

    // ── Client ──────────────────────────────────────────────────────
    if let Some(v) = env.string("QUESTLINE_CREDENTIAL_ENDPOINT") {
        settings.client.credential_endpoint = v;
    }

    // ── Connection ──────────────────────────────────────────────────
    if let Some(v) = env.u32("QUESTLINE_CONNECT_ATTEMPTS", 1, 100) {
        settings.connection.max_attempts = v;
    }
    if let Some(v) = env.u64("QUESTLINE_CONNECT_RETRY_DELAY_MS", 0, 600_000) {
        settings.connection.retry_delay_ms = v;
    }
    if let Some(v) = env.u64("QUESTLINE_TOKEN_REFRESH_MS", 1_000, 86_400_000) {
        settings.connection.token_refresh_ms = v;
    }

    // ── Groups ──────────────────────────────────────────────────────
    if let Some(v) = env.u64("QUESTLINE_GROUP_BASE_DELAY_MS", 0, 600_000) {
        settings.groups.base_delay_ms = v;
    }
    if let Some(v) = env.u32("QUESTLINE_GROUP_MAX_ATTEMPTS", 1, 100) {
        settings.groups.max_attempts = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("QUESTLINE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("QUESTLINE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("QUESTLINE_CONTENT_DIR") {
        settings.server.content_dir = v;
    }

    // ── Web PubSub ──────────────────────────────────────────────────
    if let Some(v) = env.string("AZURE_WEBPUBSUB_CONNECTION_STRING") {
        settings.pubsub.connection_string = Some(v);
    }
    if let Some(v) = env.string("AZURE_WEBPUBSUB_HUB_NAME") {
        settings.pubsub.hub_name = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("QUESTLINE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("QUESTLINE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Lookup readers ──────────────────────────────────────────────────────────

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).map(|v| v.trim().to_string())
    }

    fn checked<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.raw(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env override, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.checked(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.checked(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.checked(name, "u32", |v| parse_u32_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.checked(name, "u64", |v| parse_u64_range(v, min, max))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn apply(pairs: &[(&str, &str)]) -> QuestlineSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = QuestlineSettings::default();
        apply_overrides(&mut settings, |key| vars.get(key).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_objects() {
        let target = json!({"groups": {"maxAttempts": 3, "baseDelayMs": 1000}});
        let source = json!({"groups": {"maxAttempts": 5}});
        let result = deep_merge(target, source);
        assert_eq!(result["groups"]["maxAttempts"], 5);
        assert_eq!(result["groups"]["baseDelayMs"], 1000);
    }

    #[test]
    fn merge_skips_nulls_and_replaces_arrays() {
        let target = json!({"a": 1, "list": [1, 2, 3]});
        let source = json!({"a": null, "list": [9]});
        let result = deep_merge(target, source);
        assert_eq!(result["a"], 1);
        assert_eq!(result["list"], json!([9]));
    }

    #[test]
    fn merge_adds_new_keys() {
        let result = deep_merge(json!({"a": 1}), json!({"b": 2}));
        assert_eq!(result, json!({"a": 1, "b": 2}));
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.server.port, 7071);
        assert_eq!(settings.groups.base_delay_ms, 1_000);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": {{"port": 9000}}, "pubsub": {{"hubName": "guild"}}}}"#
        )
        .unwrap();
        let settings = load_file(file.path()).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.pubsub.hub_name, "guild");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(load_file(file.path()).is_err());
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn overrides_apply_to_every_section() {
        let settings = apply(&[
            ("QUESTLINE_CREDENTIAL_ENDPOINT", "https://example.test/api/negotiate"),
            ("QUESTLINE_CONNECT_ATTEMPTS", "5"),
            ("QUESTLINE_CONNECT_RETRY_DELAY_MS", "250"),
            ("QUESTLINE_TOKEN_REFRESH_MS", "60000"),
            ("QUESTLINE_GROUP_BASE_DELAY_MS", "500"),
            ("QUESTLINE_GROUP_MAX_ATTEMPTS", "4"),
            ("QUESTLINE_HOST", "0.0.0.0"),
            ("QUESTLINE_PORT", "8080"),
            ("QUESTLINE_CONTENT_DIR", "/srv/content"),
            ("AZURE_WEBPUBSUB_CONNECTION_STRING", "Endpoint=https://x;AccessKey=k;"),
            ("AZURE_WEBPUBSUB_HUB_NAME", "guild"),
            ("QUESTLINE_LOG_LEVEL", "debug"),
            ("QUESTLINE_LOG_JSON", "yes"),
        ]);
        assert_eq!(
            settings.client.credential_endpoint,
            "https://example.test/api/negotiate"
        );
        assert_eq!(settings.connection.max_attempts, 5);
        assert_eq!(settings.connection.retry_delay_ms, 250);
        assert_eq!(settings.connection.token_refresh_ms, 60_000);
        assert_eq!(settings.groups.base_delay_ms, 500);
        assert_eq!(settings.groups.max_attempts, 4);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.content_dir, "/srv/content");
        assert_eq!(
            settings.pubsub.connection_string.as_deref(),
            Some("Endpoint=https://x;AccessKey=k;")
        );
        assert_eq!(settings.pubsub.hub_name, "guild");
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let settings = apply(&[
            ("QUESTLINE_CONNECT_ATTEMPTS", "0"),
            ("QUESTLINE_PORT", "70000"),
            ("QUESTLINE_GROUP_MAX_ATTEMPTS", "many"),
            ("QUESTLINE_LOG_JSON", "maybe"),
            ("QUESTLINE_HOST", "   "),
        ]);
        let defaults = QuestlineSettings::default();
        assert_eq!(settings.connection.max_attempts, defaults.connection.max_attempts);
        assert_eq!(settings.server.port, defaults.server.port);
        assert_eq!(settings.groups.max_attempts, defaults.groups.max_attempts);
        assert_eq!(settings.logging.json, defaults.logging.json);
        assert_eq!(settings.server.host, defaults.server.host);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for v in ["true", "1", "YES", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{v}");
        }
        for v in ["false", "0", "No", "OFF"] {
            assert_eq!(parse_bool(v), Some(false), "{v}");
        }
        assert_eq!(parse_bool(""), None);
    }

    #[test]
    fn range_parsers_enforce_bounds() {
        assert_eq!(parse_u16_range("8080", 1, 65535), Some(8080));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u32_range(" 3 ", 1, 10), Some(3));
        assert_eq!(parse_u32_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
    }
}
