//! Tool-result masking: regex patterns and pattern groups applied to a tool
//! response before it reaches the LLM, logs, or storage (spec §4.6).
//!
//! The pattern *library* (which regexes exist, their names and groupings) is
//! out of scope and supplied as config; this module is the masking engine.

use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FAILSAFE_SENTINEL: &str = "***MASKED_ERROR***";

/// First-class built-in pattern recognizing the `data` section of a
/// serialized Kubernetes Secret object, independent of whatever custom
/// regexes a deployment configures.
const KUBERNETES_SECRET_PATTERN: &str = r#""data"\s*:\s*\{[^}]*\}"#;
const KUBERNETES_SECRET_REPLACEMENT: &str = r#""data": "***MASKED_SECRET***""#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskingPattern {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MaskingConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Named groups of built-in patterns, expanded at load time.
    #[serde(default)]
    pub pattern_groups: Vec<String>,
    /// Individual built-in pattern names.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub custom_patterns: Vec<MaskingPattern>,
    /// Applies the Kubernetes Secret `data` masker unconditionally.
    #[serde(default)]
    pub mask_kubernetes_secrets: bool,
}

struct CompiledPattern {
    regex: Regex,
    replacement: String,
}

/// Applies configured masking patterns to tool results. One instance per
/// process; patterns are compiled once up front.
pub struct Masker {
    compiled: HashMap<String, CompiledPattern>,
    pattern_groups: HashMap<String, Vec<String>>,
}

impl Masker {
    pub fn new(builtin_patterns: HashMap<String, MaskingPattern>, pattern_groups: HashMap<String, Vec<String>>) -> Self {
        let mut compiled = HashMap::new();
        for (name, p) in builtin_patterns {
            match Regex::new(&p.pattern) {
                Ok(regex) => {
                    compiled.insert(name, CompiledPattern { regex, replacement: p.replacement });
                }
                Err(e) => {
                    tracing::error!(pattern = %name, error = %e, "failed to compile built-in masking pattern, skipping");
                }
            }
        }
        Self { compiled, pattern_groups }
    }

    /// Applies `config` to `response`, returning the masked value. A
    /// reference to an unknown pattern/group name, or a custom pattern that
    /// fails to compile, is a masking failure: rather than silently masking
    /// only what it could, the whole response is replaced with
    /// [`FAILSAFE_SENTINEL`] (spec §4.6 fail-safe behavior, testable
    /// property 8).
    pub fn mask_response(&mut self, response: &Value, config: &MaskingConfig, server_name: &str) -> Value {
        if !config.enabled {
            return response.clone();
        }
        let _ = server_name;
        match self.mask_response_inner(response, config) {
            Ok(masked) => masked,
            Err(()) => Self::failsafe(response),
        }
    }

    fn mask_response_inner(&mut self, response: &Value, config: &MaskingConfig) -> Result<Value, ()> {
        let mut names: Vec<String> = Vec::new();
        for group in &config.pattern_groups {
            match self.pattern_groups.get(group) {
                Some(members) => names.extend(members.iter().cloned()),
                None => {
                    tracing::error!(group = %group, "unknown masking pattern group referenced, failing safe");
                    return Err(());
                }
            }
        }
        for pattern in &config.patterns {
            if !self.compiled.contains_key(pattern) {
                tracing::error!(pattern = %pattern, "unknown masking pattern referenced, failing safe");
                return Err(());
            }
            names.push(pattern.clone());
        }

        for custom in &config.custom_patterns {
            if !custom.enabled {
                continue;
            }
            let key = format!("custom_{}", custom.name);
            if !self.compiled.contains_key(&key) {
                match Regex::new(&custom.pattern) {
                    Ok(regex) => {
                        self.compiled.insert(
                            key.clone(),
                            CompiledPattern { regex, replacement: custom.replacement.clone() },
                        );
                    }
                    Err(e) => {
                        tracing::error!(pattern = %custom.name, error = %e, "failed to compile custom masking pattern, failing safe");
                        return Err(());
                    }
                }
            }
            names.push(key);
        }

        dedup_preserve_order(&mut names);

        let mut masked = mask_value(response, &names, &self.compiled);
        if config.mask_kubernetes_secrets {
            masked = mask_kubernetes_secrets(&masked);
        }
        Ok(masked)
    }

    pub(crate) fn failsafe(response: &Value) -> Value {
        if response.get("result").is_some() {
            serde_json::json!({ "result": FAILSAFE_SENTINEL })
        } else {
            serde_json::json!({ "masked_response": FAILSAFE_SENTINEL })
        }
    }
}

fn dedup_preserve_order(names: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
}

fn mask_value(value: &Value, pattern_names: &[String], compiled: &HashMap<String, CompiledPattern>) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), mask_value(v, pattern_names, compiled));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| mask_value(v, pattern_names, compiled)).collect()),
        Value::String(s) => Value::String(apply_patterns(s, pattern_names, compiled)),
        other => other.clone(),
    }
}

fn apply_patterns(text: &str, pattern_names: &[String], compiled: &HashMap<String, CompiledPattern>) -> String {
    let mut masked = text.to_string();
    for name in pattern_names {
        if let Some(p) = compiled.get(name) {
            masked = p.regex.replace_all(&masked, p.replacement.as_str()).into_owned();
        }
    }
    masked
}

fn mask_kubernetes_secrets(value: &Value) -> Value {
    let regex = Regex::new(KUBERNETES_SECRET_PATTERN).expect("static pattern is valid");
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), mask_kubernetes_secrets(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(mask_kubernetes_secrets).collect()),
        Value::String(s) => Value::String(regex.replace_all(s, KUBERNETES_SECRET_REPLACEMENT).into_owned()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key_masker() -> Masker {
        let mut builtin = HashMap::new();
        builtin.insert(
            "api_key".to_string(),
            MaskingPattern {
                name: "api_key".into(),
                pattern: r"sk_test_[A-Za-z0-9]+".into(),
                replacement: "***MASKED_API_KEY***".into(),
                enabled: true,
            },
        );
        let mut groups = HashMap::new();
        groups.insert("secrets".to_string(), vec!["api_key".to_string()]);
        Masker::new(builtin, groups)
    }

    #[test]
    fn api_key_is_masked_via_pattern_group() {
        let mut masker = api_key_masker();
        let config = MaskingConfig {
            enabled: true,
            pattern_groups: vec!["secrets".into()],
            ..Default::default()
        };
        let response = serde_json::json!({ "result": "api_key: sk_test_0000000000000000" });
        let masked = masker.mask_response(&response, &config, "test-server");
        assert_eq!(masked["result"], "api_key: ***MASKED_API_KEY***");
    }

    #[test]
    fn masking_is_idempotent() {
        let mut masker = api_key_masker();
        let config = MaskingConfig {
            enabled: true,
            pattern_groups: vec!["secrets".into()],
            ..Default::default()
        };
        let response = serde_json::json!({ "result": "api_key: sk_test_0000000000000000" });
        let once = masker.mask_response(&response, &config, "test-server");
        let twice = masker.mask_response(&once, &config, "test-server");
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_pattern_name_fails_safe() {
        let mut masker = api_key_masker();
        let config = MaskingConfig {
            enabled: true,
            patterns: vec!["does-not-exist".into()],
            ..Default::default()
        };
        let response = serde_json::json!({ "result": "api_key: sk_test_0000000000000000" });
        let masked = masker.mask_response(&response, &config, "test-server");
        assert_eq!(masked, serde_json::json!({ "result": FAILSAFE_SENTINEL }));
    }

    #[test]
    fn unknown_pattern_group_fails_safe() {
        let mut masker = api_key_masker();
        let config = MaskingConfig {
            enabled: true,
            pattern_groups: vec!["does-not-exist".into()],
            ..Default::default()
        };
        let response = serde_json::json!({ "other": "no result key here" });
        let masked = masker.mask_response(&response, &config, "test-server");
        assert_eq!(masked, serde_json::json!({ "masked_response": FAILSAFE_SENTINEL }));
    }

    #[test]
    fn disabled_masking_passes_through_unchanged() {
        let mut masker = api_key_masker();
        let config = MaskingConfig { enabled: false, ..Default::default() };
        let response = serde_json::json!({ "result": "api_key: sk_test_0000000000000000" });
        let masked = masker.mask_response(&response, &config, "test-server");
        assert_eq!(masked, response);
    }
}
