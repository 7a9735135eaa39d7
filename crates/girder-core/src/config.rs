//! The dynamic build-config document.
//!
//! Jobs carry an opaque JSON document describing how to run a build; it is
//! stored and shipped as raw JSON and only parsed into this struct at the
//! point of interpretation (the agent's executor). Unknown fields are
//! tolerated for forward compatibility.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Parsed form of a job's `build_config` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Container image to run the commands in.
    #[serde(default)]
    pub image: Option<String>,
    /// Shell commands executed in order; the build fails on the first
    /// non-zero exit.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Path or glob of artifacts to collect from the workspace.
    #[serde(default)]
    pub artifacts: Option<String>,
    /// Extra environment variables for the build.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BuildConfig {
    /// Parse the frozen JSON copy carried on a build row. A document that
    /// does not match the expected shape yields the default config rather
    /// than an error; the executor substitutes its own defaults.
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_full_document() {
        let config = BuildConfig::from_value(&json!({
            "image": "rust:1.85",
            "commands": ["cargo build", "cargo test"],
            "artifacts": "target/release/*.tar.gz",
            "env": {"CI": "true"}
        }));
        assert_eq!(config.image.as_deref(), Some("rust:1.85"));
        assert_eq!(config.commands.len(), 2);
        assert_eq!(config.artifacts.as_deref(), Some("target/release/*.tar.gz"));
        assert_eq!(config.env.get("CI").map(String::as_str), Some("true"));
    }

    #[test]
    fn tolerates_unknown_fields() {
        let config = BuildConfig::from_value(&json!({
            "commands": ["make"],
            "cache_key": "v2",
            "notify": {"slack": "#builds"}
        }));
        assert_eq!(config.commands, vec!["make".to_string()]);
        assert!(config.image.is_none());
    }

    #[test]
    fn empty_and_malformed_documents_fall_back_to_default() {
        assert_eq!(BuildConfig::from_value(&json!({})), BuildConfig::default());
        assert_eq!(BuildConfig::from_value(&json!(null)), BuildConfig::default());
        assert_eq!(
            BuildConfig::from_value(&json!({"commands": "not-a-list"})),
            BuildConfig::default()
        );
    }
}
