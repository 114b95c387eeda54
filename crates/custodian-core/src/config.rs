//! Compliance configuration: a dot-path JSON tree merged over compiled-in
//! defaults, loaded from a single JSON document.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{Value, json};

/// Default TTL, in seconds, for each evidence kind.
pub const DEFAULT_TTL_RAW_DERIVED_REPORT_TMP: u64 = 60 * 60 * 24;
pub const DEFAULT_TTL_EXTERNAL: u64 = 60 * 60 * 24 * 365;

/// Merged configuration: a user document layered over a fixed defaults tree.
#[derive(Debug, Clone)]
pub struct Config {
    user: Value,
    defaults: Value,
}

impl Config {
    /// Load configuration from a JSON file, merged over defaults.
    /// `path = None` uses an empty user document (defaults only).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let user = match path {
            Some(p) => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse config JSON from {}", p.display()))?
            }
            None => json!({}),
        };
        Ok(Self { user, defaults: default_tree() })
    }

    /// Build a config directly from an already-parsed user document, useful
    /// for tests and for the demonstration binary.
    pub fn from_value(user: Value) -> Self {
        Self { user, defaults: default_tree() }
    }

    /// Walk a dot-path (`"locker.branch"`) against the user document, then
    /// the defaults tree. Returns an owned clone — never a reference into
    /// either tree, so callers cannot mutate shared configuration state.
    pub fn get(&self, dotpath: &str) -> Option<Value> {
        walk(&self.user, dotpath).or_else(|| walk(&self.defaults, dotpath)).cloned()
    }

    /// As [`Config::get`], but falls back to `default` rather than `None`.
    pub fn get_or(&self, dotpath: &str, default: Value) -> Value {
        self.get(dotpath).unwrap_or(default)
    }

    /// Convenience: fetch a dot-path as a string.
    pub fn get_str(&self, dotpath: &str) -> Option<String> {
        self.get(dotpath).and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Convenience: fetch a dot-path as a u64.
    pub fn get_u64(&self, dotpath: &str) -> Option<u64> {
        self.get(dotpath).and_then(|v| v.as_u64())
    }

    /// Convenience: fetch a dot-path as a bool.
    pub fn get_bool(&self, dotpath: &str) -> Option<bool> {
        self.get(dotpath).and_then(|v| v.as_bool())
    }

    /// Resolved locker settings, with defaults applied.
    pub fn locker_settings(&self) -> LockerSettings {
        LockerSettings {
            dirname: self.get_str("locker.dirname").unwrap_or_else(|| "compliance_locker".into()),
            repo_url: self.get_str("locker.repo_url"),
            branch: self
                .get_str("locker.branch")
                .or_else(|| self.get_str("locker.default_branch"))
                .unwrap_or_else(|| "master".into()),
            local_path: self.get_str("locker.local_path"),
            ttl_tolerance: self.get_u64("locker.ttl_tolerance").unwrap_or(0),
            depth: self.get_u64("locker.depth"),
            shallow_days: self.get_u64("locker.shallow_days"),
            extra: self
                .get("locker.extra")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default()
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            prev_repo_url: self.get_str("locker.prev_repo_url"),
            force_push: self.get_bool("locker.force_push").unwrap_or(false),
            ignore_signatures: self.get_bool("locker.ignore_signatures").unwrap_or(false),
            large_file_threshold: self.get_u64("locker.large_file_threshold").unwrap_or(5_000_000),
        }
    }

    /// Agent identity configured for this run, if any.
    pub fn agent_name(&self) -> Option<String> {
        self.get_str("agent_name")
    }

    pub fn agent_private_key_path(&self) -> Option<String> {
        self.get_str("agent_private_key")
    }

    pub fn agent_public_key_path(&self) -> Option<String> {
        self.get_str("agent_public_key")
    }

    pub fn use_agent_dir(&self) -> bool {
        self.get_bool("use_agent_dir").unwrap_or(true)
    }

    pub fn org_name(&self) -> String {
        self.get_str("org.name").unwrap_or_else(|| "custodian".into())
    }
}

/// Resolved locker construction parameters.
#[derive(Debug, Clone)]
pub struct LockerSettings {
    pub dirname: String,
    pub repo_url: Option<String>,
    pub branch: String,
    pub local_path: Option<String>,
    pub ttl_tolerance: u64,
    pub depth: Option<u64>,
    pub shallow_days: Option<u64>,
    pub extra: Vec<String>,
    pub prev_repo_url: Option<String>,
    pub force_push: bool,
    pub ignore_signatures: bool,
    pub large_file_threshold: u64,
}

fn walk<'a>(root: &'a Value, dotpath: &str) -> Option<&'a Value> {
    let mut cur = root;
    for segment in dotpath.split('.') {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

fn default_tree() -> Value {
    json!({
        "locker": {
            "branch": "master",
            "ttl_tolerance": 0,
            "force_push": false,
            "ignore_signatures": false,
            "large_file_threshold": 5_000_000,
            "extra": [],
        },
        "runbooks": { "enabled": false },
        "use_agent_dir": true,
        "org": { "name": "custodian" },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_falls_back_to_defaults() {
        let cfg = Config::from_value(json!({}));
        assert_eq!(cfg.get_str("locker.branch").as_deref(), Some("master"));
    }

    #[test]
    fn get_prefers_user_document() {
        let cfg = Config::from_value(json!({"locker": {"branch": "main"}}));
        assert_eq!(cfg.get_str("locker.branch").as_deref(), Some("main"));
    }

    #[test]
    fn get_returns_none_for_unknown_path() {
        let cfg = Config::from_value(json!({}));
        assert_eq!(cfg.get("nope.nope"), None);
    }

    #[test]
    fn get_is_a_deep_copy() {
        let cfg = Config::from_value(json!({"a": {"b": [1, 2, 3]}}));
        let mut first = cfg.get("a.b").unwrap();
        first.as_array_mut().unwrap().push(json!(4));
        let second = cfg.get("a.b").unwrap();
        assert_eq!(second, json!([1, 2, 3]));
    }

    #[test]
    fn locker_settings_applies_defaults() {
        let cfg = Config::from_value(json!({}));
        let settings = cfg.locker_settings();
        assert_eq!(settings.branch, "master");
        assert_eq!(settings.ttl_tolerance, 0);
        assert!(!settings.force_push);
    }

    #[test]
    fn locker_settings_reads_default_branch_alias() {
        let cfg = Config::from_value(json!({"locker": {"default_branch": "trunk"}}));
        assert_eq!(cfg.locker_settings().branch, "trunk");
    }

    #[test]
    fn load_missing_file_errors() {
        let result = Config::load(Some(Path::new("/nonexistent/config.json")));
        assert!(result.is_err());
    }
}
