//! Credential resolution: a keyed bag of `[section] field = value` values,
//! each lookup preferring an environment variable named `SECTION_FIELD`
//! over the on-disk store. Mirrors the env-first-then-file precedence used
//! for registry token resolution, generalized from one fixed section
//! (`crates-io`/registry name) to an arbitrary keyed bag.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::EvidenceError;

/// Where a resolved credential value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Env,
    File,
}

pub const DEFAULT_CREDENTIALS_FILE: &str = "~/.credentials";

/// A credentials bag backed by a TOML file of keyed sections.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    sections: HashMap<String, HashMap<String, String>>,
    source_path: Option<PathBuf>,
}

impl Credentials {
    /// Load from `path` (default `~/.credentials`, tilde-expanded). A
    /// missing file is not an error — it yields an empty bag, since every
    /// field may still resolve from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(p) => expand_home(p),
            None => expand_home(Path::new(DEFAULT_CREDENTIALS_FILE)),
        };

        if !resolved.is_file() {
            return Ok(Self { sections: HashMap::new(), source_path: Some(resolved) });
        }

        let raw = std::fs::read_to_string(&resolved)
            .with_context(|| format!("failed to read credentials file {}", resolved.display()))?;
        Self::from_toml_str(&raw, Some(resolved))
    }

    pub fn from_toml_str(raw: &str, source_path: Option<PathBuf>) -> Result<Self> {
        let parsed: toml::Value = toml::from_str(raw).context("failed to parse credentials TOML")?;
        let mut sections = HashMap::new();
        if let Some(table) = parsed.as_table() {
            for (section, value) in table {
                let mut fields = HashMap::new();
                if let Some(section_table) = value.as_table() {
                    for (key, v) in section_table {
                        if let Some(s) = v.as_str() {
                            fields.insert(key.clone(), s.to_string());
                        }
                    }
                }
                sections.insert(section.clone(), fields);
            }
        }
        Ok(Self { sections, source_path })
    }

    /// Resolve `section.field`: environment variable `SECTION_FIELD`
    /// (section and field upper-cased) first, then the file-backed bag.
    /// Errors naming section, field, and the source checked when absent
    /// from both.
    pub fn get(&self, section: &str, field: &str) -> Result<String> {
        self.get_opt(section, field).ok_or_else(|| {
            EvidenceError::Misconfiguration {
                detail: format!("credential {section}.{field} is not set"),
                pointer: self
                    .source_path
                    .as_ref()
                    .map(|p| format!("env {} or {}", env_var_name(section, field), p.display()))
                    .unwrap_or_else(|| format!("env {}", env_var_name(section, field))),
            }
            .into()
        })
    }

    pub fn get_opt(&self, section: &str, field: &str) -> Option<String> {
        self.get_with_source(section, field).map(|(value, _)| value)
    }

    pub fn get_with_source(&self, section: &str, field: &str) -> Option<(String, CredentialSource)> {
        if let Ok(value) = env::var(env_var_name(section, field)) {
            if !value.is_empty() {
                return Some((value, CredentialSource::Env));
            }
        }
        self.sections
            .get(section)
            .and_then(|fields| fields.get(field))
            .map(|v| (v.clone(), CredentialSource::File))
    }

    /// Every field set for `section`, environment overrides merged over the
    /// file-backed values (`SECTION_` prefixed env vars take the suffix as
    /// the field name, lower-cased).
    pub fn section(&self, section: &str) -> HashMap<String, String> {
        let mut merged = self.sections.get(section).cloned().unwrap_or_default();
        let prefix = format!("{}_", section.to_uppercase());
        for (key, value) in env::vars() {
            if let Some(field) = key.strip_prefix(&prefix) {
                merged.insert(field.to_lowercase(), value);
            }
        }
        merged
    }
}

fn env_var_name(section: &str, field: &str) -> String {
    format!("{}_{}", section.to_uppercase(), field.to_uppercase())
}

fn expand_home(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else { return path.to_path_buf() };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use temp_env::with_var;

    use super::*;

    #[test]
    fn file_backed_value_resolves() {
        let creds = Credentials::from_toml_str(
            "[github]\ntoken = \"filetoken\"\n",
            None,
        )
        .unwrap();
        assert_eq!(creds.get("github", "token").unwrap(), "filetoken");
    }

    #[test]
    fn env_var_overrides_file() {
        let creds = Credentials::from_toml_str("[github]\ntoken = \"filetoken\"\n", None).unwrap();
        with_var("GITHUB_TOKEN", Some("envtoken"), || {
            assert_eq!(creds.get("github", "token").unwrap(), "envtoken");
        });
    }

    #[test]
    fn missing_field_is_a_named_misconfiguration() {
        let creds = Credentials::from_toml_str("[github]\n", None).unwrap();
        let err = creds.get("github", "token").unwrap_err();
        assert!(err.to_string().contains("github.token"));
    }

    #[test]
    fn section_merges_env_overlays() {
        let creds = Credentials::from_toml_str("[gitlab]\ntoken = \"a\"\nhost = \"b\"\n", None).unwrap();
        with_var("GITLAB_TOKEN", Some("override"), || {
            let section = creds.section("gitlab");
            assert_eq!(section.get("token").unwrap(), "override");
            assert_eq!(section.get("host").unwrap(), "b");
        });
    }
}
