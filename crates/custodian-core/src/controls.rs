//! Accreditation manifest (`controls.json`): answers "is this check part of
//! accreditation X?" The manifest is a JSON object mapping a check id to
//! either a flat list of accreditations, or a nested `{group: {subgroup:
//! [accr, ...]}}` tree — both shapes reduce to a flat accreditation set per
//! check id at load time.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct Controls {
    by_check: HashMap<String, HashSet<String>>,
}

impl Controls {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read controls manifest {}", path.display()))?;
        let doc: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse controls manifest {}", path.display()))?;
        Self::from_value(doc)
    }

    pub fn from_value(doc: Value) -> Result<Self> {
        let Value::Object(map) = doc else {
            anyhow::bail!("controls manifest must be a JSON object");
        };
        let mut by_check = HashMap::new();
        for (check_id, accrs) in map {
            by_check.insert(check_id, flatten(&accrs));
        }
        Ok(Self { by_check })
    }

    /// The flat accreditation set for `check_id`, empty if unknown.
    pub fn accreditations(&self, check_id: &str) -> HashSet<String> {
        self.by_check.get(check_id).cloned().unwrap_or_default()
    }

    /// Whether `check_id`'s accreditations intersect `accrs`.
    pub fn is_test_included(&self, check_id: &str, accrs: &HashSet<String>) -> bool {
        if accrs.is_empty() {
            return true;
        }
        self.accreditations(check_id).iter().any(|a| accrs.contains(a))
    }

    /// `{accreditation -> {check_id, ...}}`, the inverse of the manifest.
    pub fn accred_checks(&self) -> HashMap<String, HashSet<String>> {
        let mut inverse: HashMap<String, HashSet<String>> = HashMap::new();
        for (check_id, accrs) in &self.by_check {
            for accr in accrs {
                inverse.entry(accr.clone()).or_default().insert(check_id.clone());
            }
        }
        inverse
    }
}

/// Flatten either a `["accr", ...]` list or a `{group: {subgroup: [...]}}`
/// tree into the union of its leaf strings.
fn flatten(value: &Value) -> HashSet<String> {
    match value {
        Value::String(s) => HashSet::from([s.clone()]),
        Value::Array(items) => items.iter().flat_map(flatten).collect(),
        Value::Object(map) => map.values().flat_map(flatten).collect(),
        _ => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn flat_list_shape() {
        let controls = Controls::from_value(json!({
            "pkg.Check.test_a": ["soc2", "iso27001"]
        }))
        .unwrap();
        assert_eq!(
            controls.accreditations("pkg.Check.test_a"),
            HashSet::from(["soc2".to_string(), "iso27001".to_string()])
        );
    }

    #[test]
    fn nested_group_shape_flattens() {
        let controls = Controls::from_value(json!({
            "pkg.Check.test_b": {"cloud": {"region1": ["soc2"], "region2": ["iso27001"]}}
        }))
        .unwrap();
        assert_eq!(
            controls.accreditations("pkg.Check.test_b"),
            HashSet::from(["soc2".to_string(), "iso27001".to_string()])
        );
    }

    #[test]
    fn is_test_included_checks_intersection() {
        let controls = Controls::from_value(json!({"c": ["soc2"]})).unwrap();
        assert!(controls.is_test_included("c", &HashSet::from(["soc2".to_string()])));
        assert!(!controls.is_test_included("c", &HashSet::from(["iso27001".to_string()])));
    }

    #[test]
    fn unknown_check_has_empty_accreditations() {
        let controls = Controls::from_value(json!({})).unwrap();
        assert!(controls.accreditations("unknown").is_empty());
    }

    #[test]
    fn accred_checks_inverts_the_manifest() {
        let controls = Controls::from_value(json!({
            "a": ["soc2"],
            "b": ["soc2", "iso27001"],
        }))
        .unwrap();
        let inverse = controls.accred_checks();
        assert_eq!(inverse["soc2"], HashSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(inverse["iso27001"], HashSet::from(["b".to_string()]));
    }
}
