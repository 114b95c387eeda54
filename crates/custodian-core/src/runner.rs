//! Two-phase execution: fetchers populate evidence, checks assert properties
//! over it. Fetchers that depend on evidence nothing has produced yet are
//! queued for a bounded dependency-rerun pass rather than failing outright.

use std::collections::HashSet;

use anyhow::Result;
use chrono::Utc;

use crate::controls::Controls;
use crate::error::EvidenceError;
use crate::registry::{CheckReport, Registry, RunContext, TestStatus};

/// Upper bound on dependency-rerun passes, guarding against a fetcher cycle
/// (A needs B, B needs A) spinning forever.
const MAX_RERUN_PASSES: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct FetchFilter {
    pub include: Option<HashSet<String>>,
    pub exclude: HashSet<String>,
}

impl FetchFilter {
    fn allows(&self, key: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.contains(key) {
                return false;
            }
        }
        !self.exclude.contains(key)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherOutcome {
    pub key: String,
    pub status: FetcherStatus,
}

#[derive(Debug, Clone)]
pub enum FetcherStatus {
    Ok,
    DependencyUnavailable { evidence_path: String },
    Error { detail: String },
}

#[derive(Debug, Clone, Default)]
pub struct FetchPhaseResult {
    pub outcomes: Vec<FetcherOutcome>,
    pub unresolved: HashSet<String>,
}

impl FetchPhaseResult {
    /// Mirrors the primary run's success rule: a run is successful if every
    /// error seen was a dependency-unavailable error (those get a rerun
    /// pass) and the rerun loop resolved all of them in the end.
    pub fn success(&self) -> bool {
        self.unresolved.is_empty()
            && !self
                .outcomes
                .iter()
                .any(|o| matches!(o.status, FetcherStatus::Error { .. }))
    }
}

/// Run every registered fetcher once, skipped by `filter`, then keep
/// rerunning the subset that reported a dependency-unavailable error until
/// the rerun set empties, stops shrinking, or hits the iteration bound.
pub fn run_fetch_phase(registry: &Registry, ctx: &RunContext, filter: &FetchFilter) -> FetchPhaseResult {
    ctx.set_rerun_phase(false);
    let mut result = FetchPhaseResult::default();
    result.outcomes = run_fetchers(registry, ctx, filter, None);

    let mut previous: HashSet<String> = HashSet::new();
    let mut reruns = ctx.locker().lock().unwrap().dependency_reruns();
    let mut pass = 1u32;
    ctx.set_rerun_phase(true);
    while !reruns.is_empty() && reruns != previous && pass <= MAX_RERUN_PASSES {
        ctx.locker().lock().unwrap().reset_dependency_rerun();
        let pass_outcomes = run_fetchers(registry, ctx, filter, Some(&reruns));
        result.outcomes.extend(pass_outcomes);
        previous = reruns.clone();
        reruns = ctx.locker().lock().unwrap().dependency_reruns();
        pass += 1;
    }
    ctx.set_rerun_phase(false);
    result.unresolved = reruns;
    result
}

/// Run one pass over the registry's fetchers. `only` restricts the pass to
/// the given fetcher keys (a dependency-rerun pass); `None` runs everything
/// `filter` allows.
fn run_fetchers(
    registry: &Registry,
    ctx: &RunContext,
    filter: &FetchFilter,
    only: Option<&HashSet<String>>,
) -> Vec<FetcherOutcome> {
    registry
        .fetchers()
        .iter()
        .filter(|f| only.map(|set| set.contains(f.key())).unwrap_or_else(|| filter.allows(f.key())))
        .map(|fetcher| {
            let status = match fetcher.fetch(ctx) {
                Ok(evidence) => match ctx.store_evidence(evidence) {
                    Ok(_) => FetcherStatus::Ok,
                    Err(e) => FetcherStatus::Error { detail: e.to_string() },
                },
                Err(e) => match e.downcast_ref::<EvidenceError>() {
                    Some(EvidenceError::DependencyUnavailable { evidence_path, .. }) => {
                        ctx.locker().lock().unwrap().add_dependency_rerun(fetcher.key());
                        FetcherStatus::DependencyUnavailable { evidence_path: evidence_path.clone() }
                    }
                    _ => FetcherStatus::Error { detail: e.to_string() },
                },
            };
            FetcherOutcome { key: fetcher.key().to_string(), status }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct CheckRunOutcome {
    pub check_key: String,
    pub test: String,
    pub status: TestStatus,
    pub report: CheckReport,
    pub timestamp: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct CheckPhaseResult {
    pub outcomes: Vec<CheckRunOutcome>,
    /// Checks named by the controls manifest for the requested
    /// accreditations that no registered `Check` provides.
    pub missing: Vec<String>,
}

impl CheckPhaseResult {
    pub fn success(&self) -> bool {
        !self.outcomes.iter().any(|o| o.status == TestStatus::Error)
    }
}

/// Run every test of every registered check whose key intersects
/// `accreditations` per `controls`, then report any check the manifest names
/// for those accreditations that nothing in the registry provides.
pub fn run_check_phase(
    registry: &Registry,
    ctx: &RunContext,
    controls: &Controls,
    accreditations: &HashSet<String>,
) -> CheckPhaseResult {
    let mut result = CheckPhaseResult::default();
    let mut found = HashSet::new();

    for check in registry.checks() {
        let key = check.key();
        if !controls.is_test_included(key, accreditations) {
            continue;
        }
        found.insert(key.to_string());
        for test in check.tests() {
            let timestamp = Utc::now();
            let (status, report) = match check.run(&test, ctx) {
                Ok(report) => (report.status(), report),
                Err(_) => (TestStatus::Error, CheckReport::new()),
            };
            result.outcomes.push(CheckRunOutcome {
                check_key: key.to_string(),
                test,
                status,
                report,
                timestamp,
            });
        }
    }

    let mut expected = HashSet::new();
    for (accred, checks) in controls.accred_checks() {
        if accreditations.contains(&accred) {
            expected.extend(checks);
        }
    }
    for missing in expected.difference(&found) {
        result.missing.push(missing.clone());
    }
    result.missing.sort();

    result
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::config::Config;
    use crate::credentials::Credentials;
    use crate::evidence::{Evidence, Kind};
    use crate::locker::{Locker, LockerOptions};
    use crate::registry::Fetcher;

    struct OkFetcher;
    impl Fetcher for OkFetcher {
        fn key(&self) -> &str {
            "pkg.OkFetcher"
        }
        fn fetch(&self, _ctx: &RunContext) -> Result<Evidence> {
            let mut evidence = Evidence::new(Kind::Raw, "svc", "output.json");
            evidence.set_content(Some(json!({"a": 1}).to_string().into_bytes()), false, None)?;
            Ok(evidence)
        }
    }

    struct DependentFetcher;
    impl Fetcher for DependentFetcher {
        fn key(&self) -> &str {
            "pkg.DependentFetcher"
        }
        fn dependencies(&self) -> Vec<String> {
            vec!["raw/svc/output.json".to_string()]
        }
        fn fetch(&self, ctx: &RunContext) -> Result<Evidence> {
            ctx.get_evidence_dependency("raw/svc/output.json")?;
            let mut evidence = Evidence::new(Kind::Raw, "svc", "followup.json");
            evidence.set_content(Some(json!({"b": 2}).to_string().into_bytes()), false, None)?;
            Ok(evidence)
        }
    }

    fn make_ctx() -> (tempfile::TempDir, RunContext) {
        let td = tempdir().unwrap();
        let mut locker = Locker::new(LockerOptions { local_path: Some(td.path().to_path_buf()), ..Default::default() });
        locker.init().unwrap();
        let ctx = RunContext::new(Config::from_value(json!({})), Credentials::default(), None, locker);
        (td, ctx)
    }

    #[test]
    #[serial]
    fn dependent_fetcher_resolves_after_rerun() {
        let (_td, ctx) = make_ctx();
        let mut registry = Registry::new();
        registry.register_fetcher(Box::new(DependentFetcher));
        registry.register_fetcher(Box::new(OkFetcher));

        let result = run_fetch_phase(&registry, &ctx, &FetchFilter::default());
        assert!(result.success());
        assert!(result.unresolved.is_empty());
    }

    #[test]
    #[serial]
    fn unresolvable_dependency_is_reported() {
        let (_td, ctx) = make_ctx();
        let mut registry = Registry::new();
        registry.register_fetcher(Box::new(DependentFetcher));

        let result = run_fetch_phase(&registry, &ctx, &FetchFilter::default());
        assert!(!result.success());
        assert!(result.unresolved.contains("pkg.DependentFetcher"));
    }

    #[test]
    #[serial]
    fn fetch_filter_excludes_by_key() {
        let (_td, ctx) = make_ctx();
        let mut registry = Registry::new();
        registry.register_fetcher(Box::new(OkFetcher));
        let filter = FetchFilter { include: None, exclude: HashSet::from(["pkg.OkFetcher".to_string()]) };

        let result = run_fetch_phase(&registry, &ctx, &filter);
        assert!(result.outcomes.is_empty());
    }

    struct PassingCheck;
    impl crate::registry::Check for PassingCheck {
        fn key(&self) -> &str {
            "pkg.PassingCheck"
        }
        fn tests(&self) -> Vec<String> {
            vec!["test_one".to_string()]
        }
        fn run(&self, _test: &str, _ctx: &RunContext) -> Result<CheckReport> {
            Ok(CheckReport::new())
        }
    }

    #[test]
    #[serial]
    fn check_phase_reports_pass_and_missing() {
        let (_td, ctx) = make_ctx();
        let mut registry = Registry::new();
        registry.register_check(Box::new(PassingCheck));
        let controls = Controls::from_value(json!({
            "pkg.PassingCheck": ["soc2"],
            "pkg.MissingCheck": ["soc2"],
        }))
        .unwrap();

        let result = run_check_phase(&registry, &ctx, &controls, &HashSet::from(["soc2".to_string()]));
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].status, TestStatus::Pass);
        assert_eq!(result.missing, vec!["pkg.MissingCheck".to_string()]);
    }

    #[test]
    #[serial]
    fn check_phase_skips_checks_outside_accreditation() {
        let (_td, ctx) = make_ctx();
        let mut registry = Registry::new();
        registry.register_check(Box::new(PassingCheck));
        let controls = Controls::from_value(json!({"pkg.PassingCheck": ["iso27001"]})).unwrap();

        let result = run_check_phase(&registry, &ctx, &controls, &HashSet::from(["soc2".to_string()]));
        assert!(result.outcomes.is_empty());
    }
}
