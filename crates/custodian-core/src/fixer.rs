//! Repairs check failures. Replaces the `fix_<test>`-method-or-single-
//! `fix_failures`-fallback convention with one [`Check::fix`] method per
//! check, given the failing test's name and report; the implementation
//! decides which findings it knows how to repair.

use anyhow::Result;

use crate::registry::{Registry, RunContext, TestStatus};
use crate::runner::CheckPhaseResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMode {
    /// Report what would be done without doing it.
    DryRun,
    Apply,
}

/// One repair a `Check::fix` call performed or would perform.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    /// Human-readable description of the repair, already interpolated with
    /// whatever arguments the fix needed — shown as-is in dry-run mode.
    pub description: String,
    /// Whether the repair was actually applied. Always `false` in dry-run.
    pub fixed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FixSummary {
    pub attempted: usize,
    pub fixed: usize,
    pub descriptions: Vec<String>,
}

/// Walk every failing test in `results`, asking the check that produced it
/// to repair what it can. Errors from an individual fix are reported and
/// skipped rather than aborting the rest of the pass.
pub fn run_fixers(registry: &Registry, ctx: &RunContext, results: &CheckPhaseResult, mode: FixMode) -> FixSummary {
    let mut summary = FixSummary::default();
    for outcome in &results.outcomes {
        if outcome.status != TestStatus::Fail {
            continue;
        }
        let Some(check) = registry.check_by_key(&outcome.check_key) else {
            continue;
        };
        match check.fix(&outcome.test, &outcome.report, mode, ctx) {
            Ok(Some(fix)) => {
                summary.attempted += 1;
                if mode == FixMode::DryRun {
                    println!("DRY-RUN: {}", fix.description);
                } else if fix.fixed {
                    summary.fixed += 1;
                }
                summary.descriptions.push(fix.description);
            }
            Ok(None) => {}
            Err(e) => eprintln!("fix for {} ({}) failed: {e:#}", outcome.test, outcome.check_key),
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;
    use crate::config::Config;
    use crate::controls::Controls;
    use crate::credentials::Credentials;
    use crate::locker::{Locker, LockerOptions};
    use crate::registry::{Check, CheckReport};
    use crate::runner::run_check_phase;
    use std::collections::HashSet;

    struct FailingCheck;
    impl Check for FailingCheck {
        fn key(&self) -> &str {
            "pkg.FailingCheck"
        }
        fn tests(&self) -> Vec<String> {
            vec!["test_widgets".to_string()]
        }
        fn run(&self, _test: &str, _ctx: &RunContext) -> Result<CheckReport> {
            let mut report = CheckReport::new();
            report.fail("widgets", json!({"id": 1}));
            Ok(report)
        }
        fn fix(
            &self,
            test: &str,
            report: &CheckReport,
            mode: FixMode,
            _ctx: &RunContext,
        ) -> Result<Option<FixOutcome>> {
            if test != "test_widgets" {
                return Ok(None);
            }
            let count = report.failures.get("widgets").map(Vec::len).unwrap_or(0);
            Ok(Some(FixOutcome {
                description: format!("would repair {count} widget(s)"),
                fixed: mode == FixMode::Apply,
            }))
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
    fn dry_run_reports_without_fixing() {
        let (_td, ctx) = make_ctx();
        let mut registry = Registry::new();
        registry.register_check(Box::new(FailingCheck));
        let controls = Controls::from_value(json!({"pkg.FailingCheck": ["soc2"]})).unwrap();
        let results = run_check_phase(&registry, &ctx, &controls, &HashSet::from(["soc2".to_string()]));

        let summary = run_fixers(&registry, &ctx, &results, FixMode::DryRun);
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.fixed, 0);
        assert_eq!(summary.descriptions, vec!["would repair 1 widget(s)".to_string()]);
    }

    #[test]
    #[serial]
    fn apply_mode_counts_as_fixed() {
        let (_td, ctx) = make_ctx();
        let mut registry = Registry::new();
        registry.register_check(Box::new(FailingCheck));
        let controls = Controls::from_value(json!({"pkg.FailingCheck": ["soc2"]})).unwrap();
        let results = run_check_phase(&registry, &ctx, &controls, &HashSet::from(["soc2".to_string()]));

        let summary = run_fixers(&registry, &ctx, &results, FixMode::Apply);
        assert_eq!(summary.fixed, 1);
    }
}
