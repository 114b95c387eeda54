//! The registration surface user code links against: `Fetcher` and `Check`
//! traits registered into a [`Registry`] at startup, replacing the
//! dynamic-import discovery the upstream engine drives off `evidences/`
//! packages and `fetch_`/`test_` prefixed methods. The controls manifest
//! still references checks by a stable string id — here the id a `Check`
//! or `Fetcher` reports via `key()` — rather than a module dot-path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::agent::Agent;
use crate::config::Config;
use crate::credentials::Credentials;
use crate::error::EvidenceError;
use crate::evidence::Evidence;
use crate::fixer::{FixMode, FixOutcome};
use crate::locker::Locker;

/// Produces one piece of evidence from an external system.
pub trait Fetcher: Send + Sync {
    /// Stable id, e.g. `"github.branch_protection.fetch_rules"`.
    fn key(&self) -> &str;

    /// Evidence paths this fetcher reads before it can run. The runner
    /// prefetches these; if one is unavailable the fetcher is queued for
    /// a dependency rerun pass instead of running.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn fetch(&self, ctx: &RunContext) -> Result<Evidence>;
}

/// Asserts properties over one or more pieces of evidence.
pub trait Check: Send + Sync {
    /// Stable id, e.g. `"github.branch_protection.BranchProtectionCheck"`.
    fn key(&self) -> &str;

    /// The `test_*`-equivalent method names this check exposes.
    fn tests(&self) -> Vec<String>;

    fn run(&self, test: &str, ctx: &RunContext) -> Result<CheckReport>;

    /// Report paths (relative to `reports/`) this check class contributes
    /// to, if any.
    fn reports(&self) -> Vec<String> {
        Vec::new()
    }

    /// Attempt to repair a failing test's findings, replacing the
    /// `fix_<test>`-method-or-`fix_failures`-fallback convention with one
    /// method the implementation switches on `test` for. `Ok(None)` means
    /// this test has no associated fix.
    fn fix(&self, _test: &str, _report: &CheckReport, _mode: FixMode, _ctx: &RunContext) -> Result<Option<FixOutcome>> {
        Ok(None)
    }
}

/// One piece of evidence a check consumed, enriched with the commit it was
/// read at — the linkage the report builder and TOC need.
#[derive(Debug, Clone)]
pub struct EvidenceUse {
    pub path: String,
    pub description: String,
    pub last_update: String,
    pub commit_sha: Option<String>,
    pub locker_url: Option<String>,
    pub partitions: Option<Vec<String>>,
}

/// The plain assertion accumulator a check's `test_*` body builds up,
/// replacing exception-as-failure coupling to any particular test harness.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub failures: HashMap<String, Vec<Value>>,
    pub warnings: HashMap<String, Vec<Value>>,
    pub successes: HashMap<String, Vec<Value>>,
    pub evidence_used: Vec<EvidenceUse>,
}

impl CheckReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, section: impl Into<String>, item: Value) {
        self.failures.entry(section.into()).or_default().push(item);
    }

    pub fn warn(&mut self, section: impl Into<String>, item: Value) {
        self.warnings.entry(section.into()).or_default().push(item);
    }

    pub fn succeed(&mut self, section: impl Into<String>, item: Value) {
        self.successes.entry(section.into()).or_default().push(item);
    }

    pub fn failures_count(&self) -> usize {
        self.failures.values().map(Vec::len).sum()
    }

    pub fn warnings_count(&self) -> usize {
        self.warnings.values().map(Vec::len).sum()
    }

    pub fn successes_count(&self) -> usize {
        self.successes.values().map(Vec::len).sum()
    }

    /// `fail` if any failure accumulated, else `warn` if any warning, else
    /// `pass`. An uncaught error during execution is classified separately
    /// by the runner, which never sees this method invoked.
    pub fn status(&self) -> TestStatus {
        if self.failures_count() > 0 {
            TestStatus::Fail
        } else if self.warnings_count() > 0 {
            TestStatus::Warn
        } else {
            TestStatus::Pass
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestStatus {
    Pass,
    Warn,
    Fail,
    Error,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Warn => "warn",
            TestStatus::Fail => "fail",
            TestStatus::Error => "error",
        }
    }
}

/// The collection of fetchers and checks a binary links in.
#[derive(Default)]
pub struct Registry {
    fetchers: Vec<Box<dyn Fetcher>>,
    checks: Vec<Box<dyn Check>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_fetcher(&mut self, fetcher: Box<dyn Fetcher>) -> &mut Self {
        self.fetchers.push(fetcher);
        self
    }

    pub fn register_check(&mut self, check: Box<dyn Check>) -> &mut Self {
        self.checks.push(check);
        self
    }

    pub fn fetchers(&self) -> &[Box<dyn Fetcher>] {
        &self.fetchers
    }

    pub fn checks(&self) -> &[Box<dyn Check>] {
        &self.checks
    }

    pub fn check_by_key(&self, key: &str) -> Option<&dyn Check> {
        self.checks.iter().find(|c| c.key() == key).map(|c| c.as_ref())
    }
}

/// Per-run shared state passed to every fetcher and check: configuration,
/// credentials, the locker handle, and the append-only in-memory evidence
/// cache fetchers populate as they run.
pub struct RunContext {
    pub config: Config,
    pub credentials: Credentials,
    pub agent: Option<Agent>,
    locker: Arc<Mutex<Locker>>,
    cache: Mutex<HashMap<String, Evidence>>,
    rerun_phase: Mutex<bool>,
}

impl RunContext {
    pub fn new(config: Config, credentials: Credentials, agent: Option<Agent>, locker: Locker) -> Self {
        Self {
            config,
            credentials,
            agent,
            locker: Arc::new(Mutex::new(locker)),
            cache: Mutex::new(HashMap::new()),
            rerun_phase: Mutex::new(false),
        }
    }

    pub fn locker(&self) -> Arc<Mutex<Locker>> {
        Arc::clone(&self.locker)
    }

    pub fn set_rerun_phase(&self, active: bool) {
        *self.rerun_phase.lock().unwrap() = active;
    }

    /// Persist evidence: write it through the locker, then cache it.
    /// Double-registration of an already-cached path is rejected unless the
    /// current phase is a dependency rerun.
    pub fn store_evidence(&self, evidence: Evidence) -> Result<Evidence> {
        let path = evidence.path(&self.config);
        {
            let cache = self.cache.lock().unwrap();
            if cache.contains_key(&path) && !*self.rerun_phase.lock().unwrap() {
                anyhow::bail!("evidence {path} was already registered this run");
            }
        }
        self.locker.lock().unwrap().add_evidence(&evidence, &self.config, None, None)?;
        self.cache.lock().unwrap().insert(path, evidence.clone());
        Ok(evidence)
    }

    /// A fetcher's declared dependency: the in-memory cache first (if it
    /// carries content), then the locker without caching the result. Callers
    /// (the runner) turn an `Err` here into a dependency-rerun queue entry.
    pub fn get_evidence_dependency(&self, path: &str) -> Result<Evidence> {
        if let Some(cached) = self.cache.lock().unwrap().get(path) {
            if cached.content.is_some() {
                return Ok(cached.clone());
            }
        }
        let locker = self.locker.lock().unwrap();
        locker
            .get_evidence(&self.config, path, false, None, self.agent.as_ref())
            .map_err(|e| match e.downcast_ref::<EvidenceError>() {
                Some(inner) if inner.is_missing() => {
                    EvidenceError::DependencyUnavailable {
                        fetcher_key: String::new(),
                        evidence_path: path.to_string(),
                    }
                    .into()
                }
                _ => e,
            })
    }

    pub fn get_evidence(
        &self,
        path: &str,
        ignore_ttl: bool,
        evidence_dt: Option<DateTime<Utc>>,
    ) -> Result<Evidence> {
        self.locker.lock().unwrap().get_evidence(&self.config, path, ignore_ttl, evidence_dt, self.agent.as_ref())
    }
}
