//! Worked example proving the registration surface end to end: one
//! fetcher performs a real HTTP GET against a public, stable, no-auth
//! endpoint; one check reads the evidence back through the locker and
//! always flags something, on purpose, to exercise every status path.

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use custodian_core::config::Config;
use custodian_core::controls::Controls;
use custodian_core::credentials::Credentials;
use custodian_core::evidence::{Evidence, Kind};
use custodian_core::locker::{Locker, LockerOptions};
use custodian_core::notify::{StreamNotifier, messages_by_accreditation};
use custodian_core::registry::{Check, CheckReport, EvidenceUse, Fetcher, Registry, RunContext};
use custodian_core::report::ReportBuilder;
use custodian_core::runner::{FetchFilter, run_check_phase, run_fetch_phase};

const MANIFEST_DIR: &str = env!("CARGO_MANIFEST_DIR");
const EVIDENCE_PATH: &str = "raw/time/world_clock_utc.json";

struct WorldClockFetcher;

impl Fetcher for WorldClockFetcher {
    fn key(&self) -> &str {
        "demo.WorldClockFetcher"
    }

    fn fetch(&self, ctx: &RunContext) -> Result<Evidence> {
        let url = ctx
            .config
            .get_str("demo.world_clock_url")
            .unwrap_or_else(|| "http://worldclockapi.com/api/json/utc/now".to_string());
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(ctx.config.org_name())
            .build()
            .context("building world clock HTTP client")?;
        let body = client
            .get(&url)
            .send()
            .context("fetching world clock evidence")?
            .error_for_status()
            .context("world clock API returned an error status")?
            .text()
            .context("reading world clock response body")?;

        let mut evidence = Evidence::new(Kind::Raw, "time", "world_clock_utc.json");
        evidence.description = "Current UTC time, as reported by a public world-clock API".to_string();
        evidence.set_content(Some(body.into_bytes()), true, ctx.agent.as_ref())?;
        Ok(evidence)
    }
}

struct WorldClockCheck;

impl WorldClockCheck {
    fn evidence_used(&self, ctx: &RunContext) -> Result<EvidenceUse> {
        let locker = ctx.locker();
        let locker = locker.lock().unwrap();
        let meta = locker.get_evidence_metadata(EVIDENCE_PATH, None)?.unwrap_or(Value::Null);
        let commit_sha = locker.head_commit().ok().flatten();
        Ok(EvidenceUse {
            path: EVIDENCE_PATH.to_string(),
            description: meta.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
            last_update: meta.get("last_update").and_then(Value::as_str).unwrap_or_default().to_string(),
            commit_sha: commit_sha.clone(),
            locker_url: Some(locker.remote_location(EVIDENCE_PATH, commit_sha.as_deref(), None)),
            partitions: None,
        })
    }
}

impl Check for WorldClockCheck {
    fn key(&self) -> &str {
        "demo.WorldClockCheck"
    }

    fn tests(&self) -> Vec<String> {
        vec!["test_day_of_year".to_string(), "test_day_of_week".to_string()]
    }

    fn reports(&self) -> Vec<String> {
        vec!["time/world_clock.md".to_string()]
    }

    fn run(&self, test: &str, ctx: &RunContext) -> Result<CheckReport> {
        let evidence = ctx.get_evidence(EVIDENCE_PATH, false, None)?;
        let content = evidence.content.unwrap_or_default();
        let doc: Value = serde_json::from_slice(&content).context("world clock evidence is not valid JSON")?;

        let mut report = CheckReport::new();
        report.evidence_used.push(self.evidence_used(ctx)?);

        match test {
            "test_day_of_year" => {
                let ordinal = doc.get("ordinalDate").and_then(Value::as_str).unwrap_or_default();
                let day: u32 = ordinal.rsplit('-').next().and_then(|d| d.parse().ok()).unwrap_or(0);
                if day % 2 == 0 {
                    report.fail("Even Day Violation", json!({"day": day, "ordinal_date": ordinal}));
                } else {
                    report.warn("Even Day Approaching", json!({"day": day, "ordinal_date": ordinal}));
                }
            }
            "test_day_of_week" => {
                let day_of_week = doc.get("dayOfTheWeek").and_then(Value::as_str).unwrap_or_default();
                if day_of_week == "Wednesday" {
                    report.fail("Wednesday Violation", json!({"day_of_week": day_of_week}));
                } else {
                    report.succeed("Day Of Week", json!({"day_of_week": day_of_week}));
                }
            }
            _ => {}
        }
        Ok(report)
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let manifest_dir = Path::new(MANIFEST_DIR);
    let config = Config::load(Some(&manifest_dir.join("config.json"))).context("loading demo config.json")?;
    let controls = Controls::load(&manifest_dir.join("controls.json")).context("loading demo controls.json")?;
    let credentials = Credentials::default();

    let settings = config.locker_settings();
    let mut locker = Locker::new(LockerOptions {
        name: Some(settings.dirname),
        local_path: settings.local_path.map(Into::into),
        do_push: false,
        ttl_tolerance: settings.ttl_tolerance,
        ..Default::default()
    });
    locker.init().context("opening demo locker")?;
    eprintln!("[info] demo locker opened at {}", locker.local_path.display());

    let mut registry = Registry::new();
    registry.register_fetcher(Box::new(WorldClockFetcher));
    registry.register_check(Box::new(WorldClockCheck));

    let ctx = RunContext::new(config.clone(), credentials, None, locker);

    let fetch_result = run_fetch_phase(&registry, &ctx, &FetchFilter::default());
    for outcome in &fetch_result.outcomes {
        eprintln!("[fetch] {} -> {:?}", outcome.key, outcome.status);
    }
    ctx.locker().lock().unwrap().checkin(Some("demo fetch phase evidence"))?;
    if !fetch_result.success() {
        return Ok(false);
    }

    let accreditations: HashSet<String> = HashSet::from(["demo".to_string()]);
    let results = run_check_phase(&registry, &ctx, &controls, &accreditations);
    for outcome in &results.outcomes {
        eprintln!("[check] {}.{} -> {:?}", outcome.check_key, outcome.test, outcome.status);
    }

    let locker_handle = ctx.locker();
    let locker_ref = locker_handle.lock().unwrap();
    let builder = ReportBuilder::new(manifest_dir.join("templates"));
    builder.build(&registry, &locker_ref, &config, &controls, &results).context("building demo report")?;

    let messages = messages_by_accreditation(&registry, &locker_ref, &controls, &results);
    StreamNotifier::new(&messages, false).notify(&mut std::io::stdout())?;

    locker_ref.checkin(Some("demo check phase reports"))?;

    Ok(results.success())
}
