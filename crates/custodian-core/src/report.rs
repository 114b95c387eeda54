//! Turns check results into report evidence, a README table of contents,
//! and a consolidated `check_results.json`, run once check execution
//! finishes.
//!
//! Template discovery walks from a configured template root rather than a
//! check's own source file — there is no runtime notion of "the file that
//! defined this type" here the way there is for a dynamically imported
//! Python test class.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use minijinja::{AutoEscape, Environment};
use serde_json::{Map, Value, json};

use crate::config::Config;
use crate::controls::Controls;
use crate::evidence::{Evidence, Kind};
use crate::locker::Locker;
use crate::registry::{EvidenceUse, Registry};
use crate::runner::{CheckPhaseResult, CheckRunOutcome};

const DEFAULT_TEMPLATE: &str = "default.md.tmpl";
const README_CANDIDATES: &[&str] = &["README.md", "README.rst", "README"];

pub struct ReportBuilder {
    template_dir: PathBuf,
}

impl ReportBuilder {
    pub fn new(template_dir: impl Into<PathBuf>) -> Self {
        Self { template_dir: template_dir.into() }
    }

    /// Render every report a check declares, then the locker README's table
    /// of contents, then the consolidated results file. A single report
    /// failing to render is logged and skipped rather than aborting the
    /// rest of the build.
    pub fn build(
        &self,
        registry: &Registry,
        locker: &Locker,
        cfg: &Config,
        controls: &Controls,
        results: &CheckPhaseResult,
    ) -> Result<()> {
        self.generate_reports(registry, locker, cfg, results);
        let rpt_metadata = locker.reports_metadata()?;
        self.generate_toc(locker, controls, &rpt_metadata)?;
        self.generate_check_results(locker, &rpt_metadata, controls, results)?;
        Ok(())
    }

    fn generate_reports(&self, registry: &Registry, locker: &Locker, cfg: &Config, results: &CheckPhaseResult) {
        for check in registry.checks() {
            let report_paths = check.reports();
            if report_paths.is_empty() {
                continue;
            }
            let outcomes: Vec<&CheckRunOutcome> =
                results.outcomes.iter().filter(|o| o.check_key == check.key()).collect();
            if outcomes.is_empty() {
                continue;
            }
            for report_path in &report_paths {
                if let Err(e) = self.render_one(locker, cfg, check.key(), report_path, &outcomes) {
                    eprintln!("failed to generate report {report_path} for {}: {e:#}", check.key());
                }
            }
        }
    }

    fn template_for(&self, report_path: &str) -> PathBuf {
        let specific = self.template_dir.join(format!("{report_path}.tmpl"));
        if specific.is_file() { specific } else { self.template_dir.join(DEFAULT_TEMPLATE) }
    }

    fn render_one(
        &self,
        locker: &Locker,
        cfg: &Config,
        check_key: &str,
        report_path: &str,
        outcomes: &[&CheckRunOutcome],
    ) -> Result<()> {
        let (category, name) = split_report_path(report_path);
        let mut evidence = Evidence::new(Kind::Report, category, name);
        evidence.description = format!("{check_key} report");

        let template_path = self.template_for(report_path);
        let template_src = fs::read_to_string(&template_path)
            .with_context(|| format!("failed to read report template {}", template_path.display()))?;

        let mut env = Environment::new();
        env.set_auto_escape_callback(|name| {
            if name.ends_with(".md") || name.ends_with(".html") { AutoEscape::Html } else { AutoEscape::None }
        });
        env.add_template(report_path, &template_src)
            .with_context(|| format!("failed to parse report template {report_path}"))?;
        let tmpl = env.get_template(report_path)?;

        let evidence_used = merge_evidence_used(outcomes);
        let context = json!({
            "check": check_key,
            "tests": outcomes.iter().map(|o| o.test.clone()).collect::<Vec<_>>(),
            "failures": merge_sections(outcomes, |r| &r.failures),
            "warnings": merge_sections(outcomes, |r| &r.warnings),
            "successes": merge_sections(outcomes, |r| &r.successes),
            "evidence_used": evidence_used,
            "now": Utc::now().to_rfc3339(),
        });
        let rendered = tmpl.render(&context).context("failed to render report template")?;
        evidence.set_content(Some(rendered.into_bytes()), false, None)?;

        let checks = outcomes.iter().map(|o| format!("{}.{}", o.check_key, o.test)).collect::<Vec<_>>();
        locker.add_evidence(&evidence, cfg, Some(json!(checks)), Some(evidence_used_as_json(&evidence_used)))
    }

    /// Read the locker's README, strip its existing TOC run of blank lines,
    /// and append a freshly rendered table listing every non-tombstoned
    /// report: description, URL, owning check, accreditations, last-update,
    /// and links to each input evidence (per partition, pinned by commit).
    fn generate_toc(&self, locker: &Locker, controls: &Controls, rpt_metadata: &std::collections::HashMap<String, Value>) -> Result<()> {
        let readme_name = existing_readme_name(&locker.local_path);
        let existing = locker.content("", &readme_name)?.unwrap_or_default();
        let original = collapse_blank_lines(&existing);

        let mut rows = Vec::new();
        for (report_path, meta) in rpt_metadata {
            if meta.get("pruned_by").is_some() {
                continue;
            }
            let description = meta
                .get("description")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| Path::new(report_path).file_name().and_then(|n| n.to_str()).unwrap_or(report_path))
                .to_string();
            let check_class = meta
                .get("checks")
                .and_then(Value::as_array)
                .and_then(|arr| arr.first())
                .and_then(Value::as_str)
                .and_then(|c| c.rsplit_once('.').map(|(class, _)| class.to_string()))
                .unwrap_or_else(|| "N/A".to_string());
            let url = locker.remote_location(report_path, None, None);
            let mut evidences = Vec::new();
            if let Some(evs) = meta.get("evidence").and_then(Value::as_array) {
                for ev in evs {
                    collect_evidence_row(locker, ev, &mut evidences);
                }
            }
            evidences.sort_by(|a: &Value, b: &Value| a["descr"].as_str().cmp(&b["descr"].as_str()));
            let mut accreditations: Vec<String> = controls.accreditations(&check_class).into_iter().collect();
            accreditations.sort();
            rows.push(json!({
                "descr": description,
                "url": url,
                "check": check_class,
                "accreditations": if accreditations.is_empty() { "N/A".to_string() } else { accreditations.join(", ") },
                "from": meta.get("last_update").cloned().unwrap_or(Value::Null),
                "evidences": evidences,
            }));
        }
        rows.sort_by(|a, b| a["descr"].as_str().cmp(&b["descr"].as_str()));

        let template_path = self.template_dir.join("readme_toc.md.tmpl");
        let template_src = fs::read_to_string(&template_path)
            .with_context(|| format!("failed to read TOC template {}", template_path.display()))?;
        let mut env = Environment::new();
        env.add_template("readme_toc.md.tmpl", &template_src)?;
        let tmpl = env.get_template("readme_toc.md.tmpl")?;
        let context = json!({
            "original": original.lines().collect::<Vec<_>>(),
            "reports": rows,
        });
        let content = tmpl.render(&context).context("failed to render README table of contents")?;
        locker.add_content(&content, "", &readme_name)
    }

    /// Combine check results with each report's metadata, keyed by check
    /// class dot-path, into a single `check_results.json` evidence file.
    /// Only check classes that contributed to at least one report appear.
    fn generate_check_results(
        &self,
        locker: &Locker,
        rpt_metadata: &std::collections::HashMap<String, Value>,
        controls: &Controls,
        results: &CheckPhaseResult,
    ) -> Result<()> {
        let mut by_class: Map<String, Value> = Map::new();
        for (report_path, meta) in rpt_metadata {
            let Some(checks) = meta.get("checks").and_then(Value::as_array) else { continue };
            for check in checks {
                let Some(check) = check.as_str() else { continue };
                let Some((check_class, method)) = check.rsplit_once('.') else { continue };
                let entry = by_class.entry(check_class.to_string()).or_insert_with(|| {
                    json!({
                        "checks": {},
                        "reports": {},
                        "evidence": meta.get("evidence").cloned().unwrap_or(Value::Array(vec![])),
                        "accreditations": controls.accreditations(check_class).into_iter().collect::<Vec<_>>(),
                    })
                });
                entry["reports"][report_path] =
                    meta.get("description").cloned().unwrap_or(Value::String(String::new()));
                if let Some(outcome) = results.outcomes.iter().find(|o| o.check_key == check_class && o.test == method) {
                    entry["checks"][method] = json!({
                        "status": outcome.status.as_str(),
                        "timestamp": outcome.timestamp.to_rfc3339(),
                        "failures": outcome.report.failures,
                        "warnings": outcome.report.warnings,
                        "successes": outcome.report.successes,
                        "failures_count": outcome.report.failures_count(),
                        "warnings_count": outcome.report.warnings_count(),
                        "successes_count": outcome.report.successes_count(),
                    });
                }
            }
        }
        let content = serde_json::to_string_pretty(&by_class)?;
        locker.add_content(&content, "", "check_results.json")
    }
}

fn split_report_path(report_path: &str) -> (&str, &str) {
    match report_path.rsplit_once('/') {
        Some((category, name)) => (category, name),
        None => ("", report_path),
    }
}

fn merge_sections(
    outcomes: &[&CheckRunOutcome],
    select: impl Fn(&crate::registry::CheckReport) -> &std::collections::HashMap<String, Vec<Value>>,
) -> Map<String, Value> {
    let mut merged: Map<String, Value> = Map::new();
    for outcome in outcomes {
        for (section, items) in select(&outcome.report) {
            let entry = merged.entry(section.clone()).or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(arr) = entry {
                arr.extend(items.iter().cloned());
            }
        }
    }
    merged
}

fn merge_evidence_used(outcomes: &[&CheckRunOutcome]) -> Vec<EvidenceUse> {
    let mut merged = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for outcome in outcomes {
        for used in &outcome.report.evidence_used {
            if seen.insert(used.path.clone()) {
                merged.push(used.clone());
            }
        }
    }
    merged
}

fn evidence_used_as_json(used: &[EvidenceUse]) -> Value {
    json!(
        used.iter()
            .map(|u| {
                json!({
                    "path": u.path,
                    "description": u.description,
                    "last_update": u.last_update,
                    "commit_sha": u.commit_sha,
                    "locker_url": u.locker_url,
                    "partitions": u.partitions,
                })
            })
            .collect::<Vec<_>>()
    )
}

fn collect_evidence_row(locker: &Locker, ev: &Value, out: &mut Vec<Value>) {
    let path = ev.get("path").and_then(Value::as_str).unwrap_or_default();
    let description = ev
        .get("description")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or(path));
    let commit_sha = ev.get("commit_sha").and_then(Value::as_str);
    let last_update = ev.get("last_update").cloned().unwrap_or(Value::Null);
    let locker_url = ev.get("locker_url").and_then(Value::as_str);

    match ev.get("partitions").and_then(Value::as_object) {
        Some(partitions) if !partitions.is_empty() => {
            for hash_key in partitions.keys() {
                let part_name =
                    Path::new(path).file_name().and_then(|n| n.to_str()).map(|n| format!("{hash_key}_{n}")).unwrap_or_default();
                let part_path = Path::new(path).with_file_name(&part_name);
                out.push(json!({
                    "descr": format!("{description} - {hash_key} partition"),
                    "url": locker.remote_location(&part_path.to_string_lossy(), commit_sha, locker_url),
                    "from": last_update.clone(),
                }));
            }
        }
        _ => {
            out.push(json!({
                "descr": description,
                "url": locker.remote_location(path, commit_sha, locker_url),
                "from": last_update,
            }));
        }
    }
}

fn existing_readme_name(local_path: &Path) -> String {
    README_CANDIDATES
        .iter()
        .find(|name| local_path.join(name).is_file())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "README.md".to_string())
}

/// Collapse runs of 2+ blank lines down to exactly one, matching the
/// upstream TOC's `\n{2,}` normalization of the pre-existing README body.
fn collapse_blank_lines(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut blank_run = 0;
    for line in content.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_report_path_separates_category_and_name() {
        assert_eq!(split_report_path("svc/summary.md"), ("svc", "summary.md"));
        assert_eq!(split_report_path("summary.md"), ("", "summary.md"));
    }

    #[test]
    fn collapse_blank_lines_squashes_runs() {
        let input = "a\n\n\n\nb\nc\n\n\nd\n";
        assert_eq!(collapse_blank_lines(input), "a\n\nb\nc\n\nd\n");
    }

    #[test]
    fn merge_sections_combines_across_outcomes() {
        use crate::registry::{CheckReport, TestStatus};

        let mut r1 = CheckReport::new();
        r1.fail("a", json!(1));
        let mut r2 = CheckReport::new();
        r2.fail("a", json!(2));
        r2.warn("b", json!(3));

        let o1 = CheckRunOutcome {
            check_key: "pkg.Check".to_string(),
            test: "test_one".to_string(),
            status: TestStatus::Fail,
            report: r1,
            timestamp: Utc::now(),
        };
        let o2 = CheckRunOutcome {
            check_key: "pkg.Check".to_string(),
            test: "test_two".to_string(),
            status: TestStatus::Fail,
            report: r2,
            timestamp: Utc::now(),
        };
        let merged = merge_sections(&[&o1, &o2], |r| &r.failures);
        assert_eq!(merged["a"].as_array().unwrap().len(), 2);
    }
}
