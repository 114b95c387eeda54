//! End-of-run notification sinks. Every notifier consumes the same set of
//! check outcomes, the controls descriptor, and a `push_error` flag, and
//! buckets them by accreditation (sorted) and then by status.
//!
//! The HTTP-backed notifiers (chat, ticket, paging, findings) take a
//! `&reqwest::blocking::Client` built once per run by the caller, rather
//! than each opening its own connection pool.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use chrono::Datelike;
use custodian_retry::{RetryPolicy, RetryStrategyConfig};
use serde_json::{Value, json};

use crate::config::Config;
use crate::controls::Controls;
use crate::credentials::Credentials;
use crate::locker::Locker;
use crate::registry::{Registry, TestStatus};
use crate::runner::CheckPhaseResult;

/// One check outcome reduced to what a notifier needs to render: identity,
/// status, failure/warning counts, and the reports it contributed to.
#[derive(Debug, Clone)]
pub struct NotifyMessage {
    pub check_key: String,
    pub test: String,
    pub title: String,
    pub status: TestStatus,
    pub failure_count: usize,
    pub warning_count: usize,
    pub report_links: Vec<(String, String)>,
}

/// `{accreditation -> [message, ...]}`, sorted by accreditation (the
/// `BTreeMap` ordering) and, within each bucket, by title.
pub fn messages_by_accreditation(
    registry: &Registry,
    locker: &Locker,
    controls: &Controls,
    results: &CheckPhaseResult,
) -> BTreeMap<String, Vec<NotifyMessage>> {
    let mut retval: BTreeMap<String, Vec<NotifyMessage>> = BTreeMap::new();
    for outcome in &results.outcomes {
        let report_links = registry
            .check_by_key(&outcome.check_key)
            .map(|check| {
                check
                    .reports()
                    .into_iter()
                    .map(|path| {
                        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                        let url = locker.remote_location(&format!("reports/{path}"), None, None);
                        (name, url)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let msg = NotifyMessage {
            check_key: outcome.check_key.clone(),
            test: outcome.test.clone(),
            title: format!("{}.{}", outcome.check_key, outcome.test),
            status: outcome.status,
            failure_count: outcome.report.failures_count(),
            warning_count: outcome.report.warnings_count(),
            report_links,
        };
        for accred in controls.accreditations(&outcome.check_key) {
            retval.entry(accred).or_default().push(msg.clone());
        }
    }
    for bucket in retval.values_mut() {
        bucket.sort_by(|a, b| a.title.cmp(&b.title));
    }
    retval
}

/// Messages of `accred`'s bucket split into (passed, failed, warned, errored).
fn split_by_status(messages: &[NotifyMessage]) -> (Vec<&NotifyMessage>, Vec<&NotifyMessage>, Vec<&NotifyMessage>, Vec<&NotifyMessage>) {
    let mut passed = Vec::new();
    let mut failed = Vec::new();
    let mut warned = Vec::new();
    let mut errored = Vec::new();
    for m in messages {
        match m.status {
            TestStatus::Pass => passed.push(m),
            TestStatus::Fail => failed.push(m),
            TestStatus::Warn => warned.push(m),
            TestStatus::Error => errored.push(m),
        }
    }
    (passed, failed, warned, errored)
}

fn summary_line(m: &NotifyMessage) -> String {
    let mut issues = Vec::new();
    if m.failure_count > 0 {
        issues.push(format!("{} failures", m.failure_count));
    }
    if m.warning_count > 0 {
        issues.push(format!("{} warnings", m.warning_count));
    }
    let reports = if m.report_links.is_empty() {
        "(none)".to_string()
    } else {
        m.report_links.iter().map(|(name, url)| format!("[{name}]({url})")).collect::<Vec<_>>().join(", ")
    };
    format!("{} ({}) Reports: {}", m.status.as_str().to_uppercase(), issues.join(", "), reports)
}

/// Writes a human-readable summary per accreditation to a stream; defaults
/// to stdout.
pub struct StreamNotifier<'a> {
    messages: &'a BTreeMap<String, Vec<NotifyMessage>>,
    push_error: bool,
}

impl<'a> StreamNotifier<'a> {
    pub fn new(messages: &'a BTreeMap<String, Vec<NotifyMessage>>, push_error: bool) -> Self {
        Self { messages, push_error }
    }

    pub fn notify(&self, out: &mut impl Write) -> Result<()> {
        writeln!(out, "\n-- NOTIFICATIONS --\n")?;
        if self.messages.is_empty() {
            writeln!(out, "No results")?;
            return Ok(());
        }
        if self.push_error {
            writeln!(out, "All accreditation checks: evidence/results failed to push to remote locker.")?;
            return Ok(());
        }
        for (accred, msgs) in self.messages {
            writeln!(out, "Notifications for {} accreditation\n", accred.to_uppercase())?;
            let (passed, failed, warned, errored) = split_by_status(msgs);
            let passed_titles = if passed.is_empty() {
                "(none)".to_string()
            } else {
                passed.iter().map(|m| m.title.as_str()).collect::<Vec<_>>().join(", ")
            };
            writeln!(out, "PASSED checks: {passed_titles}\n")?;
            for bucket in [errored, warned, failed] {
                for m in bucket {
                    writeln!(out, "{} - {}\n", m.title, summary_line(m))?;
                }
            }
        }
        out.flush()?;
        Ok(())
    }
}

fn markdown_body(messages: &BTreeMap<String, Vec<NotifyMessage>>, push_error: bool) -> String {
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    let mut lines = vec![format!("# CHECK RESULTS: {now}")];
    for (accred, msgs) in messages {
        lines.push(format!("\n## Notification for {} accreditation\n", accred.to_uppercase()));
        if push_error {
            lines.push("### All Checks (Errored)\n".to_string());
            lines.push("   - Evidence/Results failed to push to remote locker. See execution log for details.".to_string());
            continue;
        }
        let (passed, failed, warned, errored) = split_by_status(msgs);
        for (heading, bucket) in [("Passed Checks", &passed), ("Errored Checks", &errored)] {
            lines.push(format!("### {heading}\n"));
            if bucket.is_empty() {
                lines.push(format!("- **No {}**", heading.to_lowercase()));
            } else {
                for m in *bucket {
                    lines.push(format!("- **{}**", m.title));
                    if heading == "Errored Checks" {
                        lines.push(format!("   - {} failed to execute", m.title));
                    }
                }
            }
        }
        lines.push("### Failures/Warnings\n".to_string());
        let fail_and_warn: Vec<&&NotifyMessage> = failed.iter().chain(warned.iter()).collect();
        if fail_and_warn.is_empty() {
            lines.push("- **No failures or warnings**".to_string());
        } else {
            for m in fail_and_warn {
                lines.push(format!("- **{}**", m.title));
                lines.push(format!("   - **{}**", summary_line(m)));
            }
        }
    }
    lines.join("\n")
}

/// Writes a markdown document into `notifications/alerts_summary.md` and
/// commits + pushes it.
pub struct LockerNotifier<'a> {
    locker: &'a Locker,
    push_error: bool,
}

impl<'a> LockerNotifier<'a> {
    pub fn new(locker: &'a Locker, push_error: bool) -> Self {
        Self { locker, push_error }
    }

    pub fn notify(&self, messages: &BTreeMap<String, Vec<NotifyMessage>>) -> Result<()> {
        if messages.is_empty() {
            eprintln!("No results. Locker notifier not triggered.");
            return Ok(());
        }
        if self.push_error {
            eprintln!("Remote locker push failed. Locker notifier not triggered.");
            return Ok(());
        }
        eprintln!("Running the Locker notifier...");
        let folder = "notifications";
        let filename = "alerts_summary.md";
        let body = markdown_body(messages, false);
        self.locker.add_content(&body, folder, filename)?;
        self.locker.checkin(Some(&format!(
            "Locker notification sent at {}\n\n{folder}/{filename}",
            chrono::Utc::now().to_rfc3339()
        )))?;
        self.locker.push()
    }
}

const SLACK_COLORS: &[(&str, &str)] = &[("pass", "#00D000"), ("fail", "#D00000"), ("error", "#9932CC"), ("warn", "#FFD300")];

fn slack_color(status: &str) -> &'static str {
    SLACK_COLORS.iter().find(|(s, _)| *s == status).map(|(_, c)| *c).unwrap_or("#808080")
}

/// Posts JSON messages to a Slack-shape webhook (or a token-authenticated
/// endpoint on fallback), with normal/compact attachment modes,
/// accreditation-to-channel routing, on-call rotation, and
/// 429-Retry-After-aware retries.
pub struct ChatNotifier<'a> {
    client: reqwest::blocking::Client,
    config: &'a Config,
    credentials: &'a Credentials,
    push_error: bool,
}

impl<'a> ChatNotifier<'a> {
    pub fn new(client: &reqwest::blocking::Client, config: &'a Config, credentials: &'a Credentials, push_error: bool) -> Self {
        Self { client: client.clone(), config, credentials, push_error }
    }

    pub fn notify(&self, messages: &BTreeMap<String, Vec<NotifyMessage>>) -> Result<()> {
        eprintln!("Running the Slack notifier...");
        let Some(notify_cfg) = self.config.get("notify.slack") else {
            eprintln!("Using Slack notifier without config");
            return Ok(());
        };
        for (accred, msgs) in messages {
            let Some(accred_cfg) = notify_cfg.get(accred) else { continue };
            let (channels, mode) = self.resolve_channels(accred_cfg);
            let payload = self.generate_message(accred, msgs, &mode);
            for channel in channels {
                self.send_message(&payload, &channel)?;
            }
        }
        Ok(())
    }

    fn resolve_channels(&self, accred_cfg: &Value) -> (Vec<String>, String) {
        if let Some(list) = accred_cfg.as_array() {
            return (list.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(), "normal".to_string());
        }
        let mut channels: Vec<String> =
            accred_cfg.get("channels").and_then(Value::as_array).map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()).unwrap_or_default();
        let mode = accred_cfg.get("mode").and_then(Value::as_str).unwrap_or("normal").to_string();
        if let Some(rotation) = accred_cfg.get("rotation").and_then(Value::as_array) {
            if !rotation.is_empty() {
                let iso_week = chrono::Utc::now().iso_week().week() as usize;
                let on_duty = &rotation[iso_week % rotation.len()];
                if let Some(id) = on_duty.get("id").and_then(Value::as_str).or_else(|| on_duty.as_str()) {
                    channels.push(id.to_string());
                }
            }
        }
        (channels, mode)
    }

    fn generate_message(&self, accred: &str, msgs: &[NotifyMessage], mode: &str) -> Value {
        let text = format!(
            "Notification for {} accreditation at {}",
            accred.to_uppercase(),
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
        );
        let attachments = if self.push_error {
            vec![json!({
                "title": "ALL checks",
                "text": "Evidence/Results failed to push to remote locker. See execution log for details.",
                "mrkdwn_in": ["text", "pretext"],
                "color": slack_color("error"),
            })]
        } else if mode == "compact" {
            self.compact_attachments(msgs)
        } else {
            self.normal_attachments(msgs)
        };
        json!({
            "username": "Compliance Alerts",
            "icon_emoji": ":robot_face:",
            "text": text,
            "attachments": attachments,
        })
    }

    fn normal_attachments(&self, msgs: &[NotifyMessage]) -> Vec<Value> {
        let (passed, failed, warned, errored) = split_by_status(msgs);
        let mut out = Vec::new();
        for m in errored.iter().chain(failed.iter()).chain(warned.iter()) {
            out.push(json!({
                "title": m.title,
                "text": summary_line(m),
                "mrkdwn_in": ["text", "pretext"],
                "color": slack_color(m.status.as_str()),
            }));
        }
        let passed_titles = if passed.is_empty() {
            "(none)".to_string()
        } else {
            passed.iter().map(|m| m.title.as_str()).collect::<Vec<_>>().join(", ")
        };
        out.push(json!({
            "title": "PASSED checks",
            "text": passed_titles,
            "mrkdwn_in": ["text", "pretext"],
            "color": slack_color("pass"),
        }));
        out
    }

    fn compact_attachments(&self, msgs: &[NotifyMessage]) -> Vec<Value> {
        let (passed, failed, warned, errored) = split_by_status(msgs);
        let mut out = Vec::new();
        if !passed.is_empty() {
            out.push(json!({
                "title": format!("PASS: {} checks", passed.len()),
                "text": "",
                "mrkdwn_in": ["text", "pretext"],
                "color": slack_color("pass"),
            }));
        }
        for (status, bucket) in [("warn", &warned), ("fail", &failed)] {
            if bucket.is_empty() {
                continue;
            }
            let text = bucket.iter().map(|m| format!("* {} - {}", m.title, summary_line(m))).collect::<Vec<_>>().join("\n");
            out.push(json!({
                "title": format!("{}: {} checks", status.to_uppercase(), bucket.len()),
                "text": text,
                "mrkdwn_in": ["text", "pretext"],
                "color": slack_color(status),
            }));
        }
        if !errored.is_empty() {
            let titles: std::collections::BTreeSet<&str> = errored.iter().map(|m| m.title.as_str()).collect();
            out.push(json!({
                "title": format!("ERRORS: {} checks", errored.len()),
                "text": titles.into_iter().collect::<Vec<_>>().join(", "),
                "mrkdwn_in": ["text", "pretext"],
                "color": slack_color("error"),
            }));
        }
        out
    }

    fn send_message(&self, payload: &Value, channel: &str) -> Result<()> {
        let mut body = payload.clone();
        body["channel"] = json!(channel);

        let webhook = self.credentials.get_opt("cloobot", "webhook").or_else(|| self.credentials.get_opt("slack", "webhook"));
        let (url, headers): (String, Vec<(&str, String)>) = match webhook {
            Some(url) => (url, Vec::new()),
            None => {
                let token = self
                    .credentials
                    .get_opt("cloobot", "token")
                    .or_else(|| self.credentials.get_opt("slack", "token"))
                    .context("unable to get a Slack webhook or token from credentials")?;
                ("https://slack.com/api/chat.postMessage".to_string(), vec![("Authorization", format!("Bearer {token}"))])
            }
        };

        let retries = self.config.get_u64("notify.slack.retries").unwrap_or(3) as u32;
        let policy = RetryStrategyConfig { max_attempts: retries.max(1), ..RetryPolicy::Default.to_config() };
        let executor = custodian_retry::RetryExecutor::new(policy);

        executor.run_with_retry_after(|_attempt| {
            let mut req = self.client.post(&url).json(&body);
            for (k, v) in &headers {
                req = req.header(*k, v);
            }
            match req.send() {
                Ok(resp) if resp.status().as_u16() == 429 => {
                    let retry_after = resp.headers().get("Retry-After").and_then(|v| v.to_str().ok()).and_then(|s| s.parse::<u64>().ok());
                    Err((anyhow::anyhow!("rate limited"), retry_after.map(|s| s + 1)))
                }
                Ok(resp) => match resp.error_for_status() {
                    Ok(_) => Ok(()),
                    Err(e) => Err((anyhow::Error::from(e), None)),
                },
                Err(e) => Err((anyhow::Error::from(e), None)),
            }
        })
    }
}

/// Minimal GitHub REST client backing the ticket notifier: issue search,
/// creation, comments, and label updates. Project-column assignment is
/// not implemented — GitHub's classic Projects API is deprecated upstream.
struct GithubClient {
    client: reqwest::blocking::Client,
    api_base: String,
    token: String,
}

impl GithubClient {
    fn new(client: reqwest::blocking::Client, api_base: String, token: String) -> Self {
        Self { client, api_base, token }
    }

    fn search_issues(&self, query: &str) -> Result<Vec<Value>> {
        let url = format!("{}/search/issues", self.api_base);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("token {}", self.token))
            .query(&[("q", query)])
            .send()
            .context("github issue search failed")?
            .error_for_status()?;
        let body: Value = resp.json()?;
        Ok(body.get("items").and_then(Value::as_array).cloned().unwrap_or_default())
    }

    fn create_issue(&self, owner: &str, repo: &str, title: &str, body: &str, labels: &[String]) -> Result<Value> {
        let url = format!("{}/repos/{owner}/{repo}/issues", self.api_base);
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("token {}", self.token))
            .json(&json!({"title": title, "body": body, "labels": labels}))
            .send()
            .context("github issue creation failed")?
            .error_for_status()?;
        Ok(resp.json()?)
    }

    fn add_comment(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<()> {
        let url = format!("{}/repos/{owner}/{repo}/issues/{number}/comments", self.api_base);
        self.client
            .post(&url)
            .header("Authorization", format!("token {}", self.token))
            .json(&json!({"body": body}))
            .send()
            .context("github comment failed")?
            .error_for_status()?;
        Ok(())
    }

    fn patch_labels(&self, owner: &str, repo: &str, number: u64, labels: &[String]) -> Result<()> {
        let url = format!("{}/repos/{owner}/{repo}/issues/{number}", self.api_base);
        self.client
            .patch(&url)
            .header("Authorization", format!("token {}", self.token))
            .json(&json!({"labels": labels}))
            .send()
            .context("github label update failed")?
            .error_for_status()?;
        Ok(())
    }
}

fn rotation_index(frequency: &str, now: chrono::DateTime<chrono::Utc>) -> Option<i64> {
    match frequency {
        "day" => Some(now.ordinal() as i64),
        "week" => Some(now.iso_week().week() as i64),
        "month" => Some(now.month() as i64),
        "year" => Some(now.year() as i64),
        _ => None,
    }
}

fn frequency_title(frequency: &str, title: &str, now: chrono::DateTime<chrono::Utc>) -> (String, Vec<String>) {
    match frequency {
        "day" => {
            let today = now.format("%Y-%m-%d").to_string();
            (format!("{today} - {title}"), vec!["day".to_string(), today])
        }
        "week" => {
            let year = now.iso_week().year();
            let week = now.iso_week().week();
            (format!("{year}, {week}W - {title}"), vec!["week".to_string(), year.to_string(), format!("{week}W")])
        }
        "month" => {
            let year = now.format("%Y").to_string();
            let month = now.format("%mM").to_string();
            (format!("{year}, {month} - {title}"), vec!["month".to_string(), year, month])
        }
        "year" => {
            let year = now.format("%Y").to_string();
            (format!("{year} - {title}"), vec!["year".to_string(), year])
        }
        _ => (title.to_string(), Vec::new()),
    }
}

/// Files failing/erroring checks as repository issues, or a single rotating
/// summary issue per period. Configurable via `notify.gh_issues` (falling
/// back to the legacy `notify.ghe_issues` key).
pub struct TicketNotifier {
    github: GithubClient,
    config: Value,
    push_error: bool,
}

impl TicketNotifier {
    pub fn new(client: &reqwest::blocking::Client, config: &Config, credentials: &Credentials, push_error: bool) -> Result<Self> {
        let notify_cfg = config.get("notify.gh_issues").or_else(|| config.get("notify.ghe_issues")).unwrap_or(Value::Null);
        let locker_url = config.get_str("locker.repo_url").unwrap_or_default();
        let parsed = url::Url::parse(&locker_url).ok();
        let host = parsed.as_ref().and_then(|u| u.host_str()).unwrap_or("github.com");
        let api_base = if host == "github.com" { "https://api.github.com".to_string() } else { format!("https://{host}/api/v3") };
        let token = credentials.get_opt("github", "token").context("missing github.token credential")?;
        Ok(Self { github: GithubClient::new(client.clone(), api_base, token), config: notify_cfg, push_error })
    }

    pub fn notify(&self, messages: &BTreeMap<String, Vec<NotifyMessage>>) -> Result<()> {
        eprintln!("Running the Github Issues notifier...");
        if self.config.is_null() {
            eprintln!("Using Github Issues notifier without config");
            return Ok(());
        }
        for (accred, msgs) in messages {
            let Some(accred_cfg) = self.config.get(accred) else { continue };
            let (passed, failed, warned, errored) = split_by_status(msgs);
            if accred_cfg.get("summary_issue").is_some() {
                self.notify_by_summary_issue(accred, accred_cfg, msgs)?;
            } else if self.push_error {
                eprintln!("Remote locker push failed. Github Issues notifier not triggered.");
            } else {
                let _ = (&passed, &warned, &errored);
                self.notify_by_check_issues(accred, accred_cfg, &failed, &errored)?;
            }
        }
        Ok(())
    }

    fn notify_by_summary_issue(&self, accred: &str, accred_cfg: &Value, msgs: &[NotifyMessage]) -> Result<()> {
        let summary_cfg = &accred_cfg["summary_issue"];
        let base_title = summary_cfg.get("title").and_then(Value::as_str).unwrap_or(accred).to_string();
        let frequency = summary_cfg.get("frequency").and_then(Value::as_str).unwrap_or("");
        let now = chrono::Utc::now();
        let (title, mut labels) = frequency_title(frequency, &base_title, now);
        if let Some(extra) = summary_cfg.get("labels").and_then(Value::as_array) {
            labels.extend(extra.iter().filter_map(|v| v.as_str().map(str::to_string)));
        }
        let body = markdown_body(&BTreeMap::from([(accred.to_string(), msgs.to_vec())]), false);

        for repo in accred_cfg.get("repo").and_then(Value::as_array).into_iter().flatten().filter_map(Value::as_str) {
            let Some((owner, repository)) = repo.split_once('/') else { continue };
            self.create_or_update_issue(owner, repository, &title, &body, &labels)?;
            let _ = rotation_index(frequency, now);
        }
        Ok(())
    }

    fn notify_by_check_issues(&self, accred: &str, accred_cfg: &Value, failed: &[&NotifyMessage], errored: &[&NotifyMessage]) -> Result<()> {
        let scoped_checks: Option<Vec<String>> =
            accred_cfg.get("checks").and_then(Value::as_array).map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect());
        for repo in accred_cfg.get("repo").and_then(Value::as_array).into_iter().flatten().filter_map(Value::as_str) {
            let Some((owner, repository)) = repo.split_once('/') else { continue };
            for m in failed.iter().chain(errored.iter()) {
                if let Some(scoped) = &scoped_checks {
                    if !scoped.contains(&m.check_key) {
                        continue;
                    }
                }
                let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
                let body = format!(
                    "## Compliance check alert - {now}\n- Check: {}\n- Accreditation: {accred}\n- Run Status: **{}**",
                    m.title,
                    summary_line(m)
                );
                let labels = vec![format!("accreditation: {accred}"), format!("run status: {}", m.status.as_str())];
                self.create_or_update_issue(owner, repository, &m.title, &body, &labels)?;
            }
        }
        Ok(())
    }

    fn create_or_update_issue(&self, owner: &str, repository: &str, title: &str, body: &str, labels: &[String]) -> Result<()> {
        let found = self
            .github
            .search_issues(&format!("{title} type:issue in:title is:open repo:{owner}/{repository}"))?
            .into_iter()
            .find(|i| i.get("title").and_then(Value::as_str) == Some(title));
        match found {
            None => {
                self.github.create_issue(owner, repository, title, body, labels)?;
            }
            Some(issue) => {
                let number = issue.get("number").and_then(Value::as_u64).unwrap_or_default();
                let current: Vec<String> = issue
                    .get("labels")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|l| l.get("name").and_then(Value::as_str).map(str::to_string))
                    .filter(|l| !l.starts_with("run status: "))
                    .collect();
                let merged: Vec<String> = current.into_iter().chain(labels.iter().cloned()).collect();
                self.github.patch_labels(owner, repository, number, &merged)?;
                self.github.add_comment(owner, repository, number, body)?;
            }
        }
        Ok(())
    }
}

const PAGERDUTY_API_URL: &str = "https://api.pagerduty.com";
const PD_EVENTS_V2_URL: &str = "https://events.pagerduty.com/v2/enqueue";

struct PagerDutyAlert {
    check: String,
    details: String,
}

/// Triggers a PagerDuty alert (Events API v2) for failing/erroring checks,
/// resolves it once the check passes again. "Update" is resolve-then-trigger
/// since the events API has no in-place modify primitive.
pub struct PagingNotifier {
    client: reqwest::blocking::Client,
    api_key: String,
    routing_key: String,
    config: Value,
    push_error: bool,
}

impl PagingNotifier {
    pub fn new(client: &reqwest::blocking::Client, config: &Config, credentials: &Credentials, push_error: bool) -> Self {
        let api_key = credentials.get_opt("pagerduty", "api_key").unwrap_or_default();
        let routing_key = credentials.get_opt("pagerduty", "events_integration_key").unwrap_or_default();
        let notify_cfg = config.get("notify.pagerduty").unwrap_or(Value::Null);
        Self { client: client.clone(), api_key, routing_key, config: notify_cfg, push_error }
    }

    pub fn notify(&self, messages: &BTreeMap<String, Vec<NotifyMessage>>) -> Result<()> {
        if self.push_error {
            eprintln!("Remote locker push failed. PagerDuty notifier not triggered.");
            return Ok(());
        }
        eprintln!("Running the PagerDuty notifier...");
        if self.config.is_null() {
            eprintln!("Using PagerDuty notifier without config");
            return Ok(());
        }
        for (accred, msgs) in messages {
            let Some(accred_cfg) = self.config.get(accred) else { continue };
            if msgs.is_empty() {
                continue;
            }
            let (service_id, scoped_checks) = match accred_cfg {
                Value::String(s) => (s.clone(), None),
                _ => (
                    accred_cfg.get("service_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                    accred_cfg.get("checks").and_then(Value::as_array).map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect::<Vec<_>>()),
                ),
            };
            let alerts = self.get_alerts(&service_id)?;
            let (passed, failed, warned, errored) = split_by_status(msgs);

            for m in failed.iter().chain(errored.iter()) {
                if let Some(scoped) = &scoped_checks {
                    if !scoped.contains(&m.title) {
                        continue;
                    }
                }
                let details = summary_line(m);
                let existing = alerts.iter().find(|a| a.check == m.title);
                match existing {
                    Some(a) if a.details == details => {}
                    Some(_) => {
                        self.resolve_alert(&m.title, accred)?;
                        self.trigger_alert(&m.title, &m.title, accred, &details)?;
                    }
                    None => self.trigger_alert(&m.title, &m.title, accred, &details)?,
                }
            }
            for m in passed.iter().chain(warned.iter()) {
                if alerts.iter().any(|a| a.check == m.title) {
                    self.resolve_alert(&m.title, accred)?;
                }
            }
        }
        Ok(())
    }

    fn get_alerts(&self, service_id: &str) -> Result<Vec<PagerDutyAlert>> {
        let incidents: Value = self
            .client
            .get(format!("{PAGERDUTY_API_URL}/incidents"))
            .header("Authorization", format!("Token token={}", self.api_key))
            .header("Accept", "application/vnd.pagerduty+json;version=2")
            .query(&[("service_ids[]", service_id), ("statuses[]", "acknowledged"), ("time_zone", "UTC")])
            .send()
            .context("pagerduty incidents lookup failed")?
            .error_for_status()?
            .json()
            .context("invalid pagerduty incidents response")?;

        let mut alerts = Vec::new();
        for inc in incidents.get("incidents").and_then(Value::as_array).into_iter().flatten() {
            let Some(id) = inc.get("id").and_then(Value::as_str) else { continue };
            let resp: Value = self
                .client
                .get(format!("{PAGERDUTY_API_URL}/incidents/{id}/alerts"))
                .header("Authorization", format!("Token token={}", self.api_key))
                .header("Accept", "application/vnd.pagerduty+json;version=2")
                .send()
                .context("pagerduty alerts lookup failed")?
                .error_for_status()?
                .json()
                .context("invalid pagerduty alerts response")?;
            for a in resp.get("alerts").and_then(Value::as_array).into_iter().flatten() {
                let Some(check) = a.get("alert_key").and_then(Value::as_str) else { continue };
                let details = a.get("body").and_then(|b| b.get("details")).and_then(Value::as_str).unwrap_or_default().to_string();
                alerts.push(PagerDutyAlert { check: check.to_string(), details });
            }
        }
        Ok(alerts)
    }

    fn send_event(&self, action: &str, check: &str, title: &str, source: &str, details: &str) -> Result<()> {
        let msg = json!({
            "event_action": action,
            "routing_key": self.routing_key,
            "dedup_key": check,
            "payload": {
                "summary": title,
                "source": source,
                "severity": "error",
                "custom_details": details,
            },
            "links": Vec::<Value>::new(),
        });
        self.client.post(PD_EVENTS_V2_URL).json(&msg).send().context("pagerduty event send failed")?.error_for_status()?;
        Ok(())
    }

    fn trigger_alert(&self, check: &str, title: &str, accred: &str, details: &str) -> Result<()> {
        self.send_event("trigger", check, title, accred, details)
    }

    fn resolve_alert(&self, check: &str, accred: &str) -> Result<()> {
        self.send_event("resolve", check, check, accred, "")
    }
}

/// Posts per-occurrence payloads already present in a check's report to a
/// per-accreditation Findings API endpoint.
pub struct FindingsNotifier {
    client: reqwest::blocking::Client,
    config: Value,
    push_error: bool,
}

impl FindingsNotifier {
    pub fn new(client: &reqwest::blocking::Client, config: &Config, push_error: bool) -> Self {
        let notify_cfg = config.get("notify.findings").unwrap_or(Value::Null);
        Self { client: client.clone(), config: notify_cfg, push_error }
    }

    pub fn notify(&self, registry: &Registry, results: &CheckPhaseResult, controls: &Controls) -> Result<()> {
        if self.push_error {
            eprintln!("Remote locker push failed. Findings notifier not triggered.");
            return Ok(());
        }
        eprintln!("Running the Findings notifier...");
        if self.config.is_null() {
            eprintln!("Using findings notification without config");
            return Ok(());
        }
        let _ = registry;
        for outcome in &results.outcomes {
            for accred in controls.accreditations(&outcome.check_key) {
                let Some(endpoint) = self.config.get(&accred).and_then(Value::as_str) else { continue };
                for section in [&outcome.report.failures, &outcome.report.warnings, &outcome.report.successes] {
                    for (occurrence_id, occurrences) in section {
                        let payload = json!({"occurrence_id": occurrence_id, "occurrences": occurrences});
                        if let Err(e) = self.client.post(endpoint).json(&payload).send().and_then(|r| r.error_for_status()) {
                            eprintln!("finding creation failed for {occurrence_id}: {e}");
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serial_test::serial;

    use super::*;
    use crate::registry::CheckReport;
    use crate::runner::CheckRunOutcome;

    fn sample_results() -> CheckPhaseResult {
        let mut report = CheckReport::new();
        report.fail("widgets", json!({"id": 1}));
        CheckPhaseResult {
            outcomes: vec![CheckRunOutcome {
                check_key: "pkg.WidgetCheck".to_string(),
                test: "test_widgets".to_string(),
                status: TestStatus::Fail,
                report,
                timestamp: chrono::Utc::now(),
            }],
            missing: Vec::new(),
        }
    }

    #[test]
    #[serial]
    fn messages_group_by_accreditation() {
        let registry = Registry::new();
        let td = tempfile::tempdir().unwrap();
        let mut locker =
            crate::locker::Locker::new(crate::locker::LockerOptions { local_path: Some(td.path().to_path_buf()), ..Default::default() });
        locker.init().unwrap();
        let controls = Controls::from_value(json!({"pkg.WidgetCheck": ["soc2"]})).unwrap();
        let results = sample_results();

        let grouped = messages_by_accreditation(&registry, &locker, &controls, &results);
        assert_eq!(grouped.len(), 1);
        let msgs = &grouped["soc2"];
        assert_eq!(msgs[0].failure_count, 1);
        assert_eq!(msgs[0].status, TestStatus::Fail);
    }

    #[test]
    fn stream_notifier_writes_no_results() {
        let messages = BTreeMap::new();
        let notifier = StreamNotifier::new(&messages, false);
        let mut buf = Vec::new();
        notifier.notify(&mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().contains("No results"));
    }

    #[test]
    fn stream_notifier_reports_push_error() {
        let mut report = CheckReport::new();
        report.fail("x", json!({}));
        let mut messages = BTreeMap::new();
        messages.insert(
            "soc2".to_string(),
            vec![NotifyMessage {
                check_key: "pkg.Check".to_string(),
                test: "test_x".to_string(),
                title: "pkg.Check.test_x".to_string(),
                status: TestStatus::Fail,
                failure_count: 1,
                warning_count: 0,
                report_links: Vec::new(),
            }],
        );
        let notifier = StreamNotifier::new(&messages, true);
        let mut buf = Vec::new();
        notifier.notify(&mut buf).unwrap();
        assert!(String::from_utf8(buf).unwrap().contains("failed to push"));
    }

    #[test]
    fn summary_line_lists_issue_counts() {
        let m = NotifyMessage {
            check_key: "pkg.Check".to_string(),
            test: "test_x".to_string(),
            title: "pkg.Check.test_x".to_string(),
            status: TestStatus::Fail,
            failure_count: 2,
            warning_count: 1,
            report_links: Vec::new(),
        };
        let line = summary_line(&m);
        assert!(line.contains("2 failures"));
        assert!(line.contains("1 warnings"));
        assert!(line.contains("(none)"));
    }
}
