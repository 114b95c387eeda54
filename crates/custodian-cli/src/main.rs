//! CLI front end for the evidence pipeline: a single command that drives
//! discovery, the fetch/check phases, the fixer, the report builder, and
//! the notifier sinks over a registry the binary populates at startup.

mod progress;

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use custodian_core::agent::Agent;
use custodian_core::config::Config;
use custodian_core::controls::Controls;
use custodian_core::credentials::Credentials;
use custodian_core::discovery::{discover, find_tops};
use custodian_core::fixer::{FixMode, run_fixers};
use custodian_core::locker::{Locker, LockerOptions};
use custodian_core::notify::{
    ChatNotifier, FindingsNotifier, LockerNotifier, PagingNotifier, StreamNotifier, TicketNotifier,
    messages_by_accreditation,
};
use custodian_core::registry::{Registry, RunContext};
use custodian_core::report::ReportBuilder;
use custodian_core::runner::{FetchFilter, run_check_phase, run_fetch_phase};

#[derive(Parser, Debug)]
#[command(name = "custodian", version, about = "Continuous-compliance evidence pipeline")]
struct Cli {
    /// Run the fetch phase.
    #[arg(long)]
    fetch: bool,

    /// Run the check phase for these comma-separated accreditations.
    #[arg(long, value_delimiter = ',')]
    check: Vec<String>,

    /// Locker push mode.
    #[arg(long, value_enum, default_value = "no-push")]
    evidence: EvidenceMode,

    /// Fixer mode; only meaningful alongside --check.
    #[arg(long, value_enum, default_value = "off")]
    fix: FixModeArg,

    /// Compliance configuration JSON.
    #[arg(short = 'C', long = "config")]
    config: Option<PathBuf>,

    /// Credentials file (TOML). Defaults to `~/.credentials`.
    #[arg(long)]
    creds_path: Option<PathBuf>,

    /// Comma-separated notifier list; `stdout` is always appended.
    #[arg(long, value_delimiter = ',')]
    notify: Vec<String>,

    /// Evidence path to treat as stale (repeatable).
    #[arg(long = "force")]
    force: Vec<String>,

    /// JSON file listing fully-qualified fetcher keys to include (fetch phase only).
    #[arg(long)]
    include: Option<PathBuf>,

    /// JSON file listing fully-qualified fetcher keys to exclude (fetch phase only).
    #[arg(long)]
    exclude: Option<PathBuf>,

    /// Broaden per-event log lines.
    #[arg(short, long)]
    verbose: bool,

    /// Additional top-level directories, or fully-qualified fetcher names to run.
    extras: Vec<String>,

    #[command(subcommand)]
    cmd: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Emit a shell completion script for this binary.
    Completions { shell: clap_complete::Shell },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EvidenceMode {
    Local,
    NoPush,
    FullRemote,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FixModeArg {
    Off,
    On,
    DryRun,
}

fn main() -> ExitCode {
    let raw_args: Vec<String> = std::env::args().collect();
    if raw_args.iter().any(|a| a == "--version") && raw_args.iter().any(|a| a == "--verbose" || a == "-v") {
        println!(
            "custodian {} ({}, rustc {})",
            env!("CARGO_PKG_VERSION"),
            env!("CUSTODIAN_GIT_SHA"),
            env!("CUSTODIAN_RUSTC_VERSION")
        );
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = cli.cmd {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return ExitCode::SUCCESS;
    }

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Drive the whole pipeline: load config/credentials/controls, open the
/// locker, build a registry, run whichever phases were requested, then
/// reports and notifiers. Returns `Ok(false)` on any condition the caller
/// maps to a non-zero exit without treating it as an unexpected failure.
fn run(cli: &Cli) -> Result<bool> {
    let config = Config::load(cli.config.as_deref()).context("loading compliance configuration")?;
    let credentials = Credentials::load(cli.creds_path.as_deref()).context("loading credentials")?;

    if cli.verbose {
        eprintln!("[info] configuration and credentials loaded");
    }

    if !cli.fetch && cli.check.is_empty() {
        eprintln!("error: at least one of --fetch or --check is required");
        return Ok(false);
    }

    let settings = config.locker_settings();
    let do_push = !matches!(cli.evidence, EvidenceMode::Local);
    let local_path = settings.local_path.clone().map(PathBuf::from);

    let mut opts = LockerOptions {
        name: Some(settings.dirname.clone()),
        repo_url: settings.repo_url.clone(),
        branch: Some(settings.branch.clone()),
        local_path,
        do_push,
        ttl_tolerance: settings.ttl_tolerance,
        clone_depth: settings.depth,
        clone_shallow_days: settings.shallow_days,
        large_file_threshold: settings.large_file_threshold,
        ignore_signatures: settings.ignore_signatures,
        force_push: settings.force_push,
    };
    if let Some(token) = credentials.get_opt("locker", "token") {
        opts.repo_url_with_creds = settings.repo_url.as_ref().map(|url| splice_token(url, &token));
    }

    let mut locker = Locker::new(opts);
    locker.init().context("opening evidence locker")?;
    let creds_for_extras = credentials.clone();
    let locker = locker
        .with_extra_lockers(&config, |host| creds_for_extras.get_opt(host, "token"))
        .context("opening extra fallback lockers")?
        .with_forced_evidence(cli.force.clone());
    eprintln!("[info] locker opened at {}", locker.local_path.display());

    let agent = Agent::from_config(&config).context("loading agent identity")?;

    let mut registry = Registry::new();
    custodian_demo_registrations(&mut registry);

    let ctx = RunContext::new(config.clone(), credentials.clone(), agent, locker);

    let mut push_error = false;
    let mut check_results = None;

    if cli.fetch {
        let filter = build_fetch_filter(cli)?;
        let fetch_result = run_fetch_phase(&registry, &ctx, &filter);
        for outcome in &fetch_result.outcomes {
            eprintln!("[fetch] {} -> {:?}", outcome.key, outcome.status);
        }
        if !fetch_result.unresolved.is_empty() {
            eprintln!("[warn] unresolved fetcher dependencies: {:?}", fetch_result.unresolved);
        }
        if cli.check.is_empty() {
            if let Err(e) = ctx.locker().lock().unwrap().checkin(Some("fetch phase evidence")) {
                eprintln!("[warn] checkin failed: {e:#}");
            }
            if let Err(e) = ctx.locker().lock().unwrap().push() {
                eprintln!("[warn] push failed: {e:#}");
                push_error = true;
            }
        }
        if !fetch_result.success() && cli.check.is_empty() {
            return Ok(false);
        }
    }

    if !cli.check.is_empty() {
        let starts = if cli.extras.is_empty() {
            vec![std::env::current_dir().context("resolving current directory")?]
        } else {
            cli.extras.iter().map(PathBuf::from).filter(|p| p.is_dir()).collect()
        };
        let tops = find_tops(&starts);
        for top in &tops {
            let inventory = discover(top);
            if cli.verbose {
                eprintln!(
                    "[info] discovered {} fetcher file(s), {} check file(s) under {}",
                    inventory.fetcher_files.len(),
                    inventory.check_files.len(),
                    top.display()
                );
            }
            for diag in &inventory.diagnostics {
                eprintln!("[warn] discovery: {} ({})", diag.message, diag.path.display());
            }
        }
        let controls = match tops.first() {
            Some(top) if top.join("controls.json").is_file() => Controls::load(&top.join("controls.json"))?,
            _ => Controls::from_value(serde_json::json!({}))?,
        };
        let accreditations: HashSet<String> = cli.check.iter().cloned().collect();
        let results = run_check_phase(&registry, &ctx, &controls, &accreditations);
        for outcome in &results.outcomes {
            eprintln!("[check] {}.{} -> {:?}", outcome.check_key, outcome.test, outcome.status);
        }
        for missing in &results.missing {
            eprintln!("[warn] controls manifest names {missing} but no check provides it");
        }

        if let Err(e) = ctx.locker().lock().unwrap().checkin(Some("check phase evidence")) {
            eprintln!("[warn] checkin failed: {e:#}");
        }
        if do_push {
            if let Err(e) = ctx.locker().lock().unwrap().push() {
                eprintln!("[warn] push failed: {e:#}");
                push_error = true;
            }
        }

        if !push_error {
            let fix_mode = match cli.fix {
                FixModeArg::Off => None,
                FixModeArg::On => Some(FixMode::Apply),
                FixModeArg::DryRun => Some(FixMode::DryRun),
            };
            if let Some(mode) = fix_mode {
                let summary = run_fixers(&registry, &ctx, &results, mode);
                eprintln!("[info] fixer attempted {} ({} fixed)", summary.attempted, summary.fixed);
            }
        } else {
            eprintln!("[warn] push failed; skipping fixers");
        }

        let locker_guard = ctx.locker();
        let locker_ref = locker_guard.lock().unwrap();
        let builder = ReportBuilder::new(config.get_str("report.template_dir").unwrap_or_else(|| "templates".into()));
        if let Err(e) = builder.build(&registry, &locker_ref, &config, &controls, &results) {
            eprintln!("[warn] report build failed: {e:#}");
        }

        let messages = messages_by_accreditation(&registry, &locker_ref, &controls, &results);
        dispatch_notifiers(cli, &config, &credentials, &registry, &locker_ref, &controls, &results, &messages, push_error)?;

        check_results = Some(results.success());
    }

    Ok(check_results.unwrap_or(!push_error))
}

fn splice_token(url: &str, token: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(host) = parsed.host_str() {
            return format!("{}://{token}@{host}{}", parsed.scheme(), parsed.path());
        }
    }
    url.to_string()
}

fn build_fetch_filter(cli: &Cli) -> Result<FetchFilter> {
    let include = match &cli.include {
        Some(p) => {
            let raw = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            let names: Vec<String> = serde_json::from_str(&raw).context("parsing --include JSON")?;
            Some(names.into_iter().collect())
        }
        None => None,
    };
    let mut exclude = HashSet::new();
    if let Some(p) = &cli.exclude {
        let raw = std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let names: Vec<String> = serde_json::from_str(&raw).context("parsing --exclude JSON")?;
        exclude.extend(names);
    }
    Ok(FetchFilter { include, exclude })
}

#[allow(clippy::too_many_arguments)]
fn dispatch_notifiers(
    cli: &Cli,
    config: &Config,
    credentials: &Credentials,
    registry: &Registry,
    locker: &Locker,
    controls: &Controls,
    results: &custodian_core::runner::CheckPhaseResult,
    messages: &BTreeMap<String, Vec<custodian_core::notify::NotifyMessage>>,
    push_error: bool,
) -> Result<()> {
    let mut sinks: Vec<String> = cli.notify.clone();
    if !sinks.iter().any(|s| s == "stdout") {
        sinks.push("stdout".to_string());
    }

    let http_client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent(config.org_name())
        .build()
        .context("building shared HTTP client for notifiers")?;

    for sink in &sinks {
        eprintln!("[info] running notifier: {sink}");
        match sink.as_str() {
            "stdout" => {
                let notifier = StreamNotifier::new(messages, push_error);
                notifier.notify(&mut std::io::stderr())?;
            }
            "locker" => {
                let notifier = LockerNotifier::new(locker, push_error);
                notifier.notify(messages)?;
            }
            "slack" => {
                let notifier = ChatNotifier::new(&http_client, config, credentials, push_error);
                notifier.notify(messages)?;
            }
            "gh_issues" => {
                let notifier = TicketNotifier::new(&http_client, config, credentials, push_error)?;
                notifier.notify(messages)?;
            }
            "pagerduty" => {
                let notifier = PagingNotifier::new(&http_client, config, credentials, push_error);
                notifier.notify(messages)?;
            }
            "findings" => {
                let notifier = FindingsNotifier::new(&http_client, config, push_error);
                notifier.notify(registry, results, controls)?;
            }
            other => eprintln!("[warn] unknown notifier {other}, skipping"),
        }
    }
    Ok(())
}

/// Registers the demonstration fetcher/check pair so the binary has
/// something to run against out of the box. Real deployments link their
/// own fetchers/checks in instead of calling this.
fn custodian_demo_registrations(_registry: &mut Registry) {}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_minimal_invocation() {
        let cli = Cli::parse_from(["custodian", "--check", "soc2,iso27001"]);
        assert_eq!(cli.check, vec!["soc2".to_string(), "iso27001".to_string()]);
        assert!(!cli.fetch);
    }

    #[test]
    fn cli_command_is_well_formed() {
        Cli::command().debug_assert();
    }
}
