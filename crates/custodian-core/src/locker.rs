//! Git-backed evidence store.
//!
//! A [`Locker`] wraps a single working tree (cloned from a remote, or a
//! fresh local repository when no remote is configured) and knows how to
//! place evidence into it, maintain the per-directory `index.json`
//! metadata files (with tombstone bookkeeping for evidence that stops
//! being produced), validate evidence against its TTL, and fall through to
//! a chain of "extra" lockers when evidence is missing locally.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use crate::agent::Agent;
use crate::config::Config;
use crate::error::EvidenceError;
use crate::evidence::{Evidence, Kind, partition_hash};
use crate::git;

pub const INDEX_FILE: &str = "index.json";
const NOT_EVIDENCE: &[&str] = &[INDEX_FILE, "README.md", "readme.md", "Readme.md"];
const ABANDONED_DEFAULT_SECONDS: i64 = 30 * 24 * 60 * 60;
const LARGE_FILE_DEFAULT_BYTES: u64 = 50_000_000;

/// A process-wide serialization point for index.json read-modify-write
/// cycles, mirroring the single class-level lock every locker instance
/// shared upstream — evidence indexing is never safe to interleave even
/// across independently constructed lockers pointed at the same tree.
static INDEX_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
struct DependencyRerun {
    key: String,
}

pub struct LockerOptions {
    pub name: Option<String>,
    pub repo_url: Option<String>,
    pub repo_url_with_creds: Option<String>,
    pub branch: Option<String>,
    pub local_path: Option<PathBuf>,
    pub do_push: bool,
    pub ttl_tolerance: u64,
    pub clone_depth: Option<u64>,
    pub clone_shallow_days: Option<u64>,
    pub large_file_threshold: u64,
    pub ignore_signatures: bool,
    pub force_push: bool,
}

impl Default for LockerOptions {
    fn default() -> Self {
        Self {
            name: None,
            repo_url: None,
            repo_url_with_creds: None,
            branch: None,
            local_path: None,
            do_push: false,
            ttl_tolerance: 0,
            clone_depth: None,
            clone_shallow_days: None,
            large_file_threshold: LARGE_FILE_DEFAULT_BYTES,
            ignore_signatures: false,
            force_push: false,
        }
    }
}

pub struct Locker {
    pub name: String,
    pub repo_url: Option<String>,
    repo_url_with_creds: Option<String>,
    pub branch: String,
    default_branch: String,
    pub local_path: PathBuf,
    do_push: bool,
    ttl_tolerance: u64,
    clone_depth: Option<u64>,
    clone_shallow_days: Option<u64>,
    large_file_threshold: u64,
    ignore_signatures: bool,
    force_push: bool,
    new_branch: bool,
    commit_date: DateTime<Utc>,
    forced_evidence: Vec<String>,
    dependency_rerun: Mutex<Vec<DependencyRerun>>,
    extra_lockers: Vec<Locker>,
}

impl Locker {
    /// Construct a locker. Does not touch disk until [`Locker::init`] runs.
    pub fn new(opts: LockerOptions) -> Self {
        let branch = opts.branch.clone().unwrap_or_else(|| "master".to_string());
        let name = opts.name.clone().unwrap_or_else(|| {
            opts.repo_url
                .as_deref()
                .and_then(|u| u.rsplit('/').next())
                .map(str::to_string)
                .unwrap_or_else(|| "example".to_string())
        });
        let local_path = opts
            .local_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(&name));

        Self {
            repo_url_with_creds: opts.repo_url_with_creds.clone().or_else(|| opts.repo_url.clone()),
            repo_url: opts.repo_url,
            default_branch: branch.clone(),
            branch,
            name,
            local_path,
            do_push: opts.do_push,
            ttl_tolerance: opts.ttl_tolerance,
            clone_depth: opts.clone_depth,
            clone_shallow_days: opts.clone_shallow_days,
            large_file_threshold: opts.large_file_threshold,
            ignore_signatures: opts.ignore_signatures,
            force_push: opts.force_push,
            new_branch: false,
            commit_date: Utc::now(),
            forced_evidence: Vec::new(),
            dependency_rerun: Mutex::new(Vec::new()),
            extra_lockers: Vec::new(),
        }
    }

    /// Build a locker's chain of fallback lockers from `locker.extra` and
    /// `locker.prev_repo_url` configuration, each already checked out.
    pub fn with_extra_lockers(mut self, cfg: &Config, creds_token: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let settings = cfg.locker_settings();
        let mut extras = Vec::new();
        for entry in &settings.extra {
            // `locker.extra` entries are `repo_url` strings in the simple
            // case; richer per-entry overrides are resolved by callers
            // constructing `LockerOptions` directly before calling this.
            let mut opts = LockerOptions {
                repo_url: Some(entry.clone()),
                ..Default::default()
            };
            opts.repo_url_with_creds = with_token(&opts.repo_url.clone().unwrap(), &creds_token);
            let mut extra = Locker::new(opts);
            extra.init()?;
            extras.push(extra);
        }
        if let Some(prev) = &settings.prev_repo_url {
            let mut opts = LockerOptions { repo_url: Some(prev.clone()), ..Default::default() };
            opts.repo_url_with_creds = with_token(prev, &creds_token);
            let mut extra = Locker::new(opts);
            extra.init()?;
            extras.push(extra);
        }
        self.extra_lockers = extras;
        Ok(self)
    }

    /// Mark these paths as always stale, regardless of TTL, for the
    /// lifetime of this locker (the CLI's `--force` flag).
    pub fn with_forced_evidence(mut self, paths: Vec<String>) -> Self {
        self.forced_evidence = paths;
        self
    }

    pub fn reset_dependency_rerun(&self) {
        self.dependency_rerun.lock().unwrap().clear();
    }

    pub fn add_dependency_rerun(&self, key: &str) {
        self.dependency_rerun.lock().unwrap().push(DependencyRerun { key: key.to_string() });
    }

    /// Fetcher keys queued for a dependency rerun pass.
    pub fn dependency_reruns(&self) -> HashSet<String> {
        self.dependency_rerun.lock().unwrap().iter().map(|r| r.key.clone()).collect()
    }

    /// Clone the remote (if configured) or initialize a fresh local repo,
    /// then check out the configured branch.
    pub fn init(&mut self) -> Result<()> {
        if self.local_path.join(".git").is_dir() {
            return self.checkout_branch();
        }
        if let Some(url) = self.repo_url_with_creds.clone() {
            git::clone(&url, &self.local_path, &self.default_branch, self.clone_depth)?;
        } else {
            git::init(&self.local_path)?;
        }
        self.checkout_branch()
    }

    fn checkout_branch(&mut self) -> Result<()> {
        if git::current_branch(&self.local_path).as_deref() == Some(self.branch.as_str()) {
            return Ok(());
        }
        self.new_branch = git::checkout_or_create(&self.local_path, &self.branch)?;
        Ok(())
    }

    /// HEAD commit SHA of the locker's configured branch. Unlike the
    /// upstream behavior this is always the *configured* branch, not
    /// unconditionally `master`.
    pub fn head_commit(&self) -> Result<Option<String>> {
        git::head_commit(&self.local_path, &self.branch)
    }

    fn index_file_path_for(&self, evidence_path: &str) -> String {
        match evidence_path.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/{INDEX_FILE}"),
            None => INDEX_FILE.to_string(),
        }
    }

    /// Write evidence content to disk and, unless it's transient `tmp/`
    /// evidence, update its directory's index metadata and stage both.
    pub fn add_evidence(
        &self,
        evidence: &Evidence,
        cfg: &Config,
        checks: Option<Value>,
        evidence_used: Option<Value>,
    ) -> Result<()> {
        let content = evidence.content.as_ref().context("evidence has no content to add")?;
        let dir = self.local_path.join(evidence.dir_path(cfg));
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let resolved_name = evidence.resolved_name(cfg);
        if evidence.is_partitioned() {
            for key in evidence.partition_keys()? {
                let hash = partition_hash(&key);
                let part_doc = evidence.get_partition(&key)?;
                let part_bytes = serde_json::to_vec_pretty(&part_doc)?;
                fs::write(dir.join(format!("{hash}_{resolved_name}")), part_bytes)?;
            }
        } else if evidence.binary_content {
            fs::write(dir.join(&resolved_name), content)?;
        } else {
            fs::write(dir.join(&resolved_name), content)?;
        }

        let path = evidence.path(cfg);
        if !path.starts_with("tmp/") {
            self.index(evidence, cfg, checks, evidence_used)?;
        }
        Ok(())
    }

    /// Merge this evidence's metadata into its directory's `index.json`,
    /// tombstoning partitions/files it replaces, and stage the result.
    fn index(
        &self,
        evidence: &Evidence,
        cfg: &Config,
        checks: Option<Value>,
        evidence_used: Option<Value>,
    ) -> Result<()> {
        let _guard = INDEX_LOCK.lock().unwrap();

        let index_rel = self.index_file_path_for(&evidence.path(cfg));
        let index_abs = self.local_path.join(&index_rel);
        let mut metadata: Map<String, Value> = if index_abs.is_file() {
            let raw = fs::read_to_string(&index_abs)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Map::new()
        };

        let resolved_name = evidence.resolved_name(cfg);
        let existing = metadata.get(&resolved_name).cloned().unwrap_or(json!({}));
        let old_partitions: Vec<String> = existing
            .get("partitions")
            .and_then(Value::as_object)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        let mut entry = json!({
            "last_update": self.commit_date.to_rfc3339(),
            "ttl": evidence.ttl,
            "description": evidence.description,
        });

        if let Some(signature) = &evidence.signature {
            entry["agent_name"] = json!(evidence.agent.clone().unwrap_or_default());
            entry["digest"] = json!(evidence.digest.clone().unwrap_or_default());
            entry["signature"] = json!(signature);
        }
        if evidence.is_empty() {
            entry["empty"] = json!(true);
        }

        let mut staged = vec![index_rel.clone()];
        let mut removed: Vec<String> = Vec::new();
        let mut tombstones: Option<Value> = None;

        if evidence.is_partitioned() {
            let unpartitioned_rel = evidence.path(cfg);
            let unpartitioned = self.local_path.join(&unpartitioned_rel);
            if unpartitioned.is_file() {
                fs::remove_file(&unpartitioned).ok();
                removed.push(unpartitioned_rel);
                tombstones = Some(tombstone(
                    &existing,
                    TombstoneTarget::Single(resolved_name.clone()),
                    "Evidence is partitioned",
                    &self.commit_date,
                ));
            }

            let mut parts = Map::new();
            let mut current_hashes = Vec::new();
            for key in evidence.partition_keys()? {
                let hash = partition_hash(&key);
                parts.insert(hash.clone(), Value::Array(key));
                current_hashes.push(hash.clone());
                staged.push(format!("{}/{hash}_{resolved_name}", evidence.dir_path(cfg)));
            }

            let dead: Vec<String> =
                old_partitions.iter().filter(|p| !current_hashes.contains(p)).cloned().collect();
            if !dead.is_empty() {
                for hash in &dead {
                    let rel = format!("{}/{hash}_{resolved_name}", evidence.dir_path(cfg));
                    let file = self.local_path.join(&rel);
                    fs::remove_file(&file).ok();
                    removed.push(rel);
                }
                tombstones = Some(tombstone(
                    &existing,
                    TombstoneTarget::Many(dead),
                    "Partition no longer part of evidence",
                    &self.commit_date,
                ));
            }

            entry["partition_fields"] = json!(evidence.partition_fields);
            entry["partition_root"] = json!(evidence.partition_root);
            entry["partitions"] = Value::Object(parts);

            if tombstones.is_none() {
                tombstones = existing.get("tombstones").cloned();
            }
        } else {
            if !old_partitions.is_empty() {
                for hash in &old_partitions {
                    let rel = format!("{}/{hash}_{resolved_name}", evidence.dir_path(cfg));
                    let file = self.local_path.join(&rel);
                    fs::remove_file(&file).ok();
                    removed.push(rel);
                }
                tombstones = Some(tombstone(
                    &existing,
                    TombstoneTarget::Many(old_partitions),
                    "Evidence no longer partitioned",
                    &self.commit_date,
                ));
            }
            staged.push(evidence.path(cfg));
        }

        if let Some(t) = tombstones {
            entry["tombstones"] = t;
        }
        if let Some(checks) = checks {
            entry["checks"] = checks;
        }
        if let Some(used) = evidence_used {
            entry["evidence"] = used;
        }

        metadata.insert(resolved_name, entry);
        fs::write(&index_abs, serde_json::to_string_pretty(&metadata)?)?;

        git::add(&self.local_path, &staged.iter().map(String::as_str).collect::<Vec<_>>())?;
        if !removed.is_empty() {
            git::remove(&self.local_path, &removed.iter().map(String::as_str).collect::<Vec<_>>())?;
        }
        Ok(())
    }

    /// Fetch evidence, falling back through `extra_lockers` when it's
    /// missing (not stale, not invalid — specifically *absent*) locally.
    pub fn get_evidence(
        &self,
        cfg: &Config,
        evidence_path: &str,
        ignore_ttl: bool,
        evidence_dt: Option<DateTime<Utc>>,
        local_agent: Option<&Agent>,
    ) -> Result<Evidence> {
        match self.get_evidence_local(cfg, evidence_path, ignore_ttl, evidence_dt, local_agent) {
            Ok(mut ev) => {
                ev.locker = Some(self.name.clone());
                Ok(ev)
            }
            Err(err) => {
                let missing = err
                    .downcast_ref::<EvidenceError>()
                    .map(EvidenceError::is_missing)
                    .unwrap_or(false);
                if missing {
                    for extra in &self.extra_lockers {
                        if let Ok(mut ev) = extra.get_evidence_local(
                            cfg,
                            evidence_path,
                            ignore_ttl,
                            evidence_dt,
                            local_agent,
                        ) {
                            ev.locker = Some(extra.name.clone());
                            return Ok(ev);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    fn get_evidence_local(
        &self,
        cfg: &Config,
        evidence_path: &str,
        ignore_ttl: bool,
        evidence_dt: Option<DateTime<Utc>>,
        local_agent: Option<&Agent>,
    ) -> Result<Evidence> {
        let metadata = self.get_evidence_metadata(evidence_path, evidence_dt)?;
        let Some(metadata) = metadata else {
            return Err(EvidenceError::EvidenceNotFound { path: evidence_path.to_string() }.into());
        };

        let segments: Vec<&str> = evidence_path.rsplit('/').take(3).collect();
        if segments.len() < 3 {
            return Err(EvidenceError::EvidenceNotFound { path: evidence_path.to_string() }.into());
        }
        let name = segments[0];
        let category = segments[1];
        let kind_dir = segments[2];
        let Some(kind) = Kind::from_dirname(kind_dir) else {
            return Err(EvidenceError::EvidenceNotFound { path: evidence_path.to_string() }.into());
        };

        let mut evidence = Evidence::new(kind, category, name);
        evidence.ttl = metadata.get("ttl").and_then(Value::as_u64).unwrap_or(kind.default_ttl());
        evidence.description =
            metadata.get("description").and_then(Value::as_str).unwrap_or_default().to_string();
        evidence.partition_fields = metadata.get("partition_fields").and_then(|v| {
            v.as_array().map(|a| a.iter().filter_map(|x| x.as_str().map(str::to_owned)).collect())
        });
        evidence.partition_root =
            metadata.get("partition_root").and_then(Value::as_str).map(str::to_owned);
        evidence.agent = metadata.get("agent_name").and_then(Value::as_str).map(str::to_owned);
        evidence.digest = metadata.get("digest").and_then(Value::as_str).map(str::to_owned);
        evidence.signature = metadata.get("signature").and_then(Value::as_str).map(str::to_owned);

        self.load_content(cfg, &mut evidence, &metadata, ignore_ttl, evidence_dt, local_agent)?;
        Ok(evidence)
    }

    fn load_content(
        &self,
        cfg: &Config,
        evidence: &mut Evidence,
        metadata: &Value,
        ignore_ttl: bool,
        evidence_dt: Option<DateTime<Utc>>,
        local_agent: Option<&Agent>,
    ) -> Result<()> {
        self.validate_evidence(cfg, evidence, metadata, ignore_ttl)?;

        if evidence.is_partitioned() {
            let parts =
                metadata.get("partitions").and_then(Value::as_object).cloned().unwrap_or_default();
            let mut merged: Vec<Value> = Vec::new();
            for hash in parts.keys() {
                let file = format!("{}/{hash}_{}", evidence.dir_path(cfg), evidence.resolved_name(cfg));
                let bytes = self.read_file(&file, evidence_dt)?;
                let doc: Value = serde_json::from_slice(&bytes)?;
                let list = match (&evidence.partition_root, &doc) {
                    (Some(root), Value::Object(_)) => {
                        doc.get(root).and_then(Value::as_array).cloned().unwrap_or_default()
                    }
                    _ => doc.as_array().cloned().unwrap_or_default(),
                };
                merged.extend(list);
            }
            let doc = match &evidence.partition_root {
                Some(root) => json!({ root.clone(): merged }),
                None => Value::Array(merged),
            };
            evidence.set_content(Some(serde_json::to_vec(&doc)?), false, None)?;
        } else {
            let bytes = self.read_file(&evidence.path(cfg), evidence_dt)?;
            evidence.set_content(Some(bytes), false, None)?;
        }

        if !self.ignore_signatures {
            if let (Some(signature), Some(agent_name)) = (&evidence.signature, &evidence.agent) {
                let is_bootstrap_file = evidence.path(cfg) == crate::agent::PUBLIC_KEYS_EVIDENCE_PATH;
                let agent = if is_bootstrap_file {
                    // Verifying the key-distribution file itself against
                    // the locker copy of itself would recurse forever —
                    // fall back to the caller's own configured keypair.
                    local_agent.cloned()
                } else {
                    let mut agent = Agent::new(agent_name.clone());
                    if let Ok(keys) = self.read_file(crate::agent::PUBLIC_KEYS_EVIDENCE_PATH, None) {
                        agent.load_public_key_from_json(&keys);
                    }
                    Some(agent)
                };

                if let Some(agent) = agent {
                    let content = evidence.content.clone().unwrap_or_default();
                    if agent.verifiable() && !agent.verify(&content, signature) {
                        return Err(EvidenceError::UnverifiedEvidence { path: evidence.path(cfg) }.into());
                    }
                }
            }
        }
        Ok(())
    }

    fn read_file(&self, relative: &str, at: Option<DateTime<Utc>>) -> Result<Vec<u8>> {
        match at {
            None => {
                let full = self.local_path.join(relative);
                fs::read(&full).with_context(|| format!("failed to read {}", full.display()))
            }
            Some(dt) => {
                let commit = git::latest_commit_for_path(&self.local_path, relative, Some(dt))?;
                let Some(commit) = commit else {
                    return Err(EvidenceError::HistoricalEvidenceNotFound {
                        path: relative.to_string(),
                        requested_at: dt,
                    }
                    .into());
                };
                git::show_file_at_commit(&self.local_path, &commit, relative)
            }
        }
    }

    fn validate_evidence(
        &self,
        cfg: &Config,
        evidence: &Evidence,
        metadata: &Value,
        ignore_ttl: bool,
    ) -> Result<()> {
        let path = evidence.path(cfg);
        if self.forced_evidence.iter().any(|p| p == &path) {
            return Err(EvidenceError::StaleEvidence { path }.into());
        }

        if evidence.is_partitioned() {
            if let Some(parts) = metadata.get("partitions").and_then(Value::as_object) {
                for hash in parts.keys() {
                    let file = self
                        .local_path
                        .join(format!("{}/{hash}_{}", evidence.dir_path(cfg), evidence.resolved_name(cfg)));
                    if !file.is_file() {
                        bail!("evidence {} was not found in the locker", file.display());
                    }
                }
            }
        } else {
            let file = self.local_path.join(&path);
            if !file.is_file() {
                return Err(EvidenceError::EvidenceNotFound { path }.into());
            }
        }

        if !ignore_ttl {
            let last_update = metadata.get("last_update").and_then(Value::as_str);
            if let Some(last_update) = last_update {
                if let Ok(ts) = DateTime::parse_from_rfc3339(last_update) {
                    let expired = (Utc::now() - ts.with_timezone(&Utc)).num_seconds()
                        >= (evidence.ttl as i64 - self.ttl_tolerance as i64);
                    if expired {
                        return Err(EvidenceError::StaleEvidence { path: evidence.path(cfg) }.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Metadata for `evidence_path`, resolved historically when `evidence_dt`
    /// is given. Returns `None` rather than erroring when nothing is found,
    /// matching the "maybe absent" nature of a metadata probe.
    pub fn get_evidence_metadata(
        &self,
        evidence_path: &str,
        evidence_dt: Option<DateTime<Utc>>,
    ) -> Result<Option<Value>> {
        let index_rel = self.index_file_path_for(evidence_path);
        let Some((_, ev_name)) = evidence_path.rsplit_once('/') else { return Ok(None) };

        let metadata: Value = match evidence_dt {
            Some(dt) => {
                let commit = git::latest_commit_for_path(&self.local_path, &index_rel, Some(dt))?;
                let Some(commit) = commit else { return Ok(None) };
                let bytes = git::show_file_at_commit(&self.local_path, &commit, &index_rel)?;
                serde_json::from_slice(&bytes)?
            }
            None => {
                let full = self.local_path.join(&index_rel);
                if !full.is_file() {
                    return Ok(None);
                }
                serde_json::from_str(&fs::read_to_string(full)?)?
            }
        };

        if let Some(v) = metadata.get(ev_name) {
            return Ok(Some(v.clone()));
        }
        Ok(partitioned_evidence_metadata(&metadata, ev_name))
    }

    /// Validate `evidence` against its TTL; `true` if present and fresh.
    pub fn validate(&self, cfg: &Config, evidence: &Evidence, ignore_ttl: bool) -> Result<bool> {
        if evidence.kind == Kind::Tmp {
            return Ok(self.local_path.join(evidence.path(cfg)).is_file());
        }
        let metadata = self.get_evidence_metadata(&evidence.path(cfg), None)?.unwrap_or(json!({}));
        match self.validate_evidence(cfg, evidence, &metadata, ignore_ttl) {
            Ok(()) => Ok(true),
            Err(e) if e.downcast_ref::<EvidenceError>().is_some() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stage package index updates and commit. Returns `true` if a commit
    /// was actually made (a no-op tree produces no commit).
    pub fn checkin(&self, message: Option<&str>) -> Result<bool> {
        let message = message.map(str::to_owned).unwrap_or_else(|| {
            format!("Files updated at {}", self.commit_date.to_rfc3339())
        });
        git::commit(&self.local_path, &message)
    }

    pub fn push(&self) -> Result<()> {
        if !self.do_push {
            return Ok(());
        }
        let large = self.large_files(self.large_file_threshold)?;
        if !large.is_empty() {
            eprintln!("LARGE FILES (hosting service may reject due to size):");
            for (path, size) in &large {
                eprintln!("      {path} is {:.1} MB", *size as f64 / 1_000_000.0);
            }
        }
        git::push(&self.local_path, &self.branch, self.force_push)
    }

    /// The browsable remote URL for `path`, pinned at `sha` if given or the
    /// current HEAD otherwise. Falls back to the local filesystem path when
    /// the locker has no remote.
    pub fn remote_location(&self, path: &str, sha: Option<&str>, locker_url: Option<&str>) -> String {
        let Some(_) = &self.repo_url_with_creds else {
            return self.local_path.join(path).display().to_string();
        };
        let ref_ = sha.map(str::to_string).unwrap_or_else(|| self.branch.clone());
        let repo_url = locker_url.unwrap_or_else(|| self.repo_url.as_deref().unwrap_or(""));
        format!("{repo_url}/blob/{ref_}/{}", path.trim_matches('/'))
    }

    pub fn add_content(&self, content: &str, folder: &str, filename: &str) -> Result<()> {
        let dir = self.local_path.join(folder);
        fs::create_dir_all(&dir)?;
        let file = dir.join(filename);
        fs::write(&file, content)?;
        git::add(&self.local_path, &[file.strip_prefix(&self.local_path).unwrap_or(&file).to_str().unwrap()])?;
        Ok(())
    }

    pub fn content(&self, folder: &str, filename: &str) -> Result<Option<String>> {
        let file = self.local_path.join(folder).join(filename);
        if !file.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(file)?))
    }

    /// All `reports/**/index.json` metadata, keyed by report path.
    pub fn reports_metadata(&self) -> Result<HashMap<String, Value>> {
        let mut out = HashMap::new();
        let reports_dir = self.local_path.join("reports");
        if !reports_dir.is_dir() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(&reports_dir).into_iter().filter_map(Result::ok) {
            if entry.file_name() != INDEX_FILE {
                continue;
            }
            let parent = entry.path().parent().unwrap_or(Path::new(""));
            let rel_parent = parent.strip_prefix(&self.local_path).unwrap_or(parent);
            let doc: Value = serde_json::from_str(&fs::read_to_string(entry.path())?)?;
            if let Some(map) = doc.as_object() {
                for (name, meta) in map {
                    out.insert(rel_parent.join(name).to_string_lossy().into_owned(), meta.clone());
                }
            }
        }
        Ok(out)
    }

    /// Evidence whose `last_update + ttl + threshold` has elapsed without a
    /// refresh. `threshold` defaults to 30 days past TTL expiry.
    pub fn abandoned_evidences(&self, threshold: Option<i64>) -> Result<HashSet<String>> {
        let threshold = threshold.unwrap_or(ABANDONED_DEFAULT_SECONDS);
        let mut abandoned = HashSet::new();
        for path in self.evidence_files()? {
            let metadata = self.get_evidence_metadata(&path, Some(Utc::now()))?;
            if evidence_abandoned(metadata.as_ref(), threshold) {
                abandoned.insert(path);
            }
        }
        Ok(abandoned)
    }

    /// Paths of evidence whose content was empty when last written.
    pub fn empty_evidences(&self) -> Result<Vec<String>> {
        let mut empty = Vec::new();
        for index_path in self.index_files()? {
            let doc: Value = serde_json::from_str(&fs::read_to_string(self.local_path.join(&index_path))?)?;
            let Some(map) = doc.as_object() else { continue };
            let dir = Path::new(&index_path).parent().unwrap_or(Path::new(""));
            for (name, meta) in map {
                if meta.get("empty").and_then(Value::as_bool).unwrap_or(false) {
                    empty.push(dir.join(name).to_string_lossy().into_owned());
                }
            }
        }
        Ok(empty)
    }

    /// Files in the working tree larger than `size` bytes.
    pub fn large_files(&self, size: u64) -> Result<HashMap<String, u64>> {
        let mut out = HashMap::new();
        for entry in walkdir::WalkDir::new(&self.local_path).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().components().any(|c| c.as_os_str() == ".git") {
                continue;
            }
            let len = entry.metadata()?.len();
            if len > size {
                let rel = entry.path().strip_prefix(&self.local_path).unwrap_or(entry.path());
                out.insert(rel.to_string_lossy().into_owned(), len);
            }
        }
        Ok(out)
    }

    pub fn delete_repo_locally(&self) {
        fs::remove_dir_all(&self.local_path).ok();
    }

    fn evidence_files(&self) -> Result<Vec<String>> {
        self.tracked_files(|name, rel| {
            !rel.starts_with("notifications/") && rel != "check_results.json" && !NOT_EVIDENCE.contains(&name)
        })
    }

    fn index_files(&self) -> Result<Vec<String>> {
        self.tracked_files(|name, _rel| name == INDEX_FILE)
    }

    fn tracked_files(&self, keep: impl Fn(&str, &str) -> bool) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&self.local_path).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().components().any(|c| c.as_os_str() == ".git") {
                continue;
            }
            let rel = entry.path().strip_prefix(&self.local_path).unwrap_or(entry.path());
            let rel_str = rel.to_string_lossy().into_owned();
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep(&name, &rel_str) {
                out.push(rel_str);
            }
        }
        Ok(out)
    }
}

enum TombstoneTarget {
    Single(String),
    Many(Vec<String>),
}

fn tombstone(existing: &Value, target: TombstoneTarget, reason: &str, commit_date: &DateTime<Utc>) -> Value {
    let mut tombstones =
        existing.get("tombstones").and_then(Value::as_object).cloned().unwrap_or_default();
    match target {
        TombstoneTarget::Single(name) => {
            let entry = json!({
                "eol": commit_date.to_rfc3339(),
                "last_update": existing.get("last_update"),
                "reason": reason,
            });
            tombstones.entry(name).or_insert_with(|| Value::Array(Vec::new())).as_array_mut().unwrap().push(entry);
        }
        TombstoneTarget::Many(parts) => {
            for part in parts {
                let entry = json!({
                    "eol": commit_date.to_rfc3339(),
                    "last_update": existing.get("last_update"),
                    "partition_fields": existing.get("partition_fields"),
                    "partition_root": existing.get("partition_root"),
                    "partition_key": existing.get("partitions").and_then(|p| p.get(&part)),
                    "reason": reason,
                });
                tombstones.entry(part).or_insert_with(|| Value::Array(Vec::new())).as_array_mut().unwrap().push(entry);
            }
        }
    }
    Value::Object(tombstones)
}

fn partitioned_evidence_metadata(metadata: &Value, evidence_name: &str) -> Option<Value> {
    let (part, ev_name) = evidence_name.split_once('_')?;
    let entry = metadata.get(ev_name)?;
    let partitions = entry.get("partitions")?.as_object()?;
    if partitions.contains_key(part) { Some(entry.clone()) } else { None }
}

fn evidence_abandoned(metadata: Option<&Value>, threshold: i64) -> bool {
    let Some(metadata) = metadata else { return true };
    let Some(last_update) = metadata.get("last_update").and_then(Value::as_str) else { return true };
    let Ok(ts) = DateTime::parse_from_rfc3339(last_update) else { return true };
    let ttl = metadata.get("ttl").and_then(Value::as_i64).unwrap_or(0);
    (Utc::now() - ts.with_timezone(&Utc)).num_seconds() >= threshold + ttl
}

fn with_token(url: &str, creds_token: &impl Fn(&str) -> Option<String>) -> Option<String> {
    let host = url::Url::parse(url).ok()?.host_str()?.to_string();
    let section = if host.contains("github.com") {
        "github"
    } else if host.contains("github") {
        "github_enterprise"
    } else if host.contains("bitbucket") {
        "bitbucket"
    } else if host.contains("gitlab") {
        "gitlab"
    } else {
        return Some(url.to_string());
    };
    match creds_token(section) {
        Some(token) => Some(url.replacen("://", &format!("://{token}@"), 1)),
        None => Some(url.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    fn local_locker(path: &Path) -> Locker {
        Locker::new(LockerOptions { local_path: Some(path.to_path_buf()), ..Default::default() })
    }

    #[test]
    #[serial]
    fn init_creates_local_repo_when_no_remote() {
        let td = tempdir().unwrap();
        let mut locker = local_locker(td.path());
        locker.init().unwrap();
        assert!(td.path().join(".git").exists());
    }

    #[test]
    #[serial]
    fn add_and_fetch_evidence_round_trip() {
        let td = tempdir().unwrap();
        let mut locker = local_locker(td.path());
        locker.init().unwrap();
        git::set_config(td.path(), "user.email", "t@example.com").unwrap();
        git::set_config(td.path(), "user.name", "T").unwrap();

        let cfg = Config::from_value(json!({}));
        let mut ev = Evidence::new(Kind::Raw, "svc", "output.json");
        ev.set_content(Some(b"{\"a\":1}".to_vec()), false, None).unwrap();
        locker.add_evidence(&ev, &cfg, None, None).unwrap();
        locker.checkin(Some("add evidence")).unwrap();

        let fetched = locker.get_evidence(&cfg, "raw/svc/output.json", true, None, None).unwrap();
        assert_eq!(fetched.content_as_json().unwrap(), json!({"a": 1}));
    }

    #[test]
    #[serial]
    fn partitioned_evidence_round_trip_and_tombstone() {
        let td = tempdir().unwrap();
        let mut locker = local_locker(td.path());
        locker.init().unwrap();
        git::set_config(td.path(), "user.email", "t@example.com").unwrap();
        git::set_config(td.path(), "user.name", "T").unwrap();
        let cfg = Config::from_value(json!({}));

        let mut ev = Evidence::new(Kind::Raw, "ppl", "people.json");
        ev.partition_fields = Some(vec!["lname".into()]);
        ev.set_content(
            Some(br#"[{"fname":"jeff","lname":"lebowski"},{"fname":"walter","lname":"sobchak"}]"#.to_vec()),
            false,
            None,
        )
        .unwrap();
        locker.add_evidence(&ev, &cfg, None, None).unwrap();
        locker.checkin(Some("add partitioned evidence")).unwrap();

        let meta = locker.get_evidence_metadata("raw/ppl/people.json", None).unwrap().unwrap();
        assert_eq!(meta["partitions"].as_object().unwrap().len(), 2);

        let mut ev2 = Evidence::new(Kind::Raw, "ppl", "people.json");
        ev2.partition_fields = Some(vec!["lname".into()]);
        ev2.set_content(
            Some(br#"[{"fname":"jeff","lname":"lebowski"}]"#.to_vec()),
            false,
            None,
        )
        .unwrap();
        locker.add_evidence(&ev2, &cfg, None, None).unwrap();
        locker.checkin(Some("drop sobchak partition")).unwrap();

        let meta2 = locker.get_evidence_metadata("raw/ppl/people.json", None).unwrap().unwrap();
        assert_eq!(meta2["partitions"].as_object().unwrap().len(), 1);
        assert!(meta2.get("tombstones").is_some());

        // The dropped partition file is gone from disk *and* out of the
        // committed tree, not just unstaged.
        let tracked = git::ls_tree_recursive(td.path(), &locker.branch).unwrap();
        assert!(!tracked.iter().any(|f| f.contains("sobchak")), "dropped partition file still tracked at HEAD: {tracked:?}");
        assert!(git::status_porcelain(td.path()).unwrap().trim().is_empty(), "removal left uncommitted changes");
    }

    #[test]
    #[serial]
    fn unpartitioned_then_partitioned_drops_old_file_from_git() {
        let td = tempdir().unwrap();
        let mut locker = local_locker(td.path());
        locker.init().unwrap();
        git::set_config(td.path(), "user.email", "t@example.com").unwrap();
        git::set_config(td.path(), "user.name", "T").unwrap();
        let cfg = Config::from_value(json!({}));

        let mut ev = Evidence::new(Kind::Raw, "ppl", "people.json");
        ev.set_content(Some(br#"[{"fname":"jeff","lname":"lebowski"}]"#.to_vec()), false, None).unwrap();
        locker.add_evidence(&ev, &cfg, None, None).unwrap();
        locker.checkin(Some("add unpartitioned evidence")).unwrap();

        let mut ev2 = Evidence::new(Kind::Raw, "ppl", "people.json");
        ev2.partition_fields = Some(vec!["lname".into()]);
        ev2.set_content(Some(br#"[{"fname":"jeff","lname":"lebowski"}]"#.to_vec()), false, None).unwrap();
        locker.add_evidence(&ev2, &cfg, None, None).unwrap();
        locker.checkin(Some("partition the evidence")).unwrap();

        assert!(!td.path().join("raw/ppl/people.json").exists());
        let tracked = git::ls_tree_recursive(td.path(), &locker.branch).unwrap();
        assert!(!tracked.iter().any(|f| f == "raw/ppl/people.json"), "old unpartitioned file still tracked at HEAD");
        assert!(git::status_porcelain(td.path()).unwrap().trim().is_empty(), "removal left uncommitted changes");
    }

    #[test]
    fn empty_metadata_marks_abandoned() {
        assert!(evidence_abandoned(None, ABANDONED_DEFAULT_SECONDS));
    }
}
