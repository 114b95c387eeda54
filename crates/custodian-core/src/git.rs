//! Thin wrapper over the `git` binary, shelled out to via
//! [`std::process::Command`] rather than a bindings crate — the idiom the
//! rest of this codebase's ancestry uses throughout.
//!
//! The binary path is overridable via `CUSTODIAN_GIT_BIN` so tests can
//! point at a fake shell-script `git` that records invocations.

use std::env;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};

use crate::error::EvidenceError;

pub fn git_program() -> String {
    env::var("CUSTODIAN_GIT_BIN").unwrap_or_else(|_| "git".to_string())
}

fn run(cwd: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new(git_program())
        .args(args)
        .current_dir(cwd)
        .output()
        .with_context(|| format!("failed to execute git {}", args.join(" ")))
}

fn run_ok(cwd: &Path, args: &[&str]) -> Result<String> {
    let out = run(cwd, args)?;
    if !out.status.success() {
        bail!("git {} failed: {}", args.join(" "), String::from_utf8_lossy(&out.stderr).trim());
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Initialize a fresh working tree at `path` (no remote).
pub fn init(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create locker dir {}", path.display()))?;
    run_ok(path, &["init"])?;
    Ok(())
}

/// Clone `url` into `dest`, optionally shallow.
pub fn clone(url: &str, dest: &Path, branch: &str, depth: Option<u64>) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let depth_str;
    let mut args = vec!["clone", "--branch", branch, url, dest.to_str().unwrap_or(".")];
    if let Some(d) = depth {
        depth_str = d.to_string();
        args.insert(1, &depth_str);
        args.insert(1, "--depth");
    }
    let cwd = dest.parent().unwrap_or(Path::new("."));
    let out = run(cwd, &args)?;
    if !out.status.success() {
        bail!("git clone of {url} failed: {}", String::from_utf8_lossy(&out.stderr).trim());
    }
    Ok(())
}

/// Check out `branch`, creating it from the current HEAD if it doesn't
/// exist. Returns `true` if the branch was newly created.
pub fn checkout_or_create(path: &Path, branch: &str) -> Result<bool> {
    let exists = run(path, &["rev-parse", "--verify", branch])?.status.success();
    if exists {
        run_ok(path, &["checkout", branch])?;
        Ok(false)
    } else {
        run_ok(path, &["checkout", "-b", branch])?;
        Ok(true)
    }
}

pub fn current_branch(path: &Path) -> Option<String> {
    let out = run(path, &["rev-parse", "--abbrev-ref", "HEAD"]).ok()?;
    if out.status.success() {
        let branch = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if branch == "HEAD" { None } else { Some(branch) }
    } else {
        None
    }
}

pub fn set_config(path: &Path, key: &str, value: &str) -> Result<()> {
    run_ok(path, &["config", key, value])?;
    Ok(())
}

/// Stage the given pathspecs (relative to `path`).
pub fn add(path: &Path, pathspecs: &[&str]) -> Result<()> {
    if pathspecs.is_empty() {
        return Ok(());
    }
    let mut args = vec!["add"];
    args.extend(pathspecs);
    run_ok(path, &args)?;
    Ok(())
}

pub fn remove(path: &Path, pathspecs: &[&str]) -> Result<()> {
    if pathspecs.is_empty() {
        return Ok(());
    }
    let mut args = vec!["rm", "-f", "--quiet"];
    args.extend(pathspecs);
    run_ok(path, &args)?;
    Ok(())
}

/// Returns `true` if anything was actually committed.
pub fn commit(path: &Path, message: &str) -> Result<bool> {
    if status_porcelain(path)?.trim().is_empty() {
        return Ok(false);
    }
    run_ok(path, &["commit", "-m", message])?;
    Ok(true)
}

pub fn status_porcelain(path: &Path) -> Result<String> {
    run_ok(path, &["status", "--porcelain"])
}

pub fn push(path: &Path, branch: &str, force: bool) -> Result<()> {
    let mut args = vec!["push", "origin", branch];
    if force {
        args.insert(1, "--force");
    }
    let out = run(path, &args)?;
    if !out.status.success() {
        return Err(EvidenceError::LockerPushError {
            branch: branch.to_string(),
            detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(())
}

/// The latest commit SHA touching `file`, not later than `until` (if given).
pub fn latest_commit_for_path(path: &Path, file: &str, until: Option<DateTime<Utc>>) -> Result<Option<String>> {
    let mut args = vec!["log", "-n", "1", "--format=%H"];
    let before_arg;
    if let Some(dt) = until {
        before_arg = format!("--before={}", dt.to_rfc3339());
        args.push(&before_arg);
    }
    args.push("--");
    args.push(file);
    let out = run_ok(path, &args)?;
    Ok(if out.is_empty() { None } else { Some(out) })
}

/// Read the content of `file` as it existed at `commit`.
pub fn show_file_at_commit(path: &Path, commit: &str, file: &str) -> Result<Vec<u8>> {
    let out = run(path, &["show", &format!("{commit}:{file}")])?;
    if !out.status.success() {
        bail!(
            "git show {commit}:{file} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(out.stdout)
}

/// The date of the oldest commit reachable from HEAD (used to describe a
/// shallow clone's history bound in the log message).
pub fn earliest_commit_date(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let out = run_ok(path, &["log", "--reverse", "--format=%aI", "-n", "1"])?;
    if out.is_empty() {
        return Ok(None);
    }
    Ok(DateTime::parse_from_rfc3339(&out).ok().map(|d| d.with_timezone(&Utc)))
}

pub fn head_commit(path: &Path, branch: &str) -> Result<Option<String>> {
    let out = run(path, &["rev-parse", branch])?;
    if out.status.success() {
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    } else {
        Ok(None)
    }
}

/// All files present at HEAD of `branch`, relative to `path`.
pub fn ls_tree_recursive(path: &Path, branch: &str) -> Result<Vec<String>> {
    let out = run_ok(path, &["ls-tree", "-r", "--name-only", branch])?;
    Ok(out.lines().map(str::to_owned).collect())
}

pub fn blob_size(path: &Path, branch: &str, file: &str) -> Result<Option<u64>> {
    let spec = format!("{branch}:{file}");
    let out = run(path, &["cat-file", "-s", &spec])?;
    if !out.status.success() {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&out.stdout);
    Ok(text.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    fn configure_identity(path: &Path) {
        set_config(path, "user.email", "test@example.com").unwrap();
        set_config(path, "user.name", "Test").unwrap();
    }

    #[test]
    #[serial]
    fn init_creates_repo() {
        let td = tempdir().unwrap();
        init(td.path()).unwrap();
        assert!(td.path().join(".git").exists());
    }

    #[test]
    #[serial]
    fn commit_returns_false_when_nothing_staged() {
        let td = tempdir().unwrap();
        init(td.path()).unwrap();
        configure_identity(td.path());
        assert!(!commit(td.path(), "empty").unwrap());
    }

    #[test]
    #[serial]
    fn commit_and_log_roundtrip() {
        let td = tempdir().unwrap();
        init(td.path()).unwrap();
        configure_identity(td.path());
        fs::write(td.path().join("a.txt"), b"hello").unwrap();
        add(td.path(), &["a.txt"]).unwrap();
        assert!(commit(td.path(), "add a.txt").unwrap());

        let sha = latest_commit_for_path(td.path(), "a.txt", None).unwrap();
        assert!(sha.is_some());

        let content = show_file_at_commit(td.path(), &sha.unwrap(), "a.txt").unwrap();
        assert_eq!(content, b"hello");
    }

    #[test]
    #[serial]
    fn checkout_or_create_reports_new_branch() {
        let td = tempdir().unwrap();
        init(td.path()).unwrap();
        configure_identity(td.path());
        fs::write(td.path().join("a.txt"), b"hello").unwrap();
        add(td.path(), &["a.txt"]).unwrap();
        commit(td.path(), "init").unwrap();

        let created = checkout_or_create(td.path(), "evidence").unwrap();
        assert!(created);
        let created_again = checkout_or_create(td.path(), "evidence").unwrap();
        assert!(!created_again);
    }
}
