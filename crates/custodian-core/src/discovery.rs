//! Locating the top-level directory (the one holding `controls.json`) for a
//! set of starting paths, and enumerating fetcher/check/evidence source
//! files beneath it.
//!
//! The original dynamic-import registration this walk drove is replaced
//! here by the explicit [`crate::registry::Registry`] — user code registers
//! its fetchers, checks, and evidence descriptors directly rather than
//! having this module import arbitrary packages. What discovery still does
//! is locate the controls manifest's directory and produce the file
//! inventory the runner uses for naming and diagnostics.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

pub const CONTROLS_FILE: &str = "controls.json";
pub const FETCH_PREFIX: &str = "fetch_";
pub const CHECK_PREFIX: &str = "test_";
pub const EVIDENCES_DIR: &str = "evidences";

/// A non-fatal problem encountered while discovering a top-level tree.
#[derive(Debug, Clone)]
pub struct DiscoveryDiagnostic {
    pub path: PathBuf,
    pub message: String,
}

/// The file inventory discovered under one top-level directory.
#[derive(Debug, Clone, Default)]
pub struct Discovered {
    pub top: PathBuf,
    pub evidences_dirs: Vec<PathBuf>,
    pub fetcher_files: Vec<PathBuf>,
    pub check_files: Vec<PathBuf>,
    pub diagnostics: Vec<DiscoveryDiagnostic>,
}

/// Walk upward from `start` until a directory containing `controls.json`
/// is found. Returns `None` if none of `start`'s ancestors (inclusive) has
/// one.
pub fn find_top_level(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    let mut candidates = Vec::new();
    if start.is_dir() {
        candidates.push(start.clone());
    }
    candidates.extend(start.ancestors().skip(1).map(Path::to_path_buf));

    candidates.into_iter().find(|dir| dir.join(CONTROLS_FILE).is_file())
}

/// Resolve and deduplicate the top-level directories for a set of starting
/// paths, preserving first-seen order.
pub fn find_tops(starts: &[PathBuf]) -> Vec<PathBuf> {
    let mut tops = Vec::new();
    for start in starts {
        if let Some(top) = find_top_level(start) {
            if !tops.contains(&top) {
                tops.push(top);
            }
        }
    }
    tops
}

/// Inventory one top-level directory: every nested `evidences/` directory,
/// plus files whose stem starts with `fetch_`/`test_`. Filesystem errors
/// encountered while walking are captured as diagnostics rather than
/// propagated — a single unreadable subtree must not abort the run.
pub fn discover(top: &Path) -> Discovered {
    let mut result = Discovered { top: top.to_path_buf(), ..Default::default() };

    for entry in WalkDir::new(top).into_iter() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                result.diagnostics.push(DiscoveryDiagnostic {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| top.to_path_buf()),
                    message: e.to_string(),
                });
                continue;
            }
        };

        if entry.file_type().is_dir() && entry.file_name() == EVIDENCES_DIR {
            result.evidences_dirs.push(entry.path().to_path_buf());
            continue;
        }

        if !entry.file_type().is_file() {
            continue;
        }
        let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) else { continue };
        if stem.starts_with(FETCH_PREFIX) {
            result.fetcher_files.push(entry.path().to_path_buf());
        } else if stem.starts_with(CHECK_PREFIX) {
            result.check_files.push(entry.path().to_path_buf());
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn find_top_level_walks_upward_to_controls_json() {
        let td = tempdir().unwrap();
        fs::write(td.path().join(CONTROLS_FILE), "{}").unwrap();
        let nested = td.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        let top = find_top_level(&nested).unwrap();
        assert_eq!(top, td.path().canonicalize().unwrap());
    }

    #[test]
    fn find_top_level_returns_none_without_controls_json() {
        let td = tempdir().unwrap();
        assert!(find_top_level(td.path()).is_none());
    }

    #[test]
    fn discover_finds_evidences_dirs_and_prefixed_files() {
        let td = tempdir().unwrap();
        fs::write(td.path().join(CONTROLS_FILE), "{}").unwrap();
        fs::create_dir_all(td.path().join("svc/evidences")).unwrap();
        fs::write(td.path().join("svc/fetch_users.rs"), "").unwrap();
        fs::write(td.path().join("svc/test_users.rs"), "").unwrap();
        fs::write(td.path().join("svc/helpers.rs"), "").unwrap();

        let discovered = discover(td.path());
        assert_eq!(discovered.evidences_dirs.len(), 1);
        assert_eq!(discovered.fetcher_files.len(), 1);
        assert_eq!(discovered.check_files.len(), 1);
    }

    #[test]
    fn find_tops_deduplicates() {
        let td = tempdir().unwrap();
        fs::write(td.path().join(CONTROLS_FILE), "{}").unwrap();
        let a = td.path().join("a");
        let b = td.path().join("b");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        let tops = find_tops(&[a, b]);
        assert_eq!(tops.len(), 1);
    }
}
