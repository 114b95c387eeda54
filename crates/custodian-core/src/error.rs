//! Distinguished error kinds callers branch on.
//!
//! Most failures in this crate flow as an opaque `anyhow::Error` with
//! `.context()` chains, matching the idiom used throughout. The kinds below
//! exist only where calling code needs to `match` on *why* something failed
//! — multi-locker fallback, dependency reruns, push-failure degradation —
//! and are downcast back out of an `anyhow::Error` at the decision point.

use std::path::PathBuf;

use thiserror::Error;

/// Distinguished evidence/locker/runner failure kinds.
#[derive(Debug, Error)]
pub enum EvidenceError {
    /// The path is not present in the locker, or the directory structure
    /// at that path is not a valid evidence layout.
    #[error("evidence not found: {path}")]
    EvidenceNotFound {
        /// Evidence path that was requested.
        path: String,
    },

    /// No commit touching the index existed at or before the requested date.
    #[error("no historical evidence for {path} at or before {requested_at}")]
    HistoricalEvidenceNotFound {
        /// Evidence path that was requested.
        path: String,
        /// The `evidence_dt` cutoff that could not be satisfied.
        requested_at: chrono::DateTime<chrono::Utc>,
    },

    /// TTL exceeded, or the path was explicitly forced stale.
    #[error("evidence is stale: {path}")]
    StaleEvidence {
        /// Evidence path that is stale.
        path: String,
    },

    /// A fetcher declared a dependency on evidence that is not yet present.
    /// The runner queues the dependent fetcher for a rerun pass.
    #[error("dependency unavailable: {fetcher_key} needs {evidence_path}")]
    DependencyUnavailable {
        /// Registration key of the fetcher that raised this.
        fetcher_key: String,
        /// Evidence path the fetcher depends on.
        evidence_path: String,
    },

    /// The rerun loop reached a fixed point or the iteration bound without
    /// resolving a fetcher's dependency; no registered fetcher produces it.
    #[error("no fetcher produces dependency {evidence_path}, needed by {fetcher_key}")]
    DependencyFetcherNotFound {
        /// Registration key of the fetcher whose dependency is unowned.
        fetcher_key: String,
        /// Evidence path nothing in the registry produces.
        evidence_path: String,
    },

    /// Evidence metadata carried a signature but verification failed.
    #[error("signature verification failed for {path}")]
    UnverifiedEvidence {
        /// Evidence path whose signature did not verify.
        path: String,
    },

    /// The remote rejected a push. Not retried automatically within a run.
    #[error("locker push rejected for branch {branch}: {detail}")]
    LockerPushError {
        /// Branch that was pushed.
        branch: String,
        /// Detail captured from the git subprocess's stderr.
        detail: String,
    },

    /// A startup-time configuration problem: missing credentials file, an
    /// invalid mode flag, an empty resolved check set, etc.
    #[error("misconfiguration: {detail} ({pointer})")]
    Misconfiguration {
        /// Human-readable description of the problem.
        detail: String,
        /// Pointer to the offending config key, file, or flag.
        pointer: String,
    },
}

impl EvidenceError {
    /// True for the two "missing" kinds that multi-locker fallback retries on.
    pub fn is_missing(&self) -> bool {
        matches!(
            self,
            EvidenceError::EvidenceNotFound { .. } | EvidenceError::HistoricalEvidenceNotFound { .. }
        )
    }
}

/// Convenience constructor used by locker path validation.
pub fn invalid_path(path: impl Into<PathBuf>) -> anyhow::Error {
    let path = path.into();
    EvidenceError::EvidenceNotFound { path: path.display().to_string() }.into()
}

/// Downcast helper: find an `EvidenceError` inside an `anyhow::Error` chain.
pub fn as_evidence_error(err: &anyhow::Error) -> Option<&EvidenceError> {
    err.downcast_ref::<EvidenceError>()
}
