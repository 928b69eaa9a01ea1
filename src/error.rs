//! Error types for the ops-guard service
//!
//! Guard *denials* (kill-switched, rate-limited, circuit-open) are ordinary return
//! values, never errors — see [`crate::guard::Denial`]. The variants here cover
//! faults: configuration problems, injected failures, and bugs inside the guard
//! chain itself.

use std::io;

use thiserror::Error;

/// Result type alias for ops-guard
pub type Result<T> = std::result::Result<T, Error>;

/// Ops-guard errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A dependency timed out (real, or injected via `FaultPoint::DbTimeout`)
    #[error("Dependency timeout: {0}")]
    Timeout(String),

    /// An upstream service returned a server error (real, or injected via
    /// `FaultPoint::External5xxBurst`)
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// A fault inside the guard-evaluation chain itself. The orchestrator
    /// catches this at its boundary and fails open.
    #[error("Guard internal error: {0}")]
    GuardInternal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error originated inside the guard chain, as opposed to a
    /// dependency or configuration fault.
    #[must_use]
    pub fn is_guard_internal(&self) -> bool {
        matches!(self, Self::GuardInternal(_))
    }
}
