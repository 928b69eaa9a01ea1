//! Ops-Guard
//!
//! Operational safety guards for the invoice-processing admin API:
//!
//! - **Circuit breakers** per dependency (DB primary/replica, cache, external
//!   tariff API, import workers) with a rolling failure-rate window
//! - **Rate limiting** with deterministic fixed windows per endpoint class
//! - **Kill switches** — the operator-controlled emergency brake
//! - **Fault injection** for drills and failure testing
//! - A **guard orchestrator** middleware that sequences them and fails open
//!   when the guard chain itself errors
//!
//! Denials are values (429/503 with a structured body), faults are errors,
//! and no guard operation performs blocking I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod metrics;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
