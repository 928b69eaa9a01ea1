//! Kill switches — the operator-controlled emergency brake.
//!
//! Named independent boolean switches checked before any other guard. An
//! enabled switch short-circuits the chain with a 503 denial, without touching
//! rate-limit or circuit-breaker counters. Unknown switch names read as
//! disabled: blocking on a typo would block everything.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::metrics::{KILL_SWITCH_ENABLED, MetricsSink};

/// Switch blocking all invoice-import traffic.
pub const GLOBAL_IMPORT: &str = "global_import";
/// Switch shedding expensive (import + heavy-read) traffic.
pub const DEGRADE_MODE: &str = "degrade_mode";

/// Name of the per-tenant switch for `tenant_id`.
#[must_use]
pub fn tenant_switch(tenant_id: &str) -> String {
    format!("tenant:{tenant_id}")
}

/// State of a single switch, including the audit trail of the last toggle.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchState {
    /// Whether the switch currently blocks traffic
    pub enabled: bool,
    /// Who last toggled it
    pub actor: String,
    /// When it was last toggled
    pub toggled_at: DateTime<Utc>,
}

/// Named-switch entry for admin listings.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchInfo {
    /// Switch name
    pub name: String,
    /// Current state
    #[serde(flatten)]
    pub state: SwitchState,
}

/// Manager for all kill switches in the process.
#[derive(Debug)]
pub struct KillSwitchManager {
    switches: DashMap<String, SwitchState>,
    metrics: Arc<dyn MetricsSink>,
}

impl KillSwitchManager {
    /// Create a manager seeded from the configured initial states.
    #[must_use]
    pub fn new<'a, I>(initial: I, metrics: Arc<dyn MetricsSink>) -> Self
    where
        I: IntoIterator<Item = (&'a str, bool)>,
    {
        let manager = Self {
            switches: DashMap::new(),
            metrics,
        };
        for (name, enabled) in initial {
            manager.switches.insert(
                name.to_string(),
                SwitchState {
                    enabled,
                    actor: "startup".to_string(),
                    toggled_at: Utc::now(),
                },
            );
            manager.export_gauge(name, enabled);
        }
        manager
    }

    /// O(1) check. Unknown names return `false`.
    #[must_use]
    #[inline]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.switches.get(name).is_some_and(|s| s.enabled)
    }

    /// Toggle a switch, recording the actor for audit.
    ///
    /// Returns the previous state (`false` for a previously unknown switch),
    /// so callers can log idempotent toggles.
    pub fn set_switch(&self, name: &str, enabled: bool, actor: &str) -> bool {
        let previous = self
            .switches
            .insert(
                name.to_string(),
                SwitchState {
                    enabled,
                    actor: actor.to_string(),
                    toggled_at: Utc::now(),
                },
            )
            .is_some_and(|s| s.enabled);

        self.export_gauge(name, enabled);
        if enabled {
            warn!(switch = name, actor, previous, "Kill switch engaged");
        } else {
            info!(switch = name, actor, previous, "Kill switch released");
        }
        previous
    }

    /// Snapshot of all switches, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SwitchInfo> {
        let mut switches: Vec<SwitchInfo> = self
            .switches
            .iter()
            .map(|entry| SwitchInfo {
                name: entry.key().clone(),
                state: entry.value().clone(),
            })
            .collect();
        switches.sort_by(|a, b| a.name.cmp(&b.name));
        switches
    }

    fn export_gauge(&self, name: &str, enabled: bool) {
        self.metrics.set_gauge(
            KILL_SWITCH_ENABLED,
            &[("switch", name.to_string())],
            if enabled { 1.0 } else { 0.0 },
        );
    }
}
