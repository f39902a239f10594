//! Event sink for state transitions, selections, and reloads
//!
//! A pluggable, synchronous sink. Sinks are allowed to fail: every dispatch
//! is wrapped so a panicking sink never affects core state.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{info, warn};

use crate::classify::FailureKind;
use crate::health::HealthState;

/// Events published by the pool core.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A breaker transition for one account
    StateChanged {
        id: String,
        from: HealthState,
        to: HealthState,
        failure: Option<FailureKind>,
        cooldown_until: Option<SystemTime>,
    },
    /// An account was chosen for a rotated request
    SelectionMade {
        id: String,
        state: HealthState,
        utilization: f64,
    },
    /// The credentials file was reloaded
    CredentialsReloaded {
        before: Vec<String>,
        after: Vec<String>,
    },
    /// The credentials file changed but could not be loaded
    ReloadFailed { path: PathBuf, error: String },
    /// A usage fetch against one account failed
    UsageRefreshFailed { id: String, error: String },
}

/// Receiver for pool events. May be synchronous and fallible.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &PoolEvent);
}

/// Default sink logging every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: &PoolEvent) {
        match event {
            PoolEvent::StateChanged {
                id,
                from,
                to,
                failure,
                cooldown_until,
            } => {
                let cooldown_secs = cooldown_until
                    .and_then(|until| until.duration_since(SystemTime::now()).ok())
                    .map(|remaining| remaining.as_secs());
                info!(
                    account_id = %id,
                    from = from.label(),
                    to = to.label(),
                    failure = failure.map(|f| f.label()),
                    cooldown_secs,
                    "account state changed"
                );
            }
            PoolEvent::SelectionMade {
                id,
                state,
                utilization,
            } => {
                info!(
                    account_id = %id,
                    state = state.label(),
                    utilization,
                    "account selected"
                );
            }
            PoolEvent::CredentialsReloaded { before, after } => {
                info!(
                    before = before.len(),
                    after = after.len(),
                    "credentials reloaded"
                );
            }
            PoolEvent::ReloadFailed { path, error } => {
                warn!(path = %path.display(), error = %error, "credentials reload failed");
            }
            PoolEvent::UsageRefreshFailed { id, error } => {
                warn!(account_id = %id, error = %error, "usage refresh failed");
            }
        }
    }
}

/// Dispatch an event, containing any sink panic.
pub(crate) fn emit(sink: &dyn EventSink, event: PoolEvent) {
    if catch_unwind(AssertUnwindSafe(|| sink.publish(&event))).is_err() {
        warn!("event sink panicked, event dropped");
    }
}
