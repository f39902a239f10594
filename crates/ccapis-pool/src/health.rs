//! Per-account circuit breaker state machine
//!
//! `AccountHealth` is a plain value object owned and locked by the monitor;
//! it performs no I/O. Transitions:
//!
//! - any --record_success--> Healthy (all failure/cooldown fields cleared)
//! - Healthy/Degraded --record_failure below threshold--> Degraded
//! - Healthy/Degraded --threshold reached or quota exhausted--> Open
//! - Open --update_state past cooldown--> HalfOpen
//! - HalfOpen --record_success--> Healthy
//! - HalfOpen --record_failure--> Open (cooldown recomputed)
//!
//! Quota exhaustion opens the circuit until the five-hour window resets when
//! that instant is known, otherwise for the rate-limit cooldown.

use std::time::SystemTime;

use crate::classify::FailureKind;
use crate::config::CircuitBreakerConfig;
use crate::usage::UsageData;

/// Breaker state, declared in ranking order: selection prefers lower states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthState {
    #[default]
    Healthy,
    Degraded,
    Open,
    HalfOpen,
}

impl HealthState {
    /// Label for summaries and logging.
    pub fn label(&self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::Open => "OPEN",
            HealthState::HalfOpen => "HALF_OPEN",
        }
    }
}

/// A state change produced by one transition method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

/// Health bookkeeping for one account.
#[derive(Debug, Clone, Default)]
pub struct AccountHealth {
    state: HealthState,
    consecutive_failures: u32,
    last_failure_kind: Option<FailureKind>,
    last_failure_at: Option<SystemTime>,
    circuit_opened_at: Option<SystemTime>,
    cooldown_until: Option<SystemTime>,
    half_open_attempts: u32,
    latest_usage: Option<UsageData>,
    usage_fetched_at: Option<SystemTime>,
}

impl AccountHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_failure_kind(&self) -> Option<FailureKind> {
        self.last_failure_kind
    }

    pub fn last_failure_at(&self) -> Option<SystemTime> {
        self.last_failure_at
    }

    pub fn circuit_opened_at(&self) -> Option<SystemTime> {
        self.circuit_opened_at
    }

    pub fn cooldown_until(&self) -> Option<SystemTime> {
        self.cooldown_until
    }

    pub fn half_open_attempts(&self) -> u32 {
        self.half_open_attempts
    }

    pub fn latest_usage(&self) -> Option<&UsageData> {
        self.latest_usage.as_ref()
    }

    pub fn usage_fetched_at(&self) -> Option<SystemTime> {
        self.usage_fetched_at
    }

    /// Five-hour utilization used as the ranking tie-break; missing data
    /// sorts first.
    pub fn sort_utilization(&self) -> f64 {
        self.latest_usage
            .as_ref()
            .and_then(|u| u.five_hour_utilization())
            .unwrap_or(0.0)
    }

    /// Record a successful operation. Idempotent: an already healthy account
    /// stays healthy and reports no transition.
    pub fn record_success(&mut self) -> Option<Transition> {
        let from = self.state;
        self.state = HealthState::Healthy;
        self.consecutive_failures = 0;
        self.last_failure_kind = None;
        self.last_failure_at = None;
        self.circuit_opened_at = None;
        self.cooldown_until = None;
        self.half_open_attempts = 0;
        (from != HealthState::Healthy).then_some(Transition {
            from,
            to: HealthState::Healthy,
        })
    }

    /// Record a failed operation of the given kind.
    pub fn record_failure(
        &mut self,
        kind: FailureKind,
        config: &CircuitBreakerConfig,
    ) -> Option<Transition> {
        let now = SystemTime::now();
        let from = self.state;
        self.consecutive_failures += 1;
        self.last_failure_kind = Some(kind);
        self.last_failure_at = Some(now);

        match self.state {
            HealthState::HalfOpen => {
                // Probe failed: back to Open with a fresh cooldown
                self.half_open_attempts += 1;
                self.open_circuit(kind, now, config);
            }
            HealthState::Open => {
                // Already open: keep it open, refresh the cooldown
                self.open_circuit(kind, now, config);
            }
            HealthState::Healthy | HealthState::Degraded => {
                if kind == FailureKind::QuotaExhausted
                    || self.consecutive_failures >= config.failure_threshold
                {
                    self.open_circuit(kind, now, config);
                } else {
                    self.state = HealthState::Degraded;
                }
            }
        }

        (from != self.state).then_some(Transition {
            from,
            to: self.state,
        })
    }

    /// Move Open to HalfOpen once the cooldown has elapsed. Repeated calls
    /// without time passing are a no-op.
    pub fn update_state(&mut self) -> Option<Transition> {
        if self.state != HealthState::Open {
            return None;
        }
        let cooldown = self.cooldown_until?;
        if SystemTime::now() >= cooldown {
            self.state = HealthState::HalfOpen;
            self.half_open_attempts = 0;
            return Some(Transition {
                from: HealthState::Open,
                to: HealthState::HalfOpen,
            });
        }
        None
    }

    /// Store a usage sample. A five-hour utilization at or past 100% records
    /// a synthetic quota-exhaustion failure; the first element of the return
    /// is true when that happened.
    pub fn update_usage(
        &mut self,
        usage: UsageData,
        config: &CircuitBreakerConfig,
    ) -> (bool, Option<Transition>) {
        let exhausted = usage
            .five_hour_utilization()
            .is_some_and(|utilization| utilization >= 100.0);
        self.latest_usage = Some(usage);
        self.usage_fetched_at = Some(SystemTime::now());
        if exhausted {
            let transition = self.record_failure(FailureKind::QuotaExhausted, config);
            (true, transition)
        } else {
            (false, None)
        }
    }

    /// Whether the usage sample is missing or older than the recheck window.
    pub fn is_usage_stale(&self, config: &CircuitBreakerConfig) -> bool {
        match self.usage_fetched_at {
            None => true,
            Some(fetched_at) => {
                SystemTime::now()
                    .duration_since(fetched_at)
                    .unwrap_or_default()
                    >= config.recheck_usage_before_selection
            }
        }
    }

    /// Availability predicate: Healthy and Degraded accounts take traffic;
    /// with the breaker disabled everything does.
    pub fn is_available(&self, config: &CircuitBreakerConfig) -> bool {
        if !config.enabled {
            return true;
        }
        matches!(self.state, HealthState::Healthy | HealthState::Degraded)
    }

    /// One `healthSummary` line for this account.
    pub fn summary_line(&self, id: &str) -> String {
        let cooldown_minutes = self
            .cooldown_until
            .and_then(|until| until.duration_since(SystemTime::now()).ok())
            .map(|remaining| remaining.as_secs().div_ceil(60))
            .unwrap_or(0);
        format!(
            "[{id}] {} (failures: {}) - cooldown: {cooldown_minutes}m - usage: {:.1}%",
            self.state.label(),
            self.consecutive_failures,
            self.sort_utilization(),
        )
    }

    fn open_circuit(&mut self, kind: FailureKind, now: SystemTime, config: &CircuitBreakerConfig) {
        self.state = HealthState::Open;
        self.circuit_opened_at = Some(now);
        self.cooldown_until = Some(self.cooldown_for(kind, now, config));
    }

    /// Cooldown policy: quota exhaustion waits for the five-hour reset when
    /// known, falling back to the rate-limit cooldown; rate limits and
    /// generic failures use their fixed windows.
    fn cooldown_for(
        &self,
        kind: FailureKind,
        now: SystemTime,
        config: &CircuitBreakerConfig,
    ) -> SystemTime {
        match kind {
            FailureKind::QuotaExhausted => self
                .latest_usage
                .as_ref()
                .and_then(|u| u.five_hour_resets_at())
                .unwrap_or(now + config.rate_limit_cooldown),
            FailureKind::RateLimited => now + config.rate_limit_cooldown,
            FailureKind::Generic => now + config.generic_error_cooldown,
        }
    }
}
