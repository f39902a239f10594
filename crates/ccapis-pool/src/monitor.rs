//! Health registry: ranking, selection, and transition bookkeeping
//!
//! Holds one `AccountHealth` per known account id, created lazily on first
//! reference. All mutation goes through the registry lock; events are
//! published only after the lock is released, and no lock is ever held
//! across I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::RwLock;
use tracing::debug;

use crate::classify::FailureKind;
use crate::config::CircuitBreakerConfig;
use crate::credentials::Credential;
use crate::events::{self, EventSink, PoolEvent, TracingSink};
use crate::health::{AccountHealth, HealthState, Transition};
use crate::usage::UsageData;

/// Concurrent registry of per-account health.
pub struct HealthMonitor {
    entries: RwLock<HashMap<String, AccountHealth>>,
    config: RwLock<CircuitBreakerConfig>,
    sink: Arc<dyn EventSink>,
}

impl HealthMonitor {
    pub fn new(config: CircuitBreakerConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
            sink,
        }
    }

    /// Monitor with the default tracing sink.
    pub fn with_default_sink(config: CircuitBreakerConfig) -> Self {
        Self::new(config, Arc::new(TracingSink))
    }

    /// The active breaker configuration.
    pub async fn config(&self) -> CircuitBreakerConfig {
        self.config.read().await.clone()
    }

    /// Replace the breaker configuration (credentials reload).
    pub async fn set_config(&self, config: CircuitBreakerConfig) {
        *self.config.write().await = config;
    }

    /// Snapshot of one account's health, creating the entry on demand.
    pub async fn get_health(&self, id: &str) -> AccountHealth {
        self.entries
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Record a successful operation against `id`.
    pub async fn record_success(&self, id: &str) {
        let transition = {
            let mut entries = self.entries.write().await;
            entries.entry(id.to_string()).or_default().record_success()
        };
        if let Some(transition) = transition {
            self.emit_state_change(id, transition, None, None);
        }
    }

    /// Record a failed operation of the given kind against `id`.
    pub async fn record_failure(&self, id: &str, kind: FailureKind) {
        let config = self.config().await;
        let (transition, cooldown_until) = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(id.to_string()).or_default();
            (entry.record_failure(kind, &config), entry.cooldown_until())
        };
        if let Some(transition) = transition {
            self.emit_state_change(id, transition, Some(kind), cooldown_until);
        }
    }

    /// Store a usage sample for `id`. Returns true when the sample tripped
    /// quota exhaustion.
    pub async fn update_usage(&self, id: &str, usage: UsageData) -> bool {
        let config = self.config().await;
        let (tripped, transition, cooldown_until) = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(id.to_string()).or_default();
            let (tripped, transition) = entry.update_usage(usage, &config);
            (tripped, transition, entry.cooldown_until())
        };
        if let Some(transition) = transition {
            self.emit_state_change(
                id,
                transition,
                Some(FailureKind::QuotaExhausted),
                cooldown_until,
            );
        }
        tripped
    }

    /// Whether `id` may take traffic right now. Advances Open to HalfOpen
    /// when the cooldown has elapsed.
    pub async fn is_available(&self, id: &str) -> bool {
        let config = self.config().await;
        if !config.enabled {
            return true;
        }
        let (available, transition) = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(id.to_string()).or_default();
            let transition = entry
                .update_state()
                .map(|t| (t, entry.cooldown_until()));
            (entry.is_available(&config), transition)
        };
        if let Some((transition, cooldown_until)) = transition {
            self.emit_state_change(id, transition, None, cooldown_until);
        }
        available
    }

    /// Filter `credentials` down to available accounts, best first.
    ///
    /// Ordering is by state in declared order, then five-hour utilization
    /// ascending (missing usage sorts first); ties keep the input order.
    pub async fn available_accounts(&self, credentials: &[Credential]) -> Vec<Credential> {
        let config = self.config().await;
        let mut transitions = Vec::new();
        let mut ranked: Vec<(Credential, HealthState, f64)> = Vec::new();
        {
            let mut entries = self.entries.write().await;
            for credential in credentials {
                let entry = entries.entry(credential.id.clone()).or_default();
                if let Some(transition) = entry.update_state() {
                    transitions.push((credential.id.clone(), transition, entry.cooldown_until()));
                }
                if !entry.is_available(&config) {
                    continue;
                }
                ranked.push((credential.clone(), entry.state(), entry.sort_utilization()));
            }
        }
        for (id, transition, cooldown_until) in transitions {
            self.emit_state_change(&id, transition, None, cooldown_until);
        }
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.total_cmp(&b.2)));
        ranked.into_iter().map(|(credential, _, _)| credential).collect()
    }

    /// The best available account, or `None` when nothing can take traffic.
    pub async fn select_best_account(&self, credentials: &[Credential]) -> Option<Credential> {
        let best = self.available_accounts(credentials).await.into_iter().next()?;
        let health = self.get_health(&best.id).await;
        events::emit(
            self.sink.as_ref(),
            PoolEvent::SelectionMade {
                id: best.id.clone(),
                state: health.state(),
                utilization: health.sort_utilization(),
            },
        );
        Some(best)
    }

    /// Discard the health entry for `id` (credentials reload reconciliation).
    pub async fn reset(&self, id: &str) {
        if self.entries.write().await.remove(id).is_some() {
            debug!(account_id = %id, "health entry discarded");
        }
    }

    /// Discard every health entry.
    pub async fn reset_all(&self) {
        self.entries.write().await.clear();
    }

    /// One line per tracked account, sorted by id for stable output.
    pub async fn health_summary(&self) -> String {
        let entries = self.entries.read().await;
        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort();
        ids.iter()
            .map(|id| entries[id.as_str()].summary_line(id))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn emit_state_change(
        &self,
        id: &str,
        transition: Transition,
        failure: Option<FailureKind>,
        cooldown_until: Option<SystemTime>,
    ) {
        events::emit(
            self.sink.as_ref(),
            PoolEvent::StateChanged {
                id: id.to_string(),
                from: transition.from,
                to: transition.to,
                failure,
                cooldown_until,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::UsageWindow;
    use std::sync::Mutex;
    use std::time::{Duration, UNIX_EPOCH};

    fn monitor() -> HealthMonitor {
        HealthMonitor::with_default_sink(CircuitBreakerConfig::default())
    }

    fn credential(id: &str) -> Credential {
        Credential::session(id, "https://claude.ai", "sk")
    }

    fn usage(utilization: f64, resets_at: Option<u64>) -> UsageData {
        UsageData {
            five_hour: Some(UsageWindow {
                utilization,
                resets_at,
            }),
            ..UsageData::default()
        }
    }

    /// Sink capturing every event for assertions.
    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<PoolEvent>>);

    impl EventSink for RecordingSink {
        fn publish(&self, event: &PoolEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn get_health_creates_lazily() {
        let monitor = monitor();
        let health = monitor.get_health("fresh").await;
        assert_eq!(health.state(), HealthState::Healthy);
        assert_eq!(health.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn quota_usage_opens_circuit_and_selection_moves_on() {
        // Both accounts healthy; A's five-hour window fills up with a reset
        // two hours out. A opens until that reset and B takes over.
        let monitor = monitor();
        let a = credential("a");
        let b = credential("b");

        let resets_at = SystemTime::now() + Duration::from_secs(2 * 3600);
        let resets_secs = resets_at.duration_since(UNIX_EPOCH).unwrap().as_secs();
        let tripped = monitor.update_usage("a", usage(100.0, Some(resets_secs))).await;
        assert!(tripped);

        let health = monitor.get_health("a").await;
        assert_eq!(health.state(), HealthState::Open);
        assert_eq!(
            health.cooldown_until(),
            Some(UNIX_EPOCH + Duration::from_secs(resets_secs))
        );

        let best = monitor
            .select_best_account(&[a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(best.id, "b");
    }

    #[tokio::test]
    async fn ranking_orders_by_state_then_utilization() {
        // A healthy at 40%, B healthy at 10%, C degraded at 5%, D open
        let monitor = monitor();
        monitor.update_usage("a", usage(40.0, None)).await;
        monitor.update_usage("b", usage(10.0, None)).await;
        monitor.update_usage("c", usage(5.0, None)).await;
        monitor.record_failure("c", FailureKind::Generic).await;
        monitor.record_failure("d", FailureKind::QuotaExhausted).await;

        let list = [credential("a"), credential("b"), credential("c"), credential("d")];
        let available = monitor.available_accounts(&list).await;
        let ids: Vec<&str> = available.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        let best = monitor.select_best_account(&list).await.unwrap();
        assert_eq!(best.id, "b");
    }

    #[tokio::test]
    async fn missing_usage_sorts_before_known_usage() {
        let monitor = monitor();
        monitor.update_usage("used", usage(1.0, None)).await;
        let available = monitor
            .available_accounts(&[credential("used"), credential("unknown")])
            .await;
        assert_eq!(available[0].id, "unknown");
    }

    #[tokio::test]
    async fn ties_keep_input_order() {
        let monitor = monitor();
        let available = monitor
            .available_accounts(&[credential("first"), credential("second")])
            .await;
        let ids: Vec<&str> = available.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn select_returns_none_when_everything_is_open() {
        let monitor = monitor();
        monitor.record_failure("a", FailureKind::QuotaExhausted).await;
        assert!(monitor.select_best_account(&[credential("a")]).await.is_none());
    }

    #[tokio::test]
    async fn disabled_breaker_keeps_open_accounts_available() {
        let monitor = HealthMonitor::with_default_sink(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        });
        monitor.record_failure("a", FailureKind::QuotaExhausted).await;
        assert!(monitor.is_available("a").await);

        let available = monitor.available_accounts(&[credential("a")]).await;
        assert_eq!(available.len(), 1);
    }

    #[tokio::test]
    async fn is_available_advances_expired_cooldowns() {
        let monitor = HealthMonitor::with_default_sink(CircuitBreakerConfig {
            failure_threshold: 1,
            generic_error_cooldown: Duration::ZERO,
            ..CircuitBreakerConfig::default()
        });
        monitor.record_failure("a", FailureKind::Generic).await;
        assert_eq!(monitor.get_health("a").await.state(), HealthState::Open);

        // Zero cooldown: the availability check flips the account half-open
        assert!(!monitor.is_available("a").await);
        assert_eq!(monitor.get_health("a").await.state(), HealthState::HalfOpen);

        monitor.record_success("a").await;
        assert!(monitor.is_available("a").await);
    }

    #[tokio::test]
    async fn reset_discards_state() {
        let monitor = monitor();
        monitor.record_failure("a", FailureKind::Generic).await;
        monitor.reset("a").await;
        let health = monitor.get_health("a").await;
        assert_eq!(health.consecutive_failures(), 0);
        assert_eq!(health.state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn reset_all_discards_everything() {
        let monitor = monitor();
        monitor.record_failure("a", FailureKind::Generic).await;
        monitor.record_failure("b", FailureKind::Generic).await;
        monitor.reset_all().await;
        assert_eq!(monitor.health_summary().await, "");
    }

    #[tokio::test]
    async fn health_summary_lists_accounts_sorted() {
        let monitor = monitor();
        monitor.update_usage("beta", usage(12.5, None)).await;
        monitor.record_failure("alpha", FailureKind::Generic).await;

        let summary = monitor.health_summary().await;
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[alpha] DEGRADED (failures: 1)"), "{summary}");
        assert!(lines[1].starts_with("[beta] HEALTHY (failures: 0)"), "{summary}");
        assert!(lines[1].contains("usage: 12.5%"), "{summary}");
    }

    #[tokio::test]
    async fn transitions_reach_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = HealthMonitor::new(CircuitBreakerConfig::default(), sink.clone());

        monitor.record_failure("a", FailureKind::QuotaExhausted).await;
        monitor.record_success("a").await;
        monitor.select_best_account(&[credential("a")]).await;

        let events = sink.0.lock().unwrap();
        assert!(matches!(
            events[0],
            PoolEvent::StateChanged {
                from: HealthState::Healthy,
                to: HealthState::Open,
                failure: Some(FailureKind::QuotaExhausted),
                ..
            }
        ));
        assert!(matches!(
            events[1],
            PoolEvent::StateChanged {
                from: HealthState::Open,
                to: HealthState::Healthy,
                ..
            }
        ));
        assert!(matches!(events[2], PoolEvent::SelectionMade { .. }));
    }
}
