//! Usage refresh and listener fan-out
//!
//! Pulls usage samples through the `UsageFetcher` collaborator and feeds the
//! monitor: a successful fetch becomes `update_usage`, a failed one becomes
//! `record_failure` with the classified kind. Every refresh attempt, success
//! or failure, is fanned out to registered listeners in registration order.
//!
//! A per-account in-flight gate makes close-interval refreshes idempotent:
//! a second refresh of an account already being fetched returns immediately.
//! The gate is held only around the set membership, never across the HTTP
//! round-trip itself.

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::classify;
use crate::credentials::Credential;
use crate::error::{Error, Result};
use crate::events::{self, EventSink, PoolEvent};
use crate::monitor::HealthMonitor;
use crate::usage::{UsageData, UsageFetcher};

/// Delivered to listeners after every refresh attempt.
///
/// `usage` is `None` when the fetch failed.
#[derive(Debug, Clone)]
pub struct UsageUpdateEvent {
    pub credential: Credential,
    pub usage: Option<UsageData>,
    pub at: SystemTime,
}

/// External subscriber to usage updates.
pub trait UsageListener: Send + Sync {
    fn usage_updated(&self, event: &UsageUpdateEvent);
}

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// Pulls usage data and feeds the health monitor.
pub struct UsageRefresher {
    fetcher: Arc<dyn UsageFetcher>,
    monitor: Arc<HealthMonitor>,
    sink: Arc<dyn EventSink>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn UsageListener>)>>,
    next_listener: AtomicU64,
    in_flight: Mutex<HashSet<String>>,
}

impl UsageRefresher {
    pub fn new(
        fetcher: Arc<dyn UsageFetcher>,
        monitor: Arc<HealthMonitor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            fetcher,
            monitor,
            sink,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Register a listener; it observes every subsequent refresh attempt.
    pub async fn add_usage_listener(&self, listener: Arc<dyn UsageListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().await.push((id, listener));
        id
    }

    /// Remove a previously registered listener.
    pub async fn remove_usage_listener(&self, id: ListenerId) {
        self.listeners
            .write()
            .await
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Refresh every usage-tracked credential in the list.
    ///
    /// Failures are recorded and published but never abort the batch.
    pub async fn refresh(&self, credentials: &[Credential]) {
        for credential in credentials.iter().filter(|c| c.track_usage) {
            let _ = self.refresh_account(credential).await;
        }
    }

    /// Refresh one credential if its usage sample is stale.
    pub async fn refresh_if_stale(&self, credential: &Credential) -> Result<()> {
        if !credential.track_usage {
            return Ok(());
        }
        let config = self.monitor.config().await;
        if !self
            .monitor
            .get_health(&credential.id)
            .await
            .is_usage_stale(&config)
        {
            return Ok(());
        }
        self.refresh_account(credential).await
    }

    /// Refresh one credential unconditionally, surfacing the fetch error to
    /// this caller only.
    pub async fn refresh_account(&self, credential: &Credential) -> Result<()> {
        {
            let mut gate = self.in_flight.lock().await;
            if !gate.insert(credential.id.clone()) {
                debug!(account_id = %credential.id, "usage refresh already in flight");
                return Ok(());
            }
        }

        let result = self.fetcher.fetch(credential).await;
        self.in_flight.lock().await.remove(&credential.id);

        match result {
            Ok(usage) => {
                self.monitor
                    .update_usage(&credential.id, usage.clone())
                    .await;
                self.fan_out(credential, Some(usage)).await;
                Ok(())
            }
            Err(error) => {
                let kind = classify::classify_transport(&error);
                warn!(account_id = %credential.id, error = %error, "usage fetch failed");
                self.monitor.record_failure(&credential.id, kind).await;
                events::emit(
                    self.sink.as_ref(),
                    PoolEvent::UsageRefreshFailed {
                        id: credential.id.clone(),
                        error: error.to_string(),
                    },
                );
                self.fan_out(credential, None).await;
                Err(Error::UsageFetchFailed {
                    id: credential.id.clone(),
                    cause: error.to_string(),
                })
            }
        }
    }

    /// Deliver the update to every listener in registration order. A
    /// panicking listener is logged and skipped; the fan-out continues.
    async fn fan_out(&self, credential: &Credential, usage: Option<UsageData>) {
        let event = UsageUpdateEvent {
            credential: credential.clone(),
            usage,
            at: SystemTime::now(),
        };
        let listeners: Vec<(ListenerId, Arc<dyn UsageListener>)> =
            self.listeners.read().await.clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.usage_updated(&event))).is_err() {
                warn!(listener = id.0, account_id = %credential.id, "usage listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::error::TransportError;
    use crate::events::TracingSink;
    use crate::health::HealthState;
    use crate::usage::UsageWindow;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Fetcher returning a fixed result after an optional delay.
    struct FakeFetcher {
        fetches: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl FakeFetcher {
        fn ok() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::ok()
            }
        }
    }

    impl UsageFetcher for FakeFetcher {
        fn fetch<'a>(
            &'a self,
            _credential: &'a Credential,
        ) -> Pin<Box<dyn Future<Output = std::result::Result<UsageData, TransportError>> + Send + 'a>>
        {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.fetches.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(TransportError::from_status(429, "too many requests"))
                } else {
                    Ok(UsageData {
                        five_hour: Some(UsageWindow {
                            utilization: 33.0,
                            resets_at: None,
                        }),
                        ..UsageData::default()
                    })
                }
            })
        }
    }

    /// Listener recording a tag per delivery into a shared log.
    struct TaggingListener {
        tag: &'static str,
        log: Arc<StdMutex<Vec<(&'static str, bool)>>>,
    }

    impl UsageListener for TaggingListener {
        fn usage_updated(&self, event: &UsageUpdateEvent) {
            self.log
                .lock()
                .unwrap()
                .push((self.tag, event.usage.is_some()));
        }
    }

    struct PanickingListener;

    impl UsageListener for PanickingListener {
        fn usage_updated(&self, _event: &UsageUpdateEvent) {
            panic!("listener blew up");
        }
    }

    fn refresher(fetcher: FakeFetcher) -> (Arc<UsageRefresher>, Arc<HealthMonitor>) {
        let monitor = Arc::new(HealthMonitor::with_default_sink(
            CircuitBreakerConfig::default(),
        ));
        let refresher = Arc::new(UsageRefresher::new(
            Arc::new(fetcher),
            monitor.clone(),
            Arc::new(TracingSink),
        ));
        (refresher, monitor)
    }

    fn credential(id: &str) -> Credential {
        Credential::session(id, "https://claude.ai", "sk")
    }

    #[tokio::test]
    async fn successful_refresh_updates_monitor_and_listeners() {
        let (refresher, monitor) = refresher(FakeFetcher::ok());
        let log = Arc::new(StdMutex::new(Vec::new()));
        refresher
            .add_usage_listener(Arc::new(TaggingListener {
                tag: "observer",
                log: log.clone(),
            }))
            .await;

        refresher.refresh(&[credential("a")]).await;

        let health = monitor.get_health("a").await;
        assert_eq!(health.sort_utilization(), 33.0);
        assert!(!health.is_usage_stale(&CircuitBreakerConfig::default()));
        assert_eq!(*log.lock().unwrap(), vec![("observer", true)]);
    }

    #[tokio::test]
    async fn failed_refresh_records_failure_and_notifies_with_none() {
        let (refresher, monitor) = refresher(FakeFetcher::failing());
        let log = Arc::new(StdMutex::new(Vec::new()));
        refresher
            .add_usage_listener(Arc::new(TaggingListener {
                tag: "observer",
                log: log.clone(),
            }))
            .await;

        let err = refresher.refresh_account(&credential("a")).await.unwrap_err();
        assert!(matches!(err, Error::UsageFetchFailed { ref id, .. } if id == "a"));

        // 429 classifies as rate limited; one failure degrades the account
        let health = monitor.get_health("a").await;
        assert_eq!(health.state(), HealthState::Degraded);
        assert_eq!(*log.lock().unwrap(), vec![("observer", false)]);
    }

    #[tokio::test]
    async fn batch_refresh_continues_past_failures() {
        let (refresher, monitor) = refresher(FakeFetcher::failing());
        refresher.refresh(&[credential("a"), credential("b")]).await;
        assert_eq!(monitor.get_health("a").await.state(), HealthState::Degraded);
        assert_eq!(monitor.get_health("b").await.state(), HealthState::Degraded);
    }

    #[tokio::test]
    async fn listeners_run_in_registration_order() {
        let (refresher, _monitor) = refresher(FakeFetcher::ok());
        let log = Arc::new(StdMutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            refresher
                .add_usage_listener(Arc::new(TaggingListener {
                    tag,
                    log: log.clone(),
                }))
                .await;
        }

        refresher.refresh_account(&credential("a")).await.unwrap();

        let tags: Vec<&str> = log.lock().unwrap().iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_abort_fan_out() {
        let (refresher, _monitor) = refresher(FakeFetcher::ok());
        let log = Arc::new(StdMutex::new(Vec::new()));
        refresher.add_usage_listener(Arc::new(PanickingListener)).await;
        refresher
            .add_usage_listener(Arc::new(TaggingListener {
                tag: "survivor",
                log: log.clone(),
            }))
            .await;

        refresher.refresh_account(&credential("a")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![("survivor", true)]);
    }

    #[tokio::test]
    async fn removed_listener_stops_receiving() {
        let (refresher, _monitor) = refresher(FakeFetcher::ok());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let id = refresher
            .add_usage_listener(Arc::new(TaggingListener {
                tag: "gone",
                log: log.clone(),
            }))
            .await;
        refresher.remove_usage_listener(id).await;

        refresher.refresh_account(&credential("a")).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_refreshes_of_one_account_run_once() {
        let monitor = Arc::new(HealthMonitor::with_default_sink(
            CircuitBreakerConfig::default(),
        ));
        let fetcher = Arc::new(FakeFetcher::slow(Duration::from_millis(50)));
        let refresher = Arc::new(UsageRefresher::new(
            fetcher.clone(),
            monitor,
            Arc::new(TracingSink),
        ));

        let first = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.refresh_account(&credential("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        refresher.refresh_account(&credential("a")).await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn untracked_credentials_are_skipped() {
        let monitor = Arc::new(HealthMonitor::with_default_sink(
            CircuitBreakerConfig::default(),
        ));
        let fetcher = Arc::new(FakeFetcher::ok());
        let refresher = UsageRefresher::new(fetcher.clone(), monitor, Arc::new(TracingSink));

        let mut untracked = credential("a");
        untracked.track_usage = false;
        refresher.refresh(&[untracked.clone()]).await;
        refresher.refresh_if_stale(&untracked).await.unwrap();

        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refresh_if_stale_skips_fresh_samples() {
        let monitor = Arc::new(HealthMonitor::with_default_sink(
            CircuitBreakerConfig::default(),
        ));
        let fetcher = Arc::new(FakeFetcher::ok());
        let refresher = UsageRefresher::new(fetcher.clone(), monitor, Arc::new(TracingSink));

        let account = credential("a");
        refresher.refresh_if_stale(&account).await.unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

        // Sample is now fresh; a second staleness-gated refresh is a no-op
        refresher.refresh_if_stale(&account).await.unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }
}
