//! Credentials file watcher and reload reconciliation
//!
//! Watches the credentials document with `notify`, backed by a polling
//! fallback comparing modification time and size. A successful reload diffs
//! the id sets, discards health entries for removed accounts, swaps the
//! snapshot atomically, and publishes `CredentialsReloaded`. A failed load
//! leaves the previous snapshot and health state untouched and publishes
//! `ReloadFailed`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::credentials::SharedCredentials;
use crate::error::{Error, Result};
use crate::events::{self, EventSink, PoolEvent};
use crate::monitor::HealthMonitor;
use crate::store::CredentialsDocument;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Watches the credentials document and reconciles the live registry.
pub struct CredentialsWatcher {
    path: PathBuf,
    credentials: Arc<SharedCredentials>,
    monitor: Arc<HealthMonitor>,
    sink: Arc<dyn EventSink>,
    poll_interval: Duration,
}

impl CredentialsWatcher {
    pub fn new(
        path: PathBuf,
        credentials: Arc<SharedCredentials>,
        monitor: Arc<HealthMonitor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            path,
            credentials,
            monitor,
            sink,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Polling fallback interval for filesystems without change events.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reload the document now, reconciling health state on success.
    pub async fn reload(&self) -> Result<()> {
        let document = match CredentialsDocument::load(&self.path).await {
            Ok(document) => document,
            Err(e) => {
                let cause = e.to_string();
                events::emit(
                    self.sink.as_ref(),
                    PoolEvent::ReloadFailed {
                        path: self.path.clone(),
                        error: cause.clone(),
                    },
                );
                return Err(Error::ReloadFailed {
                    path: self.path.clone(),
                    cause,
                });
            }
        };

        let snapshot = document.snapshot();
        let previous = self.credentials.current().await;

        let old_ids: HashSet<String> = previous.ids().into_iter().collect();
        let new_ids: HashSet<String> = snapshot.ids().into_iter().collect();
        for removed in old_ids.difference(&new_ids) {
            self.monitor.reset(removed).await;
        }

        self.monitor.set_config(snapshot.breaker.clone()).await;
        let before = previous.ids();
        let after = snapshot.ids();
        self.credentials.replace(snapshot).await;

        info!(
            path = %self.path.display(),
            before = before.len(),
            after = after.len(),
            "credentials reloaded"
        );
        events::emit(
            self.sink.as_ref(),
            PoolEvent::CredentialsReloaded { before, after },
        );
        Ok(())
    }

    /// Spawn the watch loop; the returned handle stops it.
    ///
    /// The file fingerprint is captured before the task starts, so a write
    /// racing the spawn is still observed as a change.
    pub fn spawn(self) -> WatcherHandle {
        let token = CancellationToken::new();
        let initial = fingerprint_sync(&self.path);
        let task = tokio::spawn(self.run(token.clone(), initial));
        WatcherHandle { token, task }
    }

    /// Watch until `shutdown` is cancelled. Uses `notify` events with a
    /// polling fallback; either wake-up rechecks the file fingerprint.
    async fn run(self, shutdown: CancellationToken, mut last: Option<(SystemTime, u64)>) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = self.setup_notify_watcher(wake_tx);

        let mut poll = tokio::time::interval(self.poll_interval);
        // The first tick fires immediately and rechecks against `last`
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll.tick() => {}
            }

            let current = self.fingerprint().await;
            if current == last {
                continue;
            }
            last = current;
            if let Err(e) = self.reload().await {
                warn!(error = %e, "keeping previous credentials");
            }
        }
    }

    /// Set up a `notify` watcher on the document's parent directory so file
    /// replacement (the atomic-rename save) is detected too. Returns the
    /// watcher handle, which must stay alive.
    fn setup_notify_watcher(
        &self,
        wake_tx: mpsc::Sender<()>,
    ) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
            let _ = wake_tx.try_send(());
        })
        .ok()?;

        let watch_path = self.path.parent().unwrap_or(self.path.as_ref());
        watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;
        Some(watcher)
    }

    /// Modification time and size, or `None` while the file is missing.
    async fn fingerprint(&self) -> Option<(SystemTime, u64)> {
        let metadata = tokio::fs::metadata(&self.path).await.ok()?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Some((modified, metadata.len()))
    }
}

/// Blocking fingerprint used once at spawn time.
fn fingerprint_sync(path: &std::path::Path) -> Option<(SystemTime, u64)> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    Some((modified, metadata.len()))
}

/// Handle to a spawned watcher.
///
/// `shutdown` is idempotent; dropping the handle aborts the task so the
/// watcher is released on every exit path.
pub struct WatcherHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Request the watch loop to stop.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Stop the loop and wait for it to finish.
    pub async fn join(mut self) {
        self.token.cancel();
        let _ = (&mut self.task).await;
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.token.cancel();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FailureKind;
    use crate::config::CircuitBreakerConfig;
    use crate::credentials::CredentialsSnapshot;
    use crate::health::HealthState;
    use crate::store::CredentialsDocument;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<PoolEvent>>);

    impl EventSink for RecordingSink {
        fn publish(&self, event: &PoolEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn document(ids: &[&str]) -> CredentialsDocument {
        CredentialsDocument {
            credentials: ids
                .iter()
                .map(|id| crate::credentials::Credential::session(*id, "https://claude.ai", "sk"))
                .collect(),
            breaker: None,
        }
    }

    async fn watcher_fixture(
        dir: &tempfile::TempDir,
        initial: &[&str],
    ) -> (CredentialsWatcher, Arc<SharedCredentials>, Arc<HealthMonitor>, Arc<RecordingSink>) {
        let path = dir.path().join("CCAPIsCredentials.xml");
        document(initial).save(&path).await.unwrap();

        let loaded = CredentialsDocument::load(&path).await.unwrap();
        let credentials = Arc::new(SharedCredentials::new(loaded.snapshot()));
        let monitor = Arc::new(HealthMonitor::with_default_sink(
            CircuitBreakerConfig::default(),
        ));
        let sink = Arc::new(RecordingSink::default());
        let watcher = CredentialsWatcher::new(
            path,
            credentials.clone(),
            monitor.clone(),
            sink.clone(),
        );
        (watcher, credentials, monitor, sink)
    }

    #[tokio::test]
    async fn reload_diff_keeps_surviving_health_and_drops_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, credentials, monitor, sink) = watcher_fixture(&dir, &["a", "b"]).await;

        // Give both accounts some history
        monitor.record_failure("a", FailureKind::Generic).await;
        monitor.record_failure("b", FailureKind::QuotaExhausted).await;

        // Replace the file with {a, c} and reload
        document(&["a", "c"])
            .save(&dir.path().join("CCAPIsCredentials.xml"))
            .await
            .unwrap();
        watcher.reload().await.unwrap();

        assert_eq!(credentials.current().await.ids(), vec!["a", "c"]);

        // a keeps its state, b starts fresh when referenced again
        assert_eq!(monitor.get_health("a").await.consecutive_failures(), 1);
        assert_eq!(monitor.get_health("b").await.state(), HealthState::Healthy);

        let events = sink.0.lock().unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            PoolEvent::CredentialsReloaded { before, after }
                if before == &vec!["a".to_string(), "b".to_string()]
                && after == &vec!["a".to_string(), "c".to_string()]
        )));
    }

    #[tokio::test]
    async fn failed_parse_preserves_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, credentials, _monitor, sink) = watcher_fixture(&dir, &["a"]).await;

        tokio::fs::write(dir.path().join("CCAPIsCredentials.xml"), "<Credentials><bro")
            .await
            .unwrap();

        let err = watcher.reload().await.unwrap_err();
        assert!(matches!(err, Error::ReloadFailed { .. }));
        assert_eq!(credentials.current().await.ids(), vec!["a"]);
        assert!(
            sink.0
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, PoolEvent::ReloadFailed { .. }))
        );
    }

    #[tokio::test]
    async fn reload_applies_breaker_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _credentials, monitor, _sink) = watcher_fixture(&dir, &["a"]).await;

        let mut updated = document(&["a"]);
        updated.breaker = Some(CircuitBreakerConfig {
            failure_threshold: 7,
            ..CircuitBreakerConfig::default()
        });
        updated
            .save(&dir.path().join("CCAPIsCredentials.xml"))
            .await
            .unwrap();

        watcher.reload().await.unwrap();
        assert_eq!(monitor.config().await.failure_threshold, 7);
    }

    #[tokio::test]
    async fn spawned_watcher_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, credentials, _monitor, _sink) = watcher_fixture(&dir, &["a"]).await;
        let handle = watcher
            .with_poll_interval(Duration::from_millis(25))
            .spawn();

        // Longer content also changes the size fingerprint
        document(&["a", "b", "c"])
            .save(&dir.path().join("CCAPIsCredentials.xml"))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if credentials.current().await.ids().len() == 3 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "watcher never observed the change"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.join().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _credentials, _monitor, _sink) = watcher_fixture(&dir, &["a"]).await;
        let handle = watcher.spawn();
        handle.shutdown();
        handle.shutdown();
        handle.join().await;
    }

    #[test]
    fn snapshot_type_is_shared() {
        // CredentialsSnapshot is the watcher/executor contract; keep it Clone
        fn assert_clone<T: Clone>() {}
        assert_clone::<CredentialsSnapshot>();
    }
}
