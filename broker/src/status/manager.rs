//! Status reconciler
//!
//! Single consumer loop fed by three mutation paths (ingest status,
//! subscription upsert, subscription removal) and two wake-up sources: a
//! periodic resync ticker and a non-blocking "write asap" signal raised on
//! hard changes.
//!
//! Change classification:
//! - soft: only timestamp fields differ. The cache absorbs these; a write
//!   happens once the cache expiration elapses.
//! - hard: status value or message differs, or a subscription is added or
//!   removed. The signal channel has capacity one and sends are non-blocking,
//!   so a burst of hard changes coalesces into a single wake-up.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{IngestStatus, Status, StatusBackend, SubscriptionStatus};

#[derive(Debug, Clone)]
pub struct StatusManagerConfig {
    /// Unconditional write interval.
    pub resync_period: Duration,
    /// How long soft changes may sit in the cache before being written.
    pub cache_expiration: Duration,
}

impl Default for StatusManagerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(10),
            cache_expiration: Duration::from_secs(5),
        }
    }
}

struct Cached {
    status: Status,
    /// A hard change is waiting to be written.
    write_asap: bool,
    last_written: Option<Instant>,
}

struct Inner {
    cached: Mutex<Cached>,
    signal: mpsc::Sender<()>,
    backends: Mutex<Vec<Arc<dyn StatusBackend>>>,
    config: StatusManagerConfig,
}

/// Handle to the status reconciler. Cheap to clone; all mutations go through
/// the guarded cache.
#[derive(Clone)]
pub struct StatusManager {
    inner: Arc<Inner>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl StatusManager {
    pub fn new(config: StatusManagerConfig) -> Self {
        let (signal, receiver) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                cached: Mutex::new(Cached {
                    status: Status::default(),
                    write_asap: false,
                    last_written: None,
                }),
                signal,
                backends: Mutex::new(Vec::new()),
                config,
            }),
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    /// Register a destination for status snapshots.
    pub fn register_backend(&self, backend: Arc<dyn StatusBackend>) {
        self.inner.backends.lock().push(backend);
    }

    /// Replace the ingest portion of the status.
    pub fn update_ingest_status(&self, ingest: IngestStatus) {
        let mut cached = self.inner.cached.lock();
        let hard = cached.status.ingest.status != ingest.status
            || cached.status.ingest.message != ingest.message;
        cached.status.ingest = ingest;
        drop(cached);
        if hard {
            self.mark_dirty();
        }
    }

    /// Upsert a subscription entry, merging optional fields: an absent
    /// message or timestamp in the update keeps the previous value.
    pub fn ensure_subscription(&self, name: &str, update: SubscriptionStatus) {
        let mut cached = self.inner.cached.lock();
        let hard = match cached.status.subscriptions.get_mut(name) {
            Some(existing) => {
                let hard = existing.status != update.status
                    || (update.message.is_some() && existing.message != update.message);
                existing.status = update.status;
                if update.message.is_some() {
                    existing.message = update.message;
                }
                if update.last_processed.is_some() {
                    existing.last_processed = update.last_processed;
                }
                hard
            }
            None => {
                cached
                    .status
                    .subscriptions
                    .insert(name.to_string(), update);
                true
            }
        };
        drop(cached);
        if hard {
            self.mark_dirty();
        }
    }

    /// Drop a subscription entry. No-op if it does not exist.
    pub fn ensure_no_subscription(&self, name: &str) {
        let removed = self
            .inner
            .cached
            .lock()
            .status
            .subscriptions
            .remove(name)
            .is_some();
        if removed {
            self.mark_dirty();
        }
    }

    /// Current snapshot, mainly for probes and tests.
    pub fn snapshot(&self) -> Status {
        self.inner.cached.lock().status.clone()
    }

    fn mark_dirty(&self) {
        self.inner.cached.lock().write_asap = true;
        // Non-blocking: if a signal is already pending this one is redundant.
        let _ = self.inner.signal.try_send(());
    }

    /// Run the reconcile loop until cancelled. A final write happens on
    /// shutdown if changes are pending.
    pub async fn run(&self, ctx: CancellationToken) {
        let Some(mut signal) = self.receiver.lock().take() else {
            error!("status reconciler started twice");
            return;
        };

        info!(
            resync_s = self.inner.config.resync_period.as_secs(),
            "status reconciler started"
        );
        let mut ticker = tokio::time::interval(self.inner.config.resync_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    self.reconcile(true).await;
                    debug!("status reconciler stopped");
                    return;
                }
                _ = ticker.tick() => self.reconcile(true).await,
                Some(()) = signal.recv() => self.reconcile(false).await,
            }
        }
    }

    /// One reconcile cycle. `force` writes even without pending changes
    /// (resync); otherwise the cycle is skipped unless a hard change is
    /// pending or the cache has gone stale since the last write.
    async fn reconcile(&self, force: bool) {
        let snapshot = {
            let mut cached = self.inner.cached.lock();
            let stale = match cached.last_written {
                Some(at) => at.elapsed() >= self.inner.config.cache_expiration,
                None => true,
            };
            if !force && !cached.write_asap && !stale {
                return;
            }
            cached.status.last_updated = chrono::Utc::now();
            cached.status.clone()
        };

        let backends: Vec<_> = self.inner.backends.lock().clone();
        let mut failed = false;
        for backend in backends {
            if let Err(e) = backend.update_status(&snapshot).await {
                error!(backend = backend.name(), error = %e, "status write failed");
                failed = true;
            }
        }

        let mut cached = self.inner.cached.lock();
        if failed {
            // Keep the asap flag so the next tick retries.
            cached.write_asap = true;
        } else {
            cached.write_asap = false;
            cached.last_written = Some(Instant::now());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::{BrokerError, Result};
    use crate::status::{IngestState, SubscriptionState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingBackend {
        writes: AtomicUsize,
        fail: AtomicBool,
        last: Mutex<Option<Status>>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                writes: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                last: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl StatusBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn update_status(&self, status: &Status) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(BrokerError::Status("simulated failure".to_string()));
            }
            *self.last.lock() = Some(status.clone());
            Ok(())
        }
    }

    fn manager() -> (StatusManager, Arc<RecordingBackend>) {
        let manager = StatusManager::new(StatusManagerConfig {
            resync_period: Duration::from_secs(3600),
            cache_expiration: Duration::from_secs(3600),
        });
        let backend = Arc::new(RecordingBackend::new());
        manager.register_backend(backend.clone());
        (manager, backend)
    }

    #[test]
    fn subscription_merge_keeps_optional_fields() {
        let (manager, _) = manager();

        let ts = chrono::Utc::now();
        let mut first = SubscriptionStatus::new(SubscriptionState::Running);
        first.last_processed = Some(ts);
        first.message = Some("warming up".to_string());
        manager.ensure_subscription("t1", first);

        // Update with no message and no timestamp keeps both.
        manager.ensure_subscription("t1", SubscriptionStatus::new(SubscriptionState::Running));

        let snapshot = manager.snapshot();
        let entry = &snapshot.subscriptions["t1"];
        assert_eq!(entry.message.as_deref(), Some("warming up"));
        assert_eq!(entry.last_processed, Some(ts));
    }

    #[test]
    fn timestamp_only_update_is_soft() {
        let (manager, _) = manager();
        manager.ensure_subscription("t1", SubscriptionStatus::new(SubscriptionState::Running));

        // Drain the signal raised by the initial add.
        assert!(manager.inner.cached.lock().write_asap);
        manager.inner.cached.lock().write_asap = false;

        let mut soft = SubscriptionStatus::new(SubscriptionState::Running);
        soft.last_processed = Some(chrono::Utc::now());
        manager.ensure_subscription("t1", soft);
        assert!(!manager.inner.cached.lock().write_asap);
    }

    #[test]
    fn status_change_is_hard() {
        let (manager, _) = manager();
        manager.ensure_subscription("t1", SubscriptionStatus::new(SubscriptionState::Ready));
        manager.inner.cached.lock().write_asap = false;

        manager.ensure_subscription("t1", SubscriptionStatus::new(SubscriptionState::Failed));
        assert!(manager.inner.cached.lock().write_asap);
    }

    #[test]
    fn removal_is_hard_and_idempotent() {
        let (manager, _) = manager();
        manager.ensure_subscription("t1", SubscriptionStatus::new(SubscriptionState::Ready));
        manager.inner.cached.lock().write_asap = false;

        manager.ensure_no_subscription("t1");
        assert!(manager.inner.cached.lock().write_asap);

        manager.inner.cached.lock().write_asap = false;
        manager.ensure_no_subscription("t1");
        assert!(!manager.inner.cached.lock().write_asap);
    }

    #[tokio::test]
    async fn hard_change_triggers_prompt_write() {
        let (manager, backend) = manager();

        let ctx = CancellationToken::new();
        let loop_manager = manager.clone();
        let loop_ctx = ctx.clone();
        let handle = tokio::spawn(async move { loop_manager.run(loop_ctx).await });

        manager.update_ingest_status(IngestStatus::new(IngestState::Running));
        for _ in 0..100 {
            if backend.writes.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(backend.writes.load(Ordering::SeqCst) > 0);
        assert_eq!(
            backend.last.lock().as_ref().unwrap().ingest.status,
            IngestState::Running
        );

        ctx.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_write_is_retried() {
        let (manager, backend) = manager();
        backend.fail.store(true, Ordering::SeqCst);

        manager.update_ingest_status(IngestStatus::new(IngestState::Running));
        manager.reconcile(false).await;
        assert!(manager.inner.cached.lock().write_asap);

        backend.fail.store(false, Ordering::SeqCst);
        manager.reconcile(false).await;
        assert!(!manager.inner.cached.lock().write_asap);
        assert_eq!(backend.writes.load(Ordering::SeqCst), 2);
    }
}
