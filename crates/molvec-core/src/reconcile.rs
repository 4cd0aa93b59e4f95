//! External index reconciliation
//!
//! Ingestion only records intent: it writes the fingerprint, marks the index
//! entry and puts its key on the durable sync queue. The [`Reconciler`] drains
//! that queue, pushes to the external index and retries failures with capped
//! exponential backoff until the attempt budget runs out.

use crate::config::ReconcilerConfig;
use crate::error::{AdapterError, Result};
use crate::external::{AdapterResult, ExternalIndexAdapter};
use crate::locks::KeyLocks;
use crate::storage::EngineStore;
use crate::types::{ExternalId, Fingerprint, IndexEntry, SyncEvent, SyncKey, SyncState};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Hooks fired by the reconciler
pub trait SyncObserver: Send + Sync {
    /// Entry pushed successfully
    fn on_synced(&self, _entry: &IndexEntry) {}

    /// Push failed; the entry will be retried
    fn on_retry_scheduled(&self, _entry: &IndexEntry, _error: &AdapterError) {}

    /// Entry gave up after the configured number of attempts
    fn on_exhausted(&self, entry: &IndexEntry);
}

/// Default observer: logs exhausted entries
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl SyncObserver for LoggingObserver {
    fn on_exhausted(&self, entry: &IndexEntry) {
        error!(
            molecule_id = %entry.molecule_id,
            fingerprint_type = %entry.fingerprint_type,
            attempts = entry.attempts,
            state = %entry.sync_state,
            "external index sync exhausted its retry budget"
        );
    }
}

/// Capped exponential backoff with relative jitter
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
}

impl Backoff {
    /// Backoff from reconciler settings
    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self {
            base: config.base_delay(),
            cap: config.max_delay(),
            jitter: config.jitter,
        }
    }

    /// Delay before the next try, with no jitter applied
    pub fn nominal(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let ms = (self.base.as_millis() as u64).saturating_mul(1u64 << exp);
        Duration::from_millis(ms).min(self.cap)
    }

    /// Delay before the next try after `attempts` consecutive failures
    pub fn delay<R: Rng>(&self, attempts: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal(attempts);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(factor)
    }
}

/// Outcome of one pass over the sync queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys taken from the queue
    pub scanned: usize,
    /// Successful pushes
    pub pushed: usize,
    /// Failed pushes scheduled for retry
    pub retrying: usize,
    /// Entries that ran out of attempts
    pub exhausted: usize,
    /// Entries whose backoff had not elapsed
    pub deferred: usize,
    /// Molecules removed from the external index after deletion
    pub removed: usize,
}

impl ReconcileReport {
    /// Whether the pass touched nothing
    pub fn is_idle(&self) -> bool {
        self.scanned == 0
    }
}

/// Drains the sync queue into an [`ExternalIndexAdapter`]
pub struct Reconciler {
    store: Arc<dyn EngineStore>,
    adapter: Arc<dyn ExternalIndexAdapter>,
    config: ReconcilerConfig,
    backoff: Backoff,
    observer: Arc<dyn SyncObserver>,
    key_locks: Arc<KeyLocks>,
    rng: Mutex<ChaCha8Rng>,
}

impl Reconciler {
    /// Reconciler with the logging observer
    pub fn new(
        store: Arc<dyn EngineStore>,
        adapter: Arc<dyn ExternalIndexAdapter>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            backoff: Backoff::from_config(&config),
            config,
            observer: Arc::new(LoggingObserver),
            key_locks: Arc::new(KeyLocks::default()),
            rng: Mutex::new(ChaCha8Rng::from_entropy()),
        }
    }

    /// Replace the observer
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Share the write locks the ingestion path takes, so ledger updates
    /// after a push never interleave with an ingest or remove of the same key
    pub fn with_key_locks(mut self, key_locks: Arc<KeyLocks>) -> Self {
        self.key_locks = key_locks;
        self
    }

    /// Seed the jitter source
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Settings in use
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// One pass over up to `batch_size` queued keys
    ///
    /// Store failures abort the pass and are returned; adapter failures are
    /// recorded on the entry and retried on a later pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for key in self.store.queued(self.config.batch_size)? {
            report.scanned += 1;
            self.reconcile_key(&key, now, &mut report).await?;
        }
        if !report.is_idle() {
            debug!(?report, "reconciliation pass finished");
        }
        Ok(report)
    }

    async fn reconcile_key(
        &self,
        key: &SyncKey,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let fingerprint = self.store.get(&key.molecule_id, key.fingerprint_type)?;
        let Some(fingerprint) = fingerprint else {
            // Molecule deleted since it was queued
            return self.propagate_removal(key, report).await;
        };

        let mut entry = match self.store.get_entry(key)? {
            Some(entry) => entry,
            None => IndexEntry::new(&fingerprint, None),
        };

        if entry.sync_state == SyncState::Synced
            || entry.is_exhausted(self.config.max_attempts)
        {
            self.store.dequeue(key)?;
            return Ok(());
        }
        if entry.next_attempt_at.is_some_and(|at| at > now) {
            report.deferred += 1;
            return Ok(());
        }
        if matches!(entry.sync_state, SyncState::Stale | SyncState::Failed { .. }) {
            entry.transition(SyncEvent::Requeued, now)?;
        }

        let outcome = self.adapter.push(&key.molecule_id, &fingerprint).await;
        let deleted_in_flight = self.settle_push(key, entry, &fingerprint, outcome, now, report)?;
        if deleted_in_flight {
            debug!(key = %key, "molecule deleted during push");
            self.propagate_removal(key, report).await?;
        }
        Ok(())
    }

    /// Record a push outcome against what the store holds now
    ///
    /// Runs under the key's write lock. Returns `true` when the molecule was
    /// deleted while the push was in flight; the entry is then left alone and
    /// the key stays queued for removal.
    fn settle_push(
        &self,
        key: &SyncKey,
        mut entry: IndexEntry,
        pushed: &Fingerprint,
        outcome: AdapterResult<ExternalId>,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<bool> {
        let _guard = self.key_locks.lock(key);
        let Some(latest) = self.store.get(&key.molecule_id, key.fingerprint_type)? else {
            if outcome.is_ok() {
                report.pushed += 1;
            }
            return Ok(true);
        };
        let superseded = !latest.same_content(pushed);

        match outcome {
            Ok(external_id) => {
                entry.external_index_id = Some(external_id);
                entry.fingerprint_generated_at = pushed.generated_at();
                entry.transition(SyncEvent::PushSucceeded, now)?;
                if superseded {
                    // Newer content landed mid-push; push again next pass
                    entry.transition(SyncEvent::FingerprintChanged, now)?;
                    self.store.put_entry(&entry)?;
                } else {
                    self.store.put_entry(&entry)?;
                    self.store.dequeue(key)?;
                }
                report.pushed += 1;
                debug!(key = %key, external_id = ?entry.external_index_id, "pushed to external index");
                self.observer.on_synced(&entry);
            }
            Err(e) if superseded => {
                // The failed push carried stale content; the new one gets a fresh budget
                entry.transition(SyncEvent::PushFailed(e.to_string()), now)?;
                entry.transition(SyncEvent::FingerprintChanged, now)?;
                self.store.put_entry(&entry)?;
                report.retrying += 1;
                warn!(key = %key, error = %e, "push of superseded fingerprint failed");
            }
            Err(e) => {
                entry.transition(SyncEvent::PushFailed(e.to_string()), now)?;
                if entry.is_exhausted(self.config.max_attempts) {
                    entry.next_attempt_at = None;
                    self.store.put_entry(&entry)?;
                    self.store.dequeue(key)?;
                    report.exhausted += 1;
                    self.observer.on_exhausted(&entry);
                } else {
                    let mut delay = self.backoff.delay(entry.attempts, &mut *self.rng.lock());
                    if let AdapterError::RateLimited {
                        retry_after: Some(hint),
                    } = &e
                    {
                        delay = delay.max(*hint);
                    }
                    entry.next_attempt_at =
                        Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
                    self.store.put_entry(&entry)?;
                    report.retrying += 1;
                    warn!(
                        key = %key,
                        attempts = entry.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "external push failed, retry scheduled"
                    );
                    self.observer.on_retry_scheduled(&entry, &e);
                }
            }
        }
        Ok(false)
    }

    /// Remove a deleted molecule from the external index, then drop its entry
    async fn propagate_removal(&self, key: &SyncKey, report: &mut ReconcileReport) -> Result<()> {
        match self
            .adapter
            .remove(&key.molecule_id, key.fingerprint_type)
            .await
        {
            Ok(_) => {
                self.forget_removed(key)?;
                report.removed += 1;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "external removal failed, keeping key queued");
                report.deferred += 1;
            }
        }
        Ok(())
    }

    fn forget_removed(&self, key: &SyncKey) -> Result<()> {
        let _guard = self.key_locks.lock(key);
        // Re-ingested while the removal was in flight: its entry and queue slot stand
        if self.store.get(&key.molecule_id, key.fingerprint_type)?.is_some() {
            return Ok(());
        }
        self.store.delete_entry(key)?;
        self.store.dequeue(key)?;
        Ok(())
    }

    /// Run passes on the configured interval until `shutdown` flips to `true`
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.config.interval_ms, "reconciler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            warn!(error = %e, "reconciliation pass aborted");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("reconciler stopped");
        })
    }
}
