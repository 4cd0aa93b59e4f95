//! Background upkeep of one approximate index
//!
//! Each tick either builds the first generation once the family is large
//! enough, rebuilds when inserts since the last build drift past the
//! configured ratio, or compacts when tombstones pile up. The work runs on the
//! blocking pool so the async runtime is never stalled by a build.

use crate::engine::FingerprintEngine;
use crate::error::Result;
use crate::index::IndexHandle;
use crate::types::FingerprintType;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What a maintenance pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    /// Tombstones dropped by compaction
    pub compacted: usize,
    /// Generation built during the pass
    pub rebuilt: Option<IndexHandle>,
}

/// Periodic compaction and rebuild for one fingerprint family
pub struct MaintenanceTask {
    engine: Arc<FingerprintEngine>,
    fingerprint_type: FingerprintType,
}

impl MaintenanceTask {
    /// Task for one family of `engine`
    pub fn new(engine: Arc<FingerprintEngine>, fingerprint_type: FingerprintType) -> Self {
        Self {
            engine,
            fingerprint_type,
        }
    }

    /// Family maintained
    pub fn fingerprint_type(&self) -> FingerprintType {
        self.fingerprint_type
    }

    /// One synchronous pass
    pub fn run_once(&self) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let Some(ann) = self.engine.approximate_index(self.fingerprint_type)? else {
            return Ok(report);
        };
        let settings = &self.engine.config().approximate;

        if ann.handle().is_none() {
            let stored = self.engine.store().count(self.fingerprint_type)?;
            if stored >= settings.min_build_size {
                report.rebuilt = Some(
                    self.engine
                        .rebuild_approximate(self.fingerprint_type, None)?,
                );
            }
            return Ok(report);
        }

        // A rebuild also drops tombstones, so it takes precedence
        let drift = ann.drift();
        if drift > settings.rebuild_drift_ratio {
            info!(
                fingerprint_type = %self.fingerprint_type,
                drift,
                "approximate index drifted, rebuilding"
            );
            report.rebuilt = Some(
                self.engine
                    .rebuild_approximate(self.fingerprint_type, None)?,
            );
            return Ok(report);
        }

        let ratio = ann.tombstone_ratio();
        if ratio > settings.compaction_tombstone_ratio {
            report.compacted = ann.compact();
        }
        debug!(
            fingerprint_type = %self.fingerprint_type,
            drift,
            tombstone_ratio = ratio,
            compacted = report.compacted,
            "maintenance pass"
        );
        Ok(report)
    }

    /// Run passes on the configured interval until `shutdown` flips to `true`
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.engine.config().approximate.maintenance_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the engine has just been opened
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let task = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || task.run_once()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(
                                fingerprint_type = %self.fingerprint_type,
                                error = %e,
                                "approximate index maintenance failed"
                            ),
                            Err(e) => warn!(
                                fingerprint_type = %self.fingerprint_type,
                                error = %e,
                                "approximate index maintenance panicked"
                            ),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(fingerprint_type = %self.fingerprint_type, "maintenance stopped");
        })
    }
}
