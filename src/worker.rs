//! Background jobs
//!
//! Two polling loops, both stopped through a `watch` channel:
//! - [`ExitWatcher`] releases tags whose holders tapped out at an exit reader
//! - [`ReconcileWorker`] runs [`Reconciler::reconcile_from_log`] on an interval

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::engine::{AssignmentEngine, Result};
use crate::reconcile::Reconciler;
use crate::request::ReleaseTag;
use crate::types::{LogLabel, Portal};

/// Backoff interval after error
const ERROR_BACKOFF_MS: u64 = 1000;

/// Counts from one exit-log scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitScan {
    pub released: usize,
    /// Taps older than the freshness window, skipped for good.
    pub stale: usize,
    /// Taps whose release failed; retried next scan.
    pub failed: usize,
    /// Log rows that could not be decoded; passed over for good.
    pub malformed: usize,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Every exit tap with id <= floor has been handled.
    floor: i64,
    /// Last handled tap id per portal.
    per_portal: HashMap<Portal, i64>,
}

/// Releases tags as their `EXITOUT`/`EXIT` taps show up in the log.
pub struct ExitWatcher {
    engine: AssignmentEngine,
    exit_window: Duration,
    poll_interval: Duration,
    cursor: Mutex<Cursor>,
}

impl ExitWatcher {
    pub fn new(engine: AssignmentEngine, config: &EngineConfig) -> Self {
        Self {
            engine,
            exit_window: config.exit_window,
            poll_interval: config.exit_poll_interval,
            cursor: Mutex::new(Cursor::default()),
        }
    }

    /// Start the watcher loop (blocks until shutdown signal)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Exit watcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.scan_once().await {
                Ok(scan) => {
                    if scan.released > 0 || scan.failed > 0 || scan.malformed > 0 {
                        debug!(?scan, "Exit scan finished");
                    }
                    self.poll_interval
                }
                Err(e) => {
                    error!(error = %e, "Exit scan failed");
                    Duration::from_millis(ERROR_BACKOFF_MS)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    // Sender dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Exit watcher shutting down");
    }

    /// Process every exit tap newer than the cursor.
    ///
    /// Each tap is released in its own unit of work. When a release fails,
    /// later taps from the same portal wait for the next scan so a portal's
    /// exits are always applied in log order.
    pub async fn scan_once(&self) -> Result<ExitScan> {
        let mut cursor = self.cursor.lock().await;
        let batch = self
            .engine
            .log()
            .taps_after(&LogLabel::exit_labels(), cursor.floor)
            .await?;

        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(self.exit_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));

        let mut scan = ExitScan {
            malformed: batch.skipped,
            ..Default::default()
        };
        let mut blocked: HashSet<Portal> = HashSet::new();
        let mut first_blocked_id: Option<i64> = None;
        // Skipped rows count as seen so the cursor moves past them.
        let mut highest_seen = cursor.floor.max(batch.last_id);

        for tap in batch.taps {
            highest_seen = highest_seen.max(tap.id);
            if blocked.contains(&tap.portal) {
                continue;
            }
            if cursor
                .per_portal
                .get(&tap.portal)
                .is_some_and(|done| tap.id <= *done)
            {
                continue;
            }
            if cutoff.is_some_and(|c| tap.time < c) {
                scan.stale += 1;
                cursor.per_portal.insert(tap.portal.clone(), tap.id);
                continue;
            }

            let cmd = ReleaseTag {
                tag_id: tap.tag_id.clone(),
                portal: tap.portal.clone(),
            };
            match self.engine.release_tag(&cmd).await {
                Ok(_) => {
                    scan.released += 1;
                    cursor.per_portal.insert(tap.portal.clone(), tap.id);
                }
                Err(e) => {
                    warn!(
                        tag_id = %tap.tag_id,
                        portal = %tap.portal,
                        log_id = tap.id,
                        error = %e,
                        "Exit release failed, will retry"
                    );
                    scan.failed += 1;
                    blocked.insert(tap.portal.clone());
                    first_blocked_id.get_or_insert(tap.id);
                }
            }
        }

        cursor.floor = match first_blocked_id {
            Some(id) => id - 1,
            None => highest_seen,
        };
        Ok(scan)
    }
}

/// Runs reconciliation on a fixed interval.
pub struct ReconcileWorker {
    reconciler: Reconciler,
    interval: Duration,
}

impl ReconcileWorker {
    pub fn new(reconciler: Reconciler, config: &EngineConfig) -> Self {
        Self {
            reconciler,
            interval: config.reconcile_interval,
        }
    }

    /// Start the reconciliation loop (blocks until shutdown signal)
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Reconcile worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.reconciler.reconcile_from_log().await {
                Ok(_) => self.interval,
                Err(e) => {
                    error!(error = %e, "Reconciliation pass failed");
                    Duration::from_millis(ERROR_BACKOFF_MS).min(self.interval)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    // Sender dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Reconcile worker shutting down");
    }
}
