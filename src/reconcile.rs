//! Rebuild missing card rows from the tap log.
//!
//! The hardware path appends to the log and the engine writes the card
//! registry, and the two never commit together. After a crash between them
//! the registry can be missing cards the log says were seen. Reconciliation
//! walks every `REGISTER` sighting and runs [`lock_or_create`] for it, which
//! only ever adds rows: an existing card keeps whatever status it has.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::Result;
use crate::error::TagError;
use crate::registry::lock_or_create;
use crate::store::{EventLog, TagStore};
use crate::types::{LogLabel, Portal, TagId};

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Distinct `(tag, portal)` pairs found in the log.
    pub sightings: usize,
    /// Cards inserted by this pass.
    pub created: usize,
    /// Pairs whose card lock could not be taken in time; picked up next pass.
    pub skipped: usize,
}

/// Idempotent repair of the card registry from the tap log.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn TagStore>,
    log: Arc<dyn EventLog>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TagStore>, log: Arc<dyn EventLog>) -> Self {
        Self { store, log }
    }

    /// Create every card the log implies but the registry lacks.
    ///
    /// Each pair gets its own short unit of work so no lock outlives a single
    /// card. Lock timeouts are counted as skipped; any other failure stops the
    /// pass and is returned.
    pub async fn reconcile_from_log(&self) -> Result<ReconcileReport> {
        let sightings = self.log.sightings(&LogLabel::Register).await?;
        let mut report = ReconcileReport {
            sightings: sightings.len(),
            ..Default::default()
        };

        for (tag_id, portal) in &sightings {
            match self.ensure_card(tag_id, portal).await {
                Ok(true) => report.created += 1,
                Ok(false) => {}
                Err(TagError::LockTimeout(target)) => {
                    warn!(%target, "Card busy during reconciliation, skipping");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if report.created > 0 || report.skipped > 0 {
            info!(
                sightings = report.sightings,
                created = report.created,
                skipped = report.skipped,
                "Card registry reconciled from log"
            );
        }
        Ok(report)
    }

    async fn ensure_card(&self, tag_id: &TagId, portal: &Portal) -> Result<bool> {
        let mut uow = self.store.begin().await?;
        let created = match lock_or_create(uow.as_mut(), tag_id, portal).await {
            Ok(locked) => locked.created,
            Err(e) => {
                uow.rollback().await.ok();
                return Err(e.into());
            }
        };
        uow.commit().await?;
        Ok(created)
    }
}
