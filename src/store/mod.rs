//! Persistence ports for the card registry and the tap log.
//!
//! The engine talks to storage only through these traits, so the same
//! assignment logic runs against [`MemoryTagStore`] in tests and against
//! Postgres in production.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Card, LogEntry, LogLabel, Membership, Portal, Registration, RegistrationId, TagId};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::{MemoryEventLog, MemoryTagStore};
#[cfg(feature = "database")]
pub use postgres::{PgEventLog, PgTagStore};

pub type Result<T> = std::result::Result<T, StoreError>;

/// One read of the tap log past a watermark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TapBatch {
    /// Decodable taps, oldest first.
    pub taps: Vec<LogEntry>,
    /// Highest id examined, including rows that were skipped. Equals the
    /// requested watermark when nothing newer exists.
    pub last_id: i64,
    /// Rows that could not be decoded and were skipped.
    pub skipped: usize,
}

/// Handle to the transactional store holding cards, memberships and
/// registrations.
#[async_trait]
pub trait TagStore: Send + Sync {
    /// Open a unit of work. Row locks taken through it are held until
    /// `commit`/`rollback`; dropping it without committing rolls back.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    // ── Unlocked reads ──

    async fn card(&self, tag_id: &TagId) -> Result<Option<Card>>;
    async fn memberships_for_tag(&self, tag_id: &TagId) -> Result<Vec<Membership>>;
    async fn memberships_for_registration(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Vec<Membership>>;
}

/// One atomic unit of work with pessimistic row locking.
#[async_trait]
pub trait UnitOfWork: Send {
    // ── Card registry ──

    /// Select the card row and hold an exclusive lock on it.
    async fn lock_card(&mut self, tag_id: &TagId) -> Result<Option<Card>>;

    /// Insert the card unless a row already exists. Returns `false` when
    /// another writer got there first; never fails on that conflict.
    async fn insert_card_if_absent(&mut self, card: &Card) -> Result<bool>;

    /// Overwrite status and portal of a card already locked in this unit.
    async fn update_card(&mut self, card: &Card) -> Result<()>;

    // ── Registrations ──

    /// Select the registration matching both id and portal, locked.
    async fn lock_registration(
        &mut self,
        registration_id: RegistrationId,
        portal: &Portal,
    ) -> Result<Option<Registration>>;

    // ── Memberships ──

    async fn insert_membership(&mut self, membership: &Membership) -> Result<()>;

    /// Delete every membership for the tag, returning how many went.
    async fn delete_memberships(&mut self, tag_id: &TagId) -> Result<u64>;

    // ── Completion ──

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Read side of the append-only tap log. Appends belong to the hardware path.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Distinct `(tag, portal)` pairs seen with `label`, ordered by tag.
    /// Rows that fail validation are skipped, not returned as errors.
    async fn sightings(&self, label: &LogLabel) -> Result<Vec<(TagId, Portal)>>;

    /// Most recent tap with `label` at `portal`.
    async fn latest_tap(&self, label: &LogLabel, portal: &Portal) -> Result<Option<LogEntry>>;

    /// Taps carrying any of `labels` with id greater than `after_id`, oldest
    /// first.
    async fn taps_after(&self, labels: &[LogLabel], after_id: i64) -> Result<TapBatch>;
}
