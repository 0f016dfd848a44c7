//! In-process store backend.
//!
//! Mirrors the Postgres semantics the engine relies on: every locked row is
//! guarded by its own async mutex, lock waits are bounded, writes are staged
//! in the unit of work and applied on commit. Dropping an uncommitted unit
//! discards its writes and releases its locks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{EventLog, Result, TapBatch, TagStore, UnitOfWork};
use crate::error::{LockTarget, StoreError};
use crate::types::{
    Card, LogEntry, LogLabel, Membership, Portal, Registration, RegistrationId, TagId,
};

/// Lock wait used when none is configured.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Card(TagId),
    Registration(RegistrationId),
}

impl RowKey {
    fn target(&self) -> LockTarget {
        match self {
            RowKey::Card(tag_id) => LockTarget::Card(tag_id.clone()),
            RowKey::Registration(id) => LockTarget::Registration(*id),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    cards: BTreeMap<TagId, Card>,
    memberships: Vec<Membership>,
    registrations: BTreeMap<RegistrationId, Registration>,
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>,
    lock_timeout: Duration,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── MemoryTagStore ───────────────────────────────────────────

/// Card registry, membership store and registration store held in memory.
#[derive(Debug, Clone)]
pub struct MemoryTagStore {
    shared: Arc<Shared>,
}

impl Default for MemoryTagStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout,
            }),
        }
    }

    /// Add or replace a registration. Registrations are written by the
    /// registration flow, never by the engine.
    pub fn insert_registration(&self, registration: Registration) {
        guard(&self.shared.tables)
            .registrations
            .insert(registration.id, registration);
    }

    /// Snapshot of every committed card, ordered by tag.
    pub fn cards(&self) -> Vec<Card> {
        guard(&self.shared.tables).cards.values().cloned().collect()
    }

    /// Snapshot of every committed membership.
    pub fn memberships(&self) -> Vec<Membership> {
        guard(&self.shared.tables).memberships.clone()
    }
}

#[async_trait]
impl TagStore for MemoryTagStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            shared: Arc::clone(&self.shared),
            held: HashMap::new(),
            pending: Vec::new(),
        }))
    }

    async fn card(&self, tag_id: &TagId) -> Result<Option<Card>> {
        Ok(guard(&self.shared.tables).cards.get(tag_id).cloned())
    }

    async fn memberships_for_tag(&self, tag_id: &TagId) -> Result<Vec<Membership>> {
        Ok(guard(&self.shared.tables)
            .memberships
            .iter()
            .filter(|m| &m.tag_id == tag_id)
            .cloned()
            .collect())
    }

    async fn memberships_for_registration(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Vec<Membership>> {
        Ok(guard(&self.shared.tables)
            .memberships
            .iter()
            .filter(|m| m.registration_id == registration_id)
            .cloned()
            .collect())
    }
}

// ── MemoryUnitOfWork ─────────────────────────────────────────

#[derive(Debug)]
enum PendingWrite {
    PutCard(Card),
    InsertMembership(Membership),
    DeleteMemberships(TagId),
}

/// Unit of work over [`MemoryTagStore`].
pub struct MemoryUnitOfWork {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    pending: Vec<PendingWrite>,
}

impl MemoryUnitOfWork {
    /// Take the row lock unless this unit already holds it.
    async fn acquire(&mut self, key: RowKey) -> Result<()> {
        if self.held.contains_key(&key) {
            return Ok(());
        }
        let row_lock = Arc::clone(guard(&self.shared.row_locks).entry(key.clone()).or_default());
        let held = tokio::time::timeout(self.shared.lock_timeout, row_lock.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout(key.target()))?;
        self.held.insert(key, held);
        Ok(())
    }

    /// Committed card with this unit's staged writes applied.
    fn visible_card(&self, tag_id: &TagId) -> Option<Card> {
        let mut card = guard(&self.shared.tables).cards.get(tag_id).cloned();
        for write in &self.pending {
            if let PendingWrite::PutCard(staged) = write {
                if &staged.tag_id == tag_id {
                    card = Some(staged.clone());
                }
            }
        }
        card
    }

    fn visible_memberships(&self, tag_id: &TagId) -> Vec<Membership> {
        let mut rows: Vec<Membership> = guard(&self.shared.tables)
            .memberships
            .iter()
            .filter(|m| &m.tag_id == tag_id)
            .cloned()
            .collect();
        for write in &self.pending {
            match write {
                PendingWrite::InsertMembership(m) if &m.tag_id == tag_id => rows.push(m.clone()),
                PendingWrite::DeleteMemberships(t) if t == tag_id => rows.clear(),
                _ => {}
            }
        }
        rows
    }

    fn apply(&mut self) {
        let mut tables = guard(&self.shared.tables);
        for write in self.pending.drain(..) {
            match write {
                PendingWrite::PutCard(card) => {
                    tables.cards.insert(card.tag_id.clone(), card);
                }
                PendingWrite::InsertMembership(membership) => tables.memberships.push(membership),
                PendingWrite::DeleteMemberships(tag_id) => {
                    tables.memberships.retain(|m| m.tag_id != tag_id)
                }
            }
        }
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        // Release this unit's row locks, then forget rows nobody else is
        // holding or waiting on. Waiters clone the lock under `row_locks`, so
        // a count of one seen under that mutex means no one else has it.
        let keys: Vec<RowKey> = self.held.drain().map(|(key, _guard)| key).collect();
        let mut row_locks = guard(&self.shared.row_locks);
        for key in keys {
            if row_locks
                .get(&key)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                row_locks.remove(&key);
            }
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_card(&mut self, tag_id: &TagId) -> Result<Option<Card>> {
        self.acquire(RowKey::Card(tag_id.clone())).await?;
        Ok(self.visible_card(tag_id))
    }

    async fn insert_card_if_absent(&mut self, card: &Card) -> Result<bool> {
        // An insert takes the row lock, like a unique-index insert in Postgres.
        self.acquire(RowKey::Card(card.tag_id.clone())).await?;
        if self.visible_card(&card.tag_id).is_some() {
            return Ok(false);
        }
        self.pending.push(PendingWrite::PutCard(card.clone()));
        Ok(true)
    }

    async fn update_card(&mut self, card: &Card) -> Result<()> {
        self.acquire(RowKey::Card(card.tag_id.clone())).await?;
        if self.visible_card(&card.tag_id).is_none() {
            return Err(StoreError::Corrupt(format!(
                "update of missing card {}",
                card.tag_id
            )));
        }
        self.pending.push(PendingWrite::PutCard(card.clone()));
        Ok(())
    }

    async fn lock_registration(
        &mut self,
        registration_id: RegistrationId,
        portal: &Portal,
    ) -> Result<Option<Registration>> {
        self.acquire(RowKey::Registration(registration_id)).await?;
        Ok(guard(&self.shared.tables)
            .registrations
            .get(&registration_id)
            .filter(|r| &r.portal == portal)
            .cloned())
    }

    async fn insert_membership(&mut self, membership: &Membership) -> Result<()> {
        self.pending
            .push(PendingWrite::InsertMembership(membership.clone()));
        Ok(())
    }

    async fn delete_memberships(&mut self, tag_id: &TagId) -> Result<u64> {
        let removed = self.visible_memberships(tag_id).len() as u64;
        self.pending
            .push(PendingWrite::DeleteMemberships(tag_id.clone()));
        Ok(removed)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        // Writes land before the row locks drop with `this`.
        let mut this = self;
        this.apply();
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

// ── MemoryEventLog ───────────────────────────────────────────

/// Append-only tap log held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    entries: Arc<RwLock<Vec<LogEntry>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tap now, as the hardware path would.
    pub fn append(&self, tag_id: TagId, portal: Portal, label: LogLabel) -> LogEntry {
        self.append_at(tag_id, portal, label, Utc::now())
    }

    /// Record a tap with an explicit timestamp.
    pub fn append_at(
        &self,
        tag_id: TagId,
        portal: Portal,
        label: LogLabel,
        time: DateTime<Utc>,
    ) -> LogEntry {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = LogEntry {
            id: entries.len() as i64 + 1,
            time,
            tag_id,
            portal,
            label,
        };
        entries.push(entry.clone());
        entry
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<LogEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn sightings(&self, label: &LogLabel) -> Result<Vec<(TagId, Portal)>> {
        let pairs: BTreeSet<(TagId, Portal)> = self
            .read()
            .iter()
            .filter(|e| &e.label == label)
            .map(|e| (e.tag_id.clone(), e.portal.clone()))
            .collect();
        Ok(pairs.into_iter().collect())
    }

    async fn latest_tap(&self, label: &LogLabel, portal: &Portal) -> Result<Option<LogEntry>> {
        Ok(self
            .read()
            .iter()
            .filter(|e| &e.label == label && &e.portal == portal)
            .max_by_key(|e| (e.time, e.id))
            .cloned())
    }

    async fn taps_after(&self, labels: &[LogLabel], after_id: i64) -> Result<TapBatch> {
        // Entries are stored in id order.
        let taps: Vec<LogEntry> = self
            .read()
            .iter()
            .filter(|e| e.id > after_id && labels.contains(&e.label))
            .cloned()
            .collect();
        Ok(TapBatch {
            last_id: taps.last().map_or(after_id, |e| e.id),
            taps,
            skipped: 0,
        })
    }
}
