//! Postgres store backend.
//!
//! Each unit of work is one `sqlx` transaction. Card and registration rows are
//! locked with `SELECT ... FOR UPDATE`; lock waits are bounded by a
//! transaction-scoped `lock_timeout`, and SQLSTATE 55P03 comes back as
//! [`StoreError::LockTimeout`].
//!
//! All SQL is runtime-checked (sqlx::query, not sqlx::query!) because the
//! tables may not exist when the crate is compiled.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{info, warn};

use super::{EventLog, Result, TagStore, TapBatch, UnitOfWork};
use crate::config::{mask_database_url, DatabaseConfig};
use crate::error::{LockTarget, StoreError};
use crate::types::{
    Card, CardStatus, LogEntry, LogLabel, MemberRole, Membership, Portal, Registration,
    RegistrationId, TagId,
};

/// lock_not_available
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
/// query_canceled, raised when a statement_timeout fires mid-wait
const SQLSTATE_QUERY_CANCELED: &str = "57014";

/// Open a connection pool from configuration.
pub async fn connect(config: &DatabaseConfig) -> std::result::Result<PgPool, sqlx::Error> {
    info!(
        "Connecting to database: {}",
        mask_database_url(&config.database_url)
    );

    let mut pool_options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connection_timeout);

    if let Some(idle_timeout) = config.idle_timeout {
        pool_options = pool_options.idle_timeout(idle_timeout);
    }

    if let Some(max_lifetime) = config.max_lifetime {
        pool_options = pool_options.max_lifetime(max_lifetime);
    }

    let pool = pool_options
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            warn!("Failed to connect to database: {}", e);
            e
        })?;

    info!("Database connection pool created successfully");
    Ok(pool)
}

/// Create the card, membership, registration and log tables if missing.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await
}

/// Map a failed statement to a lock timeout when that is what it was.
fn classify(error: sqlx::Error, target: impl FnOnce() -> LockTarget) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if matches!(
            db.code().as_deref(),
            Some(SQLSTATE_LOCK_NOT_AVAILABLE) | Some(SQLSTATE_QUERY_CANCELED)
        ) {
            return StoreError::LockTimeout(target());
        }
    }
    StoreError::Database(error)
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{what}: {detail}"))
}

// ── Row types ─────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct CardRow {
    rfid_card_id: String,
    status: String,
    portal: String,
}

impl TryFrom<CardRow> for Card {
    type Error = StoreError;

    fn try_from(row: CardRow) -> Result<Self> {
        let status = CardStatus::parse(&row.status)
            .ok_or_else(|| corrupt("card status", &row.status))?;
        Ok(Card {
            tag_id: TagId::new(&row.rfid_card_id).map_err(|e| corrupt("card tag", e))?,
            status,
            portal: Portal::new(&row.portal).map_err(|e| corrupt("card portal", e))?,
        })
    }
}

#[derive(Debug, FromRow)]
struct MembershipRow {
    registration_id: i64,
    rfid_card_id: String,
    portal: String,
    role: String,
}

impl TryFrom<MembershipRow> for Membership {
    type Error = StoreError;

    fn try_from(row: MembershipRow) -> Result<Self> {
        Ok(Membership {
            registration_id: RegistrationId::new(row.registration_id)
                .map_err(|e| corrupt("membership registration", e))?,
            tag_id: TagId::new(&row.rfid_card_id).map_err(|e| corrupt("membership tag", e))?,
            portal: Portal::new(&row.portal).map_err(|e| corrupt("membership portal", e))?,
            role: MemberRole::parse(&row.role)
                .ok_or_else(|| corrupt("membership role", &row.role))?,
        })
    }
}

#[derive(Debug, FromRow)]
struct RegistrationRow {
    id: i64,
    portal: String,
    group_size: i32,
}

impl TryFrom<RegistrationRow> for Registration {
    type Error = StoreError;

    fn try_from(row: RegistrationRow) -> Result<Self> {
        Ok(Registration {
            id: RegistrationId::new(row.id).map_err(|e| corrupt("registration id", e))?,
            portal: Portal::new(&row.portal).map_err(|e| corrupt("registration portal", e))?,
            group_size: row.group_size,
        })
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: i64,
    log_time: DateTime<Utc>,
    rfid_card_id: String,
    portal: String,
    label: String,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(LogEntry {
            id: row.id,
            time: row.log_time,
            tag_id: TagId::new(&row.rfid_card_id).map_err(|e| corrupt("log tag", e))?,
            portal: Portal::new(&row.portal).map_err(|e| corrupt("log portal", e))?,
            label: LogLabel::parse(&row.label),
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

// The logs table is written by the reader hardware and carries no column
// checks, so log rows are decoded one at a time and bad ones are skipped.

/// Decode log rows in order, dropping the ones that fail validation.
fn decode_log_rows(rows: Vec<LogRow>) -> (Vec<LogEntry>, usize) {
    let mut taps = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        let log_id = row.id;
        match LogEntry::try_from(row) {
            Ok(entry) => taps.push(entry),
            Err(e) => {
                warn!(log_id, error = %e, "Skipping undecodable log row");
                skipped += 1;
            }
        }
    }
    (taps, skipped)
}

fn decode_sightings(rows: Vec<(String, String)>) -> Vec<(TagId, Portal)> {
    rows.into_iter()
        .filter_map(|(tag, portal)| match (TagId::new(&tag), Portal::new(&portal)) {
            (Ok(tag_id), Ok(portal)) => Some((tag_id, portal)),
            (Err(e), _) | (_, Err(e)) => {
                warn!(
                    rfid_card_id = %tag,
                    portal = %portal,
                    error = %e,
                    "Skipping undecodable sighting"
                );
                None
            }
        })
        .collect()
}

// ── PgTagStore ────────────────────────────────────────────────

/// Card registry, membership and registration tables in Postgres.
#[derive(Debug, Clone)]
pub struct PgTagStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgTagStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TagStore for PgTagStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await?;

        // Scoped to this transaction; never leaks back into the pool.
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis().max(1)))
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn card(&self, tag_id: &TagId) -> Result<Option<Card>> {
        sqlx::query_as::<_, CardRow>(
            r#"
            SELECT rfid_card_id, status, portal
            FROM rfid_cards
            WHERE rfid_card_id = $1
            "#,
        )
        .bind(tag_id.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(Card::try_from)
        .transpose()
    }

    async fn memberships_for_tag(&self, tag_id: &TagId) -> Result<Vec<Membership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT registration_id, rfid_card_id, portal, role
            FROM members
            WHERE rfid_card_id = $1
            ORDER BY id
            "#,
        )
        .bind(tag_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn memberships_for_registration(
        &self,
        registration_id: RegistrationId,
    ) -> Result<Vec<Membership>> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            r#"
            SELECT registration_id, rfid_card_id, portal, role
            FROM members
            WHERE registration_id = $1
            ORDER BY id
            "#,
        )
        .bind(registration_id.get())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}

// ── PgUnitOfWork ──────────────────────────────────────────────

/// One Postgres transaction. Dropping it uncommitted rolls back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_card(&mut self, tag_id: &TagId) -> Result<Option<Card>> {
        sqlx::query_as::<_, CardRow>(
            r#"
            SELECT rfid_card_id, status, portal
            FROM rfid_cards
            WHERE rfid_card_id = $1
            FOR UPDATE
            "#,
        )
        .bind(tag_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| classify(e, || LockTarget::Card(tag_id.clone())))?
        .map(Card::try_from)
        .transpose()
    }

    async fn insert_card_if_absent(&mut self, card: &Card) -> Result<bool> {
        // DO NOTHING waits for a concurrent inserter to finish instead of
        // raising a unique violation that would abort this transaction.
        let result = sqlx::query(
            r#"
            INSERT INTO rfid_cards (rfid_card_id, status, portal)
            VALUES ($1, $2, $3)
            ON CONFLICT (rfid_card_id) DO NOTHING
            "#,
        )
        .bind(card.tag_id.as_str())
        .bind(card.status.as_str())
        .bind(card.portal.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(e, || LockTarget::Card(card.tag_id.clone())))?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_card(&mut self, card: &Card) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE rfid_cards
            SET status = $2, portal = $3
            WHERE rfid_card_id = $1
            "#,
        )
        .bind(card.tag_id.as_str())
        .bind(card.status.as_str())
        .bind(card.portal.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| classify(e, || LockTarget::Card(card.tag_id.clone())))?;

        if result.rows_affected() == 0 {
            return Err(corrupt("update of missing card", &card.tag_id));
        }
        Ok(())
    }

    async fn lock_registration(
        &mut self,
        registration_id: RegistrationId,
        portal: &Portal,
    ) -> Result<Option<Registration>> {
        sqlx::query_as::<_, RegistrationRow>(
            r#"
            SELECT id, portal, group_size
            FROM registration
            WHERE id = $1 AND portal = $2
            FOR UPDATE
            "#,
        )
        .bind(registration_id.get())
        .bind(portal.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| classify(e, || LockTarget::Registration(registration_id)))?
        .map(Registration::try_from)
        .transpose()
    }

    async fn insert_membership(&mut self, membership: &Membership) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO members (registration_id, rfid_card_id, role, portal)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(membership.registration_id.get())
        .bind(membership.tag_id.as_str())
        .bind(membership.role.as_str())
        .bind(membership.portal.as_str())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_memberships(&mut self, tag_id: &TagId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM members WHERE rfid_card_id = $1")
            .bind(tag_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(e, || LockTarget::Card(tag_id.clone())))?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgUnitOfWork { tx } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let PgUnitOfWork { tx } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

// ── PgEventLog ────────────────────────────────────────────────

/// The `logs` table written by the hardware path.
#[derive(Debug, Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a tap the way the hardware path does. The engine never calls
    /// this; it exists for the ingestion side and for tests.
    pub async fn append(&self, tag_id: &TagId, portal: &Portal, label: &LogLabel) -> Result<LogEntry> {
        let row = sqlx::query_as::<_, LogRow>(
            r#"
            INSERT INTO logs (rfid_card_id, portal, label, log_time)
            VALUES ($1, $2, $3, now())
            RETURNING id, log_time, rfid_card_id, portal, label
            "#,
        )
        .bind(tag_id.as_str())
        .bind(portal.as_str())
        .bind(label.as_str())
        .fetch_one(&self.pool)
        .await?;
        LogEntry::try_from(row)
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn sightings(&self, label: &LogLabel) -> Result<Vec<(TagId, Portal)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT rfid_card_id, portal
            FROM logs
            WHERE label = $1
            ORDER BY rfid_card_id, portal
            "#,
        )
        .bind(label.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_sightings(rows))
    }

    async fn latest_tap(&self, label: &LogLabel, portal: &Portal) -> Result<Option<LogEntry>> {
        let row = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, log_time, rfid_card_id, portal, label
            FROM logs
            WHERE label = $1 AND portal = $2
            ORDER BY log_time DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(label.as_str())
        .bind(portal.as_str())
        .fetch_optional(&self.pool)
        .await?;

        // An undecodable latest tap names no usable card.
        Ok(decode_log_rows(row.into_iter().collect()).0.into_iter().next())
    }

    async fn taps_after(&self, labels: &[LogLabel], after_id: i64) -> Result<TapBatch> {
        let labels: Vec<String> = labels.iter().map(|l| l.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, log_time, rfid_card_id, portal, label
            FROM logs
            WHERE label = ANY($1) AND id > $2
            ORDER BY id
            "#,
        )
        .bind(labels)
        .bind(after_id)
        .fetch_all(&self.pool)
        .await?;

        let last_id = rows.last().map_or(after_id, |row| row.id);
        let (taps, skipped) = decode_log_rows(rows);
        Ok(TapBatch {
            taps,
            last_id,
            skipped,
        })
    }
}
