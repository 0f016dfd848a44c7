//! RFID tag assignment
//!
//! Binds physical RFID tags to event registrations so that a tag belongs to
//! at most one registration at any moment, under concurrent assign and
//! release requests from many reader stations.
//!
//! ## Layout
//! - [`engine::AssignmentEngine`]: assign, link-last-tap, release, lookups
//! - [`registry::lock_or_create`]: the one way a card row gets locked
//! - [`reconcile::Reconciler`]: rebuilds missing cards from the tap log
//! - [`exit_stack::ExitStack`] and [`worker::ExitWatcher`]: exit-tap handling
//! - [`store`]: persistence ports with in-memory and Postgres backends
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rfid_assign::{AssignTagRequest, AssignmentEngine, MemoryEventLog, MemoryTagStore};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let engine = AssignmentEngine::new(
//!     Arc::new(MemoryTagStore::new()),
//!     Arc::new(MemoryEventLog::new()),
//! );
//! let request = AssignTagRequest {
//!     tag_id: "A1".into(),
//!     registration_id: 7,
//!     portal: "portal1".into(),
//!     ..Default::default()
//! };
//! let assignment = engine.assign_tag(&request.validate()?).await?;
//! println!("{} -> {}", assignment.tag_id, assignment.registration_id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod exit_stack;
pub mod reconcile;
pub mod registry;
pub mod request;
pub mod store;
pub mod types;
pub mod worker;

pub use config::{DatabaseConfig, EngineConfig};
pub use engine::AssignmentEngine;
pub use error::{LockTarget, StoreError, TagError, ValidationError};
pub use exit_stack::{BatchRelease, ExitStack, PendingExit, StackPush, StackStats};
pub use reconcile::{ReconcileReport, Reconciler};
pub use request::{
    AssignTag, AssignTagRequest, LinkLastTap, LinkLastTapRequest, ReleaseTag, ReleaseTagRequest,
};
pub use store::{EventLog, MemoryEventLog, MemoryTagStore, TagStore, TapBatch, UnitOfWork};
pub use types::{
    Assignment, Card, CardStatus, LogEntry, LogLabel, MemberRole, Membership, Portal,
    Registration, RegistrationId, Release, TagId,
};
pub use worker::{ExitScan, ExitWatcher, ReconcileWorker};

#[cfg(feature = "database")]
pub use store::{PgEventLog, PgTagStore};
