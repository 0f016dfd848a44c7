//! Assignment Engine
//!
//! Every public operation runs inside exactly one unit of work:
//!
//! 1. Validated command in (request bodies are checked before we get here)
//! 2. `begin()` a unit of work on the injected store
//! 3. Lock the card through [`lock_or_create`], then the registration
//! 4. Mutate memberships and card status
//! 5. Commit, or roll back everything on the first error
//!
//! Lock order is always card before registration. Nothing is retried here:
//! `AlreadyAssigned` is a real answer and lock timeouts belong to the caller.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::TagError;
use crate::registry::lock_or_create;
use crate::request::{AssignTag, LinkLastTap, ReleaseTag};
use crate::store::{EventLog, TagStore, UnitOfWork};
use crate::types::{
    Assignment, Card, CardStatus, LogLabel, Membership, Portal, RegistrationId, Release, TagId,
};

pub type Result<T> = std::result::Result<T, TagError>;

/// Assigns, releases and looks up tags against an injected store.
#[derive(Clone)]
pub struct AssignmentEngine {
    store: Arc<dyn TagStore>,
    log: Arc<dyn EventLog>,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn TagStore>, log: Arc<dyn EventLog>) -> Self {
        Self { store, log }
    }

    pub fn store(&self) -> &Arc<dyn TagStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    // ── Assign ──

    /// Assign a tag to a registration as leader or member.
    pub async fn assign_tag(&self, cmd: &AssignTag) -> Result<Assignment> {
        let mut uow = self.store.begin().await?;
        let result = assign_in(uow.as_mut(), cmd).await;
        let assignment = finish(uow, result).await?;

        info!(
            tag_id = %assignment.tag_id,
            registration_id = %assignment.registration_id,
            role = assignment.role.as_str(),
            portal = %cmd.portal,
            "Tag assigned"
        );
        Ok(assignment)
    }

    /// Assign whichever card was last tapped with `REGISTER` at the portal.
    pub async fn link_last_tap(&self, cmd: &LinkLastTap) -> Result<Assignment> {
        let tap = self
            .log
            .latest_tap(&LogLabel::Register, &cmd.portal)
            .await?
            .ok_or_else(|| TagError::NoCardTapped {
                portal: cmd.portal.clone(),
            })?;

        self.assign_tag(&AssignTag::new(
            tap.tag_id,
            cmd.registration_id,
            cmd.portal.clone(),
            cmd.role,
        ))
        .await
    }

    // ── Release ──

    /// Drop every membership for the tag and mark it available. Releasing an
    /// available tag only re-affirms its status.
    pub async fn release_tag(&self, cmd: &ReleaseTag) -> Result<Release> {
        let mut uow = self.store.begin().await?;
        let result = release_in(uow.as_mut(), &cmd.tag_id, &cmd.portal).await;
        let release = finish(uow, result).await?;

        info!(
            tag_id = %release.tag_id,
            portal = %cmd.portal,
            removed = release.memberships_removed,
            "Tag released"
        );
        Ok(release)
    }

    /// Release several tags in one unit of work: all of them or none.
    ///
    /// Cards are locked in ascending tag order so two overlapping batches
    /// cannot deadlock each other.
    pub async fn release_tags(&self, tag_ids: &[TagId], portal: &Portal) -> Result<Vec<Release>> {
        let mut ordered: Vec<&TagId> = tag_ids.iter().collect();
        ordered.sort();
        ordered.dedup();

        let mut uow = self.store.begin().await?;
        let result: Result<Vec<Release>> = async {
            let mut releases = Vec::with_capacity(ordered.len());
            for tag_id in ordered {
                releases.push(release_in(uow.as_mut(), tag_id, portal).await?);
            }
            Ok(releases)
        }
        .await;
        let releases = finish(uow, result).await?;

        info!(count = releases.len(), portal = %portal, "Tags released in batch");
        Ok(releases)
    }

    // ── Lookups ──

    pub async fn card(&self, tag_id: &TagId) -> Result<Option<Card>> {
        Ok(self.store.card(tag_id).await?)
    }

    /// Membership currently holding the tag, if any.
    pub async fn holder_of(&self, tag_id: &TagId) -> Result<Option<Membership>> {
        Ok(self.store.memberships_for_tag(tag_id).await?.into_iter().next())
    }

    pub async fn members_of(&self, registration_id: RegistrationId) -> Result<Vec<Membership>> {
        Ok(self
            .store
            .memberships_for_registration(registration_id)
            .await?)
    }
}

/// Commit on success, roll back on failure. A failed rollback is logged and
/// the operation error returned; the backend discards the work either way.
async fn finish<T>(uow: Box<dyn UnitOfWork>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = uow.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after {}", e);
            }
            Err(e)
        }
    }
}

async fn assign_in(uow: &mut dyn UnitOfWork, cmd: &AssignTag) -> Result<Assignment> {
    let locked = lock_or_create(uow, &cmd.tag_id, &cmd.portal).await?;
    if locked.card.is_assigned() {
        return Err(TagError::AlreadyAssigned {
            tag_id: cmd.tag_id.clone(),
        });
    }

    uow.lock_registration(cmd.registration_id, &cmd.portal)
        .await?
        .ok_or_else(|| TagError::RegistrationNotFound {
            registration_id: cmd.registration_id,
            portal: cmd.portal.clone(),
        })?;

    uow.insert_membership(&Membership {
        registration_id: cmd.registration_id,
        tag_id: cmd.tag_id.clone(),
        portal: cmd.portal.clone(),
        role: cmd.role,
    })
    .await?;
    uow.update_card(&Card {
        tag_id: cmd.tag_id.clone(),
        status: CardStatus::Assigned,
        portal: cmd.portal.clone(),
    })
    .await?;

    Ok(Assignment {
        tag_id: cmd.tag_id.clone(),
        registration_id: cmd.registration_id,
        role: cmd.role,
    })
}

async fn release_in(uow: &mut dyn UnitOfWork, tag_id: &TagId, portal: &Portal) -> Result<Release> {
    let locked = lock_or_create(uow, tag_id, portal).await?;
    let memberships_removed = uow.delete_memberships(tag_id).await?;
    uow.update_card(&Card {
        status: CardStatus::Available,
        ..locked.card
    })
    .await?;

    Ok(Release {
        tag_id: tag_id.clone(),
        memberships_removed,
    })
}
