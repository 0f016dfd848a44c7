//! Card registry access shared by every operation that touches a card.

use tracing::debug;

use crate::error::StoreError;
use crate::store::{Result, UnitOfWork};
use crate::types::{Card, Portal, TagId};

/// A card row locked inside a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedCard {
    pub card: Card,
    /// This unit inserted the row.
    pub created: bool,
}

/// Lock the card for `tag_id`, creating it as `available` on first sighting.
///
/// The lock is held until the unit of work ends. When two units race to
/// create the same tag only one insert lands; the other sees the conflict as
/// "not inserted" and picks the row up through the second locking select.
pub async fn lock_or_create(
    uow: &mut dyn UnitOfWork,
    tag_id: &TagId,
    portal: &Portal,
) -> Result<LockedCard> {
    if let Some(card) = uow.lock_card(tag_id).await? {
        return Ok(LockedCard {
            card,
            created: false,
        });
    }

    let created = uow
        .insert_card_if_absent(&Card::available(tag_id.clone(), portal.clone()))
        .await?;
    if created {
        debug!(tag_id = %tag_id, portal = %portal, "Card registered on first sighting");
    }

    let card = uow
        .lock_card(tag_id)
        .await?
        .ok_or_else(|| StoreError::Corrupt(format!("card {} vanished after insert", tag_id)))?;
    Ok(LockedCard { card, created })
}
