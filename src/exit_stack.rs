//! Exit stack: exit taps staged per registration, released as one batch.
//!
//! When a group leaves, each member taps out. Instead of releasing cards one
//! by one, taps are collected under the registration that holds them and an
//! operator releases the whole group at once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::{AssignmentEngine, Result};
use crate::types::{Portal, RegistrationId, Release, TagId};

/// Result of staging one exit tap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackPush {
    pub registration_id: RegistrationId,
    pub tag_id: TagId,
    pub stack_size: usize,
    /// The tag was already staged; nothing changed.
    pub already_in_stack: bool,
}

/// Staged tags for one registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExit {
    pub registration_id: RegistrationId,
    pub cards: Vec<TagId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackStats {
    pub teams: usize,
    pub cards: usize,
}

/// Outcome of releasing one registration's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRelease {
    pub registration_id: RegistrationId,
    pub releases: Vec<Release>,
}

/// In-memory stack of exit taps keyed by registration.
pub struct ExitStack {
    engine: AssignmentEngine,
    stacks: Mutex<BTreeMap<RegistrationId, BTreeSet<TagId>>>,
}

impl ExitStack {
    pub fn new(engine: AssignmentEngine) -> Self {
        Self {
            engine,
            stacks: Mutex::new(BTreeMap::new()),
        }
    }

    fn stacks(&self) -> MutexGuard<'_, BTreeMap<RegistrationId, BTreeSet<TagId>>> {
        self.stacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stage an exit tap under the registration currently holding the tag.
    /// Returns `None` when no registration holds it.
    pub async fn record_exit(&self, tag_id: &TagId) -> Result<Option<StackPush>> {
        let Some(holder) = self.engine.holder_of(tag_id).await? else {
            debug!(tag_id = %tag_id, "Exit tap for unassigned tag ignored");
            return Ok(None);
        };
        Ok(Some(self.push(holder.registration_id, tag_id.clone())))
    }

    /// Stage a tag under an explicit registration.
    pub fn push(&self, registration_id: RegistrationId, tag_id: TagId) -> StackPush {
        let mut stacks = self.stacks();
        let stack = stacks.entry(registration_id).or_default();
        let already_in_stack = !stack.insert(tag_id.clone());
        StackPush {
            registration_id,
            tag_id,
            stack_size: stack.len(),
            already_in_stack,
        }
    }

    /// Every non-empty stack, ordered by registration.
    pub fn pending(&self) -> Vec<PendingExit> {
        self.stacks()
            .iter()
            .filter(|(_, cards)| !cards.is_empty())
            .map(|(id, cards)| PendingExit {
                registration_id: *id,
                cards: cards.iter().cloned().collect(),
            })
            .collect()
    }

    pub fn stats(&self) -> StackStats {
        let stacks = self.stacks();
        StackStats {
            teams: stacks.values().filter(|cards| !cards.is_empty()).count(),
            cards: stacks.values().map(BTreeSet::len).sum(),
        }
    }

    /// Release every staged tag of the registration in one unit of work.
    ///
    /// The stack is trimmed only after the release commits; on failure it is
    /// left as it was so the operator can retry.
    pub async fn release_all(
        &self,
        registration_id: RegistrationId,
        portal: &Portal,
    ) -> Result<BatchRelease> {
        let staged: Vec<TagId> = self
            .stacks()
            .get(&registration_id)
            .map(|cards| cards.iter().cloned().collect())
            .unwrap_or_default();

        if staged.is_empty() {
            return Ok(BatchRelease {
                registration_id,
                releases: Vec::new(),
            });
        }

        let releases = self.engine.release_tags(&staged, portal).await?;

        {
            let mut stacks = self.stacks();
            if let Some(cards) = stacks.get_mut(&registration_id) {
                for tag_id in &staged {
                    cards.remove(tag_id);
                }
                if cards.is_empty() {
                    stacks.remove(&registration_id);
                }
            }
        }

        info!(
            registration_id = %registration_id,
            released = releases.len(),
            "Exit stack released"
        );
        Ok(BatchRelease {
            registration_id,
            releases,
        })
    }

    /// Drop every staged tap without releasing anything. Returns what was
    /// staged.
    pub fn clear(&self) -> StackStats {
        let stats = self.stats();
        self.stacks().clear();
        info!(teams = stats.teams, cards = stats.cards, "Exit stack cleared");
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::request::AssignTag;
    use crate::store::{MemoryEventLog, MemoryTagStore};
    use crate::types::{CardStatus, MemberRole, Registration};

    fn setup() -> (ExitStack, AssignmentEngine) {
        let store = MemoryTagStore::new();
        store.insert_registration(Registration {
            id: RegistrationId::new(7).unwrap(),
            portal: Portal::new("portal1").unwrap(),
            group_size: 2,
        });
        let engine = AssignmentEngine::new(Arc::new(store), Arc::new(MemoryEventLog::new()));
        (ExitStack::new(engine.clone()), engine)
    }

    async fn assign(engine: &AssignmentEngine, tag: &str) {
        engine
            .assign_tag(&AssignTag::new(
                TagId::new(tag).unwrap(),
                RegistrationId::new(7).unwrap(),
                Portal::new("portal1").unwrap(),
                MemberRole::Member,
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exit_taps_are_grouped_by_holder() {
        let (stack, engine) = setup();
        assign(&engine, "A1").await;
        assign(&engine, "B2").await;

        let first = stack.record_exit(&TagId::new("A1").unwrap()).await.unwrap().unwrap();
        assert_eq!(first.stack_size, 1);
        let dup = stack.record_exit(&TagId::new("A1").unwrap()).await.unwrap().unwrap();
        assert!(dup.already_in_stack);
        stack.record_exit(&TagId::new("B2").unwrap()).await.unwrap();

        assert!(stack
            .record_exit(&TagId::new("ZZ").unwrap())
            .await
            .unwrap()
            .is_none());
        assert_eq!(stack.stats(), StackStats { teams: 1, cards: 2 });
        assert_eq!(stack.pending()[0].cards.len(), 2);
    }

    #[tokio::test]
    async fn release_all_frees_cards_and_empties_stack() {
        let (stack, engine) = setup();
        assign(&engine, "A1").await;
        assign(&engine, "B2").await;
        stack.record_exit(&TagId::new("A1").unwrap()).await.unwrap();
        stack.record_exit(&TagId::new("B2").unwrap()).await.unwrap();

        let batch = stack
            .release_all(RegistrationId::new(7).unwrap(), &Portal::new("portal1").unwrap())
            .await
            .unwrap();
        assert_eq!(batch.releases.len(), 2);
        assert_eq!(stack.stats(), StackStats::default());

        let card = engine.card(&TagId::new("B2").unwrap()).await.unwrap().unwrap();
        assert_eq!(card.status, CardStatus::Available);
    }

    #[tokio::test]
    async fn release_of_empty_stack_is_a_no_op() {
        let (stack, _engine) = setup();
        let batch = stack
            .release_all(RegistrationId::new(9).unwrap(), &Portal::new("portal1").unwrap())
            .await
            .unwrap();
        assert!(batch.releases.is_empty());
    }

    #[test]
    fn clear_reports_previous_contents() {
        let (stack, _engine) = setup();
        stack.push(RegistrationId::new(3).unwrap(), TagId::new("A1").unwrap());
        stack.push(RegistrationId::new(4).unwrap(), TagId::new("B2").unwrap());
        assert_eq!(stack.clear(), StackStats { teams: 2, cards: 2 });
        assert!(stack.pending().is_empty());
    }
}
