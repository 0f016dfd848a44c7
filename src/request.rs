//! Request bodies and their validated commands
//!
//! Collaborators hand the engine loosely-typed bodies (JSON from a UI, fields
//! from a reader). Each body is checked here, before a transaction opens, and
//! turned into a command built from the validated newtypes.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{MemberRole, Portal, RegistrationId, TagId};

/// Body of an assign request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignTagRequest {
    #[serde(default)]
    pub tag_id: String,
    #[serde(default)]
    pub registration_id: i64,
    #[serde(default)]
    pub portal: String,
    #[serde(default)]
    pub role: MemberRole,
}

/// Validated assign command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignTag {
    pub tag_id: TagId,
    pub registration_id: RegistrationId,
    pub portal: Portal,
    pub role: MemberRole,
}

impl AssignTagRequest {
    pub fn validate(&self) -> Result<AssignTag, ValidationError> {
        Ok(AssignTag {
            tag_id: TagId::new(&self.tag_id)?,
            registration_id: RegistrationId::new(self.registration_id)?,
            portal: Portal::new(&self.portal)?,
            role: self.role,
        })
    }
}

impl AssignTag {
    pub fn new(
        tag_id: TagId,
        registration_id: RegistrationId,
        portal: Portal,
        role: MemberRole,
    ) -> Self {
        Self {
            tag_id,
            registration_id,
            portal,
            role,
        }
    }
}

/// Body of a release request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseTagRequest {
    #[serde(default)]
    pub tag_id: String,
    #[serde(default)]
    pub portal: String,
}

/// Validated release command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseTag {
    pub tag_id: TagId,
    pub portal: Portal,
}

impl ReleaseTagRequest {
    pub fn validate(&self) -> Result<ReleaseTag, ValidationError> {
        Ok(ReleaseTag {
            tag_id: TagId::new(&self.tag_id)?,
            portal: Portal::new(&self.portal)?,
        })
    }
}

/// Body of a "link the card just tapped at this portal" request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkLastTapRequest {
    #[serde(default)]
    pub portal: String,
    #[serde(default)]
    pub registration_id: i64,
    #[serde(default)]
    pub role: MemberRole,
}

/// Validated link command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLastTap {
    pub portal: Portal,
    pub registration_id: RegistrationId,
    pub role: MemberRole,
}

impl LinkLastTapRequest {
    pub fn validate(&self) -> Result<LinkLastTap, ValidationError> {
        Ok(LinkLastTap {
            portal: Portal::new(&self.portal)?,
            registration_id: RegistrationId::new(self.registration_id)?,
            role: self.role,
        })
    }
}
