//! Domain types for tags, cards, memberships and the tap log
//!
//! Identifiers are newtypes so a tag id can never be passed where a portal is
//! expected. Constructors validate; anything that reaches the engine as one of
//! these types has already passed the input checks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Longest tag id accepted from a reader or UI.
pub const MAX_TAG_ID_LEN: usize = 64;

/// Longest portal name accepted.
pub const MAX_PORTAL_LEN: usize = 64;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Stable id of a physical RFID credential.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagId(String);

impl TagId {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = raw.as_ref().trim();
        if value.is_empty() {
            return Err(ValidationError::Missing { field: "tag_id" });
        }
        if value.len() > MAX_TAG_ID_LEN {
            return Err(ValidationError::TooLong {
                field: "tag_id",
                max: MAX_TAG_ID_LEN,
            });
        }
        if value.chars().any(|c| !c.is_ascii_graphic()) {
            return Err(ValidationError::Malformed {
                field: "tag_id",
                reason: "must be printable ASCII without whitespace".to_string(),
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TagId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TagId> for String {
    fn from(value: TagId) -> Self {
        value.0
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Named entry or registration point where taps happen (e.g. `portal1`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Portal(String);

impl Portal {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, ValidationError> {
        let value = raw.as_ref().trim();
        if value.is_empty() {
            return Err(ValidationError::Missing { field: "portal" });
        }
        if value.len() > MAX_PORTAL_LEN {
            return Err(ValidationError::TooLong {
                field: "portal",
                max: MAX_PORTAL_LEN,
            });
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Portal {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Portal> for String {
    fn from(value: Portal) -> Self {
        value.0
    }
}

impl fmt::Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key of a registration (individual or group leader).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub struct RegistrationId(i64);

impl RegistrationId {
    pub fn new(raw: i64) -> Result<Self, ValidationError> {
        if raw < 1 {
            return Err(ValidationError::OutOfRange {
                field: "registration_id",
                value: raw,
                min: 1,
            });
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for RegistrationId {
    type Error = ValidationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RegistrationId> for i64 {
    fn from(value: RegistrationId) -> Self {
        value.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// CARD REGISTRY
// =============================================================================

/// Current assignment status of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Available,
    Assigned,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Available => "available",
            CardStatus::Assigned => "assigned",
        }
    }

    /// Parse a stored status. `released` was written by an older exit path
    /// and means the same thing as `available`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "available" | "released" => Some(CardStatus::Available),
            "assigned" => Some(CardStatus::Assigned),
            _ => None,
        }
    }
}

impl fmt::Display for CardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materialized record of a tag's assignment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub tag_id: TagId,
    pub status: CardStatus,
    pub portal: Portal,
}

impl Card {
    /// A card as it is born on first sighting.
    pub fn available(tag_id: TagId, portal: Portal) -> Self {
        Self {
            tag_id,
            status: CardStatus::Available,
            portal,
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.status == CardStatus::Assigned
    }
}

// =============================================================================
// MEMBERSHIP / REGISTRATION
// =============================================================================

/// Role a tag plays within its registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Leader,
    #[default]
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Leader => "LEADER",
            MemberRole::Member => "MEMBER",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LEADER" => Some(MemberRole::Leader),
            "MEMBER" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

/// Link between a tag and the registration currently holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub registration_id: RegistrationId,
    pub tag_id: TagId,
    pub portal: Portal,
    pub role: MemberRole,
}

/// A registered individual or group. Owned by the registration flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationId,
    pub portal: Portal,
    pub group_size: i32,
}

// =============================================================================
// TAP LOG
// =============================================================================

/// Label attached to a tap by the reader that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogLabel {
    Register,
    ExitOut,
    Exit,
    /// Cluster or game taps the core does not interpret.
    Other(String),
}

impl LogLabel {
    pub fn as_str(&self) -> &str {
        match self {
            LogLabel::Register => "REGISTER",
            LogLabel::ExitOut => "EXITOUT",
            LogLabel::Exit => "EXIT",
            LogLabel::Other(label) => label,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "REGISTER" => LogLabel::Register,
            "EXITOUT" => LogLabel::ExitOut,
            "EXIT" => LogLabel::Exit,
            other => LogLabel::Other(other.to_string()),
        }
    }

    /// Labels that mean the holder has left the venue.
    pub fn exit_labels() -> [LogLabel; 2] {
        [LogLabel::ExitOut, LogLabel::Exit]
    }
}

impl From<String> for LogLabel {
    fn from(raw: String) -> Self {
        LogLabel::parse(&raw)
    }
}

impl From<LogLabel> for String {
    fn from(label: LogLabel) -> Self {
        label.as_str().to_string()
    }
}

/// One physical tap as recorded by the hardware path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub time: DateTime<Utc>,
    pub tag_id: TagId,
    pub portal: Portal,
    pub label: LogLabel,
}

// =============================================================================
// RESULTS
// =============================================================================

/// Outcome of a successful assign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub tag_id: TagId,
    pub registration_id: RegistrationId,
    pub role: MemberRole,
}

/// Outcome of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub tag_id: TagId,
    /// Membership rows removed; zero when the tag was already available.
    pub memberships_removed: u64,
}
