use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{Result, StateError};

/// Globally unique identifier of one tracked identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(Uuid);

impl EntityId {
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Random identifier, mostly useful in tests and tooling.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable identifier derived from an external name (e.g. an offline account name).
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EntityId {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|err| StateError::ExecutionError(format!("invalid entity id '{}': {}", s, err)))
    }
}

impl From<Uuid> for EntityId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Kind of a sanction history entry. Tags are part of the snapshot format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SanctionKind {
    Warning,
    Mute,
    Kick,
    Ban,
}

impl SanctionKind {
    pub fn tag(self) -> u8 {
        match self {
            SanctionKind::Warning => 1,
            SanctionKind::Mute => 2,
            SanctionKind::Kick => 3,
            SanctionKind::Ban => 4,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SanctionKind::Warning),
            2 => Some(SanctionKind::Mute),
            3 => Some(SanctionKind::Kick),
            4 => Some(SanctionKind::Ban),
            _ => None,
        }
    }
}

/// One entry of an identity's sanction history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionEntry {
    pub kind: SanctionKind,
    pub reason: String,
    pub issuer: String,
    pub started_at: DateTime<Utc>,
    /// `None` means the sanction never expires.
    pub ends_at: Option<DateTime<Utc>>,
}

impl SanctionEntry {
    pub fn new(
        kind: SanctionKind,
        reason: impl Into<String>,
        issuer: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            reason: reason.into(),
            issuer: issuer.into(),
            started_at,
            ends_at: None,
        }
    }

    pub fn until(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        if now < self.started_at {
            return false;
        }
        match self.ends_at {
            Some(end) => now < end,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_entity_id_display_round_trip() {
        let id = EntityId::new_random();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_entity_id_from_name_is_stable() {
        assert_eq!(EntityId::from_name("steve"), EntityId::from_name("steve"));
        assert_ne!(EntityId::from_name("steve"), EntityId::from_name("alex"));
    }

    #[test]
    fn test_invalid_entity_id_rejected() {
        assert!("not-a-uuid".parse::<EntityId>().is_err());
    }

    #[test]
    fn test_sanction_kind_tags() {
        for kind in [
            SanctionKind::Warning,
            SanctionKind::Mute,
            SanctionKind::Kick,
            SanctionKind::Ban,
        ] {
            assert_eq!(SanctionKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SanctionKind::from_tag(0), None);
        assert_eq!(SanctionKind::from_tag(99), None);
    }

    #[test]
    fn test_sanction_activity_window() {
        let start = Utc::now();
        let temp = SanctionEntry::new(SanctionKind::Mute, "spam", "mod", start)
            .until(start + Duration::minutes(10));
        assert!(!temp.is_active_at(start - Duration::seconds(1)));
        assert!(temp.is_active_at(start + Duration::minutes(5)));
        assert!(!temp.is_active_at(start + Duration::minutes(10)));

        let permanent = SanctionEntry::new(SanctionKind::Ban, "cheating", "admin", start);
        assert!(permanent.is_active_at(start + Duration::days(3650)));
    }
}
