use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::SanctionEntry;

/// Authoritative in-memory state of one identity.
///
/// Fields are grouped by the schema version that introduced them. Fields added
/// after version 1 fall back to their `Default` when a snapshot predates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    // v1
    pub balance: i64,
    pub experience: u64,
    pub capabilities: BTreeSet<String>,
    pub sanctions: Vec<SanctionEntry>,

    // v2
    pub permissions: BTreeSet<String>,
    pub statistics: BTreeMap<String, i64>,

    // v3
    pub feature_levels: BTreeMap<String, u32>,
    pub feature_flags: BTreeMap<String, bool>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl EntityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_balance(&mut self, delta: i64) -> i64 {
        self.balance = self.balance.saturating_add(delta);
        self.balance
    }

    pub fn add_experience(&mut self, amount: u64) -> u64 {
        self.experience = self.experience.saturating_add(amount);
        self.experience
    }

    /// Returns `true` if the capability was newly granted.
    pub fn grant(&mut self, capability: impl Into<String>) -> bool {
        self.capabilities.insert(capability.into())
    }

    /// Returns `true` if the capability was held.
    pub fn revoke(&mut self, capability: &str) -> bool {
        self.capabilities.remove(capability)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn increment_statistic(&mut self, name: &str, delta: i64) -> i64 {
        let slot = self.statistics.entry(name.to_string()).or_insert(0);
        *slot = slot.saturating_add(delta);
        *slot
    }

    pub fn feature_level(&self, feature: &str) -> u32 {
        self.feature_levels.get(feature).copied().unwrap_or(0)
    }

    pub fn feature_enabled(&self, feature: &str) -> bool {
        self.feature_flags.get(feature).copied().unwrap_or(false)
    }

    pub fn record_sanction(&mut self, entry: SanctionEntry) {
        self.sanctions.push(entry);
    }

    pub fn active_sanctions_at(&self, now: DateTime<Utc>) -> impl Iterator<Item = &SanctionEntry> {
        self.sanctions.iter().filter(move |entry| entry.is_active_at(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SanctionKind;
    use chrono::Duration;

    #[test]
    fn test_balance_saturates() {
        let mut record = EntityRecord::new();
        record.balance = i64::MAX - 1;
        assert_eq!(record.add_balance(10), i64::MAX);
        record.balance = i64::MIN + 1;
        assert_eq!(record.add_balance(-10), i64::MIN);
    }

    #[test]
    fn test_capability_grant_and_revoke() {
        let mut record = EntityRecord::new();
        assert!(record.grant("fly"));
        assert!(!record.grant("fly"));
        assert!(record.has_capability("fly"));
        assert!(record.revoke("fly"));
        assert!(!record.revoke("fly"));
    }

    #[test]
    fn test_feature_defaults() {
        let mut record = EntityRecord::new();
        assert_eq!(record.feature_level("mining"), 0);
        assert!(!record.feature_enabled("pvp"));
        record.feature_levels.insert("mining".to_string(), 4);
        record.feature_flags.insert("pvp".to_string(), true);
        assert_eq!(record.feature_level("mining"), 4);
        assert!(record.feature_enabled("pvp"));
    }

    #[test]
    fn test_active_sanctions() {
        let now = Utc::now();
        let mut record = EntityRecord::new();
        record.record_sanction(
            SanctionEntry::new(SanctionKind::Mute, "spam", "mod", now - Duration::hours(2))
                .until(now - Duration::hours(1)),
        );
        record.record_sanction(SanctionEntry::new(SanctionKind::Ban, "grief", "admin", now));
        let active = record.active_sanctions_at(now).collect::<Vec<_>>();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, SanctionKind::Ban);
    }

    #[test]
    fn test_statistics_increment() {
        let mut record = EntityRecord::new();
        assert_eq!(record.increment_statistic("kills", 2), 2);
        assert_eq!(record.increment_statistic("kills", 3), 5);
    }
}
