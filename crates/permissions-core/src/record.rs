use std::collections::BTreeSet;

use serde::Serialize;

/// A bounded-time group membership, timestamps in epoch seconds.
///
/// `delay_until == 0` means active immediately.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct TimedEntry {
    pub group: String,
    pub delay_until: i64,
    pub expire_at: i64,
}

impl TimedEntry {
    #[must_use]
    pub fn is_active_at(&self, now: i64) -> bool {
        self.delay_until <= now && now < self.expire_at
    }
}

/// Membership state of one principal: permanent groups plus timed entries.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct MembershipRecord {
    permanent: Vec<String>,
    timed: Vec<TimedEntry>,
}

impl MembershipRecord {
    /// Build a record, collapsing duplicates. A repeated permanent group keeps
    /// its first position; a repeated timed group keeps its last entry.
    #[must_use]
    pub fn new(permanent: Vec<String>, timed: Vec<TimedEntry>) -> Self {
        let mut deduped_permanent: Vec<String> = Vec::with_capacity(permanent.len());
        for group in permanent {
            if !deduped_permanent.contains(&group) {
                deduped_permanent.push(group);
            }
        }

        let mut deduped_timed: Vec<TimedEntry> = Vec::with_capacity(timed.len());
        for entry in timed {
            deduped_timed.retain(|existing| existing.group != entry.group);
            deduped_timed.push(entry);
        }

        Self { permanent: deduped_permanent, timed: deduped_timed }
    }

    #[must_use]
    pub fn permanent(&self) -> &[String] {
        &self.permanent
    }

    #[must_use]
    pub fn timed(&self) -> &[TimedEntry] {
        &self.timed
    }

    #[must_use]
    pub fn is_permanent_member(&self, group: &str) -> bool {
        self.permanent.iter().any(|name| name == group)
    }

    #[must_use]
    pub fn timed_entry(&self, group: &str) -> Option<&TimedEntry> {
        self.timed.iter().find(|entry| entry.group == group)
    }

    /// True when the group appears anywhere in the record, active or not.
    #[must_use]
    pub fn references(&self, group: &str) -> bool {
        self.is_permanent_member(group) || self.timed_entry(group).is_some()
    }

    /// Permanent groups plus timed groups active at `now`. Expired entries are
    /// filtered, never pruned.
    #[must_use]
    pub fn effective_groups(&self, now: i64) -> BTreeSet<String> {
        self.permanent
            .iter()
            .cloned()
            .chain(
                self.timed
                    .iter()
                    .filter(|entry| entry.is_active_at(now))
                    .map(|entry| entry.group.clone()),
            )
            .collect()
    }

    #[must_use]
    pub fn is_effective_member(&self, group: &str, now: i64) -> bool {
        self.is_permanent_member(group)
            || self.timed_entry(group).is_some_and(|entry| entry.is_active_at(now))
    }

    #[must_use]
    pub fn with_permanent_added(&self, group: &str) -> Self {
        let mut next = self.clone();
        if !next.is_permanent_member(group) {
            next.permanent.push(group.to_string());
        }
        next
    }

    #[must_use]
    pub fn without_permanent(&self, group: &str) -> Self {
        let mut next = self.clone();
        next.permanent.retain(|name| name != group);
        next
    }

    /// Replace any entry for the same group; the new entry goes last.
    #[must_use]
    pub fn with_timed(&self, entry: TimedEntry) -> Self {
        let mut next = self.clone();
        next.timed.retain(|existing| existing.group != entry.group);
        next.timed.push(entry);
        next
    }

    #[must_use]
    pub fn without_timed(&self, group: &str) -> Self {
        let mut next = self.clone();
        next.timed.retain(|entry| entry.group != group);
        next
    }
}
