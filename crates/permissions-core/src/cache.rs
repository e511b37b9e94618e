use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::principal::PrincipalId;
use crate::record::MembershipRecord;

/// Read-side mirror of one principal table. Mutations go through the engine.
#[derive(Debug)]
pub struct PrincipalCache<I: PrincipalId> {
    records: RwLock<HashMap<I, MembershipRecord>>,
}

impl<I: PrincipalId> Default for PrincipalCache<I> {
    fn default() -> Self {
        Self { records: RwLock::new(HashMap::new()) }
    }
}

impl<I: PrincipalId> PrincipalCache<I> {
    #[must_use]
    pub fn exists(&self, id: I) -> bool {
        self.records.read().contains_key(&id)
    }

    #[must_use]
    pub fn record(&self, id: I) -> Option<MembershipRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Empty for unknown principals.
    #[must_use]
    pub fn effective_groups(&self, id: I, now: i64) -> BTreeSet<String> {
        self.records
            .read()
            .get(&id)
            .map(|record| record.effective_groups(now))
            .unwrap_or_default()
    }

    /// Principals whose effective set contains `group` at `now`, sorted by id.
    #[must_use]
    pub fn list_members(&self, group: &str, now: i64) -> Vec<I> {
        let mut members = self
            .records
            .read()
            .iter()
            .filter(|(_, record)| record.is_effective_member(group, now))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        members.sort_unstable();
        members
    }

    /// Principals referencing `group` permanently or through any timed entry.
    #[must_use]
    pub fn referencing(&self, group: &str) -> Vec<I> {
        let mut ids = self
            .records
            .read()
            .iter()
            .filter(|(_, record)| record.references(group))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub(crate) fn put(&self, id: I, record: MembershipRecord) {
        self.records.write().insert(id, record);
    }

    pub(crate) fn replace_all(&self, records: HashMap<I, MembershipRecord>) {
        *self.records.write() = records;
    }
}
