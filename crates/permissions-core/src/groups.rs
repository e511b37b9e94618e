use std::collections::HashMap;

use parking_lot::RwLock;

pub const DEFAULT_GROUP: &str = "Default";
pub const ADMINS_GROUP: &str = "Admins";
/// Seeded on `Admins`. Opaque to this crate.
pub const WILDCARD_PERMISSION: &str = "*";

/// In-memory mirror of the groups table: name to ordered permission tokens.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Vec<String>>>,
}

impl GroupRegistry {
    #[must_use]
    pub fn exists(&self, group: &str) -> bool {
        self.groups.read().contains_key(group)
    }

    /// Permission tokens of a group; empty when the group is unknown.
    #[must_use]
    pub fn permissions_of(&self, group: &str) -> Vec<String> {
        self.groups.read().get(group).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn has_permission(&self, group: &str, permission: &str) -> bool {
        self.groups
            .read()
            .get(group)
            .is_some_and(|tokens| tokens.iter().any(|token| token == permission))
    }

    #[must_use]
    pub fn list_all(&self) -> Vec<String> {
        let mut names = self.groups.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }

    pub(crate) fn put(&self, group: &str, permissions: Vec<String>) {
        self.groups.write().insert(group.to_string(), permissions);
    }

    pub(crate) fn remove(&self, group: &str) {
        self.groups.write().remove(group);
    }

    pub(crate) fn replace_all(&self, groups: HashMap<String, Vec<String>>) {
        *self.groups.write() = groups;
    }
}
