//! Write-through synchronization between the caches and a [`Store`].
//!
//! Every mutation validates against the cache, writes durably, and only then
//! commits to the cache. A failed write leaves the cache untouched.
//!
//! Locking: principal mutations hold the group gate shared plus the stripe
//! of their principal for the whole validate/write/commit sequence. Group
//! mutations, bootstrap and reload hold the gate exclusively. Reads only take
//! the short cache locks and never wait on durable I/O.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::PrincipalCache;
use crate::clock::{Clock, SystemClock};
use crate::codec::{decode_list, decode_timed, encode_list, encode_timed};
use crate::error::{PermissionError, StoreError};
use crate::groups::{GroupRegistry, ADMINS_GROUP, DEFAULT_GROUP, WILDCARD_PERMISSION};
use crate::principal::{PrincipalId, SteamId, TribeId};
use crate::record::{MembershipRecord, TimedEntry};
use crate::store::{PrincipalKind, Query, ScalarQuery, Statement, Store, Value};

const LOCK_STRIPES: usize = 64;

#[derive(Debug)]
struct StripedLocks {
    stripes: [Mutex<()>; LOCK_STRIPES],
}

impl StripedLocks {
    fn new() -> Self {
        Self { stripes: std::array::from_fn(|_| Mutex::new(())) }
    }

    fn lock<K: Hash>(&self, key: &K) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = hasher.finish() % LOCK_STRIPES as u64;
        self.stripes[usize::try_from(index).unwrap_or(0)].lock()
    }
}

/// A stored row that did not load cleanly.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct DecodeSkipped {
    pub table: String,
    pub key: String,
    pub reason: String,
    /// The row was loaded with an empty timed sequence instead of dropped.
    pub loaded_without_timed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct BootstrapReport {
    pub groups: usize,
    pub players: usize,
    pub tribes: usize,
    pub schema_upgraded: Vec<PrincipalKind>,
    pub skipped: Vec<DecodeSkipped>,
}

pub struct PermissionEngine<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
    groups: GroupRegistry,
    players: PrincipalCache<SteamId>,
    tribes: PrincipalCache<TribeId>,
    player_locks: StripedLocks,
    tribe_locks: StripedLocks,
    group_gate: RwLock<()>,
}

impl<S: Store> PermissionEngine<S> {
    /// Engine over `store` with empty caches. Call [`Self::bootstrap`] before
    /// serving.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            groups: GroupRegistry::default(),
            players: PrincipalCache::default(),
            tribes: PrincipalCache::default(),
            player_locks: StripedLocks::new(),
            tribe_locks: StripedLocks::new(),
            group_gate: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    #[must_use]
    pub fn players(&self) -> Principals<'_, S, SteamId> {
        Principals { engine: self, cache: &self.players, locks: &self.player_locks }
    }

    #[must_use]
    pub fn tribes(&self) -> Principals<'_, S, TribeId> {
        Principals { engine: self, cache: &self.tribes, locks: &self.tribe_locks }
    }

    #[must_use]
    pub fn groups(&self) -> Groups<'_, S> {
        Groups { engine: self }
    }

    /// Upgrade the schema, seed the built-in groups and load every cache.
    ///
    /// # Errors
    /// Returns [`PermissionError::Store`] when the schema check, upgrade, seed
    /// or any full scan fails. Individual bad rows are reported, not fatal.
    pub fn bootstrap(&self) -> Result<BootstrapReport, PermissionError> {
        let _gate = self.group_gate.write();

        let mut upgraded = Vec::new();
        for kind in [PrincipalKind::Player, PrincipalKind::Tribe] {
            let present = self.store.query_scalar(&ScalarQuery::HasTimedColumn(kind))?;
            if !matches!(present, Some(Value::Integer(flag)) if flag != 0) {
                self.store.execute(&Statement::AddTimedColumn(kind))?;
                info!(kind = %kind, "added timed membership column");
                upgraded.push(kind);
            }
        }

        self.store.execute(&Statement::SeedGroup {
            name: ADMINS_GROUP.to_string(),
            permissions: encode_list(&[WILDCARD_PERMISSION]),
        })?;
        self.store.execute(&Statement::SeedGroup {
            name: DEFAULT_GROUP.to_string(),
            permissions: String::new(),
        })?;

        let mut report = self.load_locked()?;
        report.schema_upgraded = upgraded;
        Ok(report)
    }

    /// Re-read all durable state and swap the caches.
    ///
    /// # Errors
    /// Returns [`PermissionError::Store`] when a full scan fails; the caches
    /// keep their previous contents in that case.
    pub fn reload(&self) -> Result<BootstrapReport, PermissionError> {
        let _gate = self.group_gate.write();
        self.load_locked()
    }

    fn load_locked(&self) -> Result<BootstrapReport, PermissionError> {
        let mut skipped = Vec::new();
        let groups = self.load_groups(&mut skipped)?;
        let players = self.load_principals::<SteamId>(&mut skipped)?;
        let tribes = self.load_principals::<TribeId>(&mut skipped)?;

        let report = BootstrapReport {
            groups: groups.len(),
            players: players.len(),
            tribes: tribes.len(),
            schema_upgraded: Vec::new(),
            skipped,
        };

        self.groups.replace_all(groups);
        self.players.replace_all(players);
        self.tribes.replace_all(tribes);

        info!(
            groups = report.groups,
            players = report.players,
            tribes = report.tribes,
            skipped = report.skipped.len(),
            "permission caches loaded"
        );
        Ok(report)
    }

    fn load_groups(
        &self,
        skipped: &mut Vec<DecodeSkipped>,
    ) -> Result<HashMap<String, Vec<String>>, StoreError> {
        let mut groups = HashMap::new();
        for (index, row) in self.store.query(&Query::Groups)?.into_iter().enumerate() {
            let loaded = row.text(0).and_then(|name| row.text(1).map(|permissions| (name, permissions)));
            match loaded {
                Ok((name, permissions)) if !name.is_empty() => {
                    groups.insert(name.to_string(), decode_list(permissions));
                }
                Ok(_) => {
                    let reason = "empty group name".to_string();
                    record_skip(skipped, "group", format!("row {index}"), reason, false);
                }
                Err(err) => {
                    record_skip(skipped, "group", format!("row {index}"), err.to_string(), false);
                }
            }
        }
        Ok(groups)
    }

    fn load_principals<I: PrincipalId>(
        &self,
        skipped: &mut Vec<DecodeSkipped>,
    ) -> Result<HashMap<I, MembershipRecord>, StoreError> {
        let table = I::KIND.as_str();
        let mut records = HashMap::new();
        for (index, row) in self.store.query(&Query::Principals(I::KIND))?.into_iter().enumerate() {
            let raw_id = match row.integer(0) {
                Ok(raw_id) => raw_id,
                Err(err) => {
                    record_skip(skipped, table, format!("row {index}"), err.to_string(), false);
                    continue;
                }
            };
            let Some(id) = I::from_store(raw_id) else {
                record_skip(
                    skipped,
                    table,
                    raw_id.to_string(),
                    format!("id {raw_id} is out of range"),
                    false,
                );
                continue;
            };
            let permanent = match row.text(1) {
                Ok(encoded) => decode_list(encoded),
                Err(err) => {
                    record_skip(skipped, table, raw_id.to_string(), err.to_string(), false);
                    continue;
                }
            };
            let timed = match row.text(2).map_err(|err| err.to_string()).and_then(|encoded| {
                decode_timed(encoded).map_err(|err| err.to_string())
            }) {
                Ok(timed) => timed,
                Err(reason) => {
                    record_skip(skipped, table, raw_id.to_string(), reason, true);
                    Vec::new()
                }
            };
            records.insert(id, MembershipRecord::new(permanent, timed));
        }
        Ok(records)
    }

    fn write(&self, statement: &Statement) -> Result<(), PermissionError> {
        self.store.execute(statement).map_err(|err| {
            error!(?statement, error = %err, "durable write failed");
            PermissionError::Store(err)
        })
    }
}

fn record_skip(
    skipped: &mut Vec<DecodeSkipped>,
    table: &str,
    key: String,
    reason: String,
    loaded_without_timed: bool,
) {
    warn!(table, key = %key, reason = %reason, loaded_without_timed, "stored row did not decode");
    skipped.push(DecodeSkipped { table: table.to_string(), key, reason, loaded_without_timed });
}

fn validate_name(name: &str) -> Result<(), PermissionError> {
    if name.is_empty() || name.contains(',') {
        return Err(PermissionError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Reads and mutations for one principal kind.
pub struct Principals<'a, S: Store, I: PrincipalId> {
    engine: &'a PermissionEngine<S>,
    cache: &'a PrincipalCache<I>,
    locks: &'a StripedLocks,
}

impl<S: Store, I: PrincipalId> Principals<'_, S, I> {
    #[must_use]
    pub fn exists(&self, id: I) -> bool {
        self.cache.exists(id)
    }

    #[must_use]
    pub fn record(&self, id: I) -> Option<MembershipRecord> {
        self.cache.record(id)
    }

    #[must_use]
    pub fn effective_groups(&self, id: I, now: i64) -> BTreeSet<String> {
        self.cache.effective_groups(id, now)
    }

    #[must_use]
    pub fn current_groups(&self, id: I) -> BTreeSet<String> {
        self.cache.effective_groups(id, self.engine.now())
    }

    /// Union of the permission tokens of every effective group. Tokens are
    /// returned verbatim; a group missing from the registry adds nothing.
    #[must_use]
    pub fn permissions(&self, id: I, now: i64) -> BTreeSet<String> {
        self.cache
            .effective_groups(id, now)
            .iter()
            .flat_map(|group| self.engine.groups.permissions_of(group))
            .collect()
    }

    #[must_use]
    pub fn is_member(&self, id: I, group: &str, now: i64) -> bool {
        self.cache.record(id).is_some_and(|record| record.is_effective_member(group, now))
    }

    #[must_use]
    pub fn list_members(&self, group: &str) -> Vec<I> {
        self.cache.list_members(group, self.engine.now())
    }

    #[must_use]
    pub fn list_members_at(&self, group: &str, now: i64) -> Vec<I> {
        self.cache.list_members(group, now)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Durably insert a principal with its default membership.
    ///
    /// # Errors
    /// Returns [`PermissionError::Store`] when the insert fails, including
    /// when the principal already exists durably.
    pub fn add_principal(&self, id: I) -> Result<(), PermissionError> {
        let _gate = self.engine.group_gate.read();
        let _stripe = self.locks.lock(&id);
        self.insert_locked(id)?;
        Ok(())
    }

    /// Add a permanent membership, creating the principal if needed.
    ///
    /// # Errors
    /// `GroupMissing`, `AlreadyMember` (permanent only), or `Store`.
    pub fn add_to_group(&self, id: I, group: &str) -> Result<(), PermissionError> {
        let _gate = self.engine.group_gate.read();
        let _stripe = self.locks.lock(&id);

        if !self.engine.groups.exists(group) {
            return Err(PermissionError::GroupMissing(group.to_string()));
        }
        let record = self.ensure_principal_locked(id)?;
        if record.is_permanent_member(group) {
            return Err(Self::already_member(id, group));
        }

        self.engine.write(&Statement::AppendPermanentGroup {
            kind: I::KIND,
            id: id.to_store()?,
            encoded: encode_list(&[group]),
        })?;
        self.cache.put(id, record.with_permanent_added(group));
        debug!(kind = %I::KIND, id = %id, group, "permanent membership added");
        Ok(())
    }

    /// # Errors
    /// `PrincipalNotFound`, `GroupMissing`, `NotMember`, or `Store`.
    pub fn remove_from_group(&self, id: I, group: &str) -> Result<(), PermissionError> {
        let _gate = self.engine.group_gate.read();
        let _stripe = self.locks.lock(&id);

        let record = self.existing_record(id, group)?;
        if !record.is_permanent_member(group) {
            return Err(Self::not_member(id, group));
        }
        self.remove_permanent_locked(id, &record, group)
    }

    /// Grant a timed membership, replacing any existing timed entry for the
    /// same group. The window is `[now + delay_secs, now + duration_secs)`;
    /// a non-positive delay makes it active immediately.
    ///
    /// # Errors
    /// `GroupMissing`, `AlreadyMember` when the membership is permanent, or
    /// `Store`.
    pub fn add_to_timed_group(
        &self,
        id: I,
        group: &str,
        duration_secs: i64,
        delay_secs: i64,
    ) -> Result<(), PermissionError> {
        let _gate = self.engine.group_gate.read();
        let _stripe = self.locks.lock(&id);

        if !self.engine.groups.exists(group) {
            return Err(PermissionError::GroupMissing(group.to_string()));
        }
        let record = self.ensure_principal_locked(id)?;
        if record.is_permanent_member(group) {
            return Err(Self::already_member(id, group));
        }

        let now = self.engine.now();
        let entry = TimedEntry {
            group: group.to_string(),
            delay_until: if delay_secs > 0 { now.saturating_add(delay_secs) } else { 0 },
            expire_at: now.saturating_add(duration_secs),
        };
        let next = record.with_timed(entry);

        self.engine.write(&Statement::SetTimedGroups {
            kind: I::KIND,
            id: id.to_store()?,
            encoded: encode_timed(next.timed()),
        })?;
        self.cache.put(id, next);
        debug!(kind = %I::KIND, id = %id, group, duration_secs, delay_secs, "timed membership set");
        Ok(())
    }

    /// # Errors
    /// `PrincipalNotFound`, `GroupMissing`, `NotMember` when no timed entry
    /// exists for the group, or `Store`.
    pub fn remove_from_timed_group(&self, id: I, group: &str) -> Result<(), PermissionError> {
        let _gate = self.engine.group_gate.read();
        let _stripe = self.locks.lock(&id);

        let record = self.existing_record(id, group)?;
        if record.timed_entry(group).is_none() {
            return Err(Self::not_member(id, group));
        }
        self.remove_timed_locked(id, &record, group)
    }

    /// Drop every reference to `group` from one principal. Caller holds the
    /// gate exclusively.
    fn purge_group(&self, id: I, group: &str) -> Result<(), PermissionError> {
        let _stripe = self.locks.lock(&id);
        let Some(mut record) = self.cache.record(id) else {
            return Ok(());
        };
        if record.is_permanent_member(group) {
            self.remove_permanent_locked(id, &record, group)?;
            record = record.without_permanent(group);
        }
        if record.timed_entry(group).is_some() {
            self.remove_timed_locked(id, &record, group)?;
        }
        Ok(())
    }

    fn remove_permanent_locked(
        &self,
        id: I,
        record: &MembershipRecord,
        group: &str,
    ) -> Result<(), PermissionError> {
        let next = record.without_permanent(group);
        self.engine.write(&Statement::SetPermanentGroups {
            kind: I::KIND,
            id: id.to_store()?,
            encoded: encode_list(next.permanent()),
        })?;
        self.cache.put(id, next);
        debug!(kind = %I::KIND, id = %id, group, "permanent membership removed");
        Ok(())
    }

    fn remove_timed_locked(
        &self,
        id: I,
        record: &MembershipRecord,
        group: &str,
    ) -> Result<(), PermissionError> {
        let next = record.without_timed(group);
        self.engine.write(&Statement::SetTimedGroups {
            kind: I::KIND,
            id: id.to_store()?,
            encoded: encode_timed(next.timed()),
        })?;
        self.cache.put(id, next);
        debug!(kind = %I::KIND, id = %id, group, "timed membership removed");
        Ok(())
    }

    fn existing_record(&self, id: I, group: &str) -> Result<MembershipRecord, PermissionError> {
        let record = self.cache.record(id).ok_or_else(|| PermissionError::PrincipalNotFound {
            kind: I::KIND,
            id: id.to_string(),
        })?;
        if !self.engine.groups.exists(group) {
            return Err(PermissionError::GroupMissing(group.to_string()));
        }
        Ok(record)
    }

    fn ensure_principal_locked(&self, id: I) -> Result<MembershipRecord, PermissionError> {
        match self.cache.record(id) {
            Some(record) => Ok(record),
            None => self.insert_locked(id),
        }
    }

    fn insert_locked(&self, id: I) -> Result<MembershipRecord, PermissionError> {
        let defaults = I::default_groups();
        self.engine.write(&Statement::InsertPrincipal {
            kind: I::KIND,
            id: id.to_store()?,
            groups: encode_list(&defaults),
        })?;
        let record = MembershipRecord::new(defaults, Vec::new());
        self.cache.put(id, record.clone());
        debug!(kind = %I::KIND, id = %id, "principal created");
        Ok(record)
    }

    fn already_member(id: I, group: &str) -> PermissionError {
        PermissionError::AlreadyMember { kind: I::KIND, id: id.to_string(), group: group.to_string() }
    }

    fn not_member(id: I, group: &str) -> PermissionError {
        PermissionError::NotMember { kind: I::KIND, id: id.to_string(), group: group.to_string() }
    }
}

/// Group registry reads and mutations.
pub struct Groups<'a, S: Store> {
    engine: &'a PermissionEngine<S>,
}

impl<S: Store> Groups<'_, S> {
    #[must_use]
    pub fn exists(&self, group: &str) -> bool {
        self.engine.groups.exists(group)
    }

    #[must_use]
    pub fn list_all(&self) -> Vec<String> {
        self.engine.groups.list_all()
    }

    #[must_use]
    pub fn permissions_of(&self, group: &str) -> Vec<String> {
        self.engine.groups.permissions_of(group)
    }

    #[must_use]
    pub fn has_permission(&self, group: &str, permission: &str) -> bool {
        self.engine.groups.has_permission(group, permission)
    }

    /// # Errors
    /// `InvalidName`, `AlreadyExists`, or `Store`.
    pub fn create(&self, group: &str) -> Result<(), PermissionError> {
        validate_name(group)?;
        let _gate = self.engine.group_gate.write();
        if self.engine.groups.exists(group) {
            return Err(PermissionError::AlreadyExists(group.to_string()));
        }
        self.engine.write(&Statement::InsertGroup { name: group.to_string() })?;
        self.engine.groups.put(group, Vec::new());
        info!(group, "group created");
        Ok(())
    }

    /// Remove every player and tribe membership of `group`, then the group
    /// itself. Returns how many principals were purged.
    ///
    /// The cascade is not transactional: the first failed write stops it and
    /// the group row stays in place with the memberships removed so far gone.
    ///
    /// `Default` and `Admins` are refused before any I/O.
    ///
    /// # Errors
    /// `BuiltinGroup`, `GroupMissing`, or `Store` from the first failed write.
    pub fn delete(&self, group: &str) -> Result<usize, PermissionError> {
        if group == DEFAULT_GROUP || group == ADMINS_GROUP {
            return Err(PermissionError::BuiltinGroup(group.to_string()));
        }
        let _gate = self.engine.group_gate.write();
        if !self.engine.groups.exists(group) {
            return Err(PermissionError::GroupMissing(group.to_string()));
        }

        let mut purged = 0;
        let players = self.engine.players();
        for id in self.engine.players.referencing(group) {
            players.purge_group(id, group).inspect_err(|err| {
                warn!(group, player = %id, error = %err, "group delete cascade aborted");
            })?;
            purged += 1;
        }
        let tribes = self.engine.tribes();
        for id in self.engine.tribes.referencing(group) {
            tribes.purge_group(id, group).inspect_err(|err| {
                warn!(group, tribe = %id, error = %err, "group delete cascade aborted");
            })?;
            purged += 1;
        }

        self.engine.write(&Statement::DeleteGroup { name: group.to_string() })?;
        self.engine.groups.remove(group);
        info!(group, purged, "group deleted");
        Ok(purged)
    }

    /// # Errors
    /// `InvalidName`, `GroupMissing`, `AlreadyGranted`, or `Store`.
    pub fn grant(&self, group: &str, permission: &str) -> Result<(), PermissionError> {
        validate_name(permission)?;
        let _gate = self.engine.group_gate.write();
        if !self.engine.groups.exists(group) {
            return Err(PermissionError::GroupMissing(group.to_string()));
        }
        if self.engine.groups.has_permission(group, permission) {
            return Err(PermissionError::AlreadyGranted {
                group: group.to_string(),
                permission: permission.to_string(),
            });
        }

        self.engine.write(&Statement::AppendPermission {
            group: group.to_string(),
            encoded: encode_list(&[permission]),
        })?;
        let mut permissions = self.engine.groups.permissions_of(group);
        permissions.push(permission.to_string());
        self.engine.groups.put(group, permissions);
        debug!(group, permission, "permission granted");
        Ok(())
    }

    /// # Errors
    /// `GroupMissing`, `NotGranted`, or `Store`.
    pub fn revoke(&self, group: &str, permission: &str) -> Result<(), PermissionError> {
        let _gate = self.engine.group_gate.write();
        if !self.engine.groups.exists(group) {
            return Err(PermissionError::GroupMissing(group.to_string()));
        }
        if !self.engine.groups.has_permission(group, permission) {
            return Err(PermissionError::NotGranted {
                group: group.to_string(),
                permission: permission.to_string(),
            });
        }

        let mut permissions = self.engine.groups.permissions_of(group);
        permissions.retain(|token| token != permission);
        self.engine.write(&Statement::SetPermissions {
            group: group.to_string(),
            encoded: encode_list(&permissions),
        })?;
        self.engine.groups.put(group, permissions);
        debug!(group, permission, "permission revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use anyhow::{anyhow, Result};

    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::MemoryStore;

    fn engine_at(now: i64) -> Result<(PermissionEngine<Arc<MemoryStore>>, Arc<ManualClock>)> {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(now));
        let engine = PermissionEngine::with_clock(store, clock.clone());
        engine.bootstrap()?;
        Ok((engine, clock))
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| (*name).to_string()).collect()
    }

    // Test IDs: ENG-001
    #[test]
    fn bootstrap_seeds_builtin_groups() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        assert_eq!(engine.groups().list_all(), vec!["Admins", "Default"]);
        assert_eq!(engine.groups().permissions_of(ADMINS_GROUP), vec!["*"]);
        assert_eq!(engine.store().group(ADMINS_GROUP).as_deref(), Some("*,"));
        assert_eq!(engine.store().group(DEFAULT_GROUP).as_deref(), Some(""));
        Ok(())
    }

    // Test IDs: ENG-002
    #[test]
    fn effective_set_tracks_clock_for_delayed_grant() -> Result<()> {
        let (engine, clock) = engine_at(0)?;
        engine.groups().create("Vip")?;
        engine.players().add_to_timed_group(SteamId(1), "Vip", 20, 10)?;

        let players = engine.players();
        assert_eq!(players.effective_groups(SteamId(1), 5), set(&["Default"]));
        assert_eq!(players.effective_groups(SteamId(1), 15), set(&["Default", "Vip"]));
        assert_eq!(players.effective_groups(SteamId(1), 25), set(&["Default"]));

        clock.set(15);
        assert_eq!(players.current_groups(SteamId(1)), set(&["Default", "Vip"]));
        assert_eq!(players.list_members("Vip"), vec![SteamId(1)]);
        Ok(())
    }

    // Test IDs: ENG-003
    #[test]
    fn delayed_grant_shorter_than_delay_never_activates() -> Result<()> {
        let (engine, _) = engine_at(100)?;
        engine.groups().create("Vip")?;
        engine.tribes().add_to_timed_group(TribeId(4), "Vip", 30, 60)?;

        let Some(record) = engine.tribes().record(TribeId(4)) else {
            return Err(anyhow!("tribe should have been created"));
        };
        assert_eq!(
            record.timed_entry("Vip"),
            Some(&TimedEntry { group: "Vip".to_string(), delay_until: 160, expire_at: 130 })
        );
        for now in [100, 130, 160, 200] {
            assert!(!engine.tribes().is_member(TribeId(4), "Vip", now));
        }
        Ok(())
    }

    // Test IDs: ENG-004
    #[test]
    fn re_adding_permanent_membership_is_rejected() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("A")?;
        engine.players().add_to_group(SteamId(7), "A")?;

        match engine.players().add_to_group(SteamId(7), "A") {
            Err(PermissionError::AlreadyMember { group, .. }) => assert_eq!(group, "A"),
            other => panic!("expected AlreadyMember, got {other:?}"),
        }
        let Some(record) = engine.players().record(SteamId(7)) else {
            return Err(anyhow!("player missing"));
        };
        assert_eq!(record.permanent(), ["Default".to_string(), "A".to_string()]);
        assert_eq!(engine.store().principal(PrincipalKind::Player, 7), Some(("Default,A,".to_string(), String::new())));
        Ok(())
    }

    // Test IDs: ENG-005
    #[test]
    fn timed_grant_supersedes_previous_entry() -> Result<()> {
        let (engine, _) = engine_at(1_000)?;
        engine.groups().create("Vip")?;
        engine.players().add_to_timed_group(SteamId(2), "Vip", 100, 0)?;
        engine.players().add_to_timed_group(SteamId(2), "Vip", 50, 0)?;

        let Some(record) = engine.players().record(SteamId(2)) else {
            return Err(anyhow!("player missing"));
        };
        assert_eq!(
            record.timed(),
            [TimedEntry { group: "Vip".to_string(), delay_until: 0, expire_at: 1_050 }]
        );
        assert_eq!(
            engine.store().principal(PrincipalKind::Player, 2),
            Some(("Default,".to_string(), "0;1050;Vip,".to_string()))
        );
        Ok(())
    }

    // Test IDs: ENG-006
    #[test]
    fn timed_grant_is_rejected_for_permanent_members() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        let result = engine.players().add_to_timed_group(SteamId(3), DEFAULT_GROUP, 60, 0);
        assert!(matches!(result, Err(PermissionError::AlreadyMember { .. })));
        assert!(engine.players().exists(SteamId(3)));
        Ok(())
    }

    // Test IDs: ENG-007
    #[test]
    fn deleting_group_cascades_to_every_reference() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("G")?;
        engine.players().add_to_group(SteamId(1), "G")?;
        engine.players().add_to_timed_group(SteamId(2), "G", 60, 0)?;
        engine.tribes().add_to_group(TribeId(3), "G")?;

        assert_eq!(engine.groups().delete("G")?, 3);

        assert!(!engine.groups().exists("G"));
        assert!(engine.store().group("G").is_none());
        for id in [SteamId(1), SteamId(2)] {
            let Some(record) = engine.players().record(id) else {
                return Err(anyhow!("player {id} missing"));
            };
            assert!(!record.references("G"));
        }
        assert_eq!(
            engine.store().principal(PrincipalKind::Player, 2),
            Some(("Default,".to_string(), String::new()))
        );
        assert_eq!(
            engine.store().principal(PrincipalKind::Tribe, 3),
            Some((String::new(), String::new()))
        );
        Ok(())
    }

    // Test IDs: ENG-008
    #[test]
    fn failed_cascade_keeps_group_row() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("G")?;
        engine.players().add_to_group(SteamId(1), "G")?;

        engine.store().set_fail_writes(true);
        assert!(matches!(engine.groups().delete("G"), Err(PermissionError::Store(_))));
        engine.store().set_fail_writes(false);

        assert!(engine.groups().exists("G"));
        assert!(engine.players().is_member(SteamId(1), "G", 0));
        Ok(())
    }

    // Test IDs: ENG-009
    #[test]
    fn failed_write_leaves_cache_untouched() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("A")?;
        engine.players().add_principal(SteamId(5))?;
        let before = engine.players().record(SteamId(5));

        engine.store().set_fail_writes(true);
        assert!(matches!(engine.players().add_to_group(SteamId(5), "A"), Err(PermissionError::Store(_))));
        assert!(matches!(
            engine.players().add_to_timed_group(SteamId(5), "A", 10, 0),
            Err(PermissionError::Store(_))
        ));
        assert!(matches!(engine.players().add_to_group(SteamId(6), "A"), Err(PermissionError::Store(_))));
        assert!(matches!(engine.groups().grant("A", "kit.use"), Err(PermissionError::Store(_))));

        assert_eq!(engine.players().record(SteamId(5)), before);
        assert!(!engine.players().exists(SteamId(6)));
        assert!(engine.groups().permissions_of("A").is_empty());
        Ok(())
    }

    // Test IDs: ENG-018
    #[test]
    fn builtin_groups_cannot_be_deleted() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.players().add_principal(SteamId(1))?;
        let writes = engine.store().write_count();

        for builtin in [DEFAULT_GROUP, ADMINS_GROUP] {
            match engine.groups().delete(builtin) {
                Err(PermissionError::BuiltinGroup(name)) => assert_eq!(name, builtin),
                other => panic!("expected BuiltinGroup for {builtin}, got {other:?}"),
            }
            assert!(engine.groups().exists(builtin));
            assert!(engine.store().group(builtin).is_some());
        }
        assert_eq!(engine.store().write_count(), writes);

        engine.players().remove_from_group(SteamId(1), DEFAULT_GROUP)?;
        assert!(engine.players().effective_groups(SteamId(1), 0).is_empty());
        Ok(())
    }

    // Test IDs: ENG-019
    #[test]
    fn failed_replace_writes_leave_cache_untouched() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("Vip")?;
        engine.groups().create("Empty")?;
        engine.groups().grant("Vip", "kit.vip")?;
        engine.players().add_to_group(SteamId(1), "Vip")?;
        engine.tribes().add_to_timed_group(TribeId(2), "Vip", 60, 0)?;
        let player = engine.players().record(SteamId(1));
        let tribe = engine.tribes().record(TribeId(2));

        engine.store().set_fail_writes(true);
        assert!(matches!(
            engine.players().remove_from_group(SteamId(1), "Vip"),
            Err(PermissionError::Store(_))
        ));
        assert!(matches!(
            engine.tribes().remove_from_timed_group(TribeId(2), "Vip"),
            Err(PermissionError::Store(_))
        ));
        assert!(matches!(engine.groups().revoke("Vip", "kit.vip"), Err(PermissionError::Store(_))));
        assert!(matches!(engine.groups().create("Fresh"), Err(PermissionError::Store(_))));
        assert!(matches!(engine.groups().delete("Empty"), Err(PermissionError::Store(_))));
        engine.store().set_fail_writes(false);

        assert_eq!(engine.players().record(SteamId(1)), player);
        assert_eq!(engine.tribes().record(TribeId(2)), tribe);
        assert_eq!(engine.groups().permissions_of("Vip"), vec!["kit.vip"]);
        assert!(engine.groups().has_permission("Vip", "kit.vip"));
        assert!(!engine.groups().exists("Fresh"));
        assert!(engine.groups().exists("Empty"));
        assert_eq!(engine.groups().list_all(), vec!["Admins", "Default", "Empty", "Vip"]);
        Ok(())
    }

    // Test IDs: ENG-010
    #[test]
    fn preconditions_fail_before_any_write() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        let writes = engine.store().write_count();

        assert!(matches!(
            engine.players().add_to_group(SteamId(9), "Ghost"),
            Err(PermissionError::GroupMissing(_))
        ));
        assert!(matches!(
            engine.tribes().remove_from_group(TribeId(9), DEFAULT_GROUP),
            Err(PermissionError::PrincipalNotFound { .. })
        ));
        assert!(matches!(engine.groups().create("Default"), Err(PermissionError::AlreadyExists(_))));
        assert!(matches!(engine.groups().create("a,b"), Err(PermissionError::InvalidName(_))));
        assert!(matches!(engine.groups().revoke(ADMINS_GROUP, "kit"), Err(PermissionError::NotGranted { .. })));
        assert!(matches!(
            engine.groups().grant(ADMINS_GROUP, WILDCARD_PERMISSION),
            Err(PermissionError::AlreadyGranted { .. })
        ));

        assert_eq!(engine.store().write_count(), writes);
        assert!(!engine.players().exists(SteamId(9)));
        Ok(())
    }

    // Test IDs: ENG-011
    #[test]
    fn removals_report_non_membership() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("Vip")?;
        engine.players().add_to_timed_group(SteamId(1), "Vip", 60, 0)?;

        assert!(matches!(
            engine.players().remove_from_group(SteamId(1), "Vip"),
            Err(PermissionError::NotMember { .. })
        ));
        assert!(matches!(
            engine.players().remove_from_timed_group(SteamId(1), DEFAULT_GROUP),
            Err(PermissionError::NotMember { .. })
        ));

        engine.players().remove_from_timed_group(SteamId(1), "Vip")?;
        engine.players().remove_from_group(SteamId(1), DEFAULT_GROUP)?;
        assert_eq!(
            engine.store().principal(PrincipalKind::Player, 1),
            Some((String::new(), String::new()))
        );
        Ok(())
    }

    // Test IDs: ENG-012
    #[test]
    fn permissions_are_the_union_of_effective_groups() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("Vip")?;
        engine.groups().grant("Vip", "kit.vip")?;
        engine.groups().grant(DEFAULT_GROUP, "kit.starter")?;
        engine.groups().grant("Vip", "kit.starter")?;
        engine.players().add_to_timed_group(SteamId(1), "Vip", 10, 0)?;

        assert_eq!(engine.players().permissions(SteamId(1), 5), set(&["kit.starter", "kit.vip"]));
        assert_eq!(engine.players().permissions(SteamId(1), 10), set(&["kit.starter"]));

        engine.groups().revoke("Vip", "kit.vip")?;
        assert_eq!(engine.store().group("Vip").as_deref(), Some("kit.starter,"));
        Ok(())
    }

    // Test IDs: ENG-013
    #[test]
    fn bootstrap_survives_undecodable_timed_field() -> Result<()> {
        let store = Arc::new(MemoryStore::default());
        store.insert_raw_group("Vip", "kit,");
        store.insert_raw(PrincipalKind::Player, 1, "Default,", Some("garbage"));
        store.insert_raw(PrincipalKind::Player, 2, "Default,Vip,", Some("0;99;Vip,"));
        store.insert_raw(PrincipalKind::Player, -5, "Default,", None);

        let engine = PermissionEngine::with_clock(store, Arc::new(ManualClock::new(0)));
        let report = engine.bootstrap()?;

        assert_eq!(report.players, 2);
        assert_eq!(report.groups, 3);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().any(|skip| skip.key == "1" && skip.loaded_without_timed));
        assert!(report.skipped.iter().any(|skip| skip.key == "-5" && !skip.loaded_without_timed));

        let Some(record) = engine.players().record(SteamId(1)) else {
            return Err(anyhow!("player with bad timed field should load"));
        };
        assert!(record.timed().is_empty());
        assert_eq!(engine.players().effective_groups(SteamId(2), 0), set(&["Default", "Vip"]));
        Ok(())
    }

    // Test IDs: ENG-014
    #[test]
    fn bootstrap_adds_missing_timed_columns() -> Result<()> {
        let store = Arc::new(MemoryStore::without_timed_columns());
        store.insert_raw(PrincipalKind::Tribe, 8, "Default,", None);
        let engine = PermissionEngine::new(store);

        let report = engine.bootstrap()?;
        assert_eq!(report.schema_upgraded, vec![PrincipalKind::Player, PrincipalKind::Tribe]);
        assert_eq!(
            engine.store().principal(PrincipalKind::Tribe, 8),
            Some(("Default,".to_string(), String::new()))
        );
        assert!(engine.bootstrap()?.schema_upgraded.is_empty());
        Ok(())
    }

    // Test IDs: ENG-015
    #[test]
    fn add_principal_rejects_durable_duplicates() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.tribes().add_principal(TribeId(1))?;
        assert!(engine.tribes().record(TribeId(1)).is_some_and(|record| record.permanent().is_empty()));
        assert!(matches!(engine.tribes().add_principal(TribeId(1)), Err(PermissionError::Store(_))));

        assert!(matches!(
            engine.players().add_principal(SteamId(u64::MAX)),
            Err(PermissionError::Store(StoreError::InvalidId(_)))
        ));
        Ok(())
    }

    // Test IDs: ENG-016
    #[test]
    fn reload_matches_committed_state() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        engine.groups().create("Vip")?;
        engine.players().add_to_group(SteamId(1), "Vip")?;
        engine.tribes().add_to_timed_group(TribeId(2), "Vip", 30, 0)?;
        let player = engine.players().record(SteamId(1));
        let tribe = engine.tribes().record(TribeId(2));

        let report = engine.reload()?;
        assert_eq!((report.groups, report.players, report.tribes), (3, 1, 1));
        assert_eq!(engine.players().record(SteamId(1)), player);
        assert_eq!(engine.tribes().record(TribeId(2)), tribe);
        Ok(())
    }

    // Test IDs: ENG-017
    #[test]
    fn concurrent_mutations_keep_cache_and_store_identical() -> Result<()> {
        let (engine, _) = engine_at(0)?;
        let names = (0..8).map(|index| format!("G{index}")).collect::<Vec<_>>();
        for name in &names {
            engine.groups().create(name)?;
        }

        thread::scope(|scope| {
            for worker in 0..4 {
                let engine = &engine;
                let names = &names;
                scope.spawn(move || {
                    for round in 0..50 {
                        let group = &names[(worker + round) % names.len()];
                        let _ = engine.players().add_to_group(SteamId(1), group);
                        let _ = engine.players().add_to_timed_group(SteamId(1), group, 100, 0);
                        if round % 3 == 0 {
                            let _ = engine.players().remove_from_group(SteamId(1), group);
                        }
                    }
                });
            }
        });

        let Some(record) = engine.players().record(SteamId(1)) else {
            return Err(anyhow!("player missing after concurrent adds"));
        };
        let Some((permanent, timed)) = engine.store().principal(PrincipalKind::Player, 1) else {
            return Err(anyhow!("player row missing"));
        };
        assert_eq!(encode_list(record.permanent()), permanent);
        assert_eq!(encode_timed(record.timed()), timed);

        engine.reload()?;
        assert_eq!(engine.players().record(SteamId(1)), Some(record));
        Ok(())
    }
}
