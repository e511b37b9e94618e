use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::StoreError;
use crate::store::{PrincipalKind, Query, Row, ScalarQuery, Statement, Store, Value};

#[derive(Debug, Default)]
struct Tables {
    players: BTreeMap<i64, (String, Option<String>)>,
    tribes: BTreeMap<i64, (String, Option<String>)>,
    groups: BTreeMap<String, String>,
    legacy_players: bool,
    legacy_tribes: bool,
}

impl Tables {
    fn principals(&mut self, kind: PrincipalKind) -> &mut BTreeMap<i64, (String, Option<String>)> {
        match kind {
            PrincipalKind::Player => &mut self.players,
            PrincipalKind::Tribe => &mut self.tribes,
        }
    }

    fn legacy(&mut self, kind: PrincipalKind) -> &mut bool {
        match kind {
            PrincipalKind::Player => &mut self.legacy_players,
            PrincipalKind::Tribe => &mut self.legacy_tribes,
        }
    }
}

/// Map-backed store with switchable write failures.
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: Mutex<bool>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    pub(crate) fn write_count(&self) -> usize {
        *self.writes.lock()
    }

    pub(crate) fn without_timed_columns() -> Self {
        let store = Self::default();
        {
            let mut tables = store.tables.lock();
            tables.legacy_players = true;
            tables.legacy_tribes = true;
        }
        store
    }

    pub(crate) fn insert_raw(&self, kind: PrincipalKind, id: i64, permanent: &str, timed: Option<&str>) {
        self.tables
            .lock()
            .principals(kind)
            .insert(id, (permanent.to_string(), timed.map(str::to_string)));
    }

    pub(crate) fn insert_raw_group(&self, name: &str, permissions: &str) {
        self.tables.lock().groups.insert(name.to_string(), permissions.to_string());
    }

    pub(crate) fn principal(&self, kind: PrincipalKind, id: i64) -> Option<(String, String)> {
        self.tables
            .lock()
            .principals(kind)
            .get(&id)
            .map(|(permanent, timed)| (permanent.clone(), timed.clone().unwrap_or_default()))
    }

    pub(crate) fn group(&self, name: &str) -> Option<String> {
        self.tables.lock().groups.get(name).cloned()
    }

    fn update_principal(
        tables: &mut Tables,
        kind: PrincipalKind,
        id: i64,
        apply: impl FnOnce(&mut (String, Option<String>)),
    ) -> Result<(), StoreError> {
        let row = tables
            .principals(kind)
            .get_mut(&id)
            .ok_or_else(|| StoreError::RowMissing(format!("{kind} {id}")))?;
        apply(row);
        Ok(())
    }
}

impl Store for MemoryStore {
    fn execute(&self, statement: &Statement) -> Result<(), StoreError> {
        if *self.fail_writes.lock() {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        *self.writes.lock() += 1;

        let mut tables = self.tables.lock();
        match statement {
            Statement::InsertPrincipal { kind, id, groups } => {
                let timed = if *tables.legacy(*kind) { None } else { Some(String::new()) };
                let rows = tables.principals(*kind);
                if rows.contains_key(id) {
                    return Err(StoreError::Backend(format!("duplicate {kind} {id}")));
                }
                rows.insert(*id, (groups.clone(), timed));
                Ok(())
            }
            Statement::AppendPermanentGroup { kind, id, encoded } => {
                Self::update_principal(&mut tables, *kind, *id, |row| row.0.push_str(encoded))
            }
            Statement::SetPermanentGroups { kind, id, encoded } => {
                Self::update_principal(&mut tables, *kind, *id, |row| row.0.clone_from(encoded))
            }
            Statement::SetTimedGroups { kind, id, encoded } => {
                Self::update_principal(&mut tables, *kind, *id, |row| row.1 = Some(encoded.clone()))
            }
            Statement::InsertGroup { name } => {
                if tables.groups.contains_key(name) {
                    return Err(StoreError::Backend(format!("duplicate group {name}")));
                }
                tables.groups.insert(name.clone(), String::new());
                Ok(())
            }
            Statement::SeedGroup { name, permissions } => {
                tables.groups.entry(name.clone()).or_insert_with(|| permissions.clone());
                Ok(())
            }
            Statement::DeleteGroup { name } => tables
                .groups
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StoreError::RowMissing(format!("group {name}"))),
            Statement::AppendPermission { group, encoded } => tables
                .groups
                .get_mut(group)
                .map(|permissions| permissions.push_str(encoded))
                .ok_or_else(|| StoreError::RowMissing(format!("group {group}"))),
            Statement::SetPermissions { group, encoded } => tables
                .groups
                .get_mut(group)
                .map(|permissions| permissions.clone_from(encoded))
                .ok_or_else(|| StoreError::RowMissing(format!("group {group}"))),
            Statement::AddTimedColumn(kind) => {
                *tables.legacy(*kind) = false;
                for row in tables.principals(*kind).values_mut() {
                    row.1.get_or_insert_with(String::new);
                }
                Ok(())
            }
        }
    }

    fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        let mut tables = self.tables.lock();
        let rows = match query {
            Query::Groups => tables
                .groups
                .iter()
                .map(|(name, permissions)| {
                    Row(vec![Value::Text(name.clone()), Value::Text(permissions.clone())])
                })
                .collect(),
            Query::Principals(kind) => tables
                .principals(*kind)
                .iter()
                .map(|(id, (permanent, timed))| {
                    Row(vec![
                        Value::Integer(*id),
                        Value::Text(permanent.clone()),
                        timed.clone().map_or(Value::Null, Value::Text),
                    ])
                })
                .collect(),
        };
        Ok(rows)
    }

    fn query_scalar(&self, query: &ScalarQuery) -> Result<Option<Value>, StoreError> {
        let ScalarQuery::HasTimedColumn(kind) = query;
        let legacy = *self.tables.lock().legacy(*kind);
        Ok(Some(Value::Integer(i64::from(!legacy))))
    }
}
