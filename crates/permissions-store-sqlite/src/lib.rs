pub mod config;

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use permissions_core::{
    PrincipalKind, Query, Row, ScalarQuery, Statement, Store, StoreError, Value,
};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use config::{ConfigError, PermissionsConfig};

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

const PERMANENT_COLUMN: &str = "PermissionGroups";
const TIMED_COLUMN: &str = "TimedPermissionGroups";

/// Physical table names. Each must be a plain SQL identifier.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TableNames {
    pub players: String,
    pub tribes: String,
    pub groups: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            players: "Players".to_string(),
            tribes: "Tribes".to_string(),
            groups: "PermissionGroups".to_string(),
        }
    }
}

impl TableNames {
    /// # Errors
    /// Returns an error naming the first table name that is not an identifier.
    pub fn validate(&self) -> Result<()> {
        for (role, name) in
            [("players", &self.players), ("tribes", &self.tribes), ("groups", &self.groups)]
        {
            if !is_identifier(name) {
                return Err(anyhow!("invalid {role} table name `{name}`"));
            }
        }
        if self.players == self.tribes
            || self.players == self.groups
            || self.tribes == self.groups
        {
            return Err(anyhow!("players, tribes and groups tables must be distinct"));
        }
        Ok(())
    }

    fn principals(&self, kind: PrincipalKind) -> &str {
        match kind {
            PrincipalKind::Player => &self.players,
            PrincipalKind::Tribe => &self.tribes,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

const fn id_column(kind: PrincipalKind) -> &'static str {
    match kind {
        PrincipalKind::Player => "SteamId",
        PrincipalKind::Tribe => "TribeId",
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    tables: TableNames,
}

impl SqliteStore {
    /// Open a `SQLite`-backed permissions store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the table names are invalid, the database cannot
    /// be opened, or pragmas cannot be applied.
    pub fn open(path: &Path, tables: TableNames) -> Result<Self> {
        Self::open_with_timeout(path, tables, DEFAULT_BUSY_TIMEOUT)
    }

    /// # Errors
    /// Same as [`Self::open`].
    pub fn open_with_timeout(path: &Path, tables: TableNames, busy_timeout: Duration) -> Result<Self> {
        tables.validate()?;
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::configure(conn, tables, busy_timeout)
    }

    /// # Errors
    /// Returns an error when the table names are invalid or the connection
    /// cannot be configured.
    pub fn open_in_memory(tables: TableNames) -> Result<Self> {
        tables.validate()?;
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::configure(conn, tables, DEFAULT_BUSY_TIMEOUT)
    }

    fn configure(conn: Connection, tables: TableNames, busy_timeout: Duration) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout).context("failed to set sqlite busy timeout")?;
        Ok(Self { conn: Mutex::new(conn), tables })
    }

    #[must_use]
    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    /// Create any missing table. Existing tables are left as they are; the
    /// engine bootstrap upgrades older layouts and seeds built-in groups.
    ///
    /// # Errors
    /// Returns an error when the DDL fails.
    pub fn initialize(&self) -> Result<()> {
        let TableNames { players, tribes, groups } = &self.tables;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {players} (
               Id INTEGER PRIMARY KEY AUTOINCREMENT,
               SteamId INTEGER NOT NULL UNIQUE,
               {PERMANENT_COLUMN} TEXT NOT NULL DEFAULT 'Default,',
               {TIMED_COLUMN} TEXT NOT NULL DEFAULT ''
             );
             CREATE TABLE IF NOT EXISTS {tribes} (
               Id INTEGER PRIMARY KEY AUTOINCREMENT,
               TribeId INTEGER NOT NULL UNIQUE,
               {PERMANENT_COLUMN} TEXT NOT NULL DEFAULT '',
               {TIMED_COLUMN} TEXT NOT NULL DEFAULT ''
             );
             CREATE TABLE IF NOT EXISTS {groups} (
               Id INTEGER PRIMARY KEY AUTOINCREMENT,
               GroupName TEXT NOT NULL UNIQUE,
               Permissions TEXT NOT NULL DEFAULT ''
             );"
        );
        self.conn.lock().execute_batch(&ddl).context("failed to create permission tables")?;
        info!(players = %players, tribes = %tribes, groups = %groups, "permission tables ready");
        Ok(())
    }

    /// Run one statement and return the number of affected rows.
    fn apply(&self, statement: &Statement) -> Result<usize> {
        let conn = self.conn.lock();
        let groups = &self.tables.groups;
        let affected = match statement {
            Statement::InsertPrincipal { kind, id, groups: encoded } => {
                let table = self.tables.principals(*kind);
                let column = id_column(*kind);
                conn.execute(
                    &format!("INSERT INTO {table} ({column}, {PERMANENT_COLUMN}) VALUES (?1, ?2)"),
                    params![id, encoded],
                )
            }
            Statement::AppendPermanentGroup { kind, id, encoded } => {
                let table = self.tables.principals(*kind);
                let column = id_column(*kind);
                conn.execute(
                    &format!(
                        "UPDATE {table} SET {PERMANENT_COLUMN} = {PERMANENT_COLUMN} || ?1 WHERE {column} = ?2"
                    ),
                    params![encoded, id],
                )
            }
            Statement::SetPermanentGroups { kind, id, encoded } => {
                let table = self.tables.principals(*kind);
                let column = id_column(*kind);
                conn.execute(
                    &format!("UPDATE {table} SET {PERMANENT_COLUMN} = ?1 WHERE {column} = ?2"),
                    params![encoded, id],
                )
            }
            Statement::SetTimedGroups { kind, id, encoded } => {
                let table = self.tables.principals(*kind);
                let column = id_column(*kind);
                conn.execute(
                    &format!("UPDATE {table} SET {TIMED_COLUMN} = ?1 WHERE {column} = ?2"),
                    params![encoded, id],
                )
            }
            Statement::InsertGroup { name } => conn.execute(
                &format!("INSERT INTO {groups} (GroupName, Permissions) VALUES (?1, '')"),
                params![name],
            ),
            Statement::SeedGroup { name, permissions } => conn.execute(
                &format!("INSERT OR IGNORE INTO {groups} (GroupName, Permissions) VALUES (?1, ?2)"),
                params![name, permissions],
            ),
            Statement::DeleteGroup { name } => conn.execute(
                &format!("DELETE FROM {groups} WHERE GroupName = ?1"),
                params![name],
            ),
            Statement::AppendPermission { group, encoded } => conn.execute(
                &format!("UPDATE {groups} SET Permissions = Permissions || ?1 WHERE GroupName = ?2"),
                params![encoded, group],
            ),
            Statement::SetPermissions { group, encoded } => conn.execute(
                &format!("UPDATE {groups} SET Permissions = ?1 WHERE GroupName = ?2"),
                params![encoded, group],
            ),
            Statement::AddTimedColumn(kind) => {
                let table = self.tables.principals(*kind);
                conn.execute(
                    &format!("ALTER TABLE {table} ADD COLUMN {TIMED_COLUMN} TEXT NOT NULL DEFAULT ''"),
                    [],
                )
            }
        }
        .with_context(|| format!("failed to apply {}", describe(statement)))?;
        Ok(affected)
    }

    fn scan(&self, query: &Query) -> Result<Vec<Row>> {
        let conn = self.conn.lock();
        let sql = match query {
            Query::Groups => {
                format!("SELECT GroupName, Permissions FROM {} ORDER BY Id", self.tables.groups)
            }
            Query::Principals(kind) => {
                let table = self.tables.principals(*kind);
                let timed = if table_has_column(&conn, table, TIMED_COLUMN)? {
                    TIMED_COLUMN
                } else {
                    "NULL"
                };
                format!(
                    "SELECT {}, {PERMANENT_COLUMN}, {timed} FROM {table} ORDER BY Id",
                    id_column(*kind)
                )
            }
        };

        let mut stmt =
            conn.prepare(&sql).with_context(|| format!("failed to prepare scan for {query:?}"))?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for index in 0..column_count {
                values.push(to_value(row.get_ref(index)?));
            }
            out.push(Row(values));
        }
        Ok(out)
    }
}

fn describe(statement: &Statement) -> String {
    match statement {
        Statement::InsertPrincipal { kind, id, .. } => format!("insert of {kind} {id}"),
        Statement::AppendPermanentGroup { kind, id, .. }
        | Statement::SetPermanentGroups { kind, id, .. } => {
            format!("permanent group update for {kind} {id}")
        }
        Statement::SetTimedGroups { kind, id, .. } => format!("timed group update for {kind} {id}"),
        Statement::InsertGroup { name } | Statement::SeedGroup { name, .. } => {
            format!("insert of group `{name}`")
        }
        Statement::DeleteGroup { name } => format!("delete of group `{name}`"),
        Statement::AppendPermission { group, .. } | Statement::SetPermissions { group, .. } => {
            format!("permission update for group `{group}`")
        }
        Statement::AddTimedColumn(kind) => format!("timed column upgrade for {kind} table"),
    }
}

/// Statements whose target row must already exist.
const fn requires_row(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::AppendPermanentGroup { .. }
            | Statement::SetPermanentGroups { .. }
            | Statement::SetTimedGroups { .. }
            | Statement::DeleteGroup { .. }
            | Statement::AppendPermission { .. }
            | Statement::SetPermissions { .. }
    )
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => Value::Integer(int),
        ValueRef::Real(real) => Value::Text(real.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn backend(err: &anyhow::Error) -> StoreError {
    StoreError::Backend(format!("{err:#}"))
}

impl Store for SqliteStore {
    fn execute(&self, statement: &Statement) -> Result<(), StoreError> {
        let affected = self.apply(statement).map_err(|err| backend(&err))?;
        if affected == 0 && requires_row(statement) {
            return Err(StoreError::RowMissing(describe(statement)));
        }
        debug!(statement = %describe(statement), affected, "sqlite statement applied");
        Ok(())
    }

    fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        self.scan(query).map_err(|err| backend(&err))
    }

    fn query_scalar(&self, query: &ScalarQuery) -> Result<Option<Value>, StoreError> {
        let ScalarQuery::HasTimedColumn(kind) = query;
        let conn = self.conn.lock();
        let present = table_has_column(&conn, self.tables.principals(*kind), TIMED_COLUMN)
            .map_err(|err| backend(&err))?;
        Ok(Some(Value::Integer(i64::from(present))))
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Err(anyhow!("table {table} does not exist; run initialization first"));
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}
