//! Capability contract between the engine and a durable relational store.
//!
//! The engine speaks in typed statements; each adapter owns its SQL and
//! parameter binding.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Player,
    Tribe,
}

impl PrincipalKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Player => "player",
            Self::Tribe => "tribe",
        }
    }
}

impl Display for PrincipalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable mutation. Encoded fields are already in column format.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Statement {
    InsertPrincipal { kind: PrincipalKind, id: i64, groups: String },
    AppendPermanentGroup { kind: PrincipalKind, id: i64, encoded: String },
    SetPermanentGroups { kind: PrincipalKind, id: i64, encoded: String },
    SetTimedGroups { kind: PrincipalKind, id: i64, encoded: String },
    InsertGroup { name: String },
    /// Insert unless a group with this name already exists.
    SeedGroup { name: String, permissions: String },
    DeleteGroup { name: String },
    AppendPermission { group: String, encoded: String },
    SetPermissions { group: String, encoded: String },
    AddTimedColumn(PrincipalKind),
}

/// Full scans used at bootstrap.
///
/// `Groups` rows are `[name, permissions]`; `Principals` rows are
/// `[id, permanent, timed]` where `timed` may be `Null`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Query {
    Groups,
    Principals(PrincipalKind),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScalarQuery {
    /// `Integer(1)` when the principal table carries the timed column.
    HasTimedColumn(PrincipalKind),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Row(pub Vec<Value>);

impl Row {
    /// # Errors
    /// Returns [`StoreError::RowShape`] when the column is absent or not an integer.
    pub fn integer(&self, index: usize) -> Result<i64, StoreError> {
        match self.0.get(index) {
            Some(Value::Integer(value)) => Ok(*value),
            other => Err(StoreError::RowShape(format!(
                "column {index} expected integer, found {other:?}"
            ))),
        }
    }

    /// Text column; `Null` reads as the empty string.
    ///
    /// # Errors
    /// Returns [`StoreError::RowShape`] when the column is absent or an integer.
    pub fn text(&self, index: usize) -> Result<&str, StoreError> {
        match self.0.get(index) {
            Some(Value::Text(value)) => Ok(value),
            Some(Value::Null) => Ok(""),
            other => Err(StoreError::RowShape(format!(
                "column {index} expected text, found {other:?}"
            ))),
        }
    }
}

pub trait Store: Send + Sync {
    /// Apply a durable mutation. An update or delete that matches no row is
    /// [`StoreError::RowMissing`].
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend rejects the statement.
    fn execute(&self, statement: &Statement) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the scan fails.
    fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] when the lookup fails.
    fn query_scalar(&self, query: &ScalarQuery) -> Result<Option<Value>, StoreError>;
}

impl<S: Store + ?Sized> Store for std::sync::Arc<S> {
    fn execute(&self, statement: &Statement) -> Result<(), StoreError> {
        (**self).execute(statement)
    }

    fn query(&self, query: &Query) -> Result<Vec<Row>, StoreError> {
        (**self).query(query)
    }

    fn query_scalar(&self, query: &ScalarQuery) -> Result<Option<Value>, StoreError> {
        (**self).query_scalar(query)
    }
}
