use thiserror::Error;

use crate::store::PrincipalKind;

/// Failure reported by a durable store.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("no durable row matched: {0}")]
    RowMissing(String),
    #[error("identifier cannot be stored: {0}")]
    InvalidId(String),
    #[error("unexpected row shape: {0}")]
    RowShape(String),
}

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum PermissionError {
    #[error("{kind} {id} not found")]
    PrincipalNotFound { kind: PrincipalKind, id: String },
    #[error("group `{0}` does not exist")]
    GroupMissing(String),
    #[error("{kind} {id} is already a member of `{group}`")]
    AlreadyMember { kind: PrincipalKind, id: String, group: String },
    #[error("{kind} {id} is not a member of `{group}`")]
    NotMember { kind: PrincipalKind, id: String, group: String },
    #[error("group `{0}` already exists")]
    AlreadyExists(String),
    #[error("group `{group}` already has permission `{permission}`")]
    AlreadyGranted { group: String, permission: String },
    #[error("group `{group}` does not have permission `{permission}`")]
    NotGranted { group: String, permission: String },
    #[error("group `{0}` is built in and cannot be deleted")]
    BuiltinGroup(String),
    #[error("invalid name `{0}`: names must be non-empty and must not contain ','")]
    InvalidName(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}
