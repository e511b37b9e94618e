use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::groups::DEFAULT_GROUP;
use crate::store::PrincipalKind;

/// Identifier of something that can hold group memberships.
///
/// Players and tribes share one cache and engine contract; this trait carries
/// the per-kind differences (default membership and durable key mapping).
pub trait PrincipalId:
    Copy + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static
{
    const KIND: PrincipalKind;

    /// Permanent groups a freshly created principal starts with.
    fn default_groups() -> Vec<String>;

    /// Durable key for this id.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidId`] when the id has no signed 64-bit form.
    fn to_store(self) -> Result<i64, StoreError>;

    fn from_store(raw: i64) -> Option<Self>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SteamId(pub u64);

impl Display for SteamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SteamId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl PrincipalId for SteamId {
    const KIND: PrincipalKind = PrincipalKind::Player;

    fn default_groups() -> Vec<String> {
        vec![DEFAULT_GROUP.to_string()]
    }

    fn to_store(self) -> Result<i64, StoreError> {
        i64::try_from(self.0).map_err(|_| {
            StoreError::InvalidId(format!("steam id {} exceeds the signed 64-bit range", self.0))
        })
    }

    fn from_store(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TribeId(pub i64);

impl Display for TribeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TribeId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl PrincipalId for TribeId {
    const KIND: PrincipalKind = PrincipalKind::Tribe;

    fn default_groups() -> Vec<String> {
        Vec::new()
    }

    fn to_store(self) -> Result<i64, StoreError> {
        Ok(self.0)
    }

    fn from_store(raw: i64) -> Option<Self> {
        Some(Self(raw))
    }
}
