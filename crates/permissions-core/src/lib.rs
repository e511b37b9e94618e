pub mod cache;
pub mod clock;
pub mod codec;
pub mod engine;
pub mod error;
pub mod groups;
pub mod principal;
pub mod record;
pub mod store;

#[cfg(test)]
mod testing;

pub use cache::PrincipalCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{decode_list, decode_timed, encode_list, encode_timed, CodecError};
pub use engine::{BootstrapReport, DecodeSkipped, Groups, PermissionEngine, Principals};
pub use error::{PermissionError, StoreError};
pub use groups::{GroupRegistry, ADMINS_GROUP, DEFAULT_GROUP, WILDCARD_PERMISSION};
pub use principal::{PrincipalId, SteamId, TribeId};
pub use record::{MembershipRecord, TimedEntry};
pub use store::{PrincipalKind, Query, Row, ScalarQuery, Statement, Store, Value};
