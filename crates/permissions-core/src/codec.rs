//! Textual encoding of membership columns.
//!
//! Name lists (permanent groups, permission tokens) are stored as a
//! comma-terminated concatenation: `"A,B,"`. Timed memberships are stored as
//! `"<delay_until>;<expire_at>;<group>,"` per entry, in sequence order. Nothing
//! outside this module builds or parses these strings.

use crate::record::TimedEntry;

const ENTRY_SEPARATOR: char = ',';
const FIELD_SEPARATOR: char = ';';

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CodecError {
    #[error("timed entry `{entry}` has {found} field(s); expected delay;expire;group")]
    FieldCount { entry: String, found: usize },
    #[error("timed entry `{entry}` has a non-integer {field}: `{value}`")]
    Timestamp { entry: String, field: &'static str, value: String },
    #[error("timed entry `{entry}` has an empty group name")]
    EmptyGroup { entry: String },
}

#[must_use]
pub fn encode_list<S: AsRef<str>>(names: &[S]) -> String {
    let mut encoded = String::new();
    for name in names {
        encoded.push_str(name.as_ref());
        encoded.push(ENTRY_SEPARATOR);
    }
    encoded
}

/// Split a comma-terminated list. Empty tokens are dropped and repeated names
/// keep their first position; token syntax is not validated.
#[must_use]
pub fn decode_list(encoded: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for token in encoded.split(ENTRY_SEPARATOR) {
        if token.is_empty() || names.iter().any(|name| name == token) {
            continue;
        }
        names.push(token.to_string());
    }
    names
}

#[must_use]
pub fn encode_timed(entries: &[TimedEntry]) -> String {
    let mut encoded = String::new();
    for entry in entries {
        encoded.push_str(&format!(
            "{}{FIELD_SEPARATOR}{}{FIELD_SEPARATOR}{}{ENTRY_SEPARATOR}",
            entry.delay_until, entry.expire_at, entry.group
        ));
    }
    encoded
}

/// Parse a timed-membership column back into its entry sequence.
///
/// # Errors
/// Returns [`CodecError`] for the first entry that does not have the
/// `delay;expire;group` shape or whose timestamps are not integers.
pub fn decode_timed(encoded: &str) -> Result<Vec<TimedEntry>, CodecError> {
    let mut entries = Vec::new();
    for raw in encoded.split(ENTRY_SEPARATOR) {
        if raw.trim().is_empty() {
            continue;
        }

        let fields = raw.splitn(3, FIELD_SEPARATOR).collect::<Vec<_>>();
        let [delay, expire, group] = fields.as_slice() else {
            return Err(CodecError::FieldCount { entry: raw.to_string(), found: fields.len() });
        };

        if group.is_empty() {
            return Err(CodecError::EmptyGroup { entry: raw.to_string() });
        }

        entries.push(TimedEntry {
            group: (*group).to_string(),
            delay_until: parse_timestamp(raw, "delay", delay)?,
            expire_at: parse_timestamp(raw, "expiry", expire)?,
        });
    }
    Ok(entries)
}

fn parse_timestamp(entry: &str, field: &'static str, value: &str) -> Result<i64, CodecError> {
    value.trim().parse::<i64>().map_err(|_| CodecError::Timestamp {
        entry: entry.to_string(),
        field,
        value: value.to_string(),
    })
}
