//! Data models for chat entities
//!
//! Each model converts to and from the schemaless [`Document`] form used by
//! the stores.

mod group;
mod identity;
mod message;

pub use group::*;
pub use identity::*;
pub use message::*;

use chrono::{DateTime, Utc};

use crate::backend::{Document, Snapshot, Value};
use crate::error::{ChatError, ChatResult};

/// Collection of identity records keyed by account id.
pub const USERS: &str = "users";
pub const GROUPS: &str = "chatGroups";
pub const MESSAGES: &str = "chatMessages";

/// Typed access to the fields of one stored document.
struct Fields<'a> {
    id: &'a str,
    doc: &'a Document,
}

impl<'a> Fields<'a> {
    fn of(snapshot: &'a Snapshot) -> Self {
        Self {
            id: &snapshot.id,
            doc: &snapshot.fields,
        }
    }

    fn from_map(id: &'a str, doc: &'a Document) -> Self {
        Self { id, doc }
    }

    fn missing(&self, key: &str) -> ChatError {
        ChatError::Decode(format!("{}: missing or mistyped field {}", self.id, key))
    }

    fn string(&self, key: &str) -> ChatResult<String> {
        self.opt_string(key).ok_or_else(|| self.missing(key))
    }

    /// Absent, null and non-string values all read as `None`.
    fn opt_string(&self, key: &str) -> Option<String> {
        self.doc.get(key).and_then(Value::as_str).map(String::from)
    }

    fn timestamp(&self, key: &str) -> ChatResult<DateTime<Utc>> {
        self.opt_timestamp(key).ok_or_else(|| self.missing(key))
    }

    fn opt_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.doc.get(key).and_then(Value::as_timestamp)
    }

    fn bool_or(&self, key: &str, default: bool) -> bool {
        self.doc.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn opt_u64(&self, key: &str) -> Option<u64> {
        self.doc
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|i| u64::try_from(i).ok())
    }

    fn array(&self, key: &str) -> &'a [Value] {
        self.doc.get(key).and_then(Value::as_array).unwrap_or(&[])
    }
}
