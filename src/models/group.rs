//! Chat group records

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Fields;
use crate::backend::{Document, Snapshot, Value};
use crate::error::{ChatError, ChatResult};

/// Named set of identities sharing one message feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Membership is a set; stored order carries no meaning.
    pub members: BTreeSet<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn is_member(&self, identity_id: &str) -> bool {
        self.members.contains(identity_id)
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> ChatResult<Self> {
        let f = Fields::of(snapshot);
        let members = f
            .array("members")
            .iter()
            .map(|v| {
                v.as_str()
                    .map(String::from)
                    .ok_or_else(|| ChatError::Decode(format!("{}: non-string member", snapshot.id)))
            })
            .collect::<ChatResult<BTreeSet<String>>>()?;

        Ok(Self {
            id: snapshot.id.clone(),
            name: f.string("name")?,
            created_by: f.string("createdBy")?,
            created_at: f.timestamp("createdAt")?,
            members,
            last_message: f.opt_string("lastMessage"),
            last_message_at: f.opt_timestamp("lastMessageAt"),
        })
    }

    /// Record for a new group; the creation time is assigned by the store.
    pub fn new_fields<'a>(
        name: &str,
        created_by: &str,
        members: impl IntoIterator<Item = &'a String>,
    ) -> Document {
        let members: Vec<Value> = members.into_iter().map(|m| Value::from(m.as_str())).collect();
        let mut doc = Document::new();
        doc.insert("name".into(), name.into());
        doc.insert("createdBy".into(), created_by.into());
        doc.insert("createdAt".into(), Value::ServerTimestamp);
        doc.insert("members".into(), Value::Array(members));
        doc
    }

    /// Fields updated after a message is sent to the group.
    pub fn preview_fields(text: &str) -> Document {
        let mut doc = Document::new();
        doc.insert("lastMessage".into(), text.into());
        doc.insert("lastMessageAt".into(), Value::ServerTimestamp);
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(fields: Document) -> Snapshot {
        let fields = fields
            .into_iter()
            .map(|(k, v)| match v {
                Value::ServerTimestamp => (k, Value::Timestamp(Utc::now())),
                other => (k, other),
            })
            .collect();
        Snapshot {
            id: "g1".to_string(),
            fields,
        }
    }

    #[test]
    fn test_new_group_decodes() {
        let members: BTreeSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        let snap = stored(Group::new_fields("Volunteers", "a", &members));
        let group = Group::from_snapshot(&snap).unwrap();

        assert_eq!(group.name, "Volunteers");
        assert_eq!(group.created_by, "a");
        assert!(group.is_member("a"));
        assert!(group.is_member("b"));
        assert_eq!(group.last_message, None);
    }

    #[test]
    fn test_missing_name_is_decode_error() {
        let mut fields = Group::new_fields("x", "a", &BTreeSet::new());
        fields.remove("name");
        let err = Group::from_snapshot(&stored(fields)).unwrap_err();
        assert!(matches!(err, ChatError::Decode(_)));
    }
}
