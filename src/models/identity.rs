//! Identity (user) records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Fields;
use crate::auth::AuthUser;
use crate::backend::{Document, Snapshot, Value};
use crate::error::ChatResult;

/// A known user, as stored in the `users` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
    pub last_active: DateTime<Utc>,
    pub online: bool,
}

impl Identity {
    /// Identity of a freshly signed-in account.
    pub fn online(user: &AuthUser, now: DateTime<Utc>) -> Self {
        Self {
            id: user.uid.clone(),
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            photo_url: user.photo_url.clone(),
            last_active: now,
            online: true,
        }
    }

    /// Human-readable name: display name, then email, then a placeholder.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.email.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or("Anonymous User")
    }

    /// Missing `lastActive` reads as now and missing `isOnline` as offline.
    pub fn from_snapshot(snapshot: &Snapshot) -> ChatResult<Self> {
        let f = Fields::of(snapshot);
        Ok(Self {
            id: f.opt_string("uid").unwrap_or_else(|| snapshot.id.clone()),
            display_name: f.opt_string("displayName"),
            email: f.opt_string("email"),
            photo_url: f.opt_string("photoURL"),
            last_active: f.opt_timestamp("lastActive").unwrap_or_else(Utc::now),
            online: f.bool_or("isOnline", false),
        })
    }

    /// Full record written when an account signs in or signs up.
    pub fn to_fields(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("uid".into(), self.id.clone().into());
        doc.insert("displayName".into(), self.display_name.clone().into());
        doc.insert("email".into(), self.email.clone().into());
        doc.insert("photoURL".into(), self.photo_url.clone().into());
        doc.insert("lastActive".into(), self.last_active.into());
        doc.insert("isOnline".into(), self.online.into());
        doc
    }

    /// Partial record for a presence change; merged into the existing one.
    pub fn presence_fields(online: bool, now: DateTime<Utc>) -> Document {
        let mut doc = Document::new();
        doc.insert("isOnline".into(), Value::Bool(online));
        doc.insert("lastActive".into(), Value::Timestamp(now));
        doc
    }
}
