//! Message-related models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Fields;
use crate::backend::{Document, Snapshot, Value};
use crate::error::{ChatError, ChatResult};

/// Attachment kind, derived from the uploaded file's declared MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
    Video,
}

impl AttachmentKind {
    /// `image/*` and `video/*` are recognised; everything else is a document.
    pub fn from_mime(content_type: &str) -> Self {
        let mime = content_type.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            AttachmentKind::Image
        } else if mime.starts_with("video/") {
            AttachmentKind::Video
        } else {
            AttachmentKind::Document
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Document => "document",
            AttachmentKind::Video => "video",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "image" => AttachmentKind::Image,
            "video" => AttachmentKind::Video,
            _ => AttachmentKind::Document,
        }
    }
}

/// Uploaded file referenced by a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub url: String,
    pub name: String,
    pub size: u64,
}

impl Attachment {
    fn to_value(&self) -> Value {
        let mut doc = Document::new();
        doc.insert("type".into(), self.kind.as_str().into());
        doc.insert("url".into(), self.url.clone().into());
        doc.insert("name".into(), self.name.clone().into());
        doc.insert("size".into(), self.size.into());
        Value::Map(doc)
    }

    fn from_value(message_id: &str, value: &Value) -> ChatResult<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| ChatError::Decode(format!("{}: attachment is not a map", message_id)))?;
        let f = Fields::from_map(message_id, map);
        Ok(Self {
            kind: AttachmentKind::parse(&f.opt_string("type").unwrap_or_default()),
            url: f.string("url")?,
            name: f.opt_string("name").unwrap_or_default(),
            size: f.opt_u64("size").unwrap_or(0),
        })
    }
}

/// A message in a group feed. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sender_id: String,
    /// Sender's display name at send time.
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    pub group_id: String,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn from_snapshot(snapshot: &Snapshot) -> ChatResult<Self> {
        let f = Fields::of(snapshot);
        let attachments = f
            .array("attachments")
            .iter()
            .map(|v| Attachment::from_value(&snapshot.id, v))
            .collect::<ChatResult<Vec<_>>>()?;

        Ok(Self {
            id: snapshot.id.clone(),
            text: f.opt_string("text").unwrap_or_default(),
            sender_id: f.string("senderId")?,
            sender_name: f.opt_string("senderName").unwrap_or_default(),
            timestamp: f.timestamp("timestamp")?,
            group_id: f.string("groupId")?,
            attachments,
        })
    }

    /// Record for a new message; the timestamp is assigned by the store.
    pub fn new_fields(
        group_id: &str,
        text: &str,
        sender_id: &str,
        sender_name: &str,
        attachments: &[Attachment],
    ) -> Document {
        let mut doc = Document::new();
        doc.insert("text".into(), text.into());
        doc.insert("senderId".into(), sender_id.into());
        doc.insert("senderName".into(), sender_name.into());
        doc.insert("timestamp".into(), Value::ServerTimestamp);
        doc.insert("groupId".into(), group_id.into());
        doc.insert(
            "attachments".into(),
            Value::Array(attachments.iter().map(Attachment::to_value).collect()),
        );
        doc
    }
}
