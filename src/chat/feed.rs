//! Live, time-ordered message feed for one group at a time.

use std::sync::Arc;

use super::Subscription;
use crate::backend::{DocumentStore, Query, Snapshot};
use crate::error::ChatResult;
use crate::models::{Message, MESSAGES};

/// Decode and order a snapshot: by timestamp, then by message id.
fn decode_messages(snapshots: &[Snapshot]) -> ChatResult<Vec<Message>> {
    let mut messages = snapshots
        .iter()
        .map(Message::from_snapshot)
        .collect::<ChatResult<Vec<_>>>()?;
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    Ok(messages)
}

#[derive(Clone)]
pub struct MessageFeed {
    store: Arc<dyn DocumentStore>,
}

impl MessageFeed {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Open a live query on one group's messages.
    pub fn subscribe(&self, group_id: &str) -> Subscription<Message> {
        let query = Query::new()
            .where_eq("groupId", group_id)
            .order_by("timestamp");
        tracing::debug!("Subscribing to group {}", group_id);
        Subscription::new(self.store.listen(MESSAGES, query), decode_messages)
    }
}

/// The feed of the currently selected group.
///
/// Selecting another group releases the previous live query before the new
/// one is opened, so a discarded group can never overwrite the current view.
pub struct ActiveFeed {
    feed: MessageFeed,
    current: Option<(String, Subscription<Message>)>,
}

impl ActiveFeed {
    pub fn new(feed: MessageFeed) -> Self {
        Self {
            feed,
            current: None,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        self.current.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn select(&mut self, group_id: &str) {
        self.clear();
        let sub = self.feed.subscribe(group_id);
        self.current = Some((group_id.to_string(), sub));
    }

    pub fn clear(&mut self) {
        if let Some((_, sub)) = self.current.take() {
            sub.unsubscribe();
        }
    }

    /// Next full list for the selected group. Waits forever when nothing is selected.
    pub async fn next(&mut self) -> Option<ChatResult<Vec<Message>>> {
        match self.current.as_mut() {
            Some((_, sub)) => sub.recv().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Value;
    use chrono::{TimeZone, Utc};

    fn stored(id: &str, secs: i64) -> Snapshot {
        let mut fields = Message::new_fields("g1", id, "u1", "Ada", &[]);
        let t = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        fields.insert("timestamp".into(), Value::Timestamp(t));
        Snapshot {
            id: id.to_string(),
            fields,
        }
    }

    #[test]
    fn test_decode_orders_by_time_then_id() {
        let list = vec![stored("m3", 5), stored("m2", 1), stored("m1", 1)];
        let messages = decode_messages(&list).unwrap();
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let mut bad = stored("m1", 0);
        bad.fields.remove("senderId");
        assert!(decode_messages(&[bad]).is_err());
    }
}
