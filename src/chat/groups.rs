//! Group directory: which groups the current identity belongs to.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::SessionStore;
use crate::backend::{DocumentStore, Query};
use crate::error::{ChatError, ChatResult};
use crate::models::{Group, GROUPS};

pub struct GroupDirectory {
    session: Arc<SessionStore>,
    store: Arc<dyn DocumentStore>,
}

impl GroupDirectory {
    pub fn new(session: Arc<SessionStore>, store: Arc<dyn DocumentStore>) -> Self {
        Self { session, store }
    }

    /// Groups whose member set contains the current identity. One-shot read.
    pub async fn list_groups(&self) -> ChatResult<Vec<Group>> {
        let me = self.session.require()?;
        let query = Query::new().where_array_contains("members", me.id.as_str());
        let snapshots = self.store.query(GROUPS, &query).await?;
        snapshots.iter().map(Group::from_snapshot).collect()
    }

    /// Create a group and return its id. The creator is always a member.
    pub async fn create_group<I, S>(&self, name: &str, member_ids: I) -> ChatResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let me = self.session.require()?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::Validation("group name is empty".into()));
        }
        let mut members: BTreeSet<String> = member_ids
            .into_iter()
            .map(Into::into)
            .filter(|id: &String| !id.is_empty())
            .collect();
        if members.is_empty() {
            return Err(ChatError::Validation("select at least one member".into()));
        }
        members.insert(me.id.clone());

        let id = self
            .store
            .add(GROUPS, Group::new_fields(name, &me.id, &members))
            .await?;
        tracing::info!("Created group {} ({}) with {} members", name, id, members.len());
        Ok(id)
    }

    /// A single group by id.
    pub async fn get(&self, group_id: &str) -> ChatResult<Group> {
        self.session.require()?;
        match self.store.get(GROUPS, group_id).await? {
            Some(snapshot) => Group::from_snapshot(&snapshot),
            None => Err(ChatError::NotFound(format!("group {}", group_id))),
        }
    }
}
