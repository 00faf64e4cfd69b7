//! Chat core: session store, group directory, message feed and composer.
//!
//! Every component receives its backend handles explicitly; nothing here
//! reaches for a process-wide client.

mod composer;
mod feed;
mod groups;
mod session;
mod subscription;

pub use composer::{Composer, LocalFile, MAX_ATTACHMENT_BYTES};
pub use feed::{ActiveFeed, MessageFeed};
pub use groups::GroupDirectory;
pub use session::{SessionState, SessionStore};
pub use subscription::Subscription;

use std::sync::Arc;

use anyhow::anyhow;
use tokio::task::{JoinError, JoinHandle};

use crate::auth::AuthProvider;
use crate::backend::{DocumentStore, FileStore};
use crate::error::{ChatError, ChatResult};

/// All chat components wired to one set of backend handles.
pub struct ChatClient {
    pub session: Arc<SessionStore>,
    pub groups: GroupDirectory,
    pub feed: MessageFeed,
    pub composer: Composer,
    session_task: Option<JoinHandle<ChatResult<()>>>,
}

impl ChatClient {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn DocumentStore>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        let session = Arc::new(SessionStore::new(auth, Arc::clone(&store)));
        Self {
            groups: GroupDirectory::new(Arc::clone(&session), Arc::clone(&store)),
            feed: MessageFeed::new(Arc::clone(&store)),
            composer: Composer::new(Arc::clone(&session), store, files),
            session,
            session_task: None,
        }
    }

    /// Start following the auth provider and wait for its first report.
    pub async fn start(&mut self) -> ChatResult<SessionState> {
        let mut state = self.session.watch_state();
        let session = Arc::clone(&self.session);
        let mut task = tokio::spawn(async move { session.run().await });

        tokio::select! {
            res = async { state.wait_for(|s| *s != SessionState::Loading).await.map(|_| ()) } => {
                res.map_err(|_| ChatError::Backend(anyhow!("session store closed")))?;
            }
            joined = &mut task => {
                session_result(joined)?;
                return Err(ChatError::Backend(anyhow!("auth provider closed before reporting")));
            }
        }

        if matches!(self.session.state(), SessionState::Failed(_)) {
            session_result((&mut task).await)?;
        }
        self.session_task = Some(task);
        Ok(self.session.state())
    }

    /// Resolves when the session loop stops, with its error if it failed.
    /// Pending forever while the loop is running or before `start`.
    pub async fn session_closed(&mut self) -> ChatResult<()> {
        let task = match self.session_task.as_mut() {
            Some(task) => task,
            None => return std::future::pending().await,
        };
        let joined = task.await;
        self.session_task = None;
        session_result(joined)
    }

    /// Stop following the auth provider and mark the identity offline.
    ///
    /// Returns the session loop's error if it had already failed.
    pub async fn shutdown(mut self) -> ChatResult<()> {
        let outcome = match self.session_task.take() {
            Some(task) if task.is_finished() => session_result(task.await),
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Ok(()),
        };
        self.session.shutdown().await;
        outcome
    }

    /// Shut down, then hand back `result`. An error in `result` takes
    /// precedence over a session failure.
    pub async fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<ChatError>,
    {
        let closed = self.shutdown().await;
        let value = result?;
        closed?;
        Ok(value)
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        if let Some(task) = self.session_task.take() {
            task.abort();
        }
    }
}

fn session_result(joined: Result<ChatResult<()>, JoinError>) -> ChatResult<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ChatError::Backend(anyhow!("session task failed: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryAuth;
    use crate::auth::AuthUser;
    use crate::backend::memory::{MemoryFiles, MemoryStore};
    use crate::backend::{Document, Listener, Query, Snapshot};
    use crate::models::{AttachmentKind, Identity, Message, GROUPS, MESSAGES, USERS};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    /// Memory store whose roster query breaks shortly after it opens.
    struct BrokenRoster {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for BrokenRoster {
        async fn add(&self, collection: &str, fields: Document) -> anyhow::Result<String> {
            self.inner.add(collection, fields).await
        }

        async fn set_merge(&self, collection: &str, id: &str, fields: Document) -> anyhow::Result<()> {
            self.inner.set_merge(collection, id, fields).await
        }

        async fn update(&self, collection: &str, id: &str, fields: Document) -> anyhow::Result<()> {
            self.inner.update(collection, id, fields).await
        }

        async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Snapshot>> {
            self.inner.get(collection, id).await
        }

        async fn query(&self, collection: &str, query: &Query) -> anyhow::Result<Vec<Snapshot>> {
            self.inner.query(collection, query).await
        }

        fn listen(&self, collection: &str, query: Query) -> Listener {
            if collection != USERS {
                return self.inner.listen(collection, query);
            }
            Listener::spawn(|tx| async move {
                let _ = tx.send(Ok(Vec::new())).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(Err(anyhow!("permission denied on roster"))).await;
            })
        }
    }

    async fn is_online(store: &dyn DocumentStore, uid: &str) -> bool {
        let record = store.get(USERS, uid).await.unwrap().unwrap();
        Identity::from_snapshot(&record).unwrap().online
    }

    struct Backend {
        store: Arc<MemoryStore>,
        files: Arc<MemoryFiles>,
    }

    impl Backend {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                files: Arc::new(MemoryFiles::new()),
            }
        }

        async fn client(&self, uid: &str, name: &str) -> ChatClient {
            let auth = Arc::new(MemoryAuth::signed_in(AuthUser::new(uid).with_name(name)));
            let mut client = ChatClient::new(auth, self.store.clone(), self.files.clone());
            let state = client.start().await.unwrap();
            assert!(state.identity().is_some());
            client
        }
    }

    /// Wait until a feed delivers a list satisfying `pred`.
    async fn feed_until(
        sub: &mut Subscription<Message>,
        pred: impl Fn(&[Message]) -> bool,
    ) -> Vec<Message> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let list = sub.recv().await.unwrap().unwrap();
                if pred(&list) {
                    return list;
                }
            }
        })
        .await
        .expect("feed never delivered the expected list")
    }

    fn names(groups: &[crate::models::Group]) -> Vec<&str> {
        groups.iter().map(|g| g.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_group_visible_only_to_members() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let b = backend.client("b", "Bo").await;
        let c = backend.client("c", "Cy").await;

        let id = a.groups.create_group("Volunteers", ["b"]).await.unwrap();

        assert_eq!(names(&a.groups.list_groups().await.unwrap()), vec!["Volunteers"]);
        assert_eq!(names(&b.groups.list_groups().await.unwrap()), vec!["Volunteers"]);
        assert!(c.groups.list_groups().await.unwrap().is_empty());

        let group = a.groups.get(&id).await.unwrap();
        assert_eq!(group.created_by, "a");
        assert!(group.is_member("a") && group.is_member("b"));
        assert_eq!(group.members.len(), 2);
    }

    #[tokio::test]
    async fn test_create_group_keeps_all_members_once() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;

        let id = a
            .groups
            .create_group("Cleanup", vec!["b".to_string(), "a".to_string(), "b".to_string()])
            .await
            .unwrap();
        let group = a.groups.get(&id).await.unwrap();
        let members: Vec<&str> = group.members.iter().map(String::as_str).collect();
        assert_eq!(members, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_create_group_validation_writes_nothing() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let writes = backend.store.write_count();

        let empty_name = a.groups.create_group("  ", ["b"]).await;
        assert!(matches!(empty_name, Err(ChatError::Validation(_))));

        let no_members = a.groups.create_group("Volunteers", Vec::<String>::new()).await;
        assert!(matches!(no_members, Err(ChatError::Validation(_))));

        assert_eq!(backend.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_directory_requires_session() {
        let backend = Backend::new();
        let auth = Arc::new(MemoryAuth::new());
        auth.set_user(None);
        let mut client = ChatClient::new(auth, backend.store.clone(), backend.files.clone());
        assert_eq!(client.start().await.unwrap(), SessionState::SignedOut);

        assert!(matches!(
            client.groups.list_groups().await,
            Err(ChatError::Unauthenticated)
        ));
        assert!(matches!(
            client.groups.create_group("x", ["b"]).await,
            Err(ChatError::Unauthenticated)
        ));
        assert_eq!(backend.store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_message_reaches_other_member() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let b = backend.client("b", "Bo").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();

        let mut feed = b.feed.subscribe(&group);
        let initial = assert_ok!(feed.recv().await.unwrap());
        assert!(initial.is_empty());

        a.composer.send(&group, "hello", vec![]).await.unwrap();

        let list = feed_until(&mut feed, |l| !l.is_empty()).await;
        let last = list.last().unwrap();
        assert_eq!(last.text, "hello");
        assert_eq!(last.sender_id, "a");
        assert_eq!(last.sender_name, "Ada");
        assert_eq!(last.group_id, group);
        feed.unsubscribe();

        let preview = b.groups.get(&group).await.unwrap();
        assert_eq!(preview.last_message.as_deref(), Some("hello"));
        assert!(preview.last_message_at.is_some());
    }

    #[tokio::test]
    async fn test_feed_is_time_ordered() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();

        for i in 0..5 {
            a.composer
                .send(&group, &format!("msg {}", i), vec![])
                .await
                .unwrap();
        }

        let mut feed = a.feed.subscribe(&group);
        let list = feed_until(&mut feed, |l| l.len() == 5).await;
        assert!(list.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        let texts: Vec<&str> = list.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn test_feed_only_sees_its_group() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let g1 = a.groups.create_group("One", ["b"]).await.unwrap();
        let g2 = a.groups.create_group("Two", ["b"]).await.unwrap();

        a.composer.send(&g1, "in one", vec![]).await.unwrap();
        a.composer.send(&g2, "in two", vec![]).await.unwrap();

        let mut feed = a.feed.subscribe(&g2);
        let list = feed_until(&mut feed, |l| !l.is_empty()).await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].text, "in two");
    }

    #[tokio::test]
    async fn test_switching_groups_drops_old_feed() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let g1 = a.groups.create_group("One", ["b"]).await.unwrap();
        let g2 = a.groups.create_group("Two", ["b"]).await.unwrap();

        let mut active = ActiveFeed::new(a.feed.clone());
        active.select(&g1);
        assert!(assert_ok!(active.next().await.unwrap()).is_empty());

        active.select(&g2);
        assert_eq!(active.group_id(), Some(g2.as_str()));
        a.composer.send(&g1, "stale", vec![]).await.unwrap();
        a.composer.send(&g2, "fresh", vec![]).await.unwrap();

        let list = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let list = active.next().await.unwrap().unwrap();
                if !list.is_empty() {
                    return list;
                }
            }
        })
        .await
        .unwrap();
        assert!(list.iter().all(|m| m.group_id == g2));
        assert_eq!(list[0].text, "fresh");

        active.clear();
        assert_eq!(active.group_id(), None);
    }

    #[tokio::test]
    async fn test_blank_send_is_noop() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();
        let writes = backend.store.write_count();

        assert_eq!(a.composer.send(&group, "", vec![]).await.unwrap(), None);
        assert_eq!(a.composer.send(&group, " \n\t", vec![]).await.unwrap(), None);
        assert_eq!(backend.store.write_count(), writes);
        assert!(backend.files.paths().is_empty());
    }

    #[tokio::test]
    async fn test_image_attachment_round_trip() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();

        let bytes = vec![0x89, b'P', b'N', b'G', 1, 2, 3];
        let file = LocalFile::new("rally.png", "image/png", bytes.clone());
        let id = a
            .composer
            .send(&group, "photos", vec![file])
            .await
            .unwrap()
            .unwrap();

        let snap = backend.store.get(MESSAGES, &id).await.unwrap().unwrap();
        let msg = Message::from_snapshot(&snap).unwrap();
        assert_eq!(msg.attachments.len(), 1);
        let att = &msg.attachments[0];
        assert_eq!(att.kind, AttachmentKind::Image);
        assert_eq!(att.name, "rally.png");
        assert_eq!(att.size, bytes.len() as u64);
        assert_eq!(backend.files.fetch(&att.url).unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_document_only_message() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();

        let file = LocalFile::new("minutes.pdf", "application/pdf", b"%PDF".to_vec());
        let id = a.composer.send(&group, "", vec![file]).await.unwrap().unwrap();

        let snap = backend.store.get(MESSAGES, &id).await.unwrap().unwrap();
        let msg = Message::from_snapshot(&snap).unwrap();
        assert_eq!(msg.text, "");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0].kind, AttachmentKind::Document);

        let preview = a.groups.get(&group).await.unwrap();
        assert_eq!(preview.last_message.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_attachments_keep_file_order() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();

        let files = vec![
            LocalFile::new("b.mp4", "video/mp4", vec![1]),
            LocalFile::new("a.jpg", "image/jpeg", vec![2]),
            LocalFile::new("c.txt", "text/plain", vec![3]),
        ];
        let id = a.composer.send(&group, "", files).await.unwrap().unwrap();

        let snap = backend.store.get(MESSAGES, &id).await.unwrap().unwrap();
        let msg = Message::from_snapshot(&snap).unwrap();
        let kinds: Vec<AttachmentKind> = msg.attachments.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            vec![AttachmentKind::Video, AttachmentKind::Image, AttachmentKind::Document]
        );
        let names: Vec<&str> = msg.attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["b.mp4", "a.jpg", "c.txt"]);
    }

    #[tokio::test]
    async fn test_oversized_attachment_rejected_before_upload() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let writes = backend.store.write_count();

        let big = LocalFile::new(
            "huge.mov",
            "video/quicktime",
            vec![0; (MAX_ATTACHMENT_BYTES + 1) as usize],
        );
        let result = a.composer.send("g1", "", vec![big]).await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert!(backend.files.paths().is_empty());
        assert_eq!(backend.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_failed_insert_removes_uploads() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();
        backend.store.deny_writes(MESSAGES);

        let file = LocalFile::new("a.png", "image/png", vec![1, 2]);
        let result = a.composer.send(&group, "hi", vec![file]).await;
        assert!(matches!(result, Err(ChatError::Backend(_))));
        assert!(backend.files.paths().is_empty());

        let preview = a.groups.get(&group).await.unwrap();
        assert_eq!(preview.last_message, None);
    }

    #[tokio::test]
    async fn test_failed_upload_removes_earlier_uploads() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();
        backend.files.fail_uploads_after(1);
        let writes = backend.store.write_count();

        let files = vec![
            LocalFile::new("one.png", "image/png", vec![1]),
            LocalFile::new("two.png", "image/png", vec![2]),
        ];
        assert_err!(a.composer.send(&group, "", files).await);
        assert!(backend.files.paths().is_empty());
        assert_eq!(backend.store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_preview_failure_keeps_message() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();
        backend.store.deny_writes(GROUPS);

        let id = a.composer.send(&group, "still sent", vec![]).await.unwrap();
        assert!(id.is_some());

        let preview = a.groups.get(&group).await.unwrap();
        assert_eq!(preview.last_message, None);
    }

    #[tokio::test]
    async fn test_sender_name_is_captured_at_send_time() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let group = a.groups.create_group("Volunteers", ["b"]).await.unwrap();
        let first = a.composer.send(&group, "before", vec![]).await.unwrap().unwrap();
        a.shutdown().await.unwrap();

        let renamed = backend.client("a", "Ada L.").await;
        renamed.composer.send(&group, "after", vec![]).await.unwrap();

        let snap = backend.store.get(MESSAGES, &first).await.unwrap().unwrap();
        assert_eq!(Message::from_snapshot(&snap).unwrap().sender_name, "Ada");

        let mut feed = renamed.feed.subscribe(&group);
        let list = feed_until(&mut feed, |l| l.len() == 2).await;
        assert_eq!(list[1].sender_name, "Ada L.");
    }

    #[tokio::test]
    async fn test_anonymous_sender_name() {
        let backend = Backend::new();
        let auth = Arc::new(MemoryAuth::signed_in(AuthUser::new("x")));
        let mut client = ChatClient::new(auth, backend.store.clone(), backend.files.clone());
        client.start().await.unwrap();

        let group = client.groups.create_group("Quiet", ["b"]).await.unwrap();
        let id = client.composer.send(&group, "hi", vec![]).await.unwrap().unwrap();
        let snap = backend.store.get(MESSAGES, &id).await.unwrap().unwrap();
        assert_eq!(Message::from_snapshot(&snap).unwrap().sender_name, "Anonymous");
    }

    #[tokio::test]
    async fn test_shutdown_marks_offline() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let b = backend.client("b", "Bo").await;

        let mut roster = b.session.watch_roster();
        tokio::time::timeout(
            Duration::from_secs(5),
            roster.wait_for(|r| r.iter().any(|i| i.id == "a" && i.online)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(b.session.online_others().len(), 1);

        a.shutdown().await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            roster.wait_for(|r| r.iter().any(|i| i.id == "a" && !i.online)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(b.session.online_others().is_empty());
    }

    #[tokio::test]
    async fn test_roster_failure_reaches_caller() {
        let store = Arc::new(BrokenRoster {
            inner: MemoryStore::new(),
        });
        let auth = Arc::new(MemoryAuth::signed_in(AuthUser::new("a").with_name("Ada")));
        let mut client = ChatClient::new(auth, store.clone(), Arc::new(MemoryFiles::new()));
        assert!(client.start().await.unwrap().identity().is_some());
        assert!(is_online(store.as_ref(), "a").await);

        let closed = tokio::time::timeout(Duration::from_secs(5), client.session_closed())
            .await
            .unwrap();
        assert!(matches!(closed, Err(ChatError::Backend(_))));

        assert!(matches!(client.session.state(), SessionState::Failed(_)));
        assert!(client.session.roster().is_empty());
        assert!(matches!(
            client.groups.list_groups().await,
            Err(ChatError::Backend(_))
        ));
        assert!(!is_online(store.as_ref(), "a").await);
    }

    #[tokio::test]
    async fn test_shutdown_returns_session_failure() {
        let store = Arc::new(BrokenRoster {
            inner: MemoryStore::new(),
        });
        let auth = Arc::new(MemoryAuth::signed_in(AuthUser::new("a")));
        let mut client = ChatClient::new(auth, store, Arc::new(MemoryFiles::new()));
        client.start().await.unwrap();

        let mut state = client.session.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, SessionState::Failed(_))),
        )
        .await
        .unwrap()
        .unwrap();
        // Let the session task finish after publishing the failure.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_err!(client.shutdown().await);
    }

    #[tokio::test]
    async fn test_failed_send_still_goes_offline() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        assert!(is_online(backend.store.as_ref(), "a").await);

        let big = LocalFile::new(
            "huge.mov",
            "video/quicktime",
            vec![0; (MAX_ATTACHMENT_BYTES + 1) as usize],
        );
        let sent = a.composer.send("g1", "", vec![big]).await;
        let result = a.finish(sent).await;

        assert!(matches!(result, Err(ChatError::Validation(_))));
        assert!(!is_online(backend.store.as_ref(), "a").await);
    }

    #[tokio::test]
    async fn test_finish_passes_value_through() {
        let backend = Backend::new();
        let a = backend.client("a", "Ada").await;
        let value = a.finish(Ok::<_, ChatError>(7)).await.unwrap();
        assert_eq!(value, 7);
        assert!(!is_online(backend.store.as_ref(), "a").await);
    }

    #[tokio::test]
    async fn test_start_reports_presence_failure() {
        let backend = Backend::new();
        backend.store.deny_writes(crate::models::USERS);
        let auth = Arc::new(MemoryAuth::signed_in(AuthUser::new("a")));
        let mut client = ChatClient::new(auth, backend.store.clone(), backend.files.clone());

        assert!(matches!(client.start().await, Err(ChatError::Backend(_))));
    }
}
