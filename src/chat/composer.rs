//! Composer: turns text and local files into a stored message.
//!
//! Attachments are uploaded one at a time, in the order given, and each
//! address is resolved before the next upload starts. The message insert
//! and the group preview update are separate writes; only the first can
//! fail the send.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use super::SessionStore;
use crate::backend::{DocumentStore, FileStore};
use crate::error::{ChatError, ChatResult};
use crate::models::{Attachment, AttachmentKind, Group, Message, GROUPS, MESSAGES};

/// Largest accepted attachment.
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Storage prefix for chat uploads.
const ATTACHMENT_ROOT: &str = "chat-attachments";

/// A file picked for sending.
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub name: String,
    /// Declared MIME type.
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl LocalFile {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Attachment path has no file name")?
            .to_string();
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::new(name, content_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

pub struct Composer {
    session: Arc<SessionStore>,
    store: Arc<dyn DocumentStore>,
    files: Arc<dyn FileStore>,
    /// Last millisecond prefix used for an upload path; strictly increasing.
    last_prefix: AtomicI64,
}

impl Composer {
    pub fn new(
        session: Arc<SessionStore>,
        store: Arc<dyn DocumentStore>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            session,
            store,
            files,
            last_prefix: AtomicI64::new(0),
        }
    }

    /// Current time in milliseconds, bumped past any prefix already handed out.
    fn next_prefix(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_prefix.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match self
                .last_prefix
                .compare_exchange(last, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    fn storage_path(&self, group_id: &str, file_name: &str) -> String {
        format!(
            "{}/{}/{}-{}",
            ATTACHMENT_ROOT,
            group_id,
            self.next_prefix(),
            file_name
        )
    }

    /// Send a message to `group_id`.
    ///
    /// Returns `Ok(None)` without touching the backend when the text is blank
    /// and there are no files. Otherwise returns the new message id.
    pub async fn send(
        &self,
        group_id: &str,
        text: &str,
        files: Vec<LocalFile>,
    ) -> ChatResult<Option<String>> {
        if text.trim().is_empty() && files.is_empty() {
            return Ok(None);
        }
        let me = self.session.require()?;

        if let Some(big) = files.iter().find(|f| f.size() > MAX_ATTACHMENT_BYTES) {
            return Err(ChatError::Validation(format!(
                "{} is larger than {} MiB",
                big.name,
                MAX_ATTACHMENT_BYTES / (1024 * 1024)
            )));
        }

        let mut uploaded: Vec<String> = Vec::with_capacity(files.len());
        let mut attachments: Vec<Attachment> = Vec::with_capacity(files.len());
        for file in files {
            match self.upload(group_id, file, &mut uploaded).await {
                Ok(att) => attachments.push(att),
                Err(e) => {
                    self.discard(&uploaded).await;
                    return Err(e);
                }
            }
        }

        let sender_name = me
            .display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or("Anonymous");
        let fields = Message::new_fields(group_id, text, &me.id, sender_name, &attachments);

        let message_id = match self.store.add(MESSAGES, fields).await {
            Ok(id) => id,
            Err(e) => {
                self.discard(&uploaded).await;
                return Err(e.into());
            }
        };
        tracing::debug!(
            "Sent message {} to {} with {} attachments",
            message_id,
            group_id,
            attachments.len()
        );

        if let Err(e) = self
            .store
            .update(GROUPS, group_id, Group::preview_fields(text))
            .await
        {
            tracing::warn!("Failed to update preview of group {}: {:#}", group_id, e);
        }

        Ok(Some(message_id))
    }

    /// Upload one file and resolve its address. The path is recorded as
    /// soon as the upload succeeds so it can be cleaned up later.
    async fn upload(
        &self,
        group_id: &str,
        file: LocalFile,
        uploaded: &mut Vec<String>,
    ) -> ChatResult<Attachment> {
        let path = self.storage_path(group_id, &file.name);
        let size = file.size();
        let kind = AttachmentKind::from_mime(&file.content_type);

        self.files
            .upload(&path, file.bytes, &file.content_type)
            .await?;
        uploaded.push(path.clone());
        let url = self.files.download_url(&path).await?;

        Ok(Attachment {
            kind,
            url,
            name: file.name,
            size,
        })
    }

    /// Best-effort removal of uploads belonging to a send that failed.
    async fn discard(&self, paths: &[String]) {
        for path in paths {
            if let Err(e) = self.files.delete(path).await {
                tracing::warn!("Failed to remove orphaned upload {}: {:#}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryAuth;
    use crate::backend::memory::{MemoryFiles, MemoryStore};

    #[test]
    fn test_prefix_strictly_increasing() {
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionStore::new(Arc::new(MemoryAuth::new()), store.clone()));
        let composer = Composer::new(session, store, Arc::new(MemoryFiles::new()));

        let a = composer.next_prefix();
        let b = composer.next_prefix();
        let c = composer.next_prefix();
        assert!(a < b && b < c);

        let p1 = composer.storage_path("g1", "a.png");
        let p2 = composer.storage_path("g1", "a.png");
        assert_ne!(p1, p2);
        assert!(p1.starts_with("chat-attachments/g1/"));
        assert!(p1.ends_with("-a.png"));
    }

    #[tokio::test]
    async fn test_local_file_read_guesses_mime() {
        let dir = std::env::temp_dir().join(format!("cause-chat-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("flyer.pdf");
        tokio::fs::write(&path, b"%PDF-1.4").await.unwrap();

        let file = LocalFile::read(&path).await.unwrap();
        assert_eq!(file.name, "flyer.pdf");
        assert_eq!(file.content_type, "application/pdf");
        assert_eq!(file.size(), 8);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_send_without_session_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionStore::new(Arc::new(MemoryAuth::new()), store.clone()));
        let composer = Composer::new(session, store.clone(), Arc::new(MemoryFiles::new()));

        let result = composer.send("g1", "   ", vec![]).await.unwrap();
        assert_eq!(result, None);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_send_requires_session() {
        let store = Arc::new(MemoryStore::new());
        let session = Arc::new(SessionStore::new(Arc::new(MemoryAuth::new()), store.clone()));
        let composer = Composer::new(session, store.clone(), Arc::new(MemoryFiles::new()));

        let result = composer.send("g1", "hi", vec![]).await;
        assert!(matches!(result, Err(ChatError::Unauthenticated)));
        assert_eq!(store.write_count(), 0);
    }
}
