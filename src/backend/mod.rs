//! Storage backends: document collections, file objects and live queries.
//!
//! The chat core only sees the [`DocumentStore`] and [`FileStore`] traits.
//! `memory` implements them in-process; `firestore` and `storage` talk to
//! the hosted service over HTTPS.

pub mod client;
pub mod firestore;
pub mod memory;
pub mod storage;
mod value;

pub use value::{Document, Filter, Query, Snapshot, Value};

use std::future::Future;
use std::task::{Context, Poll};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capacity of the channel between a live-query pump and its consumer.
const LISTENER_BUFFER: usize = 16;

/// Collections of schemaless documents keyed by id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document with a store-assigned id and return the id.
    async fn add(&self, collection: &str, fields: Document) -> Result<String>;

    /// Write the given fields, leaving other fields of an existing document untouched.
    async fn set_merge(&self, collection: &str, id: &str, fields: Document) -> Result<()>;

    /// Like `set_merge`, but fails if the document does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<()>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Snapshot>>;

    /// One-shot filtered read.
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Snapshot>>;

    /// Live filtered read. The listener yields the full result set once on
    /// start and again every time it changes.
    fn listen(&self, collection: &str, query: Query) -> Listener;
}

/// Binary objects addressed by path.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Publicly retrievable address of an uploaded object.
    async fn download_url(&self, path: &str) -> Result<String>;

    async fn delete(&self, path: &str) -> Result<()>;
}

/// Handle on a running live query.
///
/// The pump task is aborted when the handle is dropped.
pub struct Listener {
    rx: mpsc::Receiver<Result<Vec<Snapshot>>>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Spawn `pump` with the sending half of a fresh channel.
    pub fn spawn<F, Fut>(pump: F) -> Self
    where
        F: FnOnce(mpsc::Sender<Result<Vec<Snapshot>>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let task = tokio::spawn(pump(tx));
        Self { rx, task }
    }

    /// Next snapshot, or `None` once the pump has stopped.
    pub async fn recv(&mut self) -> Option<Result<Vec<Snapshot>>> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Vec<Snapshot>>>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.task.abort();
    }
}
