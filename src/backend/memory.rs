//! In-process document and file stores.
//!
//! Used by the test suite and the `demo` command. Live queries are driven by a
//! revision counter bumped on every committed write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use super::{Document, DocumentStore, FileStore, Listener, Query, Snapshot, Value};

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, Document>>,
    /// Last server timestamp handed out; each write gets a later one.
    clock: Option<DateTime<Utc>>,
    /// Collections whose writes are rejected, to simulate permission errors.
    denied: HashSet<String>,
    writes: usize,
}

impl StoreState {
    fn server_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let t = match self.clock {
            Some(last) if last >= now => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.clock = Some(t);
        t
    }

    fn check_writable(&self, collection: &str) -> Result<()> {
        if self.denied.contains(collection) {
            bail!("permission denied writing to {}", collection);
        }
        Ok(())
    }

    /// Replace server-timestamp sentinels and merge into the target document.
    fn commit(&mut self, collection: &str, id: &str, fields: Document) {
        let now = self.server_time();
        let doc = self
            .collections
            .entry(collection.to_string())
            .or_default()
            .entry(id.to_string())
            .or_default();
        for (key, value) in fields {
            let value = match value {
                Value::ServerTimestamp => Value::Timestamp(now),
                other => other,
            };
            doc.insert(key, value);
        }
        self.writes += 1;
    }

    fn run_query(&self, collection: &str, query: &Query) -> Vec<Snapshot> {
        let mut results: Vec<Snapshot> = self
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, fields)| query.matches(fields))
                    .map(|(id, fields)| Snapshot {
                        id: id.clone(),
                        fields: fields.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        query.sort(&mut results);
        results
    }
}

fn query_locked(
    state: &Mutex<StoreState>,
    collection: &str,
    query: &Query,
) -> Result<Vec<Snapshot>> {
    let state = state
        .lock()
        .map_err(|_| anyhow!("memory store lock poisoned"))?;
    Ok(state.run_query(collection, query))
}

/// Document store held entirely in memory.
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    revision: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            revision,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Reject every subsequent write to `collection`.
    pub fn deny_writes(&self, collection: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.denied.insert(collection.to_string());
        }
    }

    /// Number of writes committed so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().map(|s| s.writes).unwrap_or(0)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn add(&self, collection: &str, fields: Document) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        {
            let mut state = self.lock()?;
            state.check_writable(collection)?;
            state.commit(collection, &id, fields);
        }
        self.bump();
        tracing::debug!("memory: added {}/{}", collection, id);
        Ok(id)
    }

    async fn set_merge(&self, collection: &str, id: &str, fields: Document) -> Result<()> {
        {
            let mut state = self.lock()?;
            state.check_writable(collection)?;
            state.commit(collection, id, fields);
        }
        self.bump();
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<()> {
        {
            let mut state = self.lock()?;
            state.check_writable(collection)?;
            let exists = state
                .collections
                .get(collection)
                .is_some_and(|docs| docs.contains_key(id));
            if !exists {
                bail!("no document to update: {}/{}", collection, id);
            }
            state.commit(collection, id, fields);
        }
        self.bump();
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Snapshot>> {
        let state = self.lock()?;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| Snapshot {
                id: id.to_string(),
                fields: fields.clone(),
            }))
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Snapshot>> {
        Ok(self.lock()?.run_query(collection, query))
    }

    fn listen(&self, collection: &str, query: Query) -> Listener {
        let state = Arc::clone(&self.state);
        let mut revision = self.revision.subscribe();
        let collection = collection.to_string();

        Listener::spawn(move |tx| async move {
            let mut last: Option<Vec<Snapshot>> = None;
            loop {
                match query_locked(&state, &collection, &query) {
                    Ok(list) => {
                        if last.as_ref() != Some(&list) {
                            tracing::debug!(
                                "memory: {} snapshot with {} documents",
                                collection,
                                list.len()
                            );
                            last = Some(list.clone());
                            if tx.send(Ok(list)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
                // Store dropped: no further changes can happen.
                if revision.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Object store held entirely in memory. Download addresses use a
/// `memory://` scheme and resolve through [`MemoryFiles::fetch`].
#[derive(Default)]
pub struct MemoryFiles {
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
    fail_uploads_after: Mutex<Option<usize>>,
}

const MEMORY_SCHEME: &str = "memory://";

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, (Vec<u8>, String)>>> {
        self.objects
            .lock()
            .map_err(|_| anyhow!("memory file store lock poisoned"))
    }

    /// Let `n` more uploads succeed, then fail the rest.
    pub fn fail_uploads_after(&self, n: usize) {
        if let Ok(mut limit) = self.fail_uploads_after.lock() {
            *limit = Some(n);
        }
    }

    /// Retrieve an object by its download address.
    pub fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let path = url
            .strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| anyhow!("not a memory address: {}", url))?;
        self.lock()?
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| anyhow!("no object at {}", path))
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .lock()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        paths.sort();
        paths
    }
}

#[async_trait]
impl FileStore for MemoryFiles {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        if let Ok(mut limit) = self.fail_uploads_after.lock() {
            match limit.as_mut() {
                Some(0) => bail!("upload quota exceeded"),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        self.lock()?
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn download_url(&self, path: &str) -> Result<String> {
        if !self.lock()?.contains_key(path) {
            bail!("no object at {}", path);
        }
        Ok(format!("{}{}", MEMORY_SCHEME, path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.lock()?.remove(path);
        Ok(())
    }
}
