//! Hosted document database over its REST interface
//!
//! Writes go through `documents:commit` so server timestamps can be applied
//! as field transforms. Live queries poll `documents:runQuery` and emit a
//! snapshot whenever the result set differs from the previous poll.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};

use super::client::FirebaseClient;
use super::{Document, DocumentStore, Filter, Listener, Query, Snapshot, Value};

const FIRESTORE_BASE: &str = "https://firestore.googleapis.com/v1";

// -- Value codec --

/// Encode a value as the typed JSON the REST interface expects.
pub fn encode_value(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Integer(i) => json!({ "integerValue": i.to_string() }),
        Value::Double(d) => json!({ "doubleValue": d }),
        Value::String(s) => json!({ "stringValue": s }),
        Value::Timestamp(t) => {
            json!({ "timestampValue": t.to_rfc3339_opts(SecondsFormat::Micros, true) })
        }
        Value::Array(items) => {
            let values = items
                .iter()
                .map(encode_value)
                .collect::<Result<Vec<_>>>()?;
            json!({ "arrayValue": { "values": values } })
        }
        Value::Map(fields) => {
            let mut encoded = serde_json::Map::new();
            for (key, v) in fields {
                encoded.insert(key.clone(), encode_value(v)?);
            }
            json!({ "mapValue": { "fields": encoded } })
        }
        Value::ServerTimestamp => bail!("server timestamps are only allowed as top-level fields"),
    })
}

pub fn decode_value(json: &serde_json::Value) -> Result<Value> {
    let obj = json.as_object().context("value is not an object")?;
    let (kind, inner) = obj.iter().next().context("empty value object")?;

    Ok(match kind.as_str() {
        "nullValue" => Value::Null,
        "booleanValue" => Value::Bool(inner.as_bool().context("booleanValue is not a bool")?),
        // 64-bit integers travel as decimal strings.
        "integerValue" => {
            let i = match inner {
                serde_json::Value::String(s) => s
                    .parse()
                    .with_context(|| format!("bad integerValue {}", s))?,
                other => other.as_i64().context("integerValue is not an integer")?,
            };
            Value::Integer(i)
        }
        "doubleValue" => Value::Double(inner.as_f64().context("doubleValue is not a number")?),
        "stringValue" => Value::String(
            inner
                .as_str()
                .context("stringValue is not a string")?
                .to_string(),
        ),
        "timestampValue" => {
            let s = inner.as_str().context("timestampValue is not a string")?;
            let t = DateTime::parse_from_rfc3339(s)
                .with_context(|| format!("bad timestampValue {}", s))?;
            Value::Timestamp(t.with_timezone(&Utc))
        }
        "arrayValue" => {
            let values = match inner.get("values").and_then(|v| v.as_array()) {
                Some(items) => items
                    .iter()
                    .map(decode_value)
                    .collect::<Result<Vec<_>>>()?,
                None => Vec::new(),
            };
            Value::Array(values)
        }
        "mapValue" => Value::Map(decode_fields(inner.get("fields"))?),
        other => bail!("unsupported value type {}", other),
    })
}

fn decode_fields(fields: Option<&serde_json::Value>) -> Result<Document> {
    let mut doc = Document::new();
    if let Some(obj) = fields.and_then(|f| f.as_object()) {
        for (key, v) in obj {
            doc.insert(
                key.clone(),
                decode_value(v).with_context(|| format!("field {}", key))?,
            );
        }
    }
    Ok(doc)
}

/// Split top-level fields into encoded values and server-timestamp transforms.
fn encode_fields(fields: &Document) -> Result<(serde_json::Map<String, serde_json::Value>, Vec<String>)> {
    let mut encoded = serde_json::Map::new();
    let mut server_time = Vec::new();
    for (key, value) in fields {
        match value {
            Value::ServerTimestamp => server_time.push(key.clone()),
            other => {
                encoded.insert(key.clone(), encode_value(other)?);
            }
        }
    }
    Ok((encoded, server_time))
}

/// Decode a REST document resource into a snapshot keyed by its last path segment.
pub fn decode_document(json: &serde_json::Value) -> Result<Snapshot> {
    let name = json
        .get("name")
        .and_then(|n| n.as_str())
        .context("document without a name")?;
    let id = name
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("bad document name {}", name))?;

    Ok(Snapshot {
        id: id.to_string(),
        fields: decode_fields(json.get("fields")).with_context(|| format!("document {}", name))?,
    })
}

fn field_filter(filter: &Filter) -> Result<serde_json::Value> {
    let (field, op, value) = match filter {
        Filter::Equal(f, v) => (f, "EQUAL", v),
        Filter::ArrayContains(f, v) => (f, "ARRAY_CONTAINS", v),
    };
    Ok(json!({
        "fieldFilter": {
            "field": { "fieldPath": field },
            "op": op,
            "value": encode_value(value)?
        }
    }))
}

/// Build the `structuredQuery` body for a collection query.
pub fn structured_query(collection: &str, query: &Query) -> Result<serde_json::Value> {
    let mut body = json!({ "from": [{ "collectionId": collection }] });

    let mut filters = query
        .filters
        .iter()
        .map(field_filter)
        .collect::<Result<Vec<_>>>()?;
    match filters.len() {
        0 => {}
        1 => body["where"] = filters.remove(0),
        _ => {
            body["where"] = json!({
                "compositeFilter": { "op": "AND", "filters": filters }
            })
        }
    }

    if !query.order_by.is_empty() {
        let mut order: Vec<serde_json::Value> = query
            .order_by
            .iter()
            .map(|f| json!({ "field": { "fieldPath": f }, "direction": "ASCENDING" }))
            .collect();
        // Document name as the final key makes ties deterministic.
        order.push(json!({ "field": { "fieldPath": "__name__" }, "direction": "ASCENDING" }));
        body["orderBy"] = serde_json::Value::Array(order);
    }

    Ok(json!({ "structuredQuery": body }))
}

/// Snapshots out of a `runQuery` response stream.
pub fn decode_run_query(json: &serde_json::Value) -> Result<Vec<Snapshot>> {
    let items = json.as_array().context("runQuery response is not an array")?;
    items
        .iter()
        .filter_map(|item| item.get("document"))
        .map(decode_document)
        .collect()
}

#[derive(Clone)]
pub struct Firestore {
    client: FirebaseClient,
    project_id: String,
    poll_interval: Duration,
}

impl Firestore {
    pub fn new(client: FirebaseClient, project_id: String, poll_interval: Duration) -> Self {
        Self {
            client,
            project_id,
            poll_interval,
        }
    }

    fn database(&self) -> String {
        format!("projects/{}/databases/(default)", self.project_id)
    }

    fn document_name(&self, collection: &str, id: &str) -> String {
        format!("{}/documents/{}/{}", self.database(), collection, id)
    }

    /// Build one write. `merge` adds an update mask; `exists` adds a precondition.
    fn build_write(
        &self,
        collection: &str,
        id: &str,
        fields: &Document,
        merge: bool,
        exists: Option<bool>,
    ) -> Result<serde_json::Value> {
        let (encoded, server_time) = encode_fields(fields)?;
        let mask: Vec<String> = encoded.keys().cloned().collect();

        let mut write = json!({
            "update": {
                "name": self.document_name(collection, id),
                "fields": encoded
            }
        });
        if merge {
            write["updateMask"] = json!({ "fieldPaths": mask });
        }
        if !server_time.is_empty() {
            let transforms: Vec<serde_json::Value> = server_time
                .iter()
                .map(|f| json!({ "fieldPath": f, "setToServerValue": "REQUEST_TIME" }))
                .collect();
            write["updateTransforms"] = serde_json::Value::Array(transforms);
        }
        if let Some(exists) = exists {
            write["currentDocument"] = json!({ "exists": exists });
        }
        Ok(write)
    }

    async fn commit(&self, write: serde_json::Value) -> Result<()> {
        let url = format!("{}/{}/documents:commit", FIRESTORE_BASE, self.database());
        let body = json!({ "writes": [write] });
        self.client.post_json(&url, &body).await?;
        Ok(())
    }

    async fn run_query(&self, collection: &str, query: &Query) -> Result<Vec<Snapshot>> {
        let url = format!("{}/{}/documents:runQuery", FIRESTORE_BASE, self.database());
        let body = structured_query(collection, query)?;

        let resp = self.client.post_json(&url, &body).await?;
        let json: serde_json::Value = resp
            .json()
            .await
            .context("Failed to parse runQuery response")?;

        let mut snapshots = decode_run_query(&json)?;
        query.sort(&mut snapshots);
        Ok(snapshots)
    }
}

#[async_trait]
impl DocumentStore for Firestore {
    async fn add(&self, collection: &str, fields: Document) -> Result<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let write = self.build_write(collection, &id, &fields, false, Some(false))?;
        self.commit(write)
            .await
            .with_context(|| format!("Failed to create {}/{}", collection, id))?;
        Ok(id)
    }

    async fn set_merge(&self, collection: &str, id: &str, fields: Document) -> Result<()> {
        let write = self.build_write(collection, id, &fields, true, None)?;
        self.commit(write)
            .await
            .with_context(|| format!("Failed to write {}/{}", collection, id))
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> Result<()> {
        let write = self.build_write(collection, id, &fields, true, Some(true))?;
        self.commit(write)
            .await
            .with_context(|| format!("Failed to update {}/{}", collection, id))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Snapshot>> {
        let url = format!(
            "{}/{}",
            FIRESTORE_BASE,
            self.document_name(collection, id)
        );
        match self.client.get_optional(&url).await? {
            Some(resp) => {
                let json: serde_json::Value = resp
                    .json()
                    .await
                    .context("Failed to parse document response")?;
                decode_document(&json).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Snapshot>> {
        self.run_query(collection, query).await
    }

    fn listen(&self, collection: &str, query: Query) -> Listener {
        let store = self.clone();
        let every = self.poll_interval;
        let label = collection.to_string();
        let collection = collection.to_string();

        Listener::spawn(move |tx| {
            poll_changes(tx, every, label, move || {
                let store = store.clone();
                let collection = collection.clone();
                let query = query.clone();
                async move { store.run_query(&collection, &query).await }
            })
        })
    }
}

/// Re-run `fetch` every `every` and forward each result that differs from
/// the previous one. The first failure is forwarded and ends the loop.
async fn poll_changes<F, Fut>(
    tx: mpsc::Sender<Result<Vec<Snapshot>>>,
    every: Duration,
    label: String,
    mut fetch: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<Snapshot>>>,
{
    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<Vec<Snapshot>> = None;

    loop {
        ticker.tick().await;
        if tx.is_closed() {
            break;
        }
        match fetch().await {
            Ok(list) => {
                if last.as_ref() == Some(&list) {
                    continue;
                }
                tracing::debug!("{} snapshot with {} documents", label, list.len());
                last = Some(list.clone());
                if tx.send(Ok(list)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Live query on {} failed: {:#}", label, e);
                let _ = tx.send(Err(e)).await;
                break;
            }
        }
    }
}
