//! Hosted object storage for attachments

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::client::FirebaseClient;
use super::FileStore;

const STORAGE_BASE: &str = "https://firebasestorage.googleapis.com/v0/b";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    name: Option<String>,
    /// Comma-separated list of tokens granting public read access.
    download_tokens: Option<String>,
}

pub struct FirebaseStorage {
    client: FirebaseClient,
    bucket: String,
}

impl FirebaseStorage {
    pub fn new(client: FirebaseClient, bucket: String) -> Self {
        Self { client, bucket }
    }

    fn bucket_url(&self) -> Result<Url> {
        Url::parse(&format!("{}/{}/o", STORAGE_BASE, self.bucket))
            .with_context(|| format!("Bad bucket name {}", self.bucket))
    }

    /// URL of one object; the whole path is a single percent-encoded segment.
    fn object_url(&self, path: &str) -> Result<Url> {
        let mut url = self.bucket_url()?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("storage URL cannot take path segments"))?
            .push(path);
        Ok(url)
    }
}

/// Public address for an object given one of its download tokens.
fn public_url(mut object_url: Url, token: &str) -> String {
    object_url
        .query_pairs_mut()
        .append_pair("alt", "media")
        .append_pair("token", token);
    object_url.to_string()
}

#[async_trait]
impl FileStore for FirebaseStorage {
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let mut url = self.bucket_url()?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", path);

        let resp = self
            .client
            .post_bytes(url.as_str(), bytes, content_type)
            .await
            .with_context(|| format!("Upload of {} failed", path))?;
        let meta: ObjectMetadata = resp
            .json()
            .await
            .context("Failed to parse upload response")?;
        tracing::debug!("Uploaded {}", meta.name.as_deref().unwrap_or(path));
        Ok(())
    }

    async fn download_url(&self, path: &str) -> Result<String> {
        let url = self.object_url(path)?;
        let resp = self.client.get(url.as_str()).await?;
        let meta: ObjectMetadata = resp
            .json()
            .await
            .context("Failed to parse object metadata")?;

        let token = meta
            .download_tokens
            .as_deref()
            .and_then(|t| t.split(',').next())
            .filter(|t| !t.is_empty())
            .with_context(|| format!("Object {} has no download token", path))?;

        Ok(public_url(url, token))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let url = self.object_url(path)?;
        self.client.delete(url.as_str()).await
    }
}
