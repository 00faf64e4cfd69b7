//! Authenticated HTTP client for the hosted backend
//!
//! Wraps reqwest::Client with ID-token injection; the token is refreshed by
//! [`FirebaseAuth`] when needed.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::auth::firebase::FirebaseAuth;

#[derive(Clone)]
pub struct FirebaseClient {
    http: reqwest::Client,
    auth: Arc<FirebaseAuth>,
}

impl FirebaseClient {
    pub fn new(auth: Arc<FirebaseAuth>) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth,
        }
    }

    /// GET, treating 404 as `None`.
    pub async fn get_optional(&self, url: &str) -> Result<Option<reqwest::Response>> {
        let token = self.auth.id_token().await?;
        tracing::debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_response(resp, url).await.map(Some)
    }

    pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
        match self.get_optional(url).await? {
            Some(resp) => Ok(resp),
            None => bail!("HTTP 404 for {}", url),
        }
    }

    /// POST a JSON body.
    pub async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<reqwest::Response> {
        let token = self.auth.id_token().await?;
        tracing::debug!("POST {}", url);

        let resp = self
            .http
            .post(url)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, url).await
    }

    /// POST raw bytes with the given content type.
    pub async fn post_bytes(
        &self,
        url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<reqwest::Response> {
        let token = self.auth.id_token().await?;
        tracing::debug!("POST {} ({} bytes, {})", url, bytes.len(), content_type);

        let resp = self
            .http
            .post(url)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        check_response(resp, url).await
    }

    pub async fn delete(&self, url: &str) -> Result<()> {
        let token = self.auth.id_token().await?;
        tracing::debug!("DELETE {}", url);

        let resp = self
            .http
            .delete(url)
            .bearer_auth(&token)
            .send()
            .await
            .with_context(|| format!("DELETE {} failed", url))?;

        check_response(resp, url).await?;
        Ok(())
    }
}

/// Check HTTP response status code and return a clear error on failure.
pub async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        bail!(
            "401 Unauthorized for {}. Token may be invalid -- run 'cause-chat login'.",
            url
        );
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("HTTP {} for {}: {}", status.as_u16(), url, body);
    }
    Ok(resp)
}
