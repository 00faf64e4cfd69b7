//! Email/password accounts on the hosted identity service.
//!
//! Tokens are persisted in [`Config`] so later invocations stay signed in.
//! The ID token is refreshed from the stored refresh token when it is within
//! the expiry margin.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};

use super::{AuthProvider, AuthState, AuthUser, TokenStore};
use crate::backend::client::check_response;
use crate::config::Config;

const IDENTITY_BASE: &str = "https://identitytoolkit.googleapis.com/v1";
const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1/token";

/// Response of `accounts:signInWithPassword`, `accounts:signUp` and `accounts:update`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<String>,
    local_id: String,
    email: Option<String>,
    display_name: Option<String>,
    #[serde(rename = "photoUrl")]
    photo_url: Option<String>,
}

impl AccountResponse {
    fn user(&self) -> AuthUser {
        AuthUser {
            uid: self.local_id.clone(),
            display_name: non_empty(self.display_name.as_deref()),
            email: non_empty(self.email.as_deref()),
            photo_url: non_empty(self.photo_url.as_deref()),
        }
    }
}

/// Response of the refresh-token grant. Field names are snake_case here.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: String,
    user_id: String,
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.filter(|v| !v.is_empty()).map(String::from)
}

/// Expiry is sent as a decimal string of seconds.
fn parse_expiry(expires_in: Option<&str>) -> Option<u64> {
    expires_in.and_then(|s| s.trim().parse().ok())
}

pub struct FirebaseAuth {
    http: reqwest::Client,
    api_key: String,
    config: Mutex<Config>,
    state: watch::Sender<AuthState>,
}

impl FirebaseAuth {
    /// Build from a loaded config. The initial state comes from the stored account.
    pub fn new(config: Config) -> Result<Self> {
        let settings = config.backend()?;
        let initial = match config.stored_user() {
            Some(user) => AuthState::SignedIn(user),
            None => AuthState::SignedOut,
        };
        let (state, _) = watch::channel(initial);

        Ok(Self {
            http: reqwest::Client::new(),
            api_key: settings.api_key,
            config: Mutex::new(config),
            state,
        })
    }

    /// Current ID token, refreshing it first if it has expired.
    pub async fn id_token(&self) -> Result<String> {
        let mut config = self.config.lock().await;
        if let Some(token) = config.get_id_token() {
            if !token.is_expired() {
                return Ok(token.token);
            }
        }

        let refresh_token = config
            .get_refresh_token()
            .context("Not signed in. Run 'cause-chat login' first.")?;

        tracing::info!("ID token missing or expired, refreshing...");
        let refreshed = self.refresh(&refresh_token).await?;
        config.set_id_token(
            refreshed.id_token.clone(),
            parse_expiry(Some(&refreshed.expires_in)),
        );
        config.set_refresh_token(refreshed.refresh_token);
        if config.user_id.as_deref() != Some(refreshed.user_id.as_str()) {
            tracing::warn!("Refresh returned a different account; updating stored user id");
            config.user_id = Some(refreshed.user_id);
        }
        config.save()?;
        tracing::info!("Token refreshed");

        Ok(refreshed.id_token)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse> {
        let resp = self
            .http
            .post(SECURE_TOKEN_URL)
            .query(&[("key", self.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .context("Token refresh request failed")?;

        check_response(resp, SECURE_TOKEN_URL)
            .await?
            .json()
            .await
            .context("Failed to parse token refresh response")
    }

    async fn accounts_call(&self, method: &str, body: &serde_json::Value) -> Result<AccountResponse> {
        let url = format!("{}/accounts:{}", IDENTITY_BASE, method);
        tracing::debug!("Identity POST {}", url);

        let resp = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await
            .with_context(|| format!("Identity {} failed", method))?;

        check_response(resp, &url)
            .await?
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", method))
    }

    /// Store tokens and account from a sign-in style response, then publish the new state.
    async fn establish(&self, account: &AccountResponse) -> Result<AuthUser> {
        let user = account.user();
        {
            let mut config = self.config.lock().await;
            if let Some(ref token) = account.id_token {
                config.set_id_token(token.clone(), parse_expiry(account.expires_in.as_deref()));
            }
            if let Some(ref rt) = account.refresh_token {
                config.set_refresh_token(rt.clone());
            }
            config.set_user(&user);
            config.save()?;
        }
        self.state.send_replace(AuthState::SignedIn(user.clone()));
        Ok(user)
    }
}

#[async_trait]
impl AuthProvider for FirebaseAuth {
    fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true
        });
        let account = self.accounts_call("signInWithPassword", &body).await?;
        let user = self.establish(&account).await?;
        tracing::info!("Signed in as {}", user.uid);
        Ok(user)
    }

    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> Result<AuthUser> {
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "returnSecureToken": true
        });
        let created = self.accounts_call("signUp", &body).await?;
        let id_token = created
            .id_token
            .clone()
            .context("Sign-up response carried no ID token")?;

        let profile = serde_json::json!({
            "idToken": id_token,
            "displayName": display_name,
            "returnSecureToken": true
        });
        let mut updated = self.accounts_call("update", &profile).await?;
        // The update response may omit tokens; keep the ones from sign-up.
        if updated.id_token.is_none() {
            updated.id_token = created.id_token;
            updated.expires_in = created.expires_in;
        }
        if updated.refresh_token.is_none() {
            updated.refresh_token = created.refresh_token;
        }

        let user = self.establish(&updated).await?;
        tracing::info!("Created account {}", user.uid);
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        {
            let mut config = self.config.lock().await;
            config.clear_tokens();
            config.save()?;
        }
        self.state.send_replace(AuthState::SignedOut);
        Ok(())
    }
}
