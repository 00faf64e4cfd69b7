//! Authentication providers
//!
//! A provider owns the signed-in account and publishes every change as an
//! [`AuthState`] on a watch channel. The session store is its only observer.

pub mod firebase;
pub mod memory;
pub mod tokens;

pub use tokens::{StoredToken, TokenStore};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Account details reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
}

impl AuthUser {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: None,
            email: None,
            photo_url: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Sign-in state as last reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthState {
    /// The provider has not reported anything yet.
    #[default]
    Pending,
    SignedOut,
    SignedIn(AuthUser),
}

impl AuthState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            AuthState::SignedIn(user) => Some(user),
            _ => None,
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Receiver for sign-in state changes.
    fn subscribe(&self) -> watch::Receiver<AuthState>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser>;

    /// Create an account and sign into it.
    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> Result<AuthUser>;

    async fn sign_out(&self) -> Result<()>;
}
