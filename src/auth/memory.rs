//! In-process auth provider with a local account table.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::watch;

use super::{AuthProvider, AuthState, AuthUser};

struct Account {
    password: String,
    user: AuthUser,
}

pub struct MemoryAuth {
    state: watch::Sender<AuthState>,
    accounts: Mutex<HashMap<String, Account>>,
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuth {
    /// Provider that has not reported a state yet.
    pub fn new() -> Self {
        let (state, _) = watch::channel(AuthState::Pending);
        Self {
            state,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Provider already signed in as `user`.
    pub fn signed_in(user: AuthUser) -> Self {
        let auth = Self::new();
        auth.set_user(Some(user));
        auth
    }

    /// Report a sign-in state change directly.
    pub fn set_user(&self, user: Option<AuthUser>) {
        let next = match user {
            Some(u) => AuthState::SignedIn(u),
            None => AuthState::SignedOut,
        };
        self.state.send_replace(next);
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser> {
        let user = {
            let accounts = self
                .accounts
                .lock()
                .map_err(|_| anyhow!("account table lock poisoned"))?;
            match accounts.get(email) {
                Some(acct) if acct.password == password => acct.user.clone(),
                _ => bail!("invalid email or password"),
            }
        };
        self.set_user(Some(user.clone()));
        Ok(user)
    }

    async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> Result<AuthUser> {
        let user = {
            let mut accounts = self
                .accounts
                .lock()
                .map_err(|_| anyhow!("account table lock poisoned"))?;
            if accounts.contains_key(email) {
                bail!("email already in use: {}", email);
            }
            let user = AuthUser::new(uuid::Uuid::new_v4().simple().to_string())
                .with_name(display_name)
                .with_email(email);
            accounts.insert(
                email.to_string(),
                Account {
                    password: password.to_string(),
                    user: user.clone(),
                },
            );
            user
        };
        self.set_user(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        self.set_user(None);
        Ok(())
    }
}
