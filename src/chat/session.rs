//! Session store: the signed-in identity and the roster of known users.
//!
//! State follows the auth provider. Nothing here is retried; a failed
//! presence write or roster subscription ends [`SessionStore::run`] with the
//! error and leaves the store in [`SessionState::Failed`].

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::watch;

use super::Subscription;
use crate::auth::{AuthProvider, AuthState, AuthUser};
use crate::backend::{DocumentStore, Query, Snapshot, Value};
use crate::error::{ChatError, ChatResult};
use crate::models::{Identity, USERS};

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionState {
    /// No auth notification has arrived yet.
    #[default]
    Loading,
    SignedOut,
    SignedIn(Identity),
    /// The session loop stopped on a backend error.
    Failed(String),
}

impl SessionState {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            SessionState::SignedIn(identity) => Some(identity),
            _ => None,
        }
    }
}

fn decode_roster(snapshots: &[Snapshot]) -> ChatResult<Vec<Identity>> {
    snapshots.iter().map(Identity::from_snapshot).collect()
}

/// What woke the session loop.
enum Wake {
    Auth(bool),
    Roster(Option<ChatResult<Vec<Identity>>>),
}

async fn next_roster(roster: &mut Option<Subscription<Identity>>) -> Option<ChatResult<Vec<Identity>>> {
    match roster {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

pub struct SessionStore {
    auth: Arc<dyn AuthProvider>,
    store: Arc<dyn DocumentStore>,
    state: watch::Sender<SessionState>,
    roster: watch::Sender<Vec<Identity>>,
}

impl SessionStore {
    pub fn new(auth: Arc<dyn AuthProvider>, store: Arc<dyn DocumentStore>) -> Self {
        let (state, _) = watch::channel(SessionState::Loading);
        let (roster, _) = watch::channel(Vec::new());
        Self {
            auth,
            store,
            state,
            roster,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Loading)
    }

    pub fn current(&self) -> Option<Identity> {
        self.state.borrow().identity().cloned()
    }

    /// The active identity, or [`ChatError::Unauthenticated`].
    pub fn require(&self) -> ChatResult<Identity> {
        match &*self.state.borrow() {
            SessionState::SignedIn(identity) => Ok(identity.clone()),
            SessionState::Failed(reason) => {
                Err(ChatError::Backend(anyhow!("session failed: {}", reason)))
            }
            _ => Err(ChatError::Unauthenticated),
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Latest roster snapshot.
    pub fn roster(&self) -> Vec<Identity> {
        self.roster.borrow().clone()
    }

    pub fn watch_roster(&self) -> watch::Receiver<Vec<Identity>> {
        self.roster.subscribe()
    }

    /// Online identities other than the current one.
    pub fn online_others(&self) -> Vec<Identity> {
        let me = self.current().map(|i| i.id);
        self.roster
            .borrow()
            .iter()
            .filter(|i| i.online && Some(&i.id) != me.as_ref())
            .cloned()
            .collect()
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> ChatResult<AuthUser> {
        Ok(self.auth.sign_in(email, password).await?)
    }

    /// Create an account and its identity record.
    pub async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> ChatResult<AuthUser> {
        if display_name.trim().is_empty() {
            return Err(ChatError::Validation("display name is empty".into()));
        }
        let user = self.auth.sign_up(email, password, display_name).await?;
        let identity = Identity::online(&user, Utc::now());
        self.store
            .set_merge(USERS, &identity.id, identity.to_fields())
            .await?;
        Ok(user)
    }

    /// Presence is cleared while the credentials are still valid.
    pub async fn sign_out(&self) -> ChatResult<()> {
        if let Some(me) = self.current() {
            self.mark_offline(&me.id).await;
            self.state.send_replace(SessionState::SignedOut);
        }
        Ok(self.auth.sign_out().await?)
    }

    /// Follow the auth provider until it goes away.
    ///
    /// Each sign-in writes an online presence record and opens a roster
    /// subscription; each sign-out or account switch marks the previous
    /// identity offline. On error the identity is marked offline and the
    /// state becomes [`SessionState::Failed`] before the error is returned.
    pub async fn run(&self) -> ChatResult<()> {
        let result = self.follow().await;
        if let Err(ref e) = result {
            self.shutdown().await;
            self.state.send_replace(SessionState::Failed(e.to_string()));
        }
        result
    }

    async fn follow(&self) -> ChatResult<()> {
        let mut auth_rx = self.auth.subscribe();
        let initial = auth_rx.borrow_and_update().clone();
        let mut roster = self.transition(initial).await?;

        loop {
            let wake = tokio::select! {
                changed = auth_rx.changed() => Wake::Auth(changed.is_ok()),
                update = next_roster(&mut roster) => Wake::Roster(update),
            };

            match wake {
                Wake::Auth(true) => {
                    let next = auth_rx.borrow_and_update().clone();
                    if let Some(sub) = roster.take() {
                        sub.unsubscribe();
                    }
                    roster = self.transition(next).await?;
                }
                // Provider dropped.
                Wake::Auth(false) => break,
                Wake::Roster(Some(Ok(list))) => {
                    tracing::debug!("Roster updated: {} identities", list.len());
                    self.roster.send_replace(list);
                }
                Wake::Roster(Some(Err(e))) => {
                    tracing::warn!("Roster subscription failed: {}", e);
                    return Err(e);
                }
                Wake::Roster(None) => {
                    tracing::debug!("Roster subscription closed");
                    roster = None;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Apply one auth state; returns the roster subscription for a signed-in identity.
    async fn transition(&self, next: AuthState) -> ChatResult<Option<Subscription<Identity>>> {
        let previous = self.current();

        match next {
            AuthState::Pending => {
                self.state.send_replace(SessionState::Loading);
                Ok(None)
            }
            AuthState::SignedOut => {
                if let Some(prev) = previous {
                    self.mark_offline(&prev.id).await;
                }
                self.roster.send_replace(Vec::new());
                self.state.send_replace(SessionState::SignedOut);
                tracing::info!("Signed out");
                Ok(None)
            }
            AuthState::SignedIn(user) => {
                if let Some(prev) = previous.filter(|p| p.id != user.uid) {
                    self.mark_offline(&prev.id).await;
                }

                let identity = Identity::online(&user, Utc::now());
                let mut fields = identity.to_fields();
                // Never overwrite a stored profile with blanks.
                fields.retain(|_, v| *v != Value::Null);
                self.store.set_merge(USERS, &identity.id, fields).await?;

                let sub = Subscription::new(
                    self.store.listen(USERS, Query::new()),
                    decode_roster,
                );
                tracing::info!("Signed in as {} ({})", identity.label(), identity.id);
                self.state.send_replace(SessionState::SignedIn(identity));
                Ok(Some(sub))
            }
        }
    }

    async fn mark_offline(&self, id: &str) {
        let fields = Identity::presence_fields(false, Utc::now());
        if let Err(e) = self.store.set_merge(USERS, id, fields).await {
            tracing::warn!("Failed to mark {} offline: {:#}", id, e);
        }
    }

    /// Best-effort offline presence for the current identity.
    pub async fn shutdown(&self) {
        if let Some(identity) = self.current() {
            self.mark_offline(&identity.id).await;
        }
        self.roster.send_replace(Vec::new());
    }
}
