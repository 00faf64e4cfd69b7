//! Error taxonomy for the chat core

use thiserror::Error;

/// Errors surfaced by the session store, group directory, feed and composer.
///
/// Backend failures (network, permission denial, quota) are carried through
/// unmodified in [`ChatError::Backend`].
#[derive(Debug, Error)]
pub enum ChatError {
    /// The operation needs a signed-in identity and none is active.
    #[error("not signed in")]
    Unauthenticated,

    /// Input rejected before anything was sent to the backend.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A stored document could not be turned into a model value.
    #[error("malformed document: {0}")]
    Decode(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
