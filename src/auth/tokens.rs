//! Token storage and management

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Seconds before expiry at which a token is already treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Stored bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    /// Unix seconds
    pub expires_at: Option<i64>,
}

impl StoredToken {
    pub fn new(token: String, expires_in_secs: Option<u64>) -> Self {
        let expires_at = expires_in_secs
            .map(|secs| Utc::now().timestamp() + i64::try_from(secs).unwrap_or(i64::MAX / 2));

        Self { token, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now().timestamp() + EXPIRY_MARGIN_SECS >= exp,
            None => false,
        }
    }
}

/// Token store trait for different storage backends
pub trait TokenStore {
    fn get_id_token(&self) -> Option<StoredToken>;
    fn set_id_token(&mut self, token: String, expires_in: Option<u64>);
    fn get_refresh_token(&self) -> Option<String>;
    fn set_refresh_token(&mut self, token: String);
    fn clear_tokens(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_without_expiry_never_expires() {
        let token = StoredToken::new("t".to_string(), None);
        assert!(!token.is_expired());
    }

    #[test]
    fn test_token_inside_margin_is_expired() {
        let token = StoredToken::new("t".to_string(), Some(60));
        assert!(token.is_expired());

        let fresh = StoredToken::new("t".to_string(), Some(3600));
        assert!(!fresh.is_expired());
    }
}
