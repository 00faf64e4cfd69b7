//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{AuthUser, StoredToken, TokenStore};

/// Live-query polling interval when none is configured.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1500;

/// Application configuration
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Web API key of the hosted project
    pub api_key: Option<String>,
    /// Project ID (document database)
    pub project_id: Option<String>,
    /// Storage bucket for attachments, e.g. `my-project.appspot.com`
    pub storage_bucket: Option<String>,
    /// How often live queries re-read the database
    pub poll_interval_ms: Option<u64>,
    /// Stored ID token (bearer for database and storage requests)
    pub id_token: Option<StoredToken>,
    /// Stored refresh token
    pub refresh_token: Option<String>,
    /// Account of the last sign-in
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

/// Settings needed to reach the hosted backend.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub api_key: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub poll_interval: Duration,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "cause-chat", "cause-chat")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Backend settings, or an error naming the missing one.
    pub fn backend(&self) -> Result<BackendSettings> {
        let api_key = self
            .api_key
            .clone()
            .context("No API key configured. Run 'cause-chat config --api-key ...'.")?;
        let project_id = self
            .project_id
            .clone()
            .context("No project ID configured. Run 'cause-chat config --project-id ...'.")?;
        let storage_bucket = self
            .storage_bucket
            .clone()
            .unwrap_or_else(|| format!("{}.appspot.com", project_id));
        let poll_interval = Duration::from_millis(
            self.poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
                .max(100),
        );

        Ok(BackendSettings {
            api_key,
            project_id,
            storage_bucket,
            poll_interval,
        })
    }

    /// Account recorded at the last sign-in, if tokens are still present.
    pub fn stored_user(&self) -> Option<AuthUser> {
        self.refresh_token.as_ref()?;
        let uid = self.user_id.clone()?;
        Some(AuthUser {
            uid,
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            photo_url: None,
        })
    }

    pub fn set_user(&mut self, user: &AuthUser) {
        self.user_id = Some(user.uid.clone());
        self.display_name = user.display_name.clone();
        self.email = user.email.clone();
    }
}

impl TokenStore for Config {
    fn get_id_token(&self) -> Option<StoredToken> {
        self.id_token.clone()
    }

    fn set_id_token(&mut self, token: String, expires_in: Option<u64>) {
        self.id_token = Some(StoredToken::new(token, expires_in));
    }

    fn get_refresh_token(&self) -> Option<String> {
        self.refresh_token.clone()
    }

    fn set_refresh_token(&mut self, token: String) {
        self.refresh_token = Some(token);
    }

    fn clear_tokens(&mut self) {
        self.id_token = None;
        self.refresh_token = None;
        self.user_id = None;
        self.display_name = None;
        self.email = None;
    }
}
