use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Upper bound for every second-valued setting (one day)
const MAX_SECONDS: i64 = 24 * 60 * 60;

/// Complete service configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// OAuth client registration and endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    /// Public base URL the provider redirects back to
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// How long an issued CSRF state stays acceptable
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
}

fn default_auth_url() -> String {
    "https://api.smartthings.com/oauth/authorize".to_string()
}

fn default_token_url() -> String {
    "https://auth-global.api.smartthings.com/oauth/token".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_state_ttl() -> i64 {
    600
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            base_url: default_base_url(),
            state_ttl_seconds: default_state_ttl(),
        }
    }
}

impl OAuthConfig {
    pub fn state_ttl(&self) -> Duration {
        Duration::seconds(self.state_ttl_seconds.clamp(0, MAX_SECONDS))
    }
}

/// Credential file location
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("smartthings_credentials.json")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Refresh scheduling
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Safety margin applied to both validity checks and refresh triggers
    #[serde(default = "default_expiry_buffer")]
    pub expiry_buffer_seconds: i64,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_expiry_buffer() -> i64 {
    300
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            expiry_buffer_seconds: default_expiry_buffer(),
        }
    }
}

impl RefreshConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_seconds.min(MAX_SECONDS as u64))
    }

    pub fn expiry_buffer(&self) -> Duration {
        Duration::seconds(self.expiry_buffer_seconds.clamp(0, MAX_SECONDS))
    }
}

/// Callback listener
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl AuthConfig {
    /// Applies `SMARTTHINGS_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SMARTTHINGS_CLIENT_ID") {
            self.oauth.client_id = v;
        }
        if let Some(v) = lookup("SMARTTHINGS_CLIENT_SECRET") {
            self.oauth.client_secret = v;
        }
        if let Some(v) = lookup("SMARTTHINGS_BASE_URL") {
            self.oauth.base_url = v;
        }
        if let Some(v) = lookup("SMARTTHINGS_CREDENTIALS_PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SMARTTHINGS_AUTH_PORT") {
            self.server.port = v
                .parse()
                .context("SMARTTHINGS_AUTH_PORT must be a valid port number")?;
        }
        Ok(())
    }

    /// Checks the settings the flow cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.oauth.client_id.is_empty() {
            bail!("oauth.client_id is required (or set SMARTTHINGS_CLIENT_ID)");
        }
        if self.oauth.client_secret.is_empty() {
            bail!("oauth.client_secret is required (or set SMARTTHINGS_CLIENT_SECRET)");
        }
        if !(1..=MAX_SECONDS).contains(&self.oauth.state_ttl_seconds) {
            bail!("oauth.state_ttl_seconds must be between 1 and {}", MAX_SECONDS);
        }
        if !(1..=MAX_SECONDS as u64).contains(&self.refresh.poll_interval_seconds) {
            bail!("refresh.poll_interval_seconds must be between 1 and {}", MAX_SECONDS);
        }
        if !(0..=MAX_SECONDS).contains(&self.refresh.expiry_buffer_seconds) {
            bail!("refresh.expiry_buffer_seconds must be between 0 and {}", MAX_SECONDS);
        }
        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AuthConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AuthConfig = toml::from_str(&contents).context("Failed to parse config file")?;
    Ok(config)
}
