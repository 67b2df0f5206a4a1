//! SmartThings OAuth provider settings.

use crate::config::OAuthConfig;
use std::fmt;

/// Scope requested for every authorization
pub const OAUTH_SCOPE: &str = "r:devices:* x:devices:* r:locations:*";

/// Path appended to the base URL to form the redirect URI
pub const CALLBACK_PATH: &str = "oauth/callback";

/// OAuth provider configuration
#[derive(Clone)]
pub struct OAuthProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    pub client_id: String,

    pub client_secret: String,

    /// Redirect URI, identical for the authorization request and the code
    /// exchange
    pub redirect_uri: String,
}

impl OAuthProviderConfig {
    pub fn from_config(config: &OAuthConfig) -> Self {
        Self {
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: redirect_uri(&config.base_url),
        }
    }

    /// Build authorization URL carrying the given CSRF state
    pub fn build_auth_url(&self, state: &str) -> String {
        format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&scope={}&state={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(OAUTH_SCOPE),
            urlencoding::encode(state)
        )
    }
}

impl fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Derive the redirect URI from the public base URL.
///
/// Trailing slashes are collapsed to exactly one before the callback path is
/// appended; the provider compares redirect URIs byte for byte.
pub fn redirect_uri(base_url: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), CALLBACK_PATH)
}
