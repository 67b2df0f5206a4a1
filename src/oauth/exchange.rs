//! Token endpoint calls.
//!
//! Both grants POST a form to the provider's token endpoint, authenticating
//! the client with HTTP Basic auth.

use super::provider::OAuthProviderConfig;
use crate::credentials::TokenUpdate;
use crate::error::{AuthError, Result};
use serde::Deserialize;
use tracing::debug;

/// Longest access token lifetime accepted from the provider (one year)
const MAX_EXPIRES_IN_SECONDS: i64 = 365 * 24 * 60 * 60;

/// Token endpoint response
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Access token lifetime in seconds
    expires_in: i64,
    #[serde(default)]
    installed_app_id: Option<String>,
    #[serde(default)]
    location_id: Option<String>,
}

impl From<TokenResponse> for TokenUpdate {
    fn from(response: TokenResponse) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_in: response.expires_in,
            installed_app_id: response.installed_app_id,
            location_id: response.location_id,
        }
    }
}

/// Exchange an authorization code for a token pair.
pub async fn exchange_code_for_token(
    client: &reqwest::Client,
    provider: &OAuthProviderConfig,
    code: &str,
) -> Result<TokenUpdate> {
    debug!(token_url = %provider.token_url, "Exchanging authorization code for token");

    request_token(
        client,
        provider,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", provider.redirect_uri.as_str()),
        ],
    )
    .await
}

/// Exchange a refresh token for a new token pair.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    provider: &OAuthProviderConfig,
    refresh_token: &str,
) -> Result<TokenUpdate> {
    debug!(token_url = %provider.token_url, "Refreshing access token");

    request_token(
        client,
        provider,
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
    )
    .await
}

async fn request_token(
    client: &reqwest::Client,
    provider: &OAuthProviderConfig,
    form: &[(&str, &str)],
) -> Result<TokenUpdate> {
    let response = client
        .post(&provider.token_url)
        .header("Accept", "application/json")
        .basic_auth(&provider.client_id, Some(&provider.client_secret))
        .form(form)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(AuthError::TokenExchangeFailed(format!(
            "token endpoint returned {}: {}",
            status, body
        )));
    }

    let body = response.text().await?;
    let update = parse_token_response(&body)?;

    debug!(
        has_refresh_token = update.refresh_token.is_some(),
        expires_in = update.expires_in,
        "Token exchange successful"
    );

    Ok(update)
}

fn parse_token_response(body: &str) -> Result<TokenUpdate> {
    let token_response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| AuthError::InvalidTokenResponse(e.to_string()))?;

    if !(1..=MAX_EXPIRES_IN_SECONDS).contains(&token_response.expires_in) {
        return Err(AuthError::InvalidTokenResponse(format!(
            "expires_in out of range: {}",
            token_response.expires_in
        )));
    }

    Ok(token_response.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_deserialization() {
        let json = r#"{
            "access_token": "AT",
            "refresh_token": "RT",
            "expires_in": 86399,
            "token_type": "bearer",
            "scope": "r:devices:*",
            "installed_app_id": "app-123",
            "location_id": "loc-456"
        }"#;

        let update: TokenUpdate = serde_json::from_str::<TokenResponse>(json).unwrap().into();
        assert_eq!(update.access_token, "AT");
        assert_eq!(update.refresh_token.as_deref(), Some("RT"));
        assert_eq!(update.expires_in, 86399);
        assert_eq!(update.installed_app_id.as_deref(), Some("app-123"));
        assert_eq!(update.location_id.as_deref(), Some("loc-456"));
    }

    #[test]
    fn test_token_response_minimal() {
        let json = r#"{"access_token": "AT", "expires_in": 3600}"#;

        let update: TokenUpdate = serde_json::from_str::<TokenResponse>(json).unwrap().into();
        assert_eq!(update.access_token, "AT");
        assert!(update.refresh_token.is_none());
        assert!(update.installed_app_id.is_none());
    }

    #[test]
    fn test_token_response_rejects_bad_expiry() {
        for expires_in in ["0", "-60", "9223372036854775807", "31536001"] {
            let json = format!(
                r#"{{"access_token": "AT", "refresh_token": "RT", "expires_in": {}}}"#,
                expires_in
            );
            let result = parse_token_response(&json);
            assert!(
                matches!(result, Err(AuthError::InvalidTokenResponse(_))),
                "expires_in {} accepted",
                expires_in
            );
        }

        let json = r#"{"access_token": "AT", "expires_in": 31536000}"#;
        assert_eq!(parse_token_response(json).unwrap().expires_in, 31_536_000);
    }

    #[test]
    fn test_token_response_not_json() {
        let result = parse_token_response("<html>oops</html>");
        assert!(matches!(result, Err(AuthError::InvalidTokenResponse(_))));
    }

    #[test]
    fn test_token_response_requires_expiry() {
        let json = r#"{"access_token": "AT", "refresh_token": "RT"}"#;
        assert!(serde_json::from_str::<TokenResponse>(json).is_err());
    }
}
