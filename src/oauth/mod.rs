//! OAuth 2.0 authorization-code flow for the SmartThings integration.
//!
//! 1. `start_auth_flow()` issues a CSRF state and logs the authorization URL
//! 2. The operator authorizes on the provider's site
//! 3. The provider redirects to `<base_url>/oauth/callback`
//! 4. `handle_callback()` checks the state, exchanges the code for tokens and
//!    stores them
//! 5. `refresh()` keeps the access token valid; when the refresh token itself
//!    has lapsed the flow restarts at step 1

mod exchange;
mod provider;
mod state_manager;

pub use provider::{redirect_uri, OAuthProviderConfig, CALLBACK_PATH, OAUTH_SCOPE};
pub use state_manager::CallbackValidator;

use crate::config::OAuthConfig;
use crate::credentials::{CredentialRecord, CredentialStore};
use crate::error::{AuthError, Result};
use crate::scheduler::CredentialLifecycle;
use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><title>SmartThings connected</title></head>\
<body><h1>SmartThings connected</h1><p>Authorization complete. You can close this window.</p></body></html>";

const FAILURE_PAGE: &str = "<!DOCTYPE html><html><head><title>SmartThings authorization failed</title></head>\
<body><h1>Authorization failed</h1><p>The SmartThings authorization could not be completed. \
Check the service log and start the authorization again.</p></body></html>";

/// Where the flow currently stands
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Unauthenticated,
    AwaitingCallback,
    Authenticated,
}

/// Result of a refresh attempt that did not fail operationally
#[derive(Debug)]
pub enum RefreshOutcome {
    /// A new token pair was stored
    Refreshed(CredentialRecord),
    /// The refresh token had lapsed; credentials were cleared and a new
    /// authorization was started
    ReauthorizationRequired { authorization_url: String },
    /// The record was reset or replaced while the request was in flight; the
    /// new tokens were discarded
    Superseded,
}

/// HTTP response handed back to the webhook listener for a callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResponse {
    pub status: StatusCode,
    pub body: String,
}

impl CallbackResponse {
    fn success() -> Self {
        Self {
            status: StatusCode::OK,
            body: SUCCESS_PAGE.to_string(),
        }
    }

    fn failure() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: FAILURE_PAGE.to_string(),
        }
    }
}

impl IntoResponse for CallbackResponse {
    fn into_response(self) -> Response {
        (self.status, Html(self.body)).into_response()
    }
}

/// Drives authorization, callback handling and refresh.
///
/// # Security
/// - Every authorization URL carries a fresh single-use state
/// - The state is consumed by the first callback, valid or not
/// - Client credentials are only sent to the token endpoint
pub struct OAuthFlowController {
    provider: OAuthProviderConfig,
    store: Arc<CredentialStore>,
    validator: CallbackValidator,
    http_client: reqwest::Client,
    /// An authorization URL was issued and no callback has completed it yet
    awaiting_callback: AtomicBool,
}

impl OAuthFlowController {
    pub fn new(
        provider: OAuthProviderConfig,
        store: Arc<CredentialStore>,
        state_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            store,
            validator: CallbackValidator::new(state_ttl),
            http_client: reqwest::Client::new(),
            awaiting_callback: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &OAuthConfig, store: Arc<CredentialStore>) -> Self {
        Self::new(
            OAuthProviderConfig::from_config(config),
            store,
            config.state_ttl(),
        )
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn redirect_uri(&self) -> &str {
        &self.provider.redirect_uri
    }

    pub fn state(&self) -> FlowState {
        if self.store.current().is_some() {
            FlowState::Authenticated
        } else if self.awaiting_callback.load(Ordering::Acquire) {
            FlowState::AwaitingCallback
        } else {
            FlowState::Unauthenticated
        }
    }

    /// Issue a new CSRF state and return the authorization URL.
    ///
    /// The URL is also logged; the operator opens it out of band.
    pub fn start_auth_flow(&self) -> String {
        let state = self.validator.issue();
        let url = self.provider.build_auth_url(&state);
        self.awaiting_callback.store(true, Ordering::Release);

        info!(
            redirect_uri = %self.provider.redirect_uri,
            authorization_url = %url,
            "SmartThings authorization required, open the authorization URL to continue"
        );

        url
    }

    /// Handle the provider redirect and render the page shown to the operator.
    pub async fn handle_callback(&self, query: &HashMap<String, String>) -> CallbackResponse {
        match self.complete_callback(query).await {
            Ok(_) => CallbackResponse::success(),
            Err(e) => {
                warn!(error = %e, "OAuth callback failed");
                CallbackResponse::failure()
            }
        }
    }

    /// Same as [`handle_callback`](Self::handle_callback), for listeners that
    /// forward the raw query string.
    pub async fn handle_callback_query(&self, raw_query: &str) -> CallbackResponse {
        match serde_urlencoded::from_str::<HashMap<String, String>>(raw_query) {
            Ok(query) => self.handle_callback(&query).await,
            Err(e) => {
                self.validator.discard();
                warn!(error = %e, "Unparseable OAuth callback query");
                CallbackResponse::failure()
            }
        }
    }

    /// Validate a callback and exchange its code for stored credentials.
    ///
    /// # Errors
    /// - `InvalidCallback` for provider errors, missing parameters or a state
    ///   mismatch; the pending state is consumed and the stored record is left
    ///   untouched
    /// - `TokenExchangeFailed` / `InvalidTokenResponse` when the token endpoint
    ///   call fails; the flow stays in `AwaitingCallback`
    pub async fn complete_callback(
        &self,
        query: &HashMap<String, String>,
    ) -> Result<CredentialRecord> {
        if let Some(error) = query.get("error") {
            self.validator.discard();
            let description = query
                .get("error_description")
                .map(String::as_str)
                .unwrap_or("Unknown error");
            return Err(AuthError::InvalidCallback(format!(
                "provider returned {}: {}",
                error, description
            )));
        }

        let (Some(code), Some(state)) = (param(query, "code"), param(query, "state")) else {
            self.validator.discard();
            return Err(AuthError::InvalidCallback(
                "missing 'code' or 'state' parameter".to_string(),
            ));
        };

        if !self.validator.validate(state) {
            return Err(AuthError::InvalidCallback(
                "state does not match a pending authorization (possible CSRF attack)".to_string(),
            ));
        }

        let issued_at = Utc::now();
        let update = exchange::exchange_code_for_token(&self.http_client, &self.provider, code)
            .await
            .map_err(|e| {
                error!(error = %e, "Authorization code exchange failed");
                e
            })?;

        let record = self.store.update(update, issued_at)?;
        self.awaiting_callback.store(false, Ordering::Release);

        info!(
            installed_app_id = ?record.installed_app_id,
            location_id = ?record.location_id,
            "OAuth flow completed successfully"
        );

        Ok(record)
    }

    /// Exchange the stored refresh token for a new token pair.
    ///
    /// # Errors
    /// - `NotAuthenticated` when there is no record
    /// - the exchange error when the call fails while the refresh token is
    ///   still valid; the record is kept and the caller may retry
    ///
    /// The result is only stored if the record the request started from is
    /// still current when the response arrives.
    pub async fn refresh(&self) -> Result<RefreshOutcome> {
        let Some((current, generation)) = self.store.current_with_generation() else {
            return Err(AuthError::NotAuthenticated);
        };

        if !self.store.is_refresh_valid(Utc::now()) {
            return Ok(self.reauthorize(&AuthError::RefreshTokenExpired));
        }

        let issued_at = Utc::now();
        let result = exchange::refresh_access_token(
            &self.http_client,
            &self.provider,
            &current.refresh_token,
        )
        .await;

        match result {
            Ok(update) => match self.store.update_if(generation, update, issued_at)? {
                Some(record) => {
                    info!(
                        access_expires_at = %record.access_expires_at,
                        "OAuth token refreshed successfully"
                    );
                    Ok(RefreshOutcome::Refreshed(record))
                }
                None => {
                    info!("Credentials changed during refresh, discarding refreshed tokens");
                    Ok(RefreshOutcome::Superseded)
                }
            },
            Err(e) if self.store.generation() != generation => {
                debug!(error = %e, "Refresh failed after credentials changed, ignoring");
                Ok(RefreshOutcome::Superseded)
            }
            Err(e) if self.store.is_refresh_valid(Utc::now()) => {
                warn!(error = %e, "Token refresh failed, keeping current credentials");
                Err(e)
            }
            Err(e) => Ok(self.reauthorize(&e)),
        }
    }

    /// Forget the stored credentials and any pending authorization.
    pub fn reset(&self) {
        self.validator.discard();
        self.awaiting_callback.store(false, Ordering::Release);
        self.store.clear();
        info!("SmartThings credentials reset");
    }

    fn reauthorize(&self, cause: &AuthError) -> RefreshOutcome {
        warn!(cause = %cause, "Refresh token no longer usable, re-authorization required");
        self.store.clear();
        RefreshOutcome::ReauthorizationRequired {
            authorization_url: self.start_auth_flow(),
        }
    }
}

/// Non-empty query parameter
fn param<'a>(query: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    query
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl CredentialLifecycle for OAuthFlowController {
    async fn refresh(&self) -> Result<RefreshOutcome> {
        OAuthFlowController::refresh(self).await
    }

    fn start_auth_flow(&self) -> String {
        OAuthFlowController::start_auth_flow(self)
    }
}
