//! Persisted OAuth credentials for the SmartThings integration.
//!
//! A single [`CredentialRecord`] is kept in memory and mirrored to a JSON file.
//! The record is either absent (never authenticated, or reset) or complete;
//! every token update replaces it as a whole.
//!
//! # Usage
//!
//! ```no_run
//! use smartthings_auth::credentials::{CredentialStore, TokenUpdate};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let store = CredentialStore::open("credentials.json", Duration::minutes(5));
//!
//! let record = store.update(
//!     TokenUpdate {
//!         access_token: "access".to_string(),
//!         refresh_token: Some("refresh".to_string()),
//!         expires_in: 86_400,
//!         installed_app_id: None,
//!         location_id: None,
//!     },
//!     Utc::now(),
//! )?;
//! assert!(store.is_access_valid(Utc::now()));
//! println!("access token valid until {}", record.access_expires_at);
//!
//! store.clear();
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

mod storage;

pub use storage::{CredentialStore, LoggingTokenObserver, TokenObserver};

/// Refresh tokens are not returned with an expiry; they are treated as valid
/// for this long after the last token update.
pub const REFRESH_TOKEN_LIFETIME_DAYS: i64 = 30;

/// Key under which the access token is propagated to the host configuration.
pub const CONFIG_SYNC_KEY: &str = "smartthings";

/// The full credential record, as persisted on disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    /// Bearer token for API calls
    pub access_token: String,

    /// Token used to obtain a new access token
    pub refresh_token: String,

    /// Instant the access token stops being usable
    pub access_expires_at: DateTime<Utc>,

    /// Instant the refresh token stops being usable (issue time + 30 days)
    pub refresh_expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_app_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
}

/// Fields received from the token endpoint.
///
/// `None` values keep whatever the current record holds, so a provider that
/// does not rotate the refresh token leaves the old one in place.
#[derive(Clone, Debug)]
pub struct TokenUpdate {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub installed_app_id: Option<String>,
    pub location_id: Option<String>,
}

impl CredentialRecord {
    /// Builds the record that results from applying `update` at `issued_at`.
    ///
    /// # Errors
    /// `InvalidTokenResponse` when there is no refresh token to carry forward
    /// or the lifetime is not a positive, representable number of seconds.
    fn merged(
        current: Option<&CredentialRecord>,
        update: TokenUpdate,
        issued_at: DateTime<Utc>,
    ) -> Result<Self> {
        let refresh_token = update
            .refresh_token
            .or_else(|| current.map(|c| c.refresh_token.clone()))
            .ok_or_else(|| {
                AuthError::InvalidTokenResponse("no refresh token available".to_string())
            })?;

        if update.expires_in <= 0 {
            return Err(AuthError::InvalidTokenResponse(format!(
                "expires_in must be positive, got {}",
                update.expires_in
            )));
        }

        let access_expires_at = Duration::try_seconds(update.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                AuthError::InvalidTokenResponse(format!(
                    "expires_in out of range: {}",
                    update.expires_in
                ))
            })?;
        let refresh_expires_at = issued_at
            .checked_add_signed(Duration::days(REFRESH_TOKEN_LIFETIME_DAYS))
            .ok_or_else(|| {
                AuthError::InvalidTokenResponse("issue time out of range".to_string())
            })?;

        Ok(Self {
            access_token: update.access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
            installed_app_id: update
                .installed_app_id
                .or_else(|| current.and_then(|c| c.installed_app_id.clone())),
            location_id: update
                .location_id
                .or_else(|| current.and_then(|c| c.location_id.clone())),
        })
    }
}
