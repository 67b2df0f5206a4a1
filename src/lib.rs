// Error taxonomy
pub mod error;

// TOML + environment configuration
pub mod config;

// Persisted credential record
pub mod credentials;

// Authorization-code flow and CSRF state
pub mod oauth;

// Background token refresh
pub mod scheduler;

// Callback router for the webhook server
pub mod api;

pub use credentials::{CredentialRecord, CredentialStore, TokenUpdate};
pub use error::AuthError;
pub use oauth::{CallbackResponse, FlowState, OAuthFlowController, RefreshOutcome};
pub use scheduler::{CredentialLifecycle, RefreshScheduler, TickAction};
