//! HTTP adapter for the OAuth flow.
//!
//! A webhook server can mount this router to forward the provider redirect
//! into [`OAuthFlowController`].

use crate::oauth::{FlowState, OAuthFlowController, CALLBACK_PATH};
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Json, Redirect, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Credential status (never includes token values)
#[derive(Serialize)]
pub struct StatusResponse {
    pub state: FlowState,
    pub access_token_valid: bool,
    pub access_expires_at: Option<DateTime<Utc>>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Create OAuth router
pub fn create_oauth_router(controller: Arc<OAuthFlowController>) -> Router {
    Router::new()
        .route("/oauth/start", get(oauth_start))
        .route(&format!("/{}", CALLBACK_PATH), get(oauth_callback))
        .route("/oauth/status", get(oauth_status))
        .with_state(controller)
}

/// GET /oauth/start
///
/// Issues a fresh state and redirects the operator to the provider.
async fn oauth_start(State(controller): State<Arc<OAuthFlowController>>) -> Redirect {
    debug!("OAuth start requested");
    let url = controller.start_auth_flow();
    Redirect::temporary(&url)
}

/// GET /oauth/callback
///
/// Provider redirect target: 200 with a confirmation page, 500 otherwise.
async fn oauth_callback(
    State(controller): State<Arc<OAuthFlowController>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    debug!("OAuth callback received");
    controller.handle_callback(&query).await.into_response()
}

/// GET /oauth/status
async fn oauth_status(State(controller): State<Arc<OAuthFlowController>>) -> Json<StatusResponse> {
    let record = controller.store().current();
    Json(StatusResponse {
        state: controller.state(),
        access_token_valid: controller.store().is_access_valid(Utc::now()),
        access_expires_at: record.as_ref().map(|r| r.access_expires_at),
        refresh_expires_at: record.as_ref().map(|r| r.refresh_expires_at),
    })
}
