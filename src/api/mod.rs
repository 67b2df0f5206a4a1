// HTTP adapter for the webhook server

mod callback;

pub use callback::{create_oauth_router, StatusResponse};
