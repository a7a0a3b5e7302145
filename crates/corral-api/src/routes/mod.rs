//! HTTP route handlers.

pub mod tickets;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// Waitlist routes mounted at the service root.
pub fn routes() -> Router<Arc<AppState>> {
    tickets::routes()
}
