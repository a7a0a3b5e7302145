//! `OpenAPI` specification generation for `corral-api`.
//!
//! The generated document is served at `/openapi.json` and used to
//! generate external clients.

use axum::Json;
use axum::response::IntoResponse;
use utoipa::OpenApi;

/// `OpenAPI` documentation for the Corral waitlist API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Corral API",
        description = "Compute-node control-plane waitlist API"
    ),
    paths(
        crate::routes::tickets::list_tickets,
        crate::routes::tickets::create_ticket,
        crate::routes::tickets::delete_server_tickets,
        crate::routes::tickets::get_ticket,
        crate::routes::tickets::delete_ticket,
        crate::routes::tickets::wait_ticket,
        crate::routes::tickets::release_ticket,
    ),
    components(schemas(
        crate::routes::tickets::CreateTicketRequest,
        crate::routes::tickets::CreateTicketResponse,
        crate::routes::tickets::TicketResponse,
        crate::error::ApiErrorBody,
    )),
    tags(
        (name = "tickets", description = "Waitlist ticket operations")
    )
)]
pub struct ApiDoc;

/// GET /openapi.json - the generated document.
pub async fn serve_openapi() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
