//! Waitlist ticket API routes.
//!
//! ## Routes
//!
//! - `GET    /servers/{server_uuid}/tickets` - List a server's tickets
//! - `POST   /servers/{server_uuid}/tickets` - Create a ticket
//! - `DELETE /servers/{server_uuid}/tickets` - Delete all tickets (force)
//! - `GET    /tickets/{ticket_uuid}` - Fetch a ticket
//! - `DELETE /tickets/{ticket_uuid}` - Delete a ticket
//! - `GET    /tickets/{ticket_uuid}/wait` - Block until the ticket resolves
//! - `PUT    /tickets/{ticket_uuid}/release` - Release a ticket
//!
//! The handlers are thin adapters: parameter validation happens here, all
//! waitlist logic lives in `corral-waitlist`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;
use uuid::Uuid;

use corral_core::SortOrder;
use corral_waitlist::{ListOptions, MAX_LIST_LIMIT, NewTicket, Ticket, WaitOutcome};

use crate::context::RequestContext;
use crate::error::{ApiError, ApiErrorBody};
use crate::server::AppState;

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request to create a ticket.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTicketRequest {
    /// Queue scope (e.g. `vm`).
    pub scope: String,
    /// Resource id within the scope.
    pub id: String,
    /// Absolute expiry deadline (RFC 3339); must be in the future.
    pub expires_at: String,
    /// What the holder intends to do; informational.
    #[serde(default)]
    pub action: Option<String>,
    /// Client metadata, preserved verbatim.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub extra: Option<Map<String, Value>>,
}

/// Response for a created ticket.
#[derive(Debug, Serialize, ToSchema)]
pub struct CreateTicketResponse {
    /// The created ticket's uuid.
    pub uuid: Uuid,
    /// Uuids of every non-terminal ticket in the queue, in queue order.
    pub queue: Vec<Uuid>,
}

/// Ticket representation on the wire.
#[derive(Debug, Serialize, ToSchema)]
pub struct TicketResponse {
    /// Primary key.
    pub uuid: Uuid,
    /// Server the ticket applies to.
    pub server_uuid: Uuid,
    /// Queue scope.
    pub scope: String,
    /// Resource id within the scope.
    pub id: String,
    /// Lifecycle status.
    pub status: String,
    /// What the holder intends to do.
    pub action: String,
    /// Client metadata, preserved verbatim.
    #[schema(value_type = Object)]
    pub extra: Map<String, Value>,
    /// Creation timestamp (RFC 3339).
    pub created_at: String,
    /// Last update timestamp (RFC 3339).
    pub updated_at: String,
    /// Expiry deadline (RFC 3339).
    pub expires_at: String,
    /// Request correlation id recorded at creation.
    pub req_id: String,
}

impl From<Ticket> for TicketResponse {
    fn from(ticket: Ticket) -> Self {
        Self {
            uuid: ticket.uuid,
            server_uuid: ticket.server_uuid,
            scope: ticket.scope,
            id: ticket.id,
            status: ticket.status.to_string(),
            action: ticket.action,
            extra: ticket.extra,
            created_at: format_timestamp(ticket.created_at),
            updated_at: format_timestamp(ticket.updated_at),
            expires_at: format_timestamp(ticket.expires_at),
            req_id: ticket.req_id,
        }
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Query Validation
// ============================================================================

/// Raw list query parameters, validated as a declarative schema.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    /// Page size; must match `^[1-9][0-9]*$` and be at most 1000.
    pub limit: Option<String>,
    /// Skip count; must match `^([1-9][0-9]*|0)$`.
    pub offset: Option<String>,
    /// Sort attribute; trimmed, non-empty.
    pub attribute: Option<String>,
    /// Sort order; trimmed, `ASC` or `DESC`.
    pub order: Option<String>,
}

impl ListQuery {
    /// Validates the raw parameters into list options.
    pub fn validate(self) -> Result<ListOptions, ApiError> {
        let mut options = ListOptions::default();

        if let Some(limit) = &self.limit {
            if !is_positive_integer(limit) {
                return Err(ApiError::invalid_argument(
                    "limit must be a positive integer without leading zeros",
                ));
            }
            let limit: usize = limit.parse().map_err(|_| {
                ApiError::invalid_argument("limit is out of range")
            })?;
            if limit > MAX_LIST_LIMIT {
                return Err(ApiError::invalid_argument(format!(
                    "limit must be at most {MAX_LIST_LIMIT}"
                )));
            }
            options.limit = limit;
        }

        if let Some(offset) = &self.offset {
            if offset != "0" && !is_positive_integer(offset) {
                return Err(ApiError::invalid_argument(
                    "offset must be a non-negative integer without leading zeros",
                ));
            }
            options.offset = offset.parse().map_err(|_| {
                ApiError::invalid_argument("offset is out of range")
            })?;
        }

        if let Some(attribute) = &self.attribute {
            let attribute = attribute.trim();
            if attribute.is_empty() {
                return Err(ApiError::invalid_argument("attribute must be non-empty"));
            }
            options.attribute = attribute.to_string();
        }

        if let Some(order) = &self.order {
            options.order = match order.trim() {
                "ASC" => SortOrder::Asc,
                "DESC" => SortOrder::Desc,
                other => {
                    return Err(ApiError::invalid_argument(format!(
                        "order must be ASC or DESC (got {other})"
                    )));
                }
            };
        }

        Ok(options)
    }
}

fn is_positive_integer(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) && !s.starts_with('0')
}

/// Query flag guarding destructive server-wide deletion.
#[derive(Debug, Default, Deserialize)]
pub struct ForceQuery {
    /// Must be the literal `true` to proceed.
    pub force: Option<String>,
}

impl ForceQuery {
    fn is_forced(&self) -> bool {
        self.force.as_deref().map(str::trim) == Some("true")
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Creates waitlist ticket routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/servers/:server_uuid/tickets",
            get(list_tickets)
                .post(create_ticket)
                .delete(delete_server_tickets),
        )
        .route("/tickets/:ticket_uuid", get(get_ticket).delete(delete_ticket))
        .route("/tickets/:ticket_uuid/wait", get(wait_ticket))
        .route("/tickets/:ticket_uuid/release", put(release_ticket))
}

/// List a server's tickets.
///
/// GET /servers/{server_uuid}/tickets
#[utoipa::path(
    get,
    path = "/servers/{server_uuid}/tickets",
    tag = "tickets",
    params(
        ("server_uuid" = Uuid, Path, description = "Server uuid"),
        ("limit" = Option<String>, Query, description = "Page size (1..=1000)"),
        ("offset" = Option<String>, Query, description = "Skip count"),
        ("attribute" = Option<String>, Query, description = "Sort attribute"),
        ("order" = Option<String>, Query, description = "ASC or DESC"),
    ),
    responses(
        (status = 200, description = "Tickets listed", body = Vec<TicketResponse>),
        (status = 400, description = "Bad request", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn list_tickets(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(server_uuid): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::debug!(
        request_id = %ctx.request_id,
        server_uuid = %server_uuid,
        "Listing waitlist tickets"
    );

    let options = query
        .validate()
        .map_err(|e| e.with_request_id(ctx.request_id.clone()))?;
    let tickets = state
        .queue()
        .list(server_uuid, &options)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let body: Vec<TicketResponse> = tickets.into_iter().map(TicketResponse::from).collect();
    Ok(Json(body))
}

/// Create a ticket.
///
/// POST /servers/{server_uuid}/tickets
#[utoipa::path(
    post,
    path = "/servers/{server_uuid}/tickets",
    tag = "tickets",
    params(
        ("server_uuid" = Uuid, Path, description = "Server uuid"),
    ),
    request_body = CreateTicketRequest,
    responses(
        (status = 202, description = "Ticket accepted", body = CreateTicketResponse),
        (status = 400, description = "Bad request", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn create_ticket(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(server_uuid): Path<Uuid>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(
        request_id = %ctx.request_id,
        server_uuid = %server_uuid,
        scope = %req.scope,
        id = %req.id,
        "Creating waitlist ticket"
    );

    let expires_at = DateTime::parse_from_rfc3339(&req.expires_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            ApiError::invalid_argument(format!("expires_at must be an RFC 3339 timestamp: {e}"))
                .with_request_id(ctx.request_id.clone())
        })?;

    let params = NewTicket {
        server_uuid,
        scope: req.scope,
        id: req.id,
        expires_at,
        action: req.action.unwrap_or_default(),
        extra: req.extra.unwrap_or_default(),
        req_id: ctx.request_id.clone(),
    };

    let (uuid, queue) = state
        .queue()
        .create(params)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateTicketResponse { uuid, queue }),
    ))
}

/// Delete every ticket for a server.
///
/// DELETE /servers/{server_uuid}/tickets?force=true
#[utoipa::path(
    delete,
    path = "/servers/{server_uuid}/tickets",
    tag = "tickets",
    params(
        ("server_uuid" = Uuid, Path, description = "Server uuid"),
        ("force" = Option<String>, Query, description = "Must be `true`"),
    ),
    responses(
        (status = 204, description = "Tickets deleted"),
        (status = 412, description = "Missing force flag", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn delete_server_tickets(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(server_uuid): Path<Uuid>,
    Query(query): Query<ForceQuery>,
) -> Result<StatusCode, ApiError> {
    tracing::info!(
        request_id = %ctx.request_id,
        server_uuid = %server_uuid,
        forced = query.is_forced(),
        "Deleting all waitlist tickets for server"
    );

    state
        .queue()
        .delete_for_server(server_uuid, query.is_forced())
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Fetch a ticket.
///
/// GET /tickets/{ticket_uuid}
#[utoipa::path(
    get,
    path = "/tickets/{ticket_uuid}",
    tag = "tickets",
    params(
        ("ticket_uuid" = Uuid, Path, description = "Ticket uuid"),
    ),
    responses(
        (status = 200, description = "Ticket found", body = TicketResponse),
        (status = 404, description = "Not found", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn get_ticket(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(ticket_uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::debug!(
        request_id = %ctx.request_id,
        ticket_uuid = %ticket_uuid,
        "Getting waitlist ticket"
    );

    let ticket = state
        .queue()
        .get(ticket_uuid)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok(Json(TicketResponse::from(ticket)))
}

/// Delete a ticket.
///
/// DELETE /tickets/{ticket_uuid}
#[utoipa::path(
    delete,
    path = "/tickets/{ticket_uuid}",
    tag = "tickets",
    params(
        ("ticket_uuid" = Uuid, Path, description = "Ticket uuid"),
    ),
    responses(
        (status = 204, description = "Ticket deleted"),
        (status = 404, description = "Not found", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn delete_ticket(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(ticket_uuid): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    tracing::info!(
        request_id = %ctx.request_id,
        ticket_uuid = %ticket_uuid,
        "Deleting waitlist ticket"
    );

    state
        .queue()
        .delete(ticket_uuid)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok(StatusCode::NO_CONTENT)
}

/// Block until a ticket becomes active, expired, or finished.
///
/// GET /tickets/{ticket_uuid}/wait
#[utoipa::path(
    get,
    path = "/tickets/{ticket_uuid}/wait",
    tag = "tickets",
    params(
        ("ticket_uuid" = Uuid, Path, description = "Ticket uuid"),
    ),
    responses(
        (status = 204, description = "Ticket resolved"),
        (status = 404, description = "Not found", body = ApiErrorBody),
        (status = 503, description = "Server-side wait cap elapsed", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn wait_ticket(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(ticket_uuid): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(
        request_id = %ctx.request_id,
        ticket_uuid = %ticket_uuid,
        "Waiting on waitlist ticket"
    );

    let waiter = match state
        .queue()
        .wait(ticket_uuid)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?
    {
        WaitOutcome::Resolved(_) => return Ok(StatusCode::NO_CONTENT),
        WaitOutcome::Pending(waiter) => waiter,
    };

    let resolved = match state.config.wait_timeout() {
        Some(cap) => match tokio::time::timeout(cap, waiter.wait()).await {
            Ok(resolved) => resolved,
            Err(_) => {
                return Err(ApiError::unavailable(
                    "wait cap elapsed before the ticket resolved; retry",
                )
                .with_request_id(ctx.request_id.clone()));
            }
        },
        None => waiter.wait().await,
    };

    resolved.map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Release a ticket.
///
/// PUT /tickets/{ticket_uuid}/release
#[utoipa::path(
    put,
    path = "/tickets/{ticket_uuid}/release",
    tag = "tickets",
    params(
        ("ticket_uuid" = Uuid, Path, description = "Ticket uuid"),
    ),
    responses(
        (status = 204, description = "Ticket released"),
        (status = 404, description = "Not found", body = ApiErrorBody),
        (status = 409, description = "Release contended", body = ApiErrorBody),
        (status = 500, description = "Internal error", body = ApiErrorBody),
    )
)]
pub(crate) async fn release_ticket(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(ticket_uuid): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    tracing::info!(
        request_id = %ctx.request_id,
        ticket_uuid = %ticket_uuid,
        "Releasing waitlist ticket"
    );

    state
        .queue()
        .release(ticket_uuid)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok(StatusCode::NO_CONTENT)
}
