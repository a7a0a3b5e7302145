//! # corral-api
//!
//! HTTP composition layer for the Corral compute-node control plane.
//!
//! This crate provides the API surface for the waitlist, handling:
//!
//! - **Routing**: the HTTP contract over queue manager and director
//! - **Validation**: declarative parameter rules applied per endpoint
//! - **Service Wiring**: store, queue manager, waiter registry, director
//! - **Observability**: metrics, tracing, and health checks
//!
//! ## Design Principles
//!
//! This crate is a **thin composition layer** with no waitlist policy.
//! All coordination logic lives in `corral-waitlist`.
//!
//! ## Endpoints
//!
//! ```text
//! GET    /health                          - Health check
//! GET    /ready                           - Readiness check
//! GET    /metrics                         - Prometheus exposition
//! GET    /openapi.json                    - OpenAPI document
//! GET    /servers/{server}/tickets        - List tickets
//! POST   /servers/{server}/tickets        - Create a ticket
//! DELETE /servers/{server}/tickets        - Delete all tickets (force)
//! GET    /tickets/{uuid}                  - Fetch a ticket
//! DELETE /tickets/{uuid}                  - Delete a ticket
//! GET    /tickets/{uuid}/wait             - Block until resolution
//! PUT    /tickets/{uuid}/release          - Release a ticket
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use corral_api::server::Server;
//!
//! let server = Server::builder()
//!     .http_port(8080)
//!     .debug(true)
//!     .build();
//!
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod openapi;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
