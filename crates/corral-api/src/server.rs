//! API server implementation.
//!
//! Provides health, ready, and waitlist endpoints, and owns the director
//! lifecycle: one director per process, started with the router and
//! stopped when the server shuts down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use corral_core::{Error as CoreError, KvStore, MemoryStore, Result};
use corral_waitlist::{
    Director, DirectorConfig, DirectorHandle, QueueManager, TICKETS_BUCKET, WaiterRegistry,
};

use crate::config::{Config, CorsConfig};

// ============================================================================
// Health and Ready Responses
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    store: Arc<dyn KvStore>,
    queue: Arc<QueueManager>,
    waiters: Arc<WaiterRegistry>,
    director: Arc<DirectorHandle>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("store", &"<KvStore>")
            .field("queue", &"<QueueManager>")
            .field("waiters", &"<WaiterRegistry>")
            .field("director", &"<DirectorHandle>")
            .finish()
    }
}

impl AppState {
    /// Wires the waitlist components over `store` and starts the director.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn KvStore>) -> Arc<Self> {
        let waiters = Arc::new(WaiterRegistry::new());
        let (director, poke) = Director::new(
            store.clone(),
            waiters.clone(),
            DirectorConfig {
                sweep_interval: config.sweep_interval(),
            },
        );
        let queue = Arc::new(QueueManager::new(store.clone(), waiters.clone(), poke));
        let director = Arc::new(director.spawn());

        Arc::new(Self {
            config,
            store,
            queue,
            waiters,
            director,
        })
    }

    /// Returns the store backend.
    #[must_use]
    pub fn store(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.store)
    }

    /// Returns the queue manager.
    #[must_use]
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Returns the waiter registry.
    #[must_use]
    pub fn waiters(&self) -> &WaiterRegistry {
        &self.waiters
    }

    /// Returns the director lifecycle handle.
    #[must_use]
    pub fn director(&self) -> &DirectorHandle {
        &self.director
    }
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint handler.
///
/// Returns 200 OK if the service is alive. This is a shallow check that
/// doesn't verify dependencies.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Returns 200 OK if the service is ready to accept requests. A read of a
/// missing key is sufficient to validate the store's network path.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check_key = "__corral/ready-check";
    match state.store.get(TICKETS_BUCKET, check_key).await {
        Ok(_) | Err(CoreError::NotFound(_)) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("store check failed: {e}")),
            }),
        ),
    }
}

// ============================================================================
// Server
// ============================================================================

/// The Corral API server.
pub struct Server {
    config: Config,
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("store", &"<KvStore>")
            .finish()
    }
}

impl Server {
    /// Creates a new server with the given configuration.
    ///
    /// Defaults to in-memory storage; use [`Server::with_store`] for
    /// production.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
        }
    }

    /// Creates a new server with an explicit store backend.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn KvStore>) -> Self {
        Self { config, store }
    }

    /// Creates a new `ServerBuilder`.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the application state and router with all middleware.
    fn create_app(&self) -> (Arc<AppState>, Router) {
        let state = AppState::new(self.config.clone(), Arc::clone(&self.store));

        let cors = Self::build_cors_layer(&self.config.cors);
        let metrics_layer = middleware::from_fn(crate::metrics::metrics_middleware);

        let router = Router::new()
            // Health, ready, metrics, and spec endpoints (no waitlist state)
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/metrics", get(crate::metrics::serve_metrics))
            .route("/openapi.json", get(crate::openapi::serve_openapi))
            // Waitlist endpoints per the HTTP contract
            .merge(crate::routes::routes())
            // Middleware (order matters): metrics outermost for timing,
            // then trace, then CORS.
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(metrics_layer)
            .with_state(state.clone());

        (state, router)
    }

    fn build_cors_layer(cors_config: &CorsConfig) -> CorsLayer {
        let cors = CorsLayer::new()
            .allow_methods([
                Method::GET,
                Method::HEAD,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::HeaderName::from_static("x-request-id"),
            ])
            .expose_headers([
                header::CONTENT_TYPE,
                header::CONTENT_LENGTH,
                header::HeaderName::from_static("x-request-id"),
            ])
            .max_age(Duration::from_secs(cors_config.max_age_seconds));

        Self::apply_cors_allowed_origins(cors, cors_config)
    }

    fn apply_cors_allowed_origins(cors: CorsLayer, cors_config: &CorsConfig) -> CorsLayer {
        if cors_config.allowed_origins.is_empty() {
            return cors;
        }

        if cors_config.allowed_origins.len() == 1
            && cors_config.allowed_origins.first().is_some_and(|o| o == "*")
        {
            return cors.allow_origin(Any);
        }

        if cors_config.allowed_origins.iter().any(|o| o == "*") {
            tracing::error!(
                origins = ?cors_config.allowed_origins,
                "Invalid CORS config: '*' must be the only allowed origin"
            );
            return cors;
        }

        let mut allowed = Vec::new();
        for origin in &cors_config.allowed_origins {
            match HeaderValue::from_str(origin) {
                Ok(value) => allowed.push(value),
                Err(_) => {
                    tracing::error!(
                        origin = %origin,
                        "Invalid CORS origin; expected a valid HeaderValue"
                    );
                }
            }
        }

        if allowed.is_empty() {
            tracing::warn!("All configured CORS origins were invalid; disabling CORS");
            cors
        } else {
            tracing::info!(origins = ?cors_config.allowed_origins, "CORS configured");
            cors.allow_origin(AllowOrigin::list(allowed))
        }
    }

    /// Starts the server and blocks until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the server
    /// cannot bind to the port.
    pub async fn serve(&self) -> Result<()> {
        self.validate_config()?;

        crate::metrics::init_metrics();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let (state, router) = self.create_app();

        tracing::info!(
            http_port = self.config.http_port,
            sweep_interval_ms = self.config.sweep_interval_ms,
            "Starting Corral API server"
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| CoreError::Internal {
                message: format!("failed to bind to {addr}: {e}"),
            })?;

        let served = axum::serve(listener, router).await;
        state.director().shutdown().await;

        served.map_err(|e| CoreError::Internal {
            message: format!("server error: {e}"),
        })
    }

    /// Creates a test router for the server.
    ///
    /// This is useful for integration tests where you want to exercise
    /// the routes without binding to a port. The router carries a live
    /// director; must be called from within a tokio runtime.
    #[doc(hidden)]
    #[must_use]
    pub fn test_router(&self) -> Router {
        let (_state, router) = self.create_app();
        router
    }

    fn validate_config(&self) -> Result<()> {
        if !self.config.debug && self.config.store.bucket.is_none() {
            return Err(CoreError::InvalidArgument(
                "store.bucket is required when debug=false".to_string(),
            ));
        }

        // Enforce "no wildcard in production" for CORS.
        if !self.config.debug
            && self.config.cors.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(CoreError::InvalidArgument(
                "cors.allowed_origins cannot include '*' when debug=false".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for constructing a server.
pub struct ServerBuilder {
    config: Config,
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("store", &"<KvStore>")
            .finish()
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            store: Arc::new(MemoryStore::new()),
        }
    }
}

impl ServerBuilder {
    /// Creates a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the HTTP port.
    #[must_use]
    pub fn http_port(mut self, port: u16) -> Self {
        self.config.http_port = port;
        self
    }

    /// Enables debug mode.
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the director sweep cadence in milliseconds.
    #[must_use]
    pub fn sweep_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.sweep_interval_ms = interval_ms;
        self
    }

    /// Sets the server-side wait cap in milliseconds.
    #[must_use]
    pub fn wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.wait_timeout_ms = Some(timeout_ms);
        self
    }

    /// Sets the full configuration (for advanced use cases or testing).
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the store backend used by request handlers.
    ///
    /// By default, the server uses an in-memory store intended only for
    /// tests and development.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = store;
        self
    }

    /// Builds the server.
    #[must_use]
    pub fn build(self) -> Server {
        Server {
            config: self.config,
            store: self.store,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
