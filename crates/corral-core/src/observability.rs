//! Observability infrastructure for Corral.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors shared by all components.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `corral_waitlist=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for waitlist operations with standard fields.
///
/// `subject` is the uuid the operation targets: the server for
/// queue-level operations, the ticket for ticket-level ones.
#[must_use]
pub fn waitlist_span(operation: &str, subject: &str) -> Span {
    tracing::info_span!(
        "waitlist",
        op = operation,
        subject = subject,
    )
}

/// Creates a span for director work.
#[must_use]
pub fn director_span(operation: &str) -> Span {
    tracing::info_span!("director", op = operation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty);
    }

    #[test]
    fn test_span_helper_creates_span() {
        let span = waitlist_span("create", "564d4d2c-0000-0000-0000-000000000000");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn test_director_span_creates_span() {
        let span = director_span("sweep");
        let _guard = span.enter();
        tracing::info!("sweep message");
    }
}
