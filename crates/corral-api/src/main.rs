//! `corral-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP
//! server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use corral_api::config::Config;
use corral_api::server::Server;
use corral_core::{KvStore, LogFormat, MemoryStore, init_logging};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));

    // The production store backend is wired in by the embedding
    // control-plane deployment; this binary only carries the in-memory
    // store for development.
    if !config.debug {
        anyhow::bail!(
            "no external store backend is linked into this binary; \
             embed corral_api::Server with a store, or set CORRAL_DEBUG=true"
        );
    }
    tracing::warn!("CORRAL_DEBUG=true; using in-memory store backend (debug only)");
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

    let server = Server::with_store(config, store);
    server.serve().await?;
    Ok(())
}
