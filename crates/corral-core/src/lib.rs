//! # corral-core
//!
//! Core abstractions for the Corral compute-node control plane.
//!
//! This crate provides the foundational types and traits used across all
//! Corral components:
//!
//! - **Store Contract**: the transactional key-value store the control
//!   plane coordinates through, with etag-based optimistic concurrency
//! - **Error Types**: shared error definitions and result types
//! - **Observability**: logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `corral-core` is the **only** crate allowed to define shared primitives.
//! Cross-component interaction happens via the contracts defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod observability;
pub mod store;

pub use error::{Error, Result};
pub use observability::{LogFormat, init_logging};
pub use store::{
    Filter, FindOptions, KvRecord, KvStore, MemoryStore, PutPrecondition, PutResult, SortField,
    SortOrder,
};
