//! Transactional key-value store contract.
//!
//! This module defines the store contract the waitlist coordinates through.
//! The store is bucket/key addressed, holds JSON documents, and supports
//! conditional writes against an opaque version token (etag):
//! - A put with `MatchesEtag` fails when the record changed underneath the
//!   caller; callers re-read and retry.
//! - An etag mismatch is a normal result, never an error.
//!
//! The version token is an opaque `String` so backends with different
//! native version schemes (numeric generations, entity tags, transaction
//! ids) can satisfy the contract without leaking their representation.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional writes (CAS operations).
#[derive(Debug, Clone)]
pub enum PutPrecondition {
    /// Write unconditionally.
    None,
    /// Write only if no record exists under the key.
    DoesNotExist,
    /// Write only if the record's current etag matches the given token.
    MatchesEtag(String),
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum PutResult {
    /// Write succeeded, returns the new etag.
    Stored {
        /// The record's etag after the write.
        etag: String,
    },
    /// Precondition failed; the record was not written.
    EtagMismatch {
        /// The record's current etag, or `None` if no record exists.
        current_etag: Option<String>,
    },
}

/// A record read from the store.
#[derive(Debug, Clone)]
pub struct KvRecord {
    /// Record key within its bucket.
    pub key: String,
    /// Raw JSON document.
    pub value: Bytes,
    /// Opaque version token for CAS writes.
    pub etag: String,
}

impl KvRecord {
    /// Deserializes the record's JSON document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the document does not decode as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            Error::serialization(format!("record {} failed to decode: {e}", self.key))
        })
    }
}

/// A conjunction of field predicates over stored JSON documents.
///
/// An empty filter matches every record.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

#[derive(Debug, Clone)]
enum Clause {
    Eq(String, Value),
    OneOf(String, Vec<Value>),
}

impl Filter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires `field` to equal `value`.
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(Clause::Eq(field.into(), value.into()));
        self
    }

    /// Requires `field` to equal one of `values`.
    #[must_use]
    pub fn one_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.push(Clause::OneOf(field.into(), values));
        self
    }

    /// Returns whether the given document satisfies every clause.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.clauses.iter().all(|clause| match clause {
            Clause::Eq(field, value) => doc.get(field) == Some(value),
            Clause::OneOf(field, values) => doc
                .get(field)
                .is_some_and(|actual| values.iter().any(|v| v == actual)),
        })
    }
}

/// Sort direction for a find operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// A single sort key.
#[derive(Debug, Clone)]
pub struct SortField {
    /// Document field to sort on.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

impl SortField {
    /// Ascending sort on `field`.
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    /// Descending sort on `field`.
    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Options for a find operation.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Sort keys, applied in order. Ties are broken by record key ascending,
    /// so results are deterministic for a given store state.
    pub sort: Vec<SortField>,
    /// Maximum number of records to return after `offset`.
    pub limit: Option<usize>,
    /// Number of matching records to skip.
    pub offset: usize,
}

impl FindOptions {
    /// Options with the given sort keys and no limit.
    #[must_use]
    pub fn sorted(sort: Vec<SortField>) -> Self {
        Self {
            sort,
            limit: None,
            offset: 0,
        }
    }
}

/// Transactional key-value store.
///
/// All backends (external stores, in-memory test store) implement this
/// trait. Multiple processes may share one store; the only cross-process
/// coordination primitive is the etag-guarded put.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Reads the record under `key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if no record exists.
    async fn get(&self, bucket: &str, key: &str) -> Result<KvRecord>;

    /// Writes a JSON document with an optional precondition.
    ///
    /// Returns `PutResult::EtagMismatch` if the precondition is not met.
    /// Never returns an error for a precondition failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` on transport failure.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        precondition: PutPrecondition,
    ) -> Result<PutResult>;

    /// Deletes the record under `key`.
    ///
    /// Succeeds even if the record does not exist (idempotent).
    ///
    /// # Errors
    ///
    /// Returns `Error::StoreUnavailable` on transport failure.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Returns the records in `bucket` matching `filter`, sorted and
    /// windowed per `options`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if a stored document is not valid
    /// JSON, `Error::StoreUnavailable` on transport failure.
    async fn find(&self, bucket: &str, filter: &Filter, options: &FindOptions)
        -> Result<Vec<KvRecord>>;
}

/// Compares two optional JSON values for sorting.
///
/// Missing and null sort before everything else; numbers compare
/// numerically, strings and booleans natively; mixed types fall back to
/// their canonical string forms.
fn cmp_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// In-memory store backend for tests and debug mode.
///
/// Thread-safe via `RwLock`. Not suitable for production; etags are
/// monotonically increasing integers per key, stored as strings.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Arc<RwLock<HashMap<String, HashMap<String, StoredObject>>>>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    version: i64,
}

impl MemoryStore {
    /// Creates a new empty memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<KvRecord> {
        let buckets = self.buckets.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .map(|obj| KvRecord {
                key: key.to_string(),
                value: obj.data.clone(),
                etag: obj.version.to_string(),
            })
            .ok_or_else(|| Error::NotFound(format!("{bucket}/{key}")))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        precondition: PutPrecondition,
    ) -> Result<PutResult> {
        let mut buckets = self.buckets.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let entries = buckets.entry(bucket.to_string()).or_default();
        let current = entries.get(key);

        match precondition {
            PutPrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(PutResult::EtagMismatch {
                        current_etag: Some(obj.version.to_string()),
                    });
                }
            }
            PutPrecondition::MatchesEtag(expected) => match current {
                Some(obj) if obj.version.to_string() != expected => {
                    return Ok(PutResult::EtagMismatch {
                        current_etag: Some(obj.version.to_string()),
                    });
                }
                None => {
                    return Ok(PutResult::EtagMismatch { current_etag: None });
                }
                _ => {}
            },
            PutPrecondition::None => {}
        }

        let new_version = current.map_or(1, |obj| obj.version + 1);
        entries.insert(
            key.to_string(),
            StoredObject {
                data: value,
                version: new_version,
            },
        );
        drop(buckets);

        Ok(PutResult::Stored {
            etag: new_version.to_string(),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut buckets = self.buckets.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;
        if let Some(entries) = buckets.get_mut(bucket) {
            entries.remove(key);
        }
        Ok(())
    }

    async fn find(
        &self,
        bucket: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<KvRecord>> {
        let buckets = self.buckets.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let Some(entries) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<(Value, KvRecord)> = Vec::new();
        for (key, obj) in entries {
            let doc: Value = serde_json::from_slice(&obj.data).map_err(|e| {
                Error::serialization(format!("record {bucket}/{key} is not valid JSON: {e}"))
            })?;
            if filter.matches(&doc) {
                matched.push((
                    doc,
                    KvRecord {
                        key: key.clone(),
                        value: obj.data.clone(),
                        etag: obj.version.to_string(),
                    },
                ));
            }
        }
        drop(buckets);

        matched.sort_by(|(doc_a, rec_a), (doc_b, rec_b)| {
            for sort in &options.sort {
                let ord = cmp_values(doc_a.get(&sort.field), doc_b.get(&sort.field));
                let ord = match sort.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            rec_a.key.cmp(&rec_b.key)
        });

        let records = matched
            .into_iter()
            .map(|(_, rec)| rec)
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();

        Ok(records)
    }
}
