//! Ticket model and state machine.
//!
//! A ticket represents one caller's claim on a scoped resource of a server.
//! Tickets sharing `(server_uuid, scope, id)` form a queue; at most one
//! ticket per queue is `active` at any time.
//!
//! Tickets are persisted as flat JSON documents with millisecond-epoch
//! timestamps so the store can sort on them numerically. The store etag
//! rides alongside the document in [`TicketRecord`], never inside it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use corral_core::{Error, KvRecord, Result};

/// Bucket holding one record per ticket, keyed by hyphenated uuid.
pub const TICKETS_BUCKET: &str = "waitlist_tickets";

/// Document field names, shared by queue and director find calls.
pub mod fields {
    /// Ticket uuid (hyphenated string).
    pub const UUID: &str = "uuid";
    /// Server uuid (hyphenated string).
    pub const SERVER_UUID: &str = "server_uuid";
    /// Queue scope.
    pub const SCOPE: &str = "scope";
    /// Resource id within the scope.
    pub const ID: &str = "id";
    /// Lifecycle status.
    pub const STATUS: &str = "status";
    /// Creation timestamp (epoch milliseconds).
    pub const CREATED_AT: &str = "created_at";
}

/// Returns the store key for a ticket uuid.
#[must_use]
pub fn ticket_key(uuid: Uuid) -> String {
    uuid.to_string()
}

/// Ticket lifecycle status.
///
/// `Expired` and `Finished` are terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    /// Waiting behind the queue head.
    Queued,
    /// Holding the queue.
    Active,
    /// Deadline passed before release.
    Expired,
    /// Explicitly released.
    Finished,
}

impl TicketStatus {
    /// Returns whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Finished)
    }

    /// Returns whether the state machine permits a transition to `to`.
    #[must_use]
    pub fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Active | Self::Expired | Self::Finished)
                | (Self::Active, Self::Expired | Self::Finished)
        )
    }

    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the queue a ticket belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    /// Server the ticket applies to.
    pub server_uuid: Uuid,
    /// Queue scope (e.g. `vm`).
    pub scope: String,
    /// Resource id within the scope.
    pub id: String,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.server_uuid, self.scope, self.id)
    }
}

/// A persisted waitlist ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Primary key, assigned at creation.
    pub uuid: Uuid,
    /// Server the ticket applies to.
    pub server_uuid: Uuid,
    /// Queue scope.
    pub scope: String,
    /// Resource id within the scope.
    pub id: String,
    /// Lifecycle status.
    pub status: TicketStatus,
    /// What the holder intends to do; informational.
    #[serde(default)]
    pub action: String,
    /// Client metadata, preserved verbatim.
    #[serde(default)]
    pub extra: Map<String, Value>,
    /// Assigned at creation.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Updated on every status change.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Absolute expiry deadline.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    /// Request correlation id.
    #[serde(default)]
    pub req_id: String,
}

/// Parameters for creating a ticket.
#[derive(Debug, Clone)]
pub struct NewTicket {
    /// Server the ticket applies to.
    pub server_uuid: Uuid,
    /// Queue scope.
    pub scope: String,
    /// Resource id within the scope.
    pub id: String,
    /// Absolute expiry deadline; must be strictly in the future.
    pub expires_at: DateTime<Utc>,
    /// What the holder intends to do.
    pub action: String,
    /// Client metadata, preserved verbatim.
    pub extra: Map<String, Value>,
    /// Request correlation id.
    pub req_id: String,
}

impl NewTicket {
    /// Validates the creation parameters against `now`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` for an empty scope or id, or an
    /// expiry that is not strictly in the future.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.scope.trim().is_empty() {
            return Err(Error::InvalidArgument("scope must be non-empty".into()));
        }
        if self.id.trim().is_empty() {
            return Err(Error::InvalidArgument("id must be non-empty".into()));
        }
        if self.expires_at <= now {
            return Err(Error::InvalidArgument(format!(
                "expires_at must be in the future (got {})",
                self.expires_at.to_rfc3339()
            )));
        }
        Ok(())
    }
}

impl Ticket {
    /// Builds a new queued ticket from validated parameters.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if the parameters fail validation.
    pub fn create(params: NewTicket, now: DateTime<Utc>) -> Result<Self> {
        params.validate(now)?;
        Ok(Self {
            uuid: Uuid::new_v4(),
            server_uuid: params.server_uuid,
            scope: params.scope,
            id: params.id,
            status: TicketStatus::Queued,
            action: params.action,
            extra: params.extra,
            created_at: now,
            updated_at: now,
            expires_at: params.expires_at,
            req_id: params.req_id,
        })
    }

    /// Returns the queue this ticket belongs to.
    #[must_use]
    pub fn queue_key(&self) -> QueueKey {
        QueueKey {
            server_uuid: self.server_uuid,
            scope: self.scope.clone(),
            id: self.id.clone(),
        }
    }

    /// Returns whether the ticket's deadline has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Applies a status transition, stamping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conflict` for a transition the state machine
    /// forbids; terminal statuses never change.
    pub fn transition(&mut self, to: TicketStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::conflict(format!(
                "ticket {} cannot transition {} -> {to}",
                self.uuid, self.status
            )));
        }
        self.status = to;
        // Creation stamps may sit slightly ahead of wall clock (same-process
        // ordering); updated_at never runs backwards.
        self.updated_at = now.max(self.updated_at);
        Ok(())
    }

    /// Serializes the ticket document for storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if encoding fails.
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| Error::serialization(format!("encode ticket {}: {e}", self.uuid)))
    }
}

/// A ticket together with its store etag.
#[derive(Debug, Clone)]
pub struct TicketRecord {
    /// The decoded ticket document.
    pub ticket: Ticket,
    /// Store version token for CAS writes.
    pub etag: String,
}

impl TicketRecord {
    /// Decodes a store record into a ticket.
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if the document does not decode.
    pub fn decode(record: &KvRecord) -> Result<Self> {
        Ok(Self {
            ticket: record.decode()?,
            etag: record.etag.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn params(now: DateTime<Utc>) -> NewTicket {
        NewTicket {
            server_uuid: Uuid::new_v4(),
            scope: "vm".into(),
            id: "vm-0001".into(),
            expires_at: now + Duration::seconds(60),
            action: "provision".into(),
            extra: Map::new(),
            req_id: "req-1".into(),
        }
    }

    #[test]
    fn test_create_sets_queued_and_timestamps() {
        let now = Utc::now();
        let ticket = Ticket::create(params(now), now).expect("create");
        assert_eq!(ticket.status, TicketStatus::Queued);
        assert_eq!(ticket.created_at, ticket.updated_at);
        assert!(ticket.created_at < ticket.expires_at);
    }

    #[test]
    fn test_validate_rejects_past_expiry() {
        let now = Utc::now();
        let mut p = params(now);
        p.expires_at = now - Duration::seconds(1);
        let err = Ticket::create(p, now).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_rejects_empty_scope_and_id() {
        let now = Utc::now();
        let mut p = params(now);
        p.scope = "  ".into();
        assert!(Ticket::create(p, now).is_err());

        let mut p = params(now);
        p.id = String::new();
        assert!(Ticket::create(p, now).is_err());
    }

    #[test]
    fn test_transitions_follow_state_machine() {
        let now = Utc::now();
        let mut ticket = Ticket::create(params(now), now).expect("create");

        ticket
            .transition(TicketStatus::Active, now + Duration::seconds(1))
            .expect("queued -> active");
        assert_eq!(ticket.status, TicketStatus::Active);
        assert!(ticket.updated_at > ticket.created_at);

        ticket
            .transition(TicketStatus::Finished, now + Duration::seconds(2))
            .expect("active -> finished");

        // Terminal statuses never change.
        let err = ticket
            .transition(TicketStatus::Active, now + Duration::seconds(3))
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn test_queued_may_finish_directly() {
        let now = Utc::now();
        let mut ticket = Ticket::create(params(now), now).expect("create");
        ticket
            .transition(TicketStatus::Finished, now)
            .expect("queued -> finished");
    }

    #[test]
    fn test_expired_is_terminal() {
        let now = Utc::now();
        let mut ticket = Ticket::create(params(now), now).expect("create");
        ticket
            .transition(TicketStatus::Expired, now)
            .expect("queued -> expired");
        assert!(ticket.status.is_terminal());
        assert!(ticket.transition(TicketStatus::Finished, now).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip_preserves_extra() {
        let now = Utc::now();
        let mut p = params(now);
        p.extra
            .insert("owner".into(), Value::String("provisioner".into()));
        let ticket = Ticket::create(p, now).expect("create");

        let bytes = ticket.encode().expect("encode");
        let decoded: Ticket = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(decoded.uuid, ticket.uuid);
        assert_eq!(decoded.extra, ticket.extra);
        assert_eq!(decoded.expires_at, ticket.expires_at);
    }

    #[test]
    fn test_document_timestamps_are_millis() {
        let now = Utc::now();
        let ticket = Ticket::create(params(now), now).expect("create");
        let doc: Value = serde_json::from_slice(&ticket.encode().expect("encode")).expect("json");
        assert!(doc[fields::CREATED_AT].is_i64());
        assert_eq!(doc[fields::STATUS], Value::String("queued".into()));
    }
}
