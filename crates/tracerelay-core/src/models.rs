//! Core domain models and strongly-typed identifiers.
//!
//! Defines traces, destinations, delivery records, and newtype ID wrappers
//! for compile-time type safety. Includes database serialization traits and
//! the delivery state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Declares a UUID newtype identifier with display, conversion and Postgres
/// encoding support.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed organization identifier.
    ///
    /// Every trace and destination is scoped to exactly one organization.
    OrgId
);

uuid_id!(
    /// Strongly-typed identifier of a persisted trace row.
    TraceId
);

uuid_id!(
    /// Strongly-typed destination identifier.
    DestinationId
);

uuid_id!(
    /// Strongly-typed delivery record identifier.
    DeliveryId
);

/// Organization owning traces and destinations.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    /// Unique identifier for this organization.
    pub id: OrgId,
    /// Human-readable name.
    pub name: String,
    /// When the organization was created.
    pub created_at: DateTime<Utc>,
}

/// An immutable captured event to be routed to destinations.
///
/// `external_trace_id`, `span_id` and `parent_span_id` are grouping keys
/// carried through to adapters. The engine never orders on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trace {
    /// Unique identifier for this trace row.
    pub id: TraceId,
    /// Organization that ingested the trace.
    pub org_id: OrgId,
    /// Trace grouping key from the producing system.
    pub external_trace_id: Option<String>,
    /// Span identifier within the external trace.
    pub span_id: Option<String>,
    /// Parent span identifier within the external trace.
    pub parent_span_id: Option<String>,
    /// Opaque structured payload.
    pub data: Value,
    /// Free-form metadata attached at ingestion.
    pub metadata: Value,
    /// When the trace was captured.
    pub created_at: DateTime<Utc>,
    /// When the trace becomes eligible for deletion.
    pub expires_at: DateTime<Utc>,
}

impl Trace {
    /// Returns true once `expires_at` lies strictly in the past.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// An org-scoped delivery target.
///
/// Written by the configuration surface; read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Destination {
    /// Unique identifier for this destination.
    pub id: DestinationId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Display name.
    pub name: String,
    /// Key into the adapter registry (`webhook`, `datadog`, ...).
    pub provider_type: String,
    /// Provider configuration as stored, possibly sealed at rest.
    pub config: String,
    /// Inactive destinations receive no new deliveries.
    pub is_active: bool,
    /// Higher priorities are fanned out first.
    pub priority: i32,
    /// Optional transform source applied before delivery.
    pub transform_function: Option<String>,
    /// Maximum successful deliveries per rolling minute; `None` is
    /// unlimited.
    pub rate_limit: Option<i32>,
    /// Whether failed attempts are retried.
    pub retry_enabled: bool,
    /// Attempt cap for a single delivery record.
    pub max_retries: i32,
    /// Base delay for exponential backoff in milliseconds.
    pub retry_delay_ms_base: i64,
    /// When the destination was created.
    pub created_at: DateTime<Utc>,
}

/// Delivery record lifecycle status.
///
/// ```text
/// pending ──▶ success
///    │  └───▶ retrying ──▶ success
///    │            │  └───▶ failed
///    └──▶ failed  └──────▶ cancelled
///    └──▶ cancelled
/// ```
///
/// `success`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, never attempted or deferred before its first attempt.
    Pending,
    /// At least one attempt failed; another is scheduled.
    Retrying,
    /// Delivered. Terminal.
    Success,
    /// Gave up. Terminal.
    Failed,
    /// Cancelled administratively or by trace expiry. Terminal.
    Cancelled,
}

impl DeliveryStatus {
    /// Returns true for states that never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid delivery status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// The per-(trace, destination) unit of delivery work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    /// Unique identifier for this record.
    pub id: DeliveryId,
    /// Trace being delivered.
    pub trace_id: TraceId,
    /// Target destination.
    pub destination_id: DestinationId,
    /// Current state.
    pub status: DeliveryStatus,
    /// Failed attempts so far. Deferrals never count.
    pub attempts: i32,
    /// Payload handed to the adapter on the successful attempt.
    pub transformed_payload: Option<Value>,
    /// Adapter response data from the successful attempt.
    pub response_data: Option<Value>,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// When `last_error` was recorded.
    pub last_error_at: Option<DateTime<Utc>>,
    /// When the adapter was last invoked.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the record may be processed again.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the record reached `success`.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Token of the processor currently holding the record.
    pub claim_token: Option<Uuid>,
    /// Lease expiry of the current claim.
    pub claimed_until: Option<DateTime<Utc>>,
    /// Rate-limit reservation taken by an in-flight attempt.
    pub rate_slot_at: Option<DateTime<Utc>>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Builds a fresh `pending` record for a trace/destination pair.
    pub fn new(trace_id: TraceId, destination_id: DestinationId, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            trace_id,
            destination_id,
            status: DeliveryStatus::Pending,
            attempts: 0,
            transformed_payload: None,
            response_data: None,
            last_error: None,
            last_error_at: None,
            last_attempt_at: None,
            next_retry_at: None,
            delivered_at: None,
            claim_token: None,
            claimed_until: None,
            rate_slot_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the record may be picked up for processing at `now`.
    ///
    /// Requires a non-terminal status, an elapsed (or absent) retry time and
    /// no live claim.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal()
            && self.next_retry_at.is_none_or(|at| at <= now)
            && self.claimed_until.is_none_or(|until| until < now)
    }

    /// Returns the claim currently held on this record, if any.
    pub fn claim(&self) -> Option<Claim> {
        self.claim_token.map(|token| Claim { record_id: self.id, token })
    }
}

/// Exclusive right to process one delivery record.
///
/// Every state change is applied conditionally on the token so a processor
/// whose lease was lost (or whose record was cancelled) writes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    /// Claimed record.
    pub record_id: DeliveryId,
    /// Token written at claim time.
    pub token: Uuid,
}

/// A record together with the claim under which it is being processed.
#[derive(Debug, Clone)]
pub struct ClaimedRecord {
    /// Snapshot of the record taken when the claim was acquired.
    pub record: DeliveryRecord,
    /// The claim to present on every write.
    pub claim: Claim,
}

/// A state change applied atomically to a claimed record.
///
/// Applying any transition releases the claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The adapter reported success.
    Delivered {
        /// Attempt timestamp, also used as `delivered_at`.
        at: DateTime<Utc>,
        /// Payload that was delivered.
        transformed_payload: Value,
        /// Adapter response data.
        response_data: Option<Value>,
    },
    /// The attempt failed and another one is scheduled.
    RetryScheduled {
        /// Failed attempts including this one.
        attempts: i32,
        /// Attempt timestamp.
        at: DateTime<Utc>,
        /// When the next attempt becomes due.
        next_retry_at: DateTime<Utc>,
        /// Error reported by the attempt.
        error: String,
    },
    /// Rate limit saturated: push the record back without consuming an
    /// attempt.
    Deferred {
        /// When the record becomes due again.
        next_retry_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Failed {
        /// Failed attempts including this one.
        attempts: i32,
        /// Timestamp of the decision.
        at: DateTime<Utc>,
        /// Whether an adapter call happened as part of this decision.
        attempted: bool,
        /// Final error message.
        error: String,
    },
    /// Terminal cancellation.
    Cancelled {
        /// Timestamp of the decision.
        at: DateTime<Utc>,
        /// Reason recorded as `last_error`.
        reason: String,
    },
}

impl Transition {
    /// Applies the transition to an in-memory record.
    ///
    /// Used by the in-memory storage and as the reference for the SQL
    /// implementation. Releases the claim.
    pub fn apply_to(&self, record: &mut DeliveryRecord, now: DateTime<Utc>) {
        match self {
            Self::Delivered { at, transformed_payload, response_data } => {
                record.status = DeliveryStatus::Success;
                record.delivered_at = Some(*at);
                record.last_attempt_at = Some(*at);
                record.next_retry_at = None;
                record.transformed_payload = Some(transformed_payload.clone());
                record.response_data = response_data.clone();
            },
            Self::RetryScheduled { attempts, at, next_retry_at, error } => {
                record.status = DeliveryStatus::Retrying;
                record.attempts = *attempts;
                record.last_attempt_at = Some(*at);
                record.next_retry_at = Some(*next_retry_at);
                record.last_error = Some(error.clone());
                record.last_error_at = Some(*at);
                record.rate_slot_at = None;
            },
            Self::Deferred { next_retry_at } => {
                record.next_retry_at = Some(*next_retry_at);
            },
            Self::Failed { attempts, at, attempted, error } => {
                record.status = DeliveryStatus::Failed;
                record.attempts = *attempts;
                if *attempted {
                    record.last_attempt_at = Some(*at);
                }
                record.next_retry_at = None;
                record.last_error = Some(error.clone());
                record.last_error_at = Some(*at);
                record.rate_slot_at = None;
            },
            Self::Cancelled { at, reason } => {
                record.status = DeliveryStatus::Cancelled;
                record.next_retry_at = None;
                record.last_error = Some(reason.clone());
                record.last_error_at = Some(*at);
                record.rate_slot_at = None;
            },
        }
        record.claim_token = None;
        record.claimed_until = None;
        record.updated_at = now;
    }
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    /// Trace rows deleted.
    pub traces_deleted: u64,
    /// Non-terminal delivery records cancelled on the way.
    pub deliveries_cancelled: u64,
}
