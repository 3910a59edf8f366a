//! Core domain models, storage and shared primitives for trace delivery.
//!
//! Provides strongly-typed identifiers, the delivery state machine, delivery
//! events, clock abstractions and the PostgreSQL repositories. The delivery
//! engine builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryCancelledEvent, DeliveryDeferredEvent, DeliveryEvent, DeliveryFailedEvent,
    DeliveryRetryScheduledEvent, DeliverySucceededEvent, EventHandler, MulticastEventHandler,
    NoOpEventHandler, TracingEventHandler,
};
pub use models::{
    Claim, ClaimedRecord, DeliveryId, DeliveryRecord, DeliveryStatus, Destination,
    DestinationId, ExpirySummary, OrgId, Organization, Trace, TraceId, Transition,
};
pub use time::{Clock, RealClock, TestClock};
