//! Telemetry delivery: events, the outbound queue, the broker connection and
//! the publish APIs built on top of it.

pub mod acks;
pub mod backoff;
pub mod certs;
pub mod connection;
pub mod event;
pub mod publisher;
pub mod queue;
pub mod tls;

pub use acks::{AckOutcome, AckRegistry, AckWait, CorrelationToken};
pub use backoff::Backoff;
pub use certs::{CertificatePaths, CertificateResolver, MissingCertificates};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState};
pub use event::{Event, EventDetails, EventKind, GuestStatus, MemberStatus};
pub use publisher::{BrokerLink, Delivery, LinkError, Publisher};
pub use queue::{FlushReport, OutboundQueue};
