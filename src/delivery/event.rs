//! Outbound telemetry events and their wire representation.
//!
//! An [`Event`] is built once and never patched: a newer event supersedes an
//! older one. On the wire it is the JSON object
//! `{"DEVICE_ID", "TS", "Type", "Details"}` with `Type` 3 for member updates
//! and 4 for guest updates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire code for a household member update.
pub const MEMBERS_UPDATE_CODE: u8 = 3;
/// Wire code for a guest update.
pub const GUESTS_UPDATE_CODE: u8 = 4;

/// Closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MembersUpdate,
    GuestsUpdate,
}

impl EventKind {
    pub fn code(self) -> u8 {
        match self {
            EventKind::MembersUpdate => MEMBERS_UPDATE_CODE,
            EventKind::GuestsUpdate => GUESTS_UPDATE_CODE,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            MEMBERS_UPDATE_CODE => Some(EventKind::MembersUpdate),
            GUESTS_UPDATE_CODE => Some(EventKind::GuestsUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::MembersUpdate => f.write_str("members_update"),
            EventKind::GuestsUpdate => f.write_str("guests_update"),
        }
    }
}

/// One fully-resolved member entry inside a `MembersUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub member_id: String,
    pub age: u32,
    pub gender: String,
    pub active: bool,
}

/// One fully-resolved guest entry inside a `GuestsUpdate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestStatus {
    pub age: u32,
    pub gender: String,
    pub active: bool,
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDetails {
    Members(Vec<MemberStatus>),
    Guests(Vec<GuestStatus>),
}

/// Immutable outbound telemetry message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireEvent", try_from = "WireEvent")]
pub struct Event {
    device_id: String,
    timestamp: u64,
    details: EventDetails,
}

impl Event {
    /// Build a member update stamped with the current time.
    pub fn members_update(device_id: impl Into<String>, members: Vec<MemberStatus>) -> Self {
        Self::at(device_id, now_unix(), EventDetails::Members(members))
    }

    /// Build a guest update stamped with the current time.
    pub fn guests_update(device_id: impl Into<String>, guests: Vec<GuestStatus>) -> Self {
        Self::at(device_id, now_unix(), EventDetails::Guests(guests))
    }

    /// Build an event with an explicit timestamp (unix seconds).
    pub fn at(device_id: impl Into<String>, timestamp: u64, details: EventDetails) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            details,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn details(&self) -> &EventDetails {
        &self.details
    }

    pub fn kind(&self) -> EventKind {
        match self.details {
            EventDetails::Members(_) => EventKind::MembersUpdate,
            EventDetails::Guests(_) => EventKind::GuestsUpdate,
        }
    }

    /// Serialize to the JSON bytes published on the broker topic.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// -----------------------------------------------------------------------------
// Wire form
// -----------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
struct WireEvent {
    #[serde(rename = "DEVICE_ID")]
    device_id: String,
    #[serde(rename = "TS")]
    ts: String,
    #[serde(rename = "Type")]
    kind: u8,
    #[serde(rename = "Details")]
    details: WireDetails,
}

#[derive(Serialize, Deserialize, Default)]
struct WireDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    members: Option<Vec<MemberStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    guests: Option<Vec<GuestStatus>>,
}

impl From<Event> for WireEvent {
    fn from(event: Event) -> Self {
        let kind = event.kind().code();
        let details = match event.details {
            EventDetails::Members(members) => WireDetails {
                members: Some(members),
                guests: None,
            },
            EventDetails::Guests(guests) => WireDetails {
                members: None,
                guests: Some(guests),
            },
        };
        WireEvent {
            device_id: event.device_id,
            ts: event.timestamp.to_string(),
            kind,
            details,
        }
    }
}

impl TryFrom<WireEvent> for Event {
    type Error = String;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let timestamp = wire
            .ts
            .parse::<u64>()
            .map_err(|e| format!("invalid TS {:?}: {e}", wire.ts))?;
        let details = match EventKind::from_code(wire.kind) {
            Some(EventKind::MembersUpdate) => {
                EventDetails::Members(wire.details.members.unwrap_or_default())
            }
            Some(EventKind::GuestsUpdate) => {
                EventDetails::Guests(wire.details.guests.unwrap_or_default())
            }
            None => return Err(format!("unknown event Type {}", wire.kind)),
        };
        Ok(Event {
            device_id: wire.device_id,
            timestamp,
            details,
        })
    }
}
