//! Household snapshot: the locally persisted members and guests with their
//! `active` flags, and the filters that turn records into wire entries.

use crate::delivery::event::{GuestStatus, MemberStatus};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Date format used for member dates of birth.
pub const DOB_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    #[serde(default)]
    pub member_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub active: bool,
}

impl MemberRecord {
    /// Wire entry for this member, or `None` when age or gender cannot be
    /// resolved.
    pub fn status(&self, today: NaiveDate) -> Option<MemberStatus> {
        let age = age_on(self.dob.as_deref()?, today)?;
        let gender = non_empty(self.gender.as_deref())?;
        Some(MemberStatus {
            member_id: self.member_code.clone(),
            age,
            gender: gender.to_string(),
            active: self.active,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default)]
    pub active: bool,
}

impl GuestRecord {
    pub fn status(&self) -> Option<GuestStatus> {
        Some(GuestStatus {
            age: self.age?,
            gender: non_empty(self.gender.as_deref())?.to_string(),
            active: self.active,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HouseholdSnapshot {
    pub meter_id: String,
    pub hhid: String,
    pub members: Vec<MemberRecord>,
    pub guests: Vec<GuestRecord>,
}

impl HouseholdSnapshot {
    /// A household id has been assigned to this appliance.
    pub fn has_household(&self) -> bool {
        !self.hhid.trim().is_empty()
    }

    /// Records with no meter id are treated as this device's.
    pub fn belongs_to(&self, device_id: &str) -> bool {
        self.meter_id.is_empty() || self.meter_id == device_id
    }

    pub fn member_statuses(&self, today: NaiveDate) -> Vec<MemberStatus> {
        self.members.iter().filter_map(|m| m.status(today)).collect()
    }

    pub fn guest_statuses(&self) -> Vec<GuestStatus> {
        self.guests.iter().filter_map(GuestRecord::status).collect()
    }

    /// Flip every member and guest to inactive. Returns how many flags changed.
    pub fn deactivate_all(&mut self) -> usize {
        let mut changed = 0;
        for member in &mut self.members {
            changed += usize::from(member.active);
            member.active = false;
        }
        for guest in &mut self.guests {
            changed += usize::from(guest.active);
            guest.active = false;
        }
        changed
    }

    pub fn any_active(&self) -> bool {
        self.members.iter().any(|m| m.active) || self.guests.iter().any(|g| g.active)
    }
}

/// Completed years between `dob` (`YYYY-MM-DD`) and `today`. `None` for
/// unparsable or future dates.
pub fn age_on(dob: &str, today: NaiveDate) -> Option<u32> {
    let born = NaiveDate::parse_from_str(dob.trim(), DOB_FORMAT).ok()?;
    if born > today {
        return None;
    }
    let mut years = today.year() - born.year();
    if (today.month(), today.day()) < (born.month(), born.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
