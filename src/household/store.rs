//! Persistence for the household snapshot.
//!
//! Two JSON files, matching what the setup wizard writes: a members file
//! carrying the meter and household ids, and a separate guests file.

use crate::household::model::{GuestRecord, HouseholdSnapshot, MemberRecord};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("household store io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("household file {path} is invalid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Load/save accessors for the household snapshot.
pub trait HouseholdStore: Send + Sync {
    fn load(&self) -> Result<HouseholdSnapshot, StoreError>;
    fn save(&self, snapshot: &HouseholdSnapshot) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct MembersFile {
    #[serde(default)]
    meter_id: String,
    #[serde(default)]
    hhid: String,
    #[serde(default)]
    members: Vec<MemberRecord>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct GuestsFile {
    #[serde(default)]
    guests: Vec<GuestRecord>,
}

#[derive(Debug, Clone)]
pub struct JsonHouseholdStore {
    members_path: PathBuf,
    guests_path: PathBuf,
    device_id: String,
}

impl JsonHouseholdStore {
    pub fn new(
        members_path: impl Into<PathBuf>,
        guests_path: impl Into<PathBuf>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            members_path: members_path.into(),
            guests_path: guests_path.into(),
            device_id: device_id.into(),
        }
    }

    pub fn members_path(&self) -> &Path {
        &self.members_path
    }

    pub fn guests_path(&self) -> &Path {
        &self.guests_path
    }
}

impl HouseholdStore for JsonHouseholdStore {
    fn load(&self) -> Result<HouseholdSnapshot, StoreError> {
        let members: MembersFile = read_json(&self.members_path)?.unwrap_or_else(|| MembersFile {
            meter_id: self.device_id.clone(),
            ..Default::default()
        });
        let guests: GuestsFile = read_json(&self.guests_path)?.unwrap_or_default();
        Ok(HouseholdSnapshot {
            meter_id: members.meter_id,
            hhid: members.hhid,
            members: members.members,
            guests: guests.guests,
        })
    }

    fn save(&self, snapshot: &HouseholdSnapshot) -> Result<(), StoreError> {
        let meter_id = if snapshot.meter_id.is_empty() {
            self.device_id.clone()
        } else {
            snapshot.meter_id.clone()
        };
        write_json(
            &self.members_path,
            &MembersFile {
                meter_id,
                hhid: snapshot.hhid.clone(),
                members: snapshot.members.clone(),
            },
        )?;
        write_json(
            &self.guests_path,
            &GuestsFile {
                guests: snapshot.guests.clone(),
            },
        )
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&data)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body).map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_files_load_as_empty_snapshot_for_this_device() {
        let dir = tempdir().unwrap();
        let store = JsonHouseholdStore::new(
            dir.path().join("members.json"),
            dir.path().join("guests.json"),
            "IM7",
        );
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.meter_id, "IM7");
        assert!(!snapshot.has_household());
        assert!(snapshot.members.is_empty());
        assert!(snapshot.guests.is_empty());
    }

    #[test]
    fn reads_wizard_members_file() {
        let dir = tempdir().unwrap();
        let members = dir.path().join("members.json");
        fs::write(
            &members,
            r#"{"meter_id":"IM7","hhid":"HH1","members":[
                {"member_code":"A1","dob":"1990-01-01","gender":"F","created_at":"2024-01-01","active":true},
                {"member_code":"B2","gender":"M"}
            ]}"#,
        )
        .unwrap();
        let store = JsonHouseholdStore::new(&members, dir.path().join("guests.json"), "IM7");
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.hhid, "HH1");
        assert_eq!(snapshot.members.len(), 2);
        assert!(snapshot.members[0].active);
        assert!(!snapshot.members[1].active);
        assert_eq!(snapshot.members[1].dob, None);
    }

    #[test]
    fn save_then_load_keeps_flags() {
        let dir = tempdir().unwrap();
        let store = JsonHouseholdStore::new(
            dir.path().join("state").join("members.json"),
            dir.path().join("state").join("guests.json"),
            "IM7",
        );
        let snapshot = HouseholdSnapshot {
            meter_id: String::new(),
            hhid: "HH9".into(),
            members: vec![MemberRecord {
                member_code: "A".into(),
                active: true,
                ..Default::default()
            }],
            guests: vec![GuestRecord {
                age: Some(40),
                gender: Some("M".into()),
                active: true,
            }],
        };
        store.save(&snapshot).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.meter_id, "IM7");
        assert_eq!(loaded.members, snapshot.members);
        assert_eq!(loaded.guests, snapshot.guests);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let guests = dir.path().join("guests.json");
        fs::write(&guests, "[").unwrap();
        let store = JsonHouseholdStore::new(dir.path().join("members.json"), &guests, "IM7");
        assert!(matches!(store.load(), Err(StoreError::Parse { .. })));
    }
}
