//! Household operations invoked by the request layer.
//!
//! Local state is persisted only after the matching event was either
//! confirmed by the broker or queued, so the snapshot never claims an
//! `active` transition the cloud has not at least been queued to learn about.
//!
//! Mutating operations run one at a time: each event is built from the
//! snapshot the previous operation saved.

use crate::delivery::event::Event;
use crate::delivery::publisher::{BrokerLink, Delivery, Publisher};
use crate::household::model::GuestRecord;
use crate::household::store::{HouseholdStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("member index {index} out of range (household has {len})")]
    MemberIndex { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberToggle {
    pub index: usize,
    pub active: bool,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestSync {
    pub guest_count: usize,
    pub delivery: Delivery,
}

pub struct HouseholdService<S, L> {
    device_id: String,
    store: S,
    publisher: Publisher<L>,
    // Held across load, publish and save.
    writes: Mutex<()>,
}

impl<S: HouseholdStore, L: BrokerLink> HouseholdService<S, L> {
    pub fn new(device_id: impl Into<String>, store: S, publisher: Publisher<L>) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            publisher,
            writes: Mutex::new(()),
        }
    }

    /// Flip one member's viewing status.
    pub async fn toggle_member(&self, index: usize) -> Result<MemberToggle, ServiceError> {
        let _writes = self.writes.lock().await;
        let mut snapshot = self.store.load()?;
        let len = snapshot.members.len();
        let Some(member) = snapshot.members.get(index) else {
            return Err(ServiceError::MemberIndex { index, len });
        };
        let active = !member.active;

        let mut proposed = snapshot.clone();
        proposed.members[index].active = active;
        let event = Event::members_update(&self.device_id, proposed.member_statuses(today()));
        let delivery = self.publisher.confirm_or_queue(event).await;

        snapshot.members[index].active = active;
        self.store.save(&snapshot)?;
        info!(index, active, delivery = delivery.as_str(), "member status toggled");
        Ok(MemberToggle {
            index,
            active,
            delivery,
        })
    }

    /// Replace the guest list; every listed guest is present and active.
    pub async fn sync_guests(&self, guests: Vec<GuestRecord>) -> Result<GuestSync, ServiceError> {
        let _writes = self.writes.lock().await;
        let mut snapshot = self.store.load()?;
        snapshot.guests = guests
            .into_iter()
            .map(|guest| GuestRecord {
                active: true,
                ..guest
            })
            .collect();
        let event = Event::guests_update(&self.device_id, snapshot.guest_statuses());
        let delivery = self.publisher.confirm_or_queue(event).await;

        self.store.save(&snapshot)?;
        let guest_count = snapshot.guests.len();
        info!(guest_count, delivery = delivery.as_str(), "guests synced");
        Ok(GuestSync {
            guest_count,
            delivery,
        })
    }

    /// Fire-and-forget announcement of the current member list. `None` when no
    /// member has resolvable age and gender.
    pub fn announce_members(&self) -> Result<Option<Delivery>, ServiceError> {
        let snapshot = self.store.load()?;
        let members = snapshot.member_statuses(today());
        if members.is_empty() {
            info!("no valid members to announce");
            return Ok(None);
        }
        Ok(Some(
            self.publisher
                .publish_or_queue(Event::members_update(&self.device_id, members)),
        ))
    }
}

fn today() -> chrono::NaiveDate {
    chrono::Local::now().date_naive()
}
