//! Boot-time reconciliation of household state with the outbound queue.
//!
//! After a real power-on nobody is watching any more, so every member and
//! guest is flipped to inactive, the stale pre-boot queue is discarded and
//! fresh "all inactive" / "no guests" events are queued. After a plain process
//! restart the queue holds genuine offline telemetry and is left alone.

use crate::delivery::event::Event;
use crate::delivery::queue::OutboundQueue;
use crate::household::boot::BootMarker;
use crate::household::model::HouseholdSnapshot;
use crate::household::store::HouseholdStore;
use crate::ops::observability::DeliveryMetrics;
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// Same boot as the previous run; nothing touched.
    ProcessRestart,
    /// Power cycle: household reset and the queue rebuilt.
    FreshBoot {
        /// Events dropped from the queue, including the first announcement.
        discarded: usize,
        /// Events left in the queue afterwards.
        announced: usize,
    },
}

pub struct Reconciler<S, M> {
    device_id: String,
    store: S,
    marker: M,
    queue: Arc<OutboundQueue>,
    metrics: Arc<DeliveryMetrics>,
    today: Option<NaiveDate>,
}

impl<S: HouseholdStore, M: BootMarker> Reconciler<S, M> {
    pub fn new(
        device_id: impl Into<String>,
        store: S,
        marker: M,
        queue: Arc<OutboundQueue>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            store,
            marker,
            queue,
            metrics,
            today: None,
        }
    }

    /// Pin the date used for age calculation.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Run once before the request layer starts. Never fails: every problem
    /// is logged and startup continues.
    pub fn reconcile_on_boot(&self) -> BootOutcome {
        let outcome = if self.marker.is_fresh_boot() {
            info!("fresh boot detected; resetting viewing session");
            self.reset_session()
        } else {
            info!("same boot; preserving queued offline events");
            BootOutcome::ProcessRestart
        };

        if let Err(err) = self.marker.record_current_boot() {
            warn!("boot marker not updated: {err}");
        }
        outcome
    }

    fn reset_session(&self) -> BootOutcome {
        if let Some(snapshot) = self.reset_household() {
            self.announce(&snapshot);
        }

        let stale = self.queue.drain_all();
        self.metrics.record_stale_discarded(stale.len());
        info!(count = stale.len(), "discarded stale queued events");

        // Rebuild after the drain so the queue ends with the authoritative state
        // even if something slipped in between the reset and the drain.
        let announced = match self.reset_household() {
            Some(snapshot) => self.announce(&snapshot),
            None => 0,
        };
        info!(announced, "queued fresh household state");
        BootOutcome::FreshBoot {
            discarded: stale.len(),
            announced,
        }
    }

    /// Load, deactivate and persist. `None` when there is nothing to announce.
    fn reset_household(&self) -> Option<HouseholdSnapshot> {
        let mut snapshot = match self.store.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("cannot load household state for reset: {err}");
                return None;
            }
        };
        if !snapshot.has_household() {
            info!("no household assigned yet; skipping reset");
            return None;
        }
        if !snapshot.belongs_to(&self.device_id) {
            warn!(
                stored = %snapshot.meter_id,
                device = %self.device_id,
                "household state belongs to another meter; skipping reset"
            );
            return None;
        }
        let changed = snapshot.deactivate_all();
        if let Err(err) = self.store.save(&snapshot) {
            warn!("failed to persist household reset: {err}");
        } else {
            info!(
                changed,
                members = snapshot.members.len(),
                guests = snapshot.guests.len(),
                "household deactivated"
            );
        }
        Some(snapshot)
    }

    fn announce(&self, snapshot: &HouseholdSnapshot) -> usize {
        let today = self
            .today
            .unwrap_or_else(|| chrono::Local::now().date_naive());
        let events = [
            Event::members_update(&self.device_id, snapshot.member_statuses(today)),
            Event::guests_update(&self.device_id, Vec::new()),
        ];
        let count = events.len();
        for event in events {
            self.queue.enqueue(event);
            self.metrics.record_queued();
        }
        count
    }
}
