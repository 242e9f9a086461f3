//! Household state: the persisted snapshot, boot detection, the boot-time
//! reconciler and the operations the request layer calls.

pub mod boot;
pub mod model;
pub mod reconcile;
pub mod service;
pub mod store;

pub use boot::{BootMarker, FileBootMarker};
pub use model::{GuestRecord, HouseholdSnapshot, MemberRecord};
pub use reconcile::{BootOutcome, Reconciler};
pub use service::{GuestSync, HouseholdService, MemberToggle, ServiceError};
pub use store::{HouseholdStore, JsonHouseholdStore, StoreError};
