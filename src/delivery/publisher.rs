//! Publish entry points used by the rest of the appliance.
//!
//! - [`Publisher::publish_or_queue`]: fire-and-forget, falls back to the queue.
//! - [`Publisher::publish_and_confirm`]: waits for the broker's acknowledgment
//!   of this specific publish, bounded by a timeout.
//! - [`Publisher::confirm_or_queue`]: the combination interactive callers use
//!   before persisting a state change.

use crate::delivery::acks::{AckOutcome, AckWait};
use crate::delivery::event::Event;
use crate::delivery::queue::OutboundQueue;
use crate::ops::observability::DeliveryMetrics;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default bound for [`Publisher::publish_and_confirm`].
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("broker not connected")]
    NotConnected,
    #[error("connection worker is saturated")]
    Busy,
    #[error("connection worker has stopped")]
    Closed,
}

/// What a publisher needs from the broker connection.
pub trait BrokerLink: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Hand an event over without tracking its acknowledgment. Events accepted
    /// here that never get acknowledged are put back on the queue by the link.
    fn send(&self, event: Event) -> Result<(), LinkError>;

    /// Hand an event over and get a waiter bound to this publish only.
    fn send_tracked(&self, event: Event) -> Result<AckWait, LinkError>;
}

/// How an event left the caller's hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Broker acknowledged the publish.
    Sent,
    /// Handed to the live connection; acknowledgment not awaited.
    Submitted,
    /// Appended to the outbound queue for a later flush.
    Queued,
}

impl Delivery {
    pub fn as_str(self) -> &'static str {
        match self {
            Delivery::Sent => "sent",
            Delivery::Submitted => "submitted",
            Delivery::Queued => "queued",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Publisher<L> {
    link: L,
    queue: Arc<OutboundQueue>,
    metrics: Arc<DeliveryMetrics>,
    confirm_timeout: Duration,
}

impl<L: BrokerLink> Publisher<L> {
    pub fn new(link: L, queue: Arc<OutboundQueue>, metrics: Arc<DeliveryMetrics>) -> Self {
        Self {
            link,
            queue,
            metrics,
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    /// Publish if connected, otherwise queue. Never fails.
    pub fn publish_or_queue(&self, event: Event) -> Delivery {
        if self.link.is_connected() {
            match self.link.send(event.clone()) {
                Ok(()) => {
                    debug!(kind = %event.kind(), "event submitted to broker link");
                    return Delivery::Submitted;
                }
                Err(err) => warn!(kind = %event.kind(), "publish failed, queueing: {err}"),
            }
        }
        self.enqueue(event);
        Delivery::Queued
    }

    /// Publish and wait up to `timeout` for this publish's acknowledgment.
    pub async fn publish_and_confirm(&self, event: Event, timeout: Duration) -> bool {
        if !self.link.is_connected() {
            debug!(kind = %event.kind(), "not connected; skipping confirmed publish");
            return false;
        }
        let kind = event.kind();
        let wait = match self.link.send_tracked(event) {
            Ok(wait) => wait,
            Err(err) => {
                warn!(%kind, "confirmed publish rejected: {err}");
                return false;
            }
        };
        let token = wait.token();
        let outcome = wait.wait(timeout).await;
        match outcome {
            AckOutcome::Delivered => debug!(%kind, %token, "publish confirmed"),
            AckOutcome::Rejected => {
                self.metrics.record_confirm_rejected();
                warn!(%kind, %token, "publish dropped before acknowledgment");
            }
            AckOutcome::TimedOut => {
                self.metrics.record_confirm_timeout();
                warn!(
                    %kind,
                    %token,
                    timeout_ms = timeout.as_millis() as u64,
                    "publish not confirmed in time"
                );
            }
        }
        outcome.is_delivered()
    }

    /// Try a confirmed publish with the configured timeout; queue on failure.
    pub async fn confirm_or_queue(&self, event: Event) -> Delivery {
        if self
            .publish_and_confirm(event.clone(), self.confirm_timeout)
            .await
        {
            return Delivery::Sent;
        }
        self.enqueue(event);
        Delivery::Queued
    }

    pub fn enqueue(&self, event: Event) {
        self.queue.enqueue(event);
        self.metrics.record_queued();
    }
}
