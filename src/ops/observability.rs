//! Delivery counters exported on the status endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the publisher, the connection worker and the
/// reconciler.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    published: AtomicU64,
    acked: AtomicU64,
    queued: AtomicU64,
    flushed: AtomicU64,
    requeued: AtomicU64,
    confirm_timeouts: AtomicU64,
    confirm_rejected: AtomicU64,
    connects: AtomicU64,
    connect_failures: AtomicU64,
    cert_missing: AtomicU64,
    stale_discarded: AtomicU64,
}

/// Point-in-time copy of [`DeliveryMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySnapshot {
    pub published_total: u64,
    pub acked_total: u64,
    pub queued_total: u64,
    pub flushed_total: u64,
    pub requeued_total: u64,
    pub confirm_timeouts_total: u64,
    pub confirm_rejected_total: u64,
    pub connects_total: u64,
    pub connect_failures_total: u64,
    pub cert_missing_total: u64,
    pub stale_discarded_total: u64,
}

impl DeliveryMetrics {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flushed(&self, delivered: usize) {
        self.flushed.fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub fn record_requeued(&self, count: usize) {
        self.requeued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_confirm_timeout(&self) {
        self.confirm_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A confirm waiter resolved negatively before its timeout.
    pub fn record_confirm_rejected(&self) {
        self.confirm_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cert_missing(&self) {
        self.cert_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_discarded(&self, count: usize) {
        self.stale_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DeliverySnapshot {
        DeliverySnapshot {
            published_total: self.published.load(Ordering::Relaxed),
            acked_total: self.acked.load(Ordering::Relaxed),
            queued_total: self.queued.load(Ordering::Relaxed),
            flushed_total: self.flushed.load(Ordering::Relaxed),
            requeued_total: self.requeued.load(Ordering::Relaxed),
            confirm_timeouts_total: self.confirm_timeouts.load(Ordering::Relaxed),
            confirm_rejected_total: self.confirm_rejected.load(Ordering::Relaxed),
            connects_total: self.connects.load(Ordering::Relaxed),
            connect_failures_total: self.connect_failures.load(Ordering::Relaxed),
            cert_missing_total: self.cert_missing.load(Ordering::Relaxed),
            stale_discarded_total: self.stale_discarded.load(Ordering::Relaxed),
        }
    }
}

impl DeliverySnapshot {
    /// Prometheus text lines, one counter per line.
    pub fn to_prometheus(&self) -> String {
        let rows: [(&str, u64); 11] = [
            ("meterlink_published_total", self.published_total),
            ("meterlink_acked_total", self.acked_total),
            ("meterlink_queued_total", self.queued_total),
            ("meterlink_flushed_total", self.flushed_total),
            ("meterlink_requeued_total", self.requeued_total),
            ("meterlink_confirm_timeouts_total", self.confirm_timeouts_total),
            ("meterlink_confirm_rejected_total", self.confirm_rejected_total),
            ("meterlink_connects_total", self.connects_total),
            ("meterlink_connect_failures_total", self.connect_failures_total),
            ("meterlink_cert_missing_total", self.cert_missing_total),
            ("meterlink_stale_discarded_total", self.stale_discarded_total),
        ];
        let mut body = String::new();
        for (name, value) in rows {
            body.push_str(&format!("{} {}\n", name, value));
        }
        body
    }
}
