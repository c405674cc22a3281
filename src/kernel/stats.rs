//! Kernel-wide message accounting.
//!
//! Every message accepted into a mailbox is counted once on entry and once
//! more when it leaves through exactly one disposition. At quiescence
//! `enqueued == consumed + retained + forwarded + dropped`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// How a message left the kernel's custody.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Callback returned without keeping the payload.
    Consumed,
    /// Callback took ownership of the payload.
    Retained,
    /// Redirected to another service.
    Forwarded,
    /// Discarded by the kernel (retired destination, panicking callback).
    Dropped,
}

#[derive(Debug, Default)]
pub struct KernelStats {
    enqueued: AtomicU64,
    undeliverable: AtomicU64,
    consumed: AtomicU64,
    retained: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    remote_sent: AtomicU64,
    remote_received: AtomicU64,
}

/// Point-in-time copy of [`KernelStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    /// Sends rejected before reaching a mailbox.
    pub undeliverable: u64,
    pub consumed: u64,
    pub retained: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub remote_sent: u64,
    pub remote_received: u64,
}

impl StatsSnapshot {
    /// Messages that have left through some disposition.
    pub fn settled(&self) -> u64 {
        self.consumed + self.retained + self.forwarded + self.dropped
    }
}

impl KernelStats {
    pub fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Consumed => &self.consumed,
            Disposition::Retained => &self.retained,
            Disposition::Forwarded => &self.forwarded,
            Disposition::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_undeliverable(&self) {
        self.undeliverable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_sent(&self) {
        self.remote_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_remote_received(&self) {
        self.remote_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            undeliverable: self.undeliverable.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            retained: self.retained.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            remote_sent: self.remote_sent.load(Ordering::Relaxed),
            remote_received: self.remote_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_settled() {
        let stats = KernelStats::default();
        stats.record_enqueued();
        stats.record_enqueued();
        stats.record(Disposition::Consumed);
        stats.record(Disposition::Forwarded);
        let snap = stats.snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.settled(), 2);
        assert_eq!(snap.dropped, 0);
    }
}
