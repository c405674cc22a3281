//! Liveness monitor.
//!
//! Every worker owns a [`WorkerMonitor`] that it stamps twice per dispatch:
//! with the real `(source, destination)` pair before the callback and with
//! `(0, 0)` after it, bumping a version counter each time. A checker thread
//! samples all records once per interval. A version that has not moved while
//! the destination is non-zero means the worker spent the whole interval
//! inside one callback: the destination is flagged endless and a warning is
//! logged. Nothing is aborted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Kernel;
use crate::types::Handle;

/// Dispatch stamp for one worker thread.
#[derive(Debug, Default)]
pub struct WorkerMonitor {
    version: AtomicU32,
    check_version: AtomicU32,
    source: AtomicU32,
    destination: AtomicU32,
}

/// A worker found inside the same callback on two consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckDispatch {
    pub source: Handle,
    pub destination: Handle,
    pub version: u32,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pair about to be (or just) dispatched.
    pub fn trigger(&self, source: Handle, destination: Handle) {
        self.source.store(source.raw(), Ordering::Relaxed);
        self.destination.store(destination.raw(), Ordering::Relaxed);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Compare against the previous sample. Only the checker thread calls this.
    pub fn check(&self) -> Option<StuckDispatch> {
        let version = self.version.load(Ordering::Acquire);
        if version == self.check_version.load(Ordering::Relaxed) {
            let destination = Handle::from_raw(self.destination.load(Ordering::Relaxed));
            if !destination.is_none() {
                return Some(StuckDispatch {
                    source: Handle::from_raw(self.source.load(Ordering::Relaxed)),
                    destination,
                    version,
                });
            }
        } else {
            self.check_version.store(version, Ordering::Relaxed);
        }
        None
    }
}

impl Kernel {
    /// Sample every worker record once, flagging stuck destinations.
    pub fn check_workers(&self, monitors: &[Arc<WorkerMonitor>]) -> Vec<StuckDispatch> {
        let mut stuck = Vec::new();
        for monitor in monitors {
            if let Some(report) = monitor.check() {
                self.mark_endless(report.destination);
                tracing::warn!(
                    source = %report.source,
                    destination = %report.destination,
                    version = report.version,
                    "a message from {} to {} maybe in an endless loop",
                    report.source,
                    report.destination,
                );
                stuck.push(report);
            }
        }
        stuck
    }

    /// Checker thread body. Sleeps in short steps so shutdown stays prompt.
    pub(crate) fn run_monitor(self: Arc<Self>, monitors: Vec<Arc<WorkerMonitor>>) {
        let interval = self.config.monitor.interval;
        let step = interval.min(Duration::from_millis(100));
        let mut last = Instant::now();
        while !self.is_shutting_down() {
            std::thread::sleep(step);
            if last.elapsed() >= interval {
                self.check_workers(&monitors);
                last = Instant::now();
            }
        }
    }
}
