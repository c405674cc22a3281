//! Global ready queue and the worker dispatch loop.
//!
//! The ready queue is a growable FIFO of mailboxes with work. Each worker
//! dequeues one mailbox, dispatches a weight-dependent batch of its messages
//! to the owning service, then hands the mailbox back to the tail of the
//! ready queue. Per-mailbox FIFO order and single-owner dispatch follow from
//! the mailbox `in_global` flag; fairness across mailboxes is plain FIFO.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::mailbox::Mailbox;
use super::monitor::WorkerMonitor;
use super::service::ServiceCell;
use super::Kernel;
use crate::types::Handle;

/// Per-worker batch weights: -1 dispatches one message per turn, `w >= 0`
/// dispatches `len >> w` (at least one).
const WORKER_WEIGHTS: [i32; 32] = [
    -1, -1, -1, -1, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3,
    3, 3,
];

/// Weight assigned to worker `index`.
pub fn worker_weight(index: usize) -> i32 {
    WORKER_WEIGHTS
        .get(index)
        .copied()
        .unwrap_or(WORKER_WEIGHTS[WORKER_WEIGHTS.len() - 1])
}

/// Scheduler-level FIFO of mailboxes that currently have work.
#[derive(Debug)]
pub struct GlobalQueue {
    queue: Mutex<super::ring::RingBuffer<Arc<Mailbox>>>,
    ready: Condvar,
    sleeping: AtomicUsize,
}

impl GlobalQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(super::ring::RingBuffer::with_capacity(capacity)),
            ready: Condvar::new(),
            sleeping: AtomicUsize::new(0),
        }
    }

    pub fn enqueue(&self, mailbox: Arc<Mailbox>) {
        let mut queue = self.queue.lock();
        queue.push(mailbox);
        if self.sleeping.load(Ordering::Relaxed) > 0 {
            self.ready.notify_one();
        }
    }

    pub fn dequeue(&self) -> Option<Arc<Mailbox>> {
        self.queue.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until a mailbox is queued or `timeout` passes.
    pub fn wait_for_work(&self, timeout: Duration) {
        let mut queue = self.queue.lock();
        if !queue.is_empty() {
            return;
        }
        self.sleeping.fetch_add(1, Ordering::Relaxed);
        let _ = self.ready.wait_for(&mut queue, timeout);
        self.sleeping.fetch_sub(1, Ordering::Relaxed);
    }

    /// Wake every sleeping worker (shutdown).
    pub fn wake_all(&self) {
        let _guard = self.queue.lock();
        self.ready.notify_all();
    }
}

impl Kernel {
    /// Run one scheduling step: take the next ready mailbox, dispatch a
    /// batch of its messages, and re-queue it. Returns `false` when the
    /// ready queue was empty.
    pub fn dispatch_next(&self, monitor: &WorkerMonitor, weight: i32) -> bool {
        let Some(mailbox) = self.global.dequeue() else {
            return false;
        };
        let handle = mailbox.handle();

        let Some(cell) = self.registry.grab(handle) else {
            match mailbox.drain_released() {
                Some(dropped) => {
                    for msg in dropped {
                        self.drop_message(handle, msg);
                    }
                }
                // Retired but a producer still holds the service; try again later.
                None => self.global.enqueue(mailbox),
            }
            return true;
        };

        let mut batch = 1;
        let mut i = 0;
        while i < batch {
            // The service may have exited (or been killed) during the last
            // callback; leave the rest of the queue to `drain_released`.
            if i > 0 && !self.still_registered(handle, &cell) {
                break;
            }
            let Some(msg) = mailbox.pop() else {
                // Empty: pop unlinked the mailbox, do not re-queue it.
                return true;
            };
            if i == 0 && weight >= 0 {
                batch = (mailbox.len() >> weight).max(1);
            }
            if let Some(overload) = mailbox.take_overload() {
                tracing::warn!(handle = %handle, overload, "mailbox may be overloaded");
            }
            monitor.trigger(msg.source, handle);
            self.dispatch(&cell, msg);
            monitor.trigger(Handle::NONE, Handle::NONE);
            i += 1;
        }
        drop(cell);

        self.global.enqueue(mailbox);
        true
    }

    /// True while `cell` is still the live occupant of `handle`'s slot.
    fn still_registered(&self, handle: Handle, cell: &Arc<ServiceCell>) -> bool {
        self.registry
            .grab(handle)
            .is_some_and(|live| Arc::ptr_eq(&live, cell))
    }

    /// Worker thread body: dispatch until shutdown, sleeping briefly when
    /// the ready queue is empty.
    pub(crate) fn run_worker(self: Arc<Self>, index: usize, monitor: Arc<WorkerMonitor>) {
        let weight = worker_weight(index);
        tracing::debug!(worker = index, weight, "worker started");
        while !self.is_shutting_down() {
            if !self.dispatch_next(&monitor, weight) {
                self.global.wait_for_work(self.config.kernel.idle_sleep);
            }
        }
        tracing::debug!(worker = index, "worker stopped");
    }
}
