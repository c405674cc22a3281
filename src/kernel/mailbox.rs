//! Per-service mailbox.
//!
//! A mailbox is a growable FIFO of [`Message`]s guarded by a short-held lock,
//! plus an `in_global` flag recording whether it is currently linked into the
//! ready queue *or held by a worker*. The flag is what keeps two workers from
//! ever draining the same mailbox at once:
//!
//! - `push` links the mailbox only when the flag is clear.
//! - `pop` clears the flag only when it finds the queue empty; a worker that
//!   pops the last message keeps the flag set until it hands the mailbox back
//!   to the ready queue, and the next pop there observes the empty queue.
//!
//! New mailboxes start with the flag set so messages sent to a service while
//! it initializes accumulate without being scheduled; the launcher links the
//! mailbox once `init` returns.

use parking_lot::Mutex;
use std::sync::Arc;

use super::message::Message;
use super::ring::RingBuffer;
use super::scheduler::GlobalQueue;
use crate::types::Handle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseState {
    Live,
    /// Owning service is gone; the next worker to see the mailbox drains it.
    Marked,
    /// Drained; further pushes are rejected.
    Drained,
}

#[derive(Debug)]
struct MailboxInner {
    queue: RingBuffer<Message>,
    in_global: bool,
    release: ReleaseState,
    overload: usize,
    overload_threshold: usize,
}

/// FIFO message queue owned 1:1 by a service.
#[derive(Debug)]
pub struct Mailbox {
    handle: Handle,
    initial_threshold: usize,
    inner: Mutex<MailboxInner>,
}

impl Mailbox {
    pub fn new(handle: Handle, capacity: usize, overload_threshold: usize) -> Arc<Self> {
        let overload_threshold = overload_threshold.max(1);
        Arc::new(Self {
            handle,
            initial_threshold: overload_threshold,
            inner: Mutex::new(MailboxInner {
                queue: RingBuffer::with_capacity(capacity),
                in_global: true,
                release: ReleaseState::Live,
                overload: 0,
                overload_threshold,
            }),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a message, linking the mailbox into `global` if it is not
    /// already linked. A drained mailbox hands the message back.
    pub fn push(self: &Arc<Self>, msg: Message, global: &GlobalQueue) -> Result<(), Message> {
        let link = {
            let mut inner = self.inner.lock();
            if inner.release == ReleaseState::Drained {
                return Err(msg);
            }
            inner.queue.push(msg);
            if inner.in_global {
                false
            } else {
                inner.in_global = true;
                true
            }
        };
        if link {
            global.enqueue(Arc::clone(self));
        }
        Ok(())
    }

    /// Dequeue one message. Finding the queue empty unlinks the mailbox.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        match inner.queue.pop() {
            Some(msg) => {
                let length = inner.queue.len();
                while length > inner.overload_threshold {
                    inner.overload = length;
                    inner.overload_threshold *= 2;
                }
                Some(msg)
            }
            None => {
                inner.overload_threshold = self.initial_threshold;
                inner.in_global = false;
                None
            }
        }
    }

    /// Queue length recorded at the last threshold crossing, cleared on read.
    pub fn take_overload(&self) -> Option<usize> {
        let mut inner = self.inner.lock();
        match inner.overload {
            0 => None,
            n => {
                inner.overload = 0;
                Some(n)
            }
        }
    }

    /// Mark the mailbox for deferred release after its service is gone.
    /// If no worker holds it, link it so one will drain it.
    pub fn mark_release(self: &Arc<Self>, global: &GlobalQueue) {
        let link = {
            let mut inner = self.inner.lock();
            if inner.release != ReleaseState::Live {
                return;
            }
            inner.release = ReleaseState::Marked;
            if inner.in_global {
                false
            } else {
                inner.in_global = true;
                true
            }
        };
        if link {
            global.enqueue(Arc::clone(self));
        }
    }

    /// Drain the mailbox if it has been marked for release; `None` means the
    /// mailbox is still live and must go back to the ready queue.
    pub fn drain_released(&self) -> Option<Vec<Message>> {
        let mut inner = self.inner.lock();
        match inner.release {
            ReleaseState::Live => None,
            ReleaseState::Marked | ReleaseState::Drained => {
                inner.release = ReleaseState::Drained;
                Some(inner.queue.drain())
            }
        }
    }

    /// Close immediately, returning whatever was queued (launch failure).
    pub fn close(&self) -> Vec<Message> {
        let mut inner = self.inner.lock();
        inner.release = ReleaseState::Drained;
        inner.queue.drain()
    }
}
