//! Growable circular buffer shared by mailboxes and the ready queue.
//!
//! Capacity is always a power of two. When a push finds the buffer full, the
//! contents are copied in logical (head → tail) order into a buffer twice the
//! size, so wrap state never affects ordering or count.

#[derive(Debug)]
pub(crate) struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> RingBuffer<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    pub(crate) fn push(&mut self, value: T) {
        if self.len == self.slots.len() {
            self.grow();
        }
        self.slots[self.tail] = Some(value);
        self.tail = (self.tail + 1) & self.mask();
        self.len += 1;
    }

    pub(crate) fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) & self.mask();
        self.len -= 1;
        value
    }

    /// Double the capacity, re-laying entries out from index 0 in order.
    pub(crate) fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        let mut slots: Vec<Option<T>> = Vec::with_capacity(new_capacity);
        let mask = self.mask();
        for i in 0..self.len {
            slots.push(self.slots[(self.head + i) & mask].take());
        }
        slots.resize_with(new_capacity, || None);
        self.slots = slots;
        self.head = 0;
        self.tail = self.len;
    }

    /// Remove every entry in FIFO order.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(value) = self.pop() {
            out.push(value);
        }
        out
    }
}
