//! Handle registry - live services by handle, plus local name aliases.
//!
//! Slots live in a power-of-two table indexed by `handle & (size - 1)`. New
//! handles are allocated from a rotating cursor so a freshly retired slot id
//! is not handed out again immediately; when no slot is free the table
//! doubles and every occupant is rehashed into it.
//!
//! One reader/writer lock guards both the slot table and the name table.
//! `grab` (the hot path) takes it shared; `register`, `retire` and
//! `bind_name` take it exclusively.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::types::{Error, Handle, Result, HANDLE_MASK};

/// Anything stored in the registry knows its own handle, so a lookup can
/// reject a slot that was recycled for another occupant.
pub trait Registered {
    fn handle(&self) -> Handle;
}

#[derive(Debug)]
struct NameEntry {
    name: String,
    handle: Handle,
}

#[derive(Debug)]
struct RegistryInner<T> {
    cursor: u32,
    slots: Vec<Option<Arc<T>>>,
    names: Vec<NameEntry>,
}

impl<T: Registered> RegistryInner<T> {
    fn find_free(&mut self) -> Option<u32> {
        let size = self.slots.len();
        let mut local = self.cursor;
        for _ in 0..size {
            if local > HANDLE_MASK || local == 0 {
                local = 1;
            }
            let slot = local as usize & (size - 1);
            if self.slots[slot].is_none() {
                self.cursor = local + 1;
                return Some(local);
            }
            local += 1;
        }
        None
    }

    fn grow(&mut self) -> Result<()> {
        let new_size = self.slots.len() * 2;
        if new_size - 1 > HANDLE_MASK as usize {
            return Err(Error::capacity(format!(
                "handle table cannot grow past {} slots",
                self.slots.len()
            )));
        }
        let mut slots: Vec<Option<Arc<T>>> = Vec::with_capacity(new_size);
        slots.resize_with(new_size, || None);
        for entry in self.slots.drain(..).flatten() {
            let slot = entry.handle().local_id() as usize & (new_size - 1);
            slots[slot] = Some(entry);
        }
        self.slots = slots;
        Ok(())
    }
}

/// Registry mapping handles to live occupants.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    node: u8,
    inner: RwLock<RegistryInner<T>>,
}

impl<T: Registered> HandleRegistry<T> {
    pub fn new(node: u8, initial_slots: usize) -> Self {
        let size = initial_slots.max(1).next_power_of_two();
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || None);
        Self {
            node,
            inner: RwLock::new(RegistryInner {
                cursor: 1,
                slots,
                names: Vec::new(),
            }),
        }
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    /// Allocate a handle and install the occupant built for it. Returns the
    /// handle together with the creator's reference.
    ///
    /// Only fails when all 2^24 local ids are in use.
    pub fn register(&self, make: impl FnOnce(Handle) -> Arc<T>) -> Result<(Handle, Arc<T>)> {
        let mut inner = self.inner.write();
        let local = loop {
            if let Some(local) = inner.find_free() {
                break local;
            }
            inner.grow()?;
        };
        let handle = Handle::new(self.node, local);
        let entry = make(handle);
        let size = inner.slots.len();
        inner.slots[local as usize & (size - 1)] = Some(Arc::clone(&entry));
        Ok((handle, entry))
    }

    /// Vacate the slot and drop every name alias pointing at it. Returns the
    /// registry's reference, which the caller drops outside the lock.
    pub fn retire(&self, handle: Handle) -> Option<Arc<T>> {
        let mut inner = self.inner.write();
        let size = inner.slots.len();
        let slot = handle.local_id() as usize & (size - 1);
        let matches = inner.slots[slot]
            .as_ref()
            .is_some_and(|entry| entry.handle() == handle);
        if !matches {
            return None;
        }
        let entry = inner.slots[slot].take();
        inner.names.retain(|n| n.handle != handle);
        entry
    }

    /// Retire every live handle. Returns the retired occupants.
    pub fn retire_all(&self) -> Vec<Arc<T>> {
        let mut retired = Vec::new();
        loop {
            let handles = self.handles();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Some(entry) = self.retire(handle) {
                    retired.push(entry);
                }
            }
        }
        retired
    }

    /// Look up a live occupant, taking a new reference to it.
    pub fn grab(&self, handle: Handle) -> Option<Arc<T>> {
        let inner = self.inner.read();
        let size = inner.slots.len();
        inner.slots[handle.local_id() as usize & (size - 1)]
            .as_ref()
            .filter(|entry| entry.handle() == handle)
            .map(Arc::clone)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Handle> {
        let inner = self.inner.read();
        inner
            .names
            .binary_search_by(|n| n.name.as_str().cmp(name))
            .ok()
            .map(|i| inner.names[i].handle)
    }

    /// Alias `name` to `handle`. Returns `None` if the name is taken.
    pub fn bind_name(&self, handle: Handle, name: &str) -> Option<String> {
        let mut inner = self.inner.write();
        match inner.names.binary_search_by(|n| n.name.as_str().cmp(name)) {
            Ok(_) => None,
            Err(at) => {
                inner.names.insert(
                    at,
                    NameEntry {
                        name: name.to_string(),
                        handle,
                    },
                );
                Some(name.to_string())
            }
        }
    }

    /// Names currently aliased to `handle`.
    pub fn names_of(&self, handle: Handle) -> Vec<String> {
        self.inner
            .read()
            .names
            .iter()
            .filter(|n| n.handle == handle)
            .map(|n| n.name.clone())
            .collect()
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.inner
            .read()
            .slots
            .iter()
            .flatten()
            .map(|entry| entry.handle())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slot_count(&self) -> usize {
        self.inner.read().slots.len()
    }
}
