// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Handle database: a check-tagged slot arena that turns opaque 64-bit
//! handles into live object references across an API boundary.
//!
//! Each slot carries a random nonzero `check` cookie; the public handle is
//! `(check << 32) | index`. A lookup with a stale cookie fails with
//! [`Error::BadHandle`] instead of touching a recycled slot. Destruction is
//! deferred: `destroy` marks the slot for removal, and the instance is torn
//! down by the final `put` once the reference count drains to zero.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Opaque public handle.
pub type Handle = u64;

const CHECK_MAX_RETRIES: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    PendingRemoval,
    Active,
}

struct Slot<T> {
    state: SlotState,
    instance: Option<Arc<T>>,
    refcount: u32,
    check: u32,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            state: SlotState::Empty,
            instance: None,
            refcount: 0,
            check: 0,
        }
    }
}

/// Destructor invoked exactly once per instance, on final release.
pub type Destructor<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    slots: Vec<Slot<T>>,
    iterator: usize,
}

/// Check-tagged handle table.
///
/// All operations serialize on one mutex; the destructor runs outside the
/// critical section so it may call back into the table.
pub struct HandleDatabase<T> {
    inner: Mutex<Inner<T>>,
    destructor: Option<Destructor<T>>,
}

impl<T> HandleDatabase<T> {
    pub fn new(destructor: Option<Destructor<T>>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                iterator: 0,
            }),
            destructor,
        }
    }

    fn draw_check() -> Result<u32> {
        for _ in 0..CHECK_MAX_RETRIES {
            let check = fastrand::u32(..);
            if check != 0 {
                return Ok(check);
            }
        }
        // 200 zero draws in a row means the RNG is broken.
        Err(Error::NoMemory)
    }

    /// Store `instance` and return its handle. Reuses an empty slot when one
    /// exists, otherwise grows the table by one.
    pub fn create(&self, instance: T) -> Result<Handle> {
        let check = Self::draw_check()?;
        let mut inner = self.inner.lock();
        let index = match inner
            .slots
            .iter()
            .position(|s| s.state == SlotState::Empty)
        {
            Some(i) => i,
            None => {
                inner.slots.push(Slot::empty());
                inner.slots.len() - 1
            }
        };
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Active;
        slot.instance = Some(Arc::new(instance));
        slot.refcount = 1;
        slot.check = check;
        Ok((u64::from(check) << 32) | index as u64)
    }

    fn slot_index(&self, handle: Handle, inner: &Inner<T>) -> Result<usize> {
        let check = (handle >> 32) as u32;
        let index = (handle & 0xffff_ffff) as usize;
        if index >= inner.slots.len() {
            return Err(Error::BadHandle);
        }
        let slot = &inner.slots[index];
        if slot.state != SlotState::Active || slot.check != check {
            return Err(Error::BadHandle);
        }
        Ok(index)
    }

    /// Resolve `handle` to its instance, taking a reference.
    ///
    /// Every successful `get` must be paired with a [`put`](Self::put).
    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        let mut inner = self.inner.lock();
        let index = self.slot_index(handle, &inner)?;
        let slot = &mut inner.slots[index];
        let instance = slot.instance.as_ref().ok_or(Error::BadHandle)?;
        let instance = Arc::clone(instance);
        slot.refcount += 1;
        Ok(instance)
    }

    /// Release one reference. The instance is destroyed when the count
    /// reaches zero.
    pub fn put(&self, handle: Handle) -> Result<()> {
        let reclaimed = {
            let mut inner = self.inner.lock();
            let check = (handle >> 32) as u32;
            let index = (handle & 0xffff_ffff) as usize;
            if index >= inner.slots.len() {
                return Err(Error::BadHandle);
            }
            let slot = &mut inner.slots[index];
            // put is legal on a slot already marked for removal.
            if slot.state == SlotState::Empty || slot.check != check {
                return Err(Error::BadHandle);
            }
            assert!(slot.refcount > 0);
            slot.refcount -= 1;
            if slot.refcount == 0 {
                let instance = slot.instance.take();
                *slot = Slot::empty();
                instance
            } else {
                None
            }
        };
        if let Some(instance) = reclaimed {
            if let Some(destructor) = &self.destructor {
                destructor(&instance);
            }
        }
        Ok(())
    }

    /// Mark `handle` for removal and drop the creator's implicit reference.
    /// Outstanding `get` references keep the instance alive; the destructor
    /// fires on the last `put`.
    pub fn destroy(&self, handle: Handle) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let index = self.slot_index(handle, &inner)?;
            inner.slots[index].state = SlotState::PendingRemoval;
        }
        self.put(handle)
    }

    /// Restart iteration from the first slot.
    pub fn iterator_reset(&self) {
        self.inner.lock().iterator = 0;
    }

    /// Step to the next active slot, returning `(instance, handle)`.
    /// Non-active slots are skipped. Returns `None` at the end of the table.
    pub fn iterator_next(&self) -> Option<(Arc<T>, Handle)> {
        let mut inner = self.inner.lock();
        while inner.iterator < inner.slots.len() {
            let index = inner.iterator;
            inner.iterator += 1;
            let slot = &inner.slots[index];
            if slot.state == SlotState::Active {
                if let Some(instance) = &slot.instance {
                    let handle = (u64::from(slot.check) << 32) | index as u64;
                    return Some((Arc::clone(instance), handle));
                }
            }
        }
        None
    }

    /// Number of active slots.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Active)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
