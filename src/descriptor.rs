// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handle allocation (C7, §3.5, §9 "handle allocation"): a fixed pool
//! of descriptor slots, addressed by a small integer offset from a
//! per-backend base constant. A composer (HYFS) routes a handle to its
//! owning backend purely by checking which backend's range it falls
//! in — no parent pointer or dynamic type tag is stored in the handle
//! itself. Shared by every backend that owns its own descriptor table
//! (`fwfs`, `hyfs`'s writable-overlay test fixture).

extern crate alloc;

use alloc::vec::Vec;

use crate::capability::Handle;
use crate::error::{Error, Result};

/// Default descriptor pool capacity. `open`/`opendir` past this fail
/// with `OutOfFileDescs` (§7).
pub const DEFAULT_POOL_CAPACITY: usize = 32;

/// A fixed-capacity slab of descriptors, indexed by `handle - base`.
pub(crate) struct Pool<T> {
    base: Handle,
    slots: Vec<Option<T>>,
}

impl<T> Pool<T> {
    pub(crate) fn new(base: Handle, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Pool { base, slots }
    }

    /// Allocates the first free slot, returning its handle.
    pub(crate) fn alloc(&mut self, value: T) -> Result<Handle> {
        let index = self.slots.iter().position(Option::is_none).ok_or(Error::OutOfFileDescs)?;
        self.slots[index] = Some(value);
        Ok(self.base + index as Handle)
    }

    fn index_of(&self, handle: Handle) -> Result<usize> {
        let index = handle.checked_sub(self.base).ok_or(Error::InvalidHandle)? as usize;
        if index >= self.slots.len() {
            return Err(Error::InvalidHandle);
        }
        Ok(index)
    }

    pub(crate) fn get(&self, handle: Handle) -> Result<&T> {
        let index = self.index_of(handle)?;
        self.slots[index].as_ref().ok_or(Error::FileNotOpen)
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Result<&mut T> {
        let index = self.index_of(handle)?;
        self.slots[index].as_mut().ok_or(Error::FileNotOpen)
    }

    pub(crate) fn free(&mut self, handle: Handle) -> Result<T> {
        let index = self.index_of(handle)?;
        self.slots[index].take().ok_or(Error::FileNotOpen)
    }

    /// Whether `handle` falls in this pool's range at all, regardless
    /// of whether a descriptor is currently allocated there. Used by
    /// composers to route a handle to the right backend (§9 "Backend
    /// routing in HYFS").
    pub(crate) fn owns(&self, handle: Handle) -> bool {
        handle >= self.base && (handle - self.base) < self.slots.len() as Handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Handle = 0x1000;

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut pool: Pool<u32> = Pool::new(BASE, 4);
        let h = pool.alloc(42).unwrap();
        assert_eq!(h, BASE);
        assert_eq!(*pool.get(h).unwrap(), 42);
        assert_eq!(pool.free(h).unwrap(), 42);
        assert_eq!(pool.get(h).err(), Some(Error::FileNotOpen));
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut pool: Pool<u32> = Pool::new(BASE, 2);
        pool.alloc(1).unwrap();
        pool.alloc(2).unwrap();
        assert_eq!(pool.alloc(3).err(), Some(Error::OutOfFileDescs));
    }

    #[test]
    fn out_of_range_handle_is_invalid() {
        let pool: Pool<u32> = Pool::new(BASE, 2);
        assert_eq!(pool.get(0).err(), Some(Error::InvalidHandle));
        assert!(!pool.owns(0));
        assert!(pool.owns(BASE));
        assert!(!pool.owns(BASE + 2));
    }
}
