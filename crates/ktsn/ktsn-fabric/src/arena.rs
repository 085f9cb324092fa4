//! Carves a mapped data region into the four structures a fabric
//! participant needs, and re-attaches to one already carved.
//!
//! `Arena::create` runs exactly once, in the sender, at startup. Every
//! other process (the shim, attached into an intercepted application) maps
//! the same region and calls `Arena::attach` with the `ShmLayout` the
//! sender wrote into the control region.

use std::mem::size_of;

use ktsn_core::{Mbuf, Metadata, ShmLayout};

use crate::alloc::{AllocError, PageAllocator};
use crate::ring::{Behavior, Ring, RingError};

#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("data region has no room left for the next structure")]
    NoCapacity,
}

/// A carved view over the fabric's data region: two rings plus the mbuf
/// and metadata pools they index into.
pub struct Arena {
    tx_ring: Ring,
    free_ring: Ring,
    mbuf_pool: *mut Mbuf,
    metadata_pool: *mut Metadata,
    slot_count: u32,
}

// SAFETY: the rings guard their own memory with atomics; the pool pointers
// are only ever dereferenced by index, and callers uphold the ownership
// partition documented on `mbuf_mut`/`metadata_mut` (an index is either on
// a ring or held by exactly one process, never both).
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Carves a fresh arena out of `data`, a writable region of exactly
    /// `data_len` bytes (a power of two, per the allocator's precondition),
    /// using `page_size`-sized pages and rings of `ring_size` slots.
    ///
    /// Every slot index is handed to the free-ring before returning, so a
    /// consumer can start claiming buffers immediately.
    ///
    /// # Safety
    /// `data` must be valid and writable for `data_len` bytes, and not
    /// concurrently accessed while this call carves it up.
    pub unsafe fn create(
        data: *mut u8,
        data_len: u32,
        page_size: u32,
        ring_size: u32,
    ) -> Result<(Arena, ShmLayout), ArenaError> {
        let mut alloc = PageAllocator::new(data_len, page_size)?;

        let ring_region = Ring::region_size(ring_size) as u32;
        let tx_ring_off = alloc.alloc(ring_region).ok_or(ArenaError::NoCapacity)?;
        let free_ring_off = alloc.alloc(ring_region).ok_or(ArenaError::NoCapacity)?;

        let tx_ring = unsafe { Ring::init(data.add(tx_ring_off as usize), ring_size)? };
        let free_ring = unsafe { Ring::init(data.add(free_ring_off as usize), ring_size)? };

        // The pool slot count tracks the ring's usable capacity, not its
        // raw size: `ktsnd.c` sizes both pools off
        // `kt_ringbuf_get_capacity()`, one less than `ring_size`.
        let slot_count = free_ring.capacity();

        let mbuf_bytes = slot_count * size_of::<Mbuf>() as u32;
        let metadata_bytes = slot_count * size_of::<Metadata>() as u32;

        let mbuf_pool_off = alloc.alloc(mbuf_bytes).ok_or(ArenaError::NoCapacity)?;
        let metadata_pool_off = alloc.alloc(metadata_bytes).ok_or(ArenaError::NoCapacity)?;

        let mbuf_pool = unsafe { data.add(mbuf_pool_off as usize) } as *mut Mbuf;
        let metadata_pool = unsafe { data.add(metadata_pool_off as usize) } as *mut Metadata;

        unsafe {
            for i in 0..slot_count as usize {
                mbuf_pool.add(i).write(Mbuf::default());
                metadata_pool.add(i).write(Metadata::default());
            }
        }

        let indices: Vec<u64> = (0..slot_count as u64).collect();
        let filled = free_ring.enqueue_burst(&indices, Behavior::Variable);
        debug_assert_eq!(filled, slot_count, "free-ring fill must accept every slot index");

        let layout = ShmLayout {
            tx_ring_off,
            free_ring_off,
            mbuf_pool_off,
            metadata_pool_off,
        };

        Ok((
            Arena {
                tx_ring,
                free_ring,
                mbuf_pool,
                metadata_pool,
                slot_count,
            },
            layout,
        ))
    }

    /// Attaches to an arena a prior `Arena::create` call carved, given the
    /// layout the sender persisted in the control region.
    ///
    /// # Safety
    /// `data` must point at the same data region `layout` was computed
    /// against, mapped read-write for at least as many bytes.
    pub unsafe fn attach(data: *mut u8, layout: &ShmLayout) -> Arena {
        let tx_ring = unsafe { Ring::attach(data.add(layout.tx_ring_off as usize)) };
        let free_ring = unsafe { Ring::attach(data.add(layout.free_ring_off as usize)) };
        let slot_count = free_ring.capacity();

        let mbuf_pool = unsafe { data.add(layout.mbuf_pool_off as usize) } as *mut Mbuf;
        let metadata_pool = unsafe { data.add(layout.metadata_pool_off as usize) } as *mut Metadata;

        Arena {
            tx_ring,
            free_ring,
            mbuf_pool,
            metadata_pool,
            slot_count,
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn tx_ring(&self) -> &Ring {
        &self.tx_ring
    }

    pub fn free_ring(&self) -> &Ring {
        &self.free_ring
    }

    /// # Safety
    /// `index` must be `< slot_count()`; the caller must hold the only
    /// live reference to this slot (it must have just been claimed off the
    /// free-ring, or be owned by the sender between drain and submit).
    pub unsafe fn mbuf_mut(&self, index: u32) -> &mut Mbuf {
        unsafe { &mut *self.mbuf_pool.add(index as usize) }
    }

    /// # Safety
    /// `index` must be `< slot_count()`.
    pub unsafe fn mbuf(&self, index: u32) -> &Mbuf {
        unsafe { &*self.mbuf_pool.add(index as usize) }
    }

    /// # Safety
    /// Same obligations as [`Arena::mbuf_mut`].
    pub unsafe fn metadata_mut(&self, index: u32) -> &mut Metadata {
        unsafe { &mut *self.metadata_pool.add(index as usize) }
    }

    /// # Safety
    /// `index` must be `< slot_count()`.
    pub unsafe fn metadata(&self, index: u32) -> &Metadata {
        unsafe { &*self.metadata_pool.add(index as usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_fills_free_ring_and_zeroes_pools() {
        let data_len = 1 << 20;
        let mut data = vec![0u8; data_len];
        let (arena, layout) = unsafe { Arena::create(data.as_mut_ptr(), data_len as u32, 4096, 128).unwrap() };

        assert_eq!(arena.slot_count(), 127);
        assert_eq!(arena.free_ring().len(), 127);
        assert!(arena.tx_ring().is_empty());
        assert_ne!(layout.tx_ring_off, layout.free_ring_off);

        unsafe {
            assert_eq!(arena.metadata(0).txtime, 0);
        }
    }

    #[test]
    fn claim_fill_submit_round_trip() {
        let data_len = 1 << 20;
        let mut data = vec![0u8; data_len];
        let (arena, _layout) = unsafe { Arena::create(data.as_mut_ptr(), data_len as u32, 4096, 128).unwrap() };

        let mut claimed = [0u64; 1];
        assert_eq!(arena.free_ring().dequeue_burst(&mut claimed, Behavior::Fixed), 1);
        let index = claimed[0] as u32;

        unsafe {
            arena.metadata_mut(index).txtime = 42;
            arena.mbuf_mut(index).data[0] = 7;
        }

        assert_eq!(arena.tx_ring().enqueue_burst(&claimed, Behavior::Fixed), 1);

        let mut drained = [0u64; 1];
        assert_eq!(arena.tx_ring().dequeue_burst(&mut drained, Behavior::Fixed), 1);
        assert_eq!(drained[0], index as u64);
        unsafe {
            assert_eq!(arena.metadata(index).txtime, 42);
            assert_eq!(arena.mbuf(index).data[0], 7);
        }
    }

    #[test]
    fn attach_sees_the_same_rings_and_pools() {
        let data_len = 1 << 20;
        let mut data = vec![0u8; data_len];
        let (arena, layout) = unsafe { Arena::create(data.as_mut_ptr(), data_len as u32, 4096, 128).unwrap() };
        drop(arena);

        let attached = unsafe { Arena::attach(data.as_mut_ptr(), &layout) };
        assert_eq!(attached.slot_count(), 127);
        assert_eq!(attached.free_ring().len(), 127);
    }
}
