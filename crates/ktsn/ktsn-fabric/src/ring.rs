//! Single-producer/single-consumer burst ring over shared memory.
//!
//! The header and its inline data array live inside an arena mapped by two
//! (or more) processes at possibly different base addresses, so `Ring`
//! holds raw pointers derived at attach time rather than a Rust reference —
//! there is no way to express "valid in every address space" with borrows.
//! Synchronization is the head/tail atomics below, not Rust's aliasing
//! rules; callers on both sides must only ever drive one ring as producer
//! and the other as consumer, per §5.
//!
//! Only the 8-byte element specialisation is implemented: the ring only
//! ever carries `u64` slot indices, so unlike the source's runtime
//! `esize == 8` branch (which traps for any other size), that guarantee is
//! load-bearing in the type itself.

use std::hint::spin_loop;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering, fence};

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("ring size {0} is not a power of two")]
    SizeNotPowerOfTwo(u32),
}

/// All-or-nothing vs at-most-n partial acceptance (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    Fixed,
    Variable,
}

#[repr(C, align(64))]
struct HeadTail {
    head: AtomicU32,
    tail: AtomicU32,
}

impl HeadTail {
    const fn zeroed() -> Self {
        HeadTail {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }
}

/// Header stored at the start of a ring's carved region, immediately
/// followed by `size` `u64` slots.
#[repr(C)]
struct RingHeader {
    size: u32,
    mask: u32,
    capacity: u32,
    _pad: u32,
    prod: HeadTail,
    cons: HeadTail,
}

/// A view onto a ring carved into shared memory.
pub struct Ring {
    header: *mut RingHeader,
    data: *mut u64,
}

// SAFETY: all mutable access to the pointed-to memory goes through the
// atomics in `RingHeader`; the raw pointers themselves carry no thread
// affinity.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub const ELEM_SIZE: usize = size_of::<u64>();

    /// Bytes needed to hold a ring of `size` slots, header included.
    pub fn region_size(size: u32) -> usize {
        size_of::<RingHeader>() + size as usize * Self::ELEM_SIZE
    }

    /// Initializes a fresh ring of `size` slots (must be a power of two) at
    /// `ptr`. `ptr` must point at a region of at least `region_size(size)`
    /// writable bytes.
    ///
    /// # Safety
    /// `ptr` must be valid and suitably aligned for `RingHeader`, and the
    /// region must not be concurrently accessed while being initialized.
    pub unsafe fn init(ptr: *mut u8, size: u32) -> Result<Ring, RingError> {
        if !size.is_power_of_two() {
            return Err(RingError::SizeNotPowerOfTwo(size));
        }
        let header = ptr as *mut RingHeader;
        unsafe {
            header.write(RingHeader {
                size,
                mask: size - 1,
                capacity: size - 1,
                _pad: 0,
                prod: HeadTail::zeroed(),
                cons: HeadTail::zeroed(),
            });
        }
        Ok(unsafe { Ring::attach(ptr) })
    }

    /// Attaches to a ring previously initialized by [`Ring::init`] at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point at a region previously initialized by `Ring::init`.
    pub unsafe fn attach(ptr: *mut u8) -> Ring {
        let header = ptr as *mut RingHeader;
        let data = unsafe { ptr.add(size_of::<RingHeader>()) } as *mut u64;
        Ring { header, data }
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    /// Usable capacity: `size - 1`.
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Number of occupied slots right now. Racy under concurrent use by
    /// design — a snapshot, not a synchronization point.
    pub fn len(&self) -> u32 {
        let h = self.header();
        let prod_tail = h.prod.tail.load(Ordering::Acquire);
        let cons_tail = h.cons.tail.load(Ordering::Acquire);
        let count = prod_tail.wrapping_sub(cons_tail) & h.mask;
        count.min(h.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues up to `items.len()` words, returning how many were
    /// actually moved (§4.2 enqueue-burst).
    pub fn enqueue_burst(&self, items: &[u64], behavior: Behavior) -> u32 {
        let h = self.header();
        let capacity = h.capacity;
        let max = items.len() as u32;

        let mut old_head = h.prod.head.load(Ordering::Relaxed);
        let new_head = loop {
            fence(Ordering::Acquire);
            let cons_tail = h.cons.tail.load(Ordering::Acquire);
            let free_entries = capacity.wrapping_sub(old_head.wrapping_sub(cons_tail));
            let n = if max > free_entries {
                match behavior {
                    Behavior::Fixed => 0,
                    Behavior::Variable => free_entries,
                }
            } else {
                max
            };
            if n == 0 {
                return 0;
            }
            let candidate = old_head.wrapping_add(n);
            match h.prod.head.compare_exchange_weak(old_head, candidate, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break candidate,
                Err(actual) => old_head = actual,
            }
        };
        let n = new_head.wrapping_sub(old_head);

        self.write_slots(old_head, &items[..n as usize]);

        while h.prod.tail.load(Ordering::Relaxed) != old_head {
            spin_loop();
        }
        h.prod.tail.store(new_head, Ordering::Release);
        n
    }

    /// Dequeues up to `out.len()` words into `out`, returning how many were
    /// actually moved (§4.2, symmetric with `enqueue_burst`).
    pub fn dequeue_burst(&self, out: &mut [u64], behavior: Behavior) -> u32 {
        let h = self.header();
        let max = out.len() as u32;

        let mut old_head = h.cons.head.load(Ordering::Relaxed);
        let new_head = loop {
            fence(Ordering::Acquire);
            let prod_tail = h.prod.tail.load(Ordering::Acquire);
            let entries = prod_tail.wrapping_sub(old_head);
            let n = if max > entries {
                match behavior {
                    Behavior::Fixed => 0,
                    Behavior::Variable => entries,
                }
            } else {
                max
            };
            if n == 0 {
                return 0;
            }
            let candidate = old_head.wrapping_add(n);
            match h.cons.head.compare_exchange_weak(old_head, candidate, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break candidate,
                Err(actual) => old_head = actual,
            }
        };
        let n = new_head.wrapping_sub(old_head);

        self.read_slots(old_head, &mut out[..n as usize]);

        while h.cons.tail.load(Ordering::Relaxed) != old_head {
            spin_loop();
        }
        h.cons.tail.store(new_head, Ordering::Release);
        n
    }

    fn write_slots(&self, head: u32, src: &[u64]) {
        let h = self.header();
        let size = h.size;
        let idx = (head & h.mask) as usize;
        let n = src.len();
        unsafe {
            if idx + n <= size as usize {
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(idx), n);
            } else {
                let first = size as usize - idx;
                std::ptr::copy_nonoverlapping(src.as_ptr(), self.data.add(idx), first);
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data, n - first);
            }
        }
    }

    fn read_slots(&self, head: u32, dst: &mut [u64]) {
        let h = self.header();
        let size = h.size;
        let idx = (head & h.mask) as usize;
        let n = dst.len();
        unsafe {
            if idx + n <= size as usize {
                std::ptr::copy_nonoverlapping(self.data.add(idx), dst.as_mut_ptr(), n);
            } else {
                let first = size as usize - idx;
                std::ptr::copy_nonoverlapping(self.data.add(idx), dst.as_mut_ptr(), first);
                std::ptr::copy_nonoverlapping(self.data, dst.as_mut_ptr().add(first), n - first);
            }
        }
    }
}
