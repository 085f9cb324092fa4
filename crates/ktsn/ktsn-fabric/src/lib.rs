//! The deadline-scheduling fabric: a one-shot page allocator, an SPSC
//! burst ring, a deadline min-heap, and the `Arena` that ties them to a
//! mapped data region.
//!
//! Everything here is core to the scheduling contract (§4.1–4.3) except
//! `DeadlineHeap`, which lives only in the sender process and never
//! touches shared memory.

mod alloc;
mod arena;
mod heap;
mod ring;

pub use alloc::{AllocError, PageAllocator};
pub use arena::{Arena, ArenaError};
pub use heap::{DeadlineHeap, HeapError};
pub use ring::{Behavior, Ring, RingError};
