//! The sender's scheduling loop (§4.4): drain the tx-ring, order pending
//! packets by deadline in a [`DeadlineHeap`], and dispatch each one once it
//! falls inside the `tx_delta` window.
//!
//! Grounded on `original_source/ktsnd.c`'s main `while (g_run)` loop: drain
//! up to 8 indices per iteration (step 1), then at most one dispatch
//! decision per iteration against the heap's minimum (steps 2-3). Unlike
//! the source, a missed deadline (`diff < 0`) returns its index to the
//! free-ring before continuing — the source's dispatch branch only calls
//! `kt_prio_queue_extract_min` there and never re-enqueues onto
//! `free_ring`, which would starve the free-ring of exactly the slots that
//! miss their deadline. Per spec.md §4.4 Case B ("extract_min, return the
//! index to free_ring") and §8 scenario 2, the returned index is the
//! specified behaviour.

mod clock;

pub use clock::now_ns;

use std::sync::atomic::{AtomicBool, Ordering};

use ktsn_core::MBUF_SIZE;
use ktsn_fabric::{Arena, Behavior, DeadlineHeap};
use ktsn_nic::NicDriver;
use ktsn_perf::{PerfRecorder, PerfStage};
use ktsn_proto::{ETHERNET_HEADER_LEN, IPV4_HEADER_LEN, UDP_HEADER_LEN};

const DRAIN_BURST: usize = 8;
const FRAME_BUF_LEN: usize = ETHERNET_HEADER_LEN + IPV4_HEADER_LEN + UDP_HEADER_LEN + MBUF_SIZE;

/// What happened to the earliest pending deadline on one call to
/// [`SenderLoop::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The heap is empty; nothing to do.
    Idle,
    /// The earliest deadline is further than `tx_delta` away — deferred to
    /// the next tick without extracting anything (§4.4 Case A).
    TooEarly,
    /// The earliest deadline already passed; the slot was dropped and its
    /// index returned to the free-ring (§4.4 Case B).
    Dropped,
    /// The earliest deadline fell inside the window; a frame was built and
    /// handed to the NIC, and the index returned to the free-ring
    /// (§4.4 Case C).
    Sent,
}

/// The sender's deadline-ordered dispatch state. Lives entirely in the
/// sender process — holds the heap and a scratch frame buffer, nothing
/// shared.
pub struct SenderLoop {
    heap: DeadlineHeap,
    tx_delta_ns: i64,
    frame_buf: Vec<u8>,
    perf: PerfRecorder,
}

impl SenderLoop {
    /// `slot_count` must match the arena's slot count: the heap can never
    /// hold more pending deadlines than there are slots in flight.
    pub fn new(slot_count: u32, tx_delta_ns: i64) -> Self {
        SenderLoop {
            heap: DeadlineHeap::new(slot_count as usize),
            tx_delta_ns,
            frame_buf: vec![0u8; FRAME_BUF_LEN],
            perf: PerfRecorder::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    /// Per-stage hot-path latency samples (§ ambient perf stack). Empty
    /// unless built with `ktsn-perf`'s `record` feature enabled.
    pub fn perf(&self) -> &PerfRecorder {
        &self.perf
    }

    /// Drains up to 8 indices from the tx-ring and inserts each one into
    /// the deadline heap keyed by its metadata's `txtime` (§4.4 step 1).
    /// Returns how many were drained.
    pub fn drain(&mut self, arena: &Arena) -> u32 {
        let mut buf = [0u64; DRAIN_BURST];
        self.perf.begin(PerfStage::Dequeue);
        let n = arena.tx_ring().dequeue_burst(&mut buf, Behavior::Variable);
        self.perf.end(PerfStage::Dequeue);
        for &raw in &buf[..n as usize] {
            let index = raw as u32;
            // SAFETY: index was just dequeued from the tx-ring, handing
            // this sender the only live reference to the slot until it is
            // either inserted into the heap below or returned to the
            // free-ring on a heap-full error.
            let txtime = unsafe { arena.metadata(index).txtime };
            self.perf.begin(PerfStage::HeapInsert);
            let inserted = self.heap.insert(txtime, raw);
            self.perf.end(PerfStage::HeapInsert);
            if inserted.is_err() {
                tracing::error!(index, "deadline heap full, dropping tx-ring entry without a deadline decision");
                arena.free_ring().enqueue_burst(&[raw], Behavior::Variable);
            }
        }
        n
    }

    /// Dispatch step (§4.4 steps 2-3): inspects the earliest pending
    /// deadline against `now_ns` and acts at most once.
    pub fn tick(&mut self, arena: &Arena, nic: &mut dyn NicDriver, now_ns: i64) -> Dispatch {
        self.perf.begin(PerfStage::SenderTotal);
        let dispatch = self.tick_inner(arena, nic, now_ns);
        self.perf.end(PerfStage::SenderTotal);
        dispatch
    }

    fn tick_inner(&mut self, arena: &Arena, nic: &mut dyn NicDriver, now_ns: i64) -> Dispatch {
        let Some(deadline) = self.heap.peek_min_prio() else {
            return Dispatch::Idle;
        };
        let diff = deadline - now_ns;

        if diff > self.tx_delta_ns {
            return Dispatch::TooEarly;
        }

        self.perf.begin(PerfStage::HeapExtract);
        let raw = self.heap.extract_min().expect("heap was just confirmed non-empty by peek_min_prio");
        self.perf.end(PerfStage::HeapExtract);
        let index = raw as u32;

        if diff < 0 {
            tracing::warn!(index, deadline, now_ns, "packet dropped: deadline missed");
            self.perf.begin(PerfStage::FreeRingReturn);
            arena.free_ring().enqueue_burst(&[raw], Behavior::Variable);
            self.perf.end(PerfStage::FreeRingReturn);
            return Dispatch::Dropped;
        }

        self.perf.begin(PerfStage::BuildFrame);
        // SAFETY: index was just extracted from the heap, which only ever
        // holds indices this sender alone owns between tx-ring drain and
        // the free-ring return below.
        let result = unsafe {
            let metadata = *arena.metadata(index);
            let payload = &arena.mbuf(index).data[..metadata.size as usize];
            ktsn_proto::build_frame_into(&mut self.frame_buf, &metadata, payload)
        };
        self.perf.end(PerfStage::BuildFrame);

        match result {
            Ok(len) => {
                self.perf.begin(PerfStage::NicSubmit);
                let submitted = nic.submit(&self.frame_buf[..len]);
                self.perf.end(PerfStage::NicSubmit);
                if let Err(err) = submitted {
                    tracing::error!(index, %err, "NIC rejected frame, deadline unrecoverable");
                }
            }
            Err(err) => {
                tracing::error!(index, %err, "failed to build frame, deadline unrecoverable");
            }
        }

        // The index is returned to the free-ring whether or not the NIC
        // actually accepted the frame (§7: "index is still returned to the
        // free-ring, no retry").
        self.perf.begin(PerfStage::FreeRingReturn);
        arena.free_ring().enqueue_burst(&[raw], Behavior::Variable);
        self.perf.end(PerfStage::FreeRingReturn);
        Dispatch::Sent
    }

    /// Drives the loop until `shutdown` is set, checked once per iteration
    /// boundary (§5: "the loop exits at the next iteration boundary").
    /// Packets still in the tx-ring at that point are discarded.
    pub fn run(&mut self, arena: &Arena, nic: &mut dyn NicDriver, shutdown: &AtomicBool, clock: impl Fn() -> i64) {
        while !shutdown.load(Ordering::Relaxed) {
            self.drain(arena);
            self.tick(arena, nic, clock());
        }
    }
}
