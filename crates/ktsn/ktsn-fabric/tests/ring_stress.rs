//! Producer/consumer stress test for `Ring` (§8 end-to-end scenario 6:
//! two threads moving a million indices through the ring in randomly
//! sized bursts). A second process isn't needed to exercise the same
//! cross-thread memory-ordering path a second process would — the
//! header's atomics are the only thing standing between the two sides,
//! exactly as they would be across processes, so one process with two
//! threads is enough to catch a torn read or missed wakeup.

use std::sync::Arc;
use std::thread;

use ktsn_fabric::{Behavior, Ring};

const TOTAL: u64 = 1_000_000;
const RING_SIZE: u32 = 1024;

// A small xorshift so the burst sizes are reproducible without pulling in
// the `rand` crate for a single test.
struct Xorshift(u64);

impl Xorshift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

struct RingBuf {
    _backing: Vec<u8>,
    ring: Ring,
}

// SAFETY: `ring` borrows from `_backing`, which is never reallocated or
// moved out of this struct once constructed.
unsafe impl Send for RingBuf {}
unsafe impl Sync for RingBuf {}

#[test]
fn fifo_survives_a_million_indices_across_random_bursts() {
    let mut backing = vec![0u8; Ring::region_size(RING_SIZE)];
    let ring = unsafe { Ring::init(backing.as_mut_ptr(), RING_SIZE).unwrap() };
    let shared = Arc::new(RingBuf { _backing: backing, ring });

    let producer = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            let mut rng = Xorshift(0x9E3779B97F4A7C15);
            let mut next = 0u64;
            while next < TOTAL {
                let burst = 1 + (rng.next() % 32) as u64;
                let burst = burst.min(TOTAL - next);
                let items: Vec<u64> = (next..next + burst).collect();
                let mut sent = 0usize;
                while sent < items.len() {
                    let n = shared.ring.enqueue_burst(&items[sent..], Behavior::Variable);
                    sent += n as usize;
                    if n == 0 {
                        std::hint::spin_loop();
                    }
                }
                next += burst;
            }
        })
    };

    let consumer = {
        let shared = Arc::clone(&shared);
        thread::spawn(move || {
            let mut rng = Xorshift(0xBF58476D1CE4E5B9);
            let mut received = Vec::with_capacity(TOTAL as usize);
            while (received.len() as u64) < TOTAL {
                let burst = 1 + (rng.next() % 32) as usize;
                let mut buf = vec![0u64; burst];
                let n = shared.ring.dequeue_burst(&mut buf, Behavior::Variable);
                received.extend_from_slice(&buf[..n as usize]);
                if n == 0 {
                    std::hint::spin_loop();
                }
            }
            received
        })
    };

    producer.join().unwrap();
    let received = consumer.join().unwrap();

    assert_eq!(received.len() as u64, TOTAL);
    assert!(received.windows(2).all(|w| w[0] < w[1]), "ring reordered indices");
    assert_eq!(received[0], 0);
    assert_eq!(*received.last().unwrap(), TOTAL - 1);
}
