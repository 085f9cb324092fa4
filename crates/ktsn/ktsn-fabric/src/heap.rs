//! Array-backed binary min-heap of pending deadlines (§4.3).
//!
//! Lives only in the sender process — unlike the ring and the pools, the
//! heap is never shared; it is the scheduling structure the sender builds
//! from what it drains off the tx-ring. No allocation on the hot path: the
//! backing `Vec` is pre-sized to `cap` at construction and never grows past
//! it.

#[derive(Clone, Copy)]
struct Node {
    prio: i64,
    data: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("deadline heap is at capacity")]
    Full,
}

pub struct DeadlineHeap {
    elems: Vec<Node>,
    cap: usize,
}

impl DeadlineHeap {
    pub fn new(cap: usize) -> Self {
        DeadlineHeap { elems: Vec::with_capacity(cap), cap }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Appends with `prio = i64::MAX` then sifts down to `prio` — the exact
    /// two-step idiom `kt_prio_queue_insert` uses rather than a direct
    /// insert-and-sift-up.
    pub fn insert(&mut self, prio: i64, data: u64) -> Result<(), HeapError> {
        if self.elems.len() == self.cap {
            return Err(HeapError::Full);
        }
        self.elems.push(Node { prio: i64::MAX, data });
        let last = self.elems.len() - 1;
        self.decrease_key(last, prio);
        Ok(())
    }

    /// Lowers element `i`'s priority and sifts it up. A `new_val` greater
    /// than the current priority is a programmer error — logged and
    /// ignored, not a panic (§7).
    pub fn decrease_key(&mut self, i: usize, new_val: i64) {
        if new_val > self.elems[i].prio {
            tracing::error!(index = i, new_val, current = self.elems[i].prio, "decrease_key called with an increasing value, ignoring");
            return;
        }
        self.elems[i].prio = new_val;
        self.sift_up(i);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.elems[i].prio < self.elems[parent].prio {
                self.elems.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    /// Returns element 0's priority, the next deadline due. `None` when
    /// empty.
    pub fn peek_min_prio(&self) -> Option<i64> {
        self.elems.first().map(|n| n.prio)
    }

    /// Swaps the root with the last element, shrinks, and sifts down.
    pub fn extract_min(&mut self) -> Option<u64> {
        if self.elems.is_empty() {
            return None;
        }
        let min = self.elems[0];
        let last = self.elems.pop().unwrap();
        if !self.elems.is_empty() {
            self.elems[0] = last;
            self.sift_down(0);
        }
        Some(min.data)
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut min_idx = i;
            if left < self.elems.len() && self.elems[left].prio < self.elems[min_idx].prio {
                min_idx = left;
            }
            if right < self.elems.len() && self.elems[right].prio < self.elems[min_idx].prio {
                min_idx = right;
            }
            if min_idx == i {
                break;
            }
            self.elems.swap(i, min_idx);
            i = min_idx;
        }
    }

    /// `decrease_key(i, i64::MIN)` followed by `extract_min`, discarding
    /// the result.
    pub fn delete(&mut self, i: usize) {
        self.decrease_key(i, i64::MIN);
        self.extract_min();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_in_priority_order() {
        let mut h = DeadlineHeap::new(8);
        h.insert(30, 3).unwrap();
        h.insert(10, 1).unwrap();
        h.insert(20, 2).unwrap();
        h.insert(5, 0).unwrap();

        assert_eq!(h.peek_min_prio(), Some(5));
        assert_eq!(h.extract_min(), Some(0));
        assert_eq!(h.extract_min(), Some(1));
        assert_eq!(h.extract_min(), Some(2));
        assert_eq!(h.extract_min(), Some(3));
        assert_eq!(h.extract_min(), None);
    }

    #[test]
    fn insert_fails_when_full() {
        let mut h = DeadlineHeap::new(2);
        h.insert(1, 1).unwrap();
        h.insert(2, 2).unwrap();
        assert!(matches!(h.insert(3, 3), Err(HeapError::Full)));
    }

    #[test]
    fn decrease_key_ignores_an_increasing_value() {
        let mut h = DeadlineHeap::new(4);
        h.insert(10, 1).unwrap();
        h.decrease_key(0, 20);
        assert_eq!(h.peek_min_prio(), Some(10));
    }

    #[test]
    fn delete_removes_an_arbitrary_element() {
        let mut h = DeadlineHeap::new(4);
        h.insert(10, 1).unwrap();
        h.insert(20, 2).unwrap();
        h.insert(30, 3).unwrap();
        h.delete(1);
        assert_eq!(h.len(), 2);
    }
}
