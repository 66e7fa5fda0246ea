//! Bounded concurrent ring buffer used for per-want history.
//!
//! Each append atomically claims a monotonically increasing sequence number
//! and stores the value at `seq % capacity`. Concurrent appenders never touch
//! the same slot; a snapshot taken during an in-flight append may or may not
//! observe that entry, but never a torn value.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Fixed-capacity append-only ring with FIFO snapshots.
///
/// `update_last` and `clear` are single-writer operations: they are only
/// called from the owning want's progress cycle, never concurrently with
/// appends to the same slot.
pub struct RingBuffer<T> {
    slots: Box<[RwLock<Option<T>>]>,
    cursor: AtomicU64,
}

impl<T: Clone> RingBuffer<T> {
    /// Create a ring with the given capacity. Panics on zero capacity.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| RwLock::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of entries currently retained (at most `capacity`).
    pub fn len(&self) -> usize {
        let written = self.cursor.load(Ordering::Acquire);
        (written as usize).min(self.slots.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a value, overwriting the oldest entry once full.
    pub fn append(&self, value: T) {
        let seq = self.cursor.fetch_add(1, Ordering::AcqRel);
        let idx = (seq % self.slots.len() as u64) as usize;
        *self.slots[idx].write() = Some(value);
    }

    /// Read retained entries in FIFO order. `limit == 0` returns everything;
    /// otherwise only the most recent `limit` entries are returned (still
    /// oldest-first).
    pub fn snapshot(&self, limit: usize) -> Vec<T> {
        let written = self.cursor.load(Ordering::Acquire);
        let cap = self.slots.len() as u64;
        let start = written.saturating_sub(cap);
        let mut out = Vec::with_capacity((written - start) as usize);
        for seq in start..written {
            let idx = (seq % cap) as usize;
            if let Some(v) = self.slots[idx].read().as_ref() {
                out.push(v.clone());
            }
        }
        if limit > 0 && out.len() > limit {
            out.drain(..out.len() - limit);
        }
        out
    }

    /// Clone the most recently appended entry, if any.
    pub fn peek_last(&self) -> Option<T> {
        let written = self.cursor.load(Ordering::Acquire);
        if written == 0 {
            return None;
        }
        let idx = ((written - 1) % self.slots.len() as u64) as usize;
        self.slots[idx].read().clone()
    }

    /// Mutate the most recently appended entry in place. Best-effort: a no-op
    /// on an empty ring. Not safe against concurrent appends to the same slot.
    pub fn update_last<F: FnOnce(&mut T)>(&self, f: F) {
        let written = self.cursor.load(Ordering::Acquire);
        if written == 0 {
            return;
        }
        let idx = ((written - 1) % self.slots.len() as u64) as usize;
        if let Some(v) = self.slots[idx].write().as_mut() {
            f(v);
        }
    }

    /// Drop all entries and reset the cursor.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            *slot.write() = None;
        }
        self.cursor.store(0, Ordering::Release);
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn append_then_snapshot_fifo() {
        let ring = RingBuffer::new(4);
        for i in 0..3 {
            ring.append(i);
        }
        assert_eq!(ring.snapshot(0), vec![0, 1, 2]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn wraparound_keeps_last_capacity_entries() {
        let ring = RingBuffer::new(5);
        for i in 0..10 {
            ring.append(i);
        }
        assert_eq!(ring.snapshot(0), vec![5, 6, 7, 8, 9]);
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn snapshot_limit_returns_most_recent() {
        let ring = RingBuffer::new(10);
        for i in 0..6 {
            ring.append(i);
        }
        assert_eq!(ring.snapshot(2), vec![4, 5]);
    }

    #[test]
    fn peek_and_update_last() {
        let ring = RingBuffer::new(3);
        assert_eq!(ring.peek_last(), None);
        ring.append(String::from("a"));
        ring.append(String::from("b"));
        ring.update_last(|s| s.push('!'));
        assert_eq!(ring.peek_last(), Some(String::from("b!")));
    }

    #[test]
    fn clear_resets() {
        let ring = RingBuffer::new(3);
        ring.append(1);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.snapshot(0), Vec::<i32>::new());
    }

    #[test]
    fn concurrent_appends_land_in_distinct_slots() {
        let ring = Arc::new(RingBuffer::new(64));
        let mut handles = Vec::new();
        for t in 0..4 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..16 {
                    ring.append(t * 100 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let snap = ring.snapshot(0);
        assert_eq!(snap.len(), 64);
        // every appended value shows up exactly once
        let mut sorted = snap.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 64);
    }
}
