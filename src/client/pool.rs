//! Carrier session pool
//!
//! An ordered, fixed-length array of slots. The length never changes
//! for the life of the client; slots are only re-filled in place. Slot
//! selection is a lock-free round-robin over an atomic cursor, so
//! dispatch never contends with the health ticker replacing a session.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// One pool slot: a session pointer (possibly not yet filled) and the
/// consecutive health-check failure count.
pub struct Slot<T> {
    conn: RwLock<Option<Arc<T>>>,
    fails: AtomicU32,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            conn: RwLock::new(None),
            fails: AtomicU32::new(0),
        }
    }

    /// Current session, if the slot is filled.
    pub fn load(&self) -> Option<Arc<T>> {
        self.conn.read().clone()
    }

    /// Install a session and reset the failure count. Readers observe
    /// either the old or the new pointer, never a torn state.
    pub fn install(&self, conn: Arc<T>) {
        *self.conn.write() = Some(conn);
        self.fails.store(0, Ordering::SeqCst);
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::SeqCst)
    }

    /// Record one health-check failure; returns the new count.
    pub fn record_failure(&self) -> u32 {
        self.fails.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_fails(&self) {
        self.fails.store(0, Ordering::SeqCst);
    }
}

/// Fixed pool of carrier sessions.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    cursor: AtomicUsize,
}

impl<T> Pool<T> {
    pub fn new(size: usize) -> Self {
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, Slot::empty);
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Round-robin slot selection.
    pub fn next(&self) -> &Slot<T> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        &self.slots[idx]
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot<T>> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_fairness() {
        for n in [1usize, 3, 7] {
            let pool: Pool<u32> = Pool::new(n);
            for (i, slot) in pool.slots().enumerate() {
                slot.install(Arc::new(i as u32));
            }

            let mut counts = vec![0usize; n];
            for _ in 0..1000 {
                let v = *pool.next().load().unwrap();
                counts[v as usize] += 1;
            }
            for &c in &counts {
                assert!(
                    c == 1000 / n || c == 1000 / n + 1,
                    "slot picked {} times out of 1000 across {} slots",
                    c,
                    n
                );
            }
        }
    }

    #[test]
    fn test_pool_length_is_fixed() {
        let pool: Pool<u32> = Pool::new(3);
        assert_eq!(pool.len(), 3);
        pool.slots().nth(1).unwrap().install(Arc::new(9));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_slot_failure_accounting() {
        let pool: Pool<u32> = Pool::new(1);
        let slot = pool.next();
        assert!(slot.load().is_none());

        assert_eq!(slot.record_failure(), 1);
        assert_eq!(slot.record_failure(), 2);
        assert_eq!(slot.fails(), 2);

        slot.reset_fails();
        assert_eq!(slot.fails(), 0);

        slot.record_failure();
        // Installing a replacement clears the counter atomically with
        // the pointer swap.
        slot.install(Arc::new(1));
        assert_eq!(slot.fails(), 0);
        assert_eq!(*slot.load().unwrap(), 1);
    }
}
