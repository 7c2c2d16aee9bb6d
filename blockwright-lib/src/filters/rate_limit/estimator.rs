//! Count-min sketch for approximate per-key counters.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicIsize, Ordering};

pub struct Estimator {
    tables: Box<[(Box<[AtomicIsize]>, ahash::RandomState)]>,
    slots: usize,
}

impl Estimator {
    pub fn new(hashes: usize, slots: usize) -> Self {
        let hashes = hashes.max(1);
        let slots = slots.max(1);
        let tables = (0..hashes)
            .map(|_| {
                let row: Box<[AtomicIsize]> = (0..slots).map(|_| AtomicIsize::new(0)).collect();
                (row, ahash::RandomState::new())
            })
            .collect();
        Self { tables, slots }
    }

    fn slot_for<T: Hash>(&self, key: &T, state: &ahash::RandomState) -> usize {
        let mut hasher = state.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.slots
    }

    pub fn incr<T: Hash>(&self, key: &T, value: isize) -> isize {
        let mut min = isize::MAX;
        for (row, state) in self.tables.iter() {
            let slot = self.slot_for(key, state);
            let prev = row[slot].fetch_add(value, Ordering::SeqCst);
            min = min.min(prev + value);
        }
        min
    }

    pub fn decr<T: Hash>(&self, key: &T, value: isize) -> isize {
        self.incr(key, -value)
    }

    pub fn get<T: Hash>(&self, key: &T) -> isize {
        let mut min = isize::MAX;
        for (row, state) in self.tables.iter() {
            let slot = self.slot_for(key, state);
            min = min.min(row[slot].load(Ordering::SeqCst));
        }
        min
    }

    pub fn reset(&self) {
        for (row, _) in self.tables.iter() {
            for slot in row.iter() {
                slot.store(0, Ordering::SeqCst);
            }
        }
    }
}
