//! Fixed-capacity row table with incrementally maintained, LRU-bounded sort orders.
//!
//! Rows are identified by a primary key projection and live in a dense slab.
//! Callers request ordered views of the table keyed by a [`SortKey`]; each
//! distinct sort key in use gets its own [`treap::Treap`] over slab indices,
//! built with a comparator closure captured for that one tree rather than any
//! shared "current sort" state. Only `max_sort_keys` sort keys are kept live
//! at once; requesting one more evicts the least-recently-touched slot.

mod treap;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use treap::Treap;

/// A row type pluggable into a [`LiveTable`].
///
/// `COLUMN_COUNT` bounds the valid range of column indices accepted by
/// [`SortKey`] and [`Row::compare_column`].
pub trait Row: Clone {
    type Key: Eq + Hash + Clone;

    const COLUMN_COUNT: usize;

    fn primary_key(&self) -> Self::Key;

    /// Orders `self` against `other` on a single column.
    fn compare_column(&self, other: &Self, column: usize) -> Ordering;
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SortDir {
    Unsorted,
    Ascending,
    Descending,
}

/// A priority-ordered list of (column, direction) pairs, one entry per
/// column in the row type. Columns with [`SortDir::Unsorted`] are skipped;
/// the remaining entries are compared in order until one differs.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct SortKey {
    entries: Vec<(usize, SortDir)>,
}

impl SortKey {
    /// `entries` must have exactly `COLUMN_COUNT` entries for the row type
    /// this key will be used with; entries earlier in the vector take
    /// priority over later ones.
    pub fn new(entries: Vec<(usize, SortDir)>) -> Self {
        SortKey { entries }
    }

    fn compare<R: Row>(&self, a: &R, b: &R) -> Ordering {
        for &(column, dir) in &self.entries {
            let ord = match dir {
                SortDir::Unsorted => continue,
                SortDir::Ascending => a.compare_column(b, column),
                SortDir::Descending => b.compare_column(a, column),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

#[derive(Debug)]
pub enum Error {
    CapacityExhausted,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::CapacityExhausted => write!(f, "live table is at capacity"),
        }
    }
}

impl std::error::Error for Error {}

struct Slot {
    key: Option<SortKey>,
    last_touched: u64,
    treap: Treap,
}

/// A fixed-capacity row table with up to `max_sort_keys` live orderings.
pub struct LiveTable<R: Row> {
    capacity: usize,
    rows: Vec<Option<R>>,
    priorities: Vec<u64>,
    by_key: HashMap<R::Key, usize>,
    free: Vec<usize>,
    slots: Vec<Slot>,
    tick: u64,
    rng: StdRng,
}

impl<R: Row> LiveTable<R> {
    pub fn new(capacity: usize, max_sort_keys: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let slots = (0..max_sort_keys)
            .map(|_| Slot {
                key: None,
                last_touched: 0,
                treap: Treap::with_capacity(capacity),
            })
            .collect();
        let priorities = (0..capacity).map(|_| rng.gen()).collect();
        LiveTable {
            capacity,
            rows: (0..capacity).map(|_| None).collect(),
            priorities,
            by_key: HashMap::new(),
            free: (0..capacity).rev().collect(),
            slots,
            tick: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Inserts `row`, or replaces the existing row with the same primary key.
    /// Returns the stored row. Fails only when inserting a brand-new key into
    /// a full table.
    pub fn upsert(&mut self, row: R) -> Result<&R, Error> {
        let key = row.primary_key();

        if let Some(&idx) = self.by_key.get(&key) {
            self.remove_from_all_slots(idx);
            self.rows[idx] = Some(row);
            self.reinsert_into_all_slots(idx);
            self.touch_all_slots();
            return Ok(self.rows[idx].as_ref().unwrap());
        }

        let idx = self.free.pop().ok_or(Error::CapacityExhausted)?;
        self.rows[idx] = Some(row);
        self.by_key.insert(key, idx);
        self.priorities[idx] = self.rng.gen();
        self.reinsert_into_all_slots(idx);
        self.touch_all_slots();
        Ok(self.rows[idx].as_ref().unwrap())
    }

    /// Removes the row with the given primary key. No-op if unknown.
    pub fn remove(&mut self, key: &R::Key) {
        let Some(idx) = self.by_key.remove(key) else {
            return;
        };
        self.remove_from_all_slots(idx);
        self.rows[idx] = None;
        self.free.push(idx);
    }

    /// Drops a sort key if it currently occupies a slot. No-op otherwise.
    pub fn drop_sort_key(&mut self, key: &SortKey) {
        if let Some(slot) = self.slots.iter().position(|s| s.key.as_ref() == Some(key)) {
            self.clear_slot(slot);
        }
    }

    fn touch_all_slots(&mut self) {
        let tick = self.next_tick();
        for slot in &mut self.slots {
            if slot.key.is_some() {
                slot.last_touched = tick;
            }
        }
    }

    fn remove_from_all_slots(&mut self, idx: usize) {
        for slot in &mut self.slots {
            if slot.key.is_some() {
                slot.treap.remove(idx);
            }
        }
    }

    fn reinsert_into_all_slots(&mut self, idx: usize) {
        let priority = self.priorities[idx];
        for i in 0..self.slots.len() {
            if self.slots[i].key.is_none() {
                continue;
            }
            let key = self.slots[i].key.clone().unwrap();
            let rows = &self.rows;
            self.slots[i]
                .treap
                .insert(idx, priority, |a, b| key.compare(rows[a].as_ref().unwrap(), rows[b].as_ref().unwrap()));
        }
    }

    fn clear_slot(&mut self, slot: usize) {
        self.slots[slot].key = None;
        self.slots[slot].last_touched = 0;
        self.slots[slot].treap = Treap::with_capacity(self.capacity);
    }

    /// Finds the slot index for `key`, creating or evicting-into one if it is
    /// not already resident, then bumps its `last_touched` tick.
    fn ensure_slot(&mut self, key: &SortKey) -> usize {
        if let Some(i) = self.slots.iter().position(|s| s.key.as_ref() == Some(key)) {
            let tick = self.next_tick();
            self.slots[i].last_touched = tick;
            return i;
        }

        let target = match self.slots.iter().position(|s| s.key.is_none()) {
            Some(i) => i,
            None => {
                // Evict the slot with the oldest last_touched tick, ties
                // broken by lowest slot index.
                let (evict, _) = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(i, s)| (s.last_touched, *i))
                    .expect("max_sort_keys must be > 0");
                log::debug!("live-table: evicting sort-key slot {evict} for a new sort key");
                evict
            }
        };

        self.clear_slot(target);
        self.slots[target].key = Some(key.clone());

        let occupied: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|_| i))
            .collect();
        for idx in occupied {
            let priority = self.priorities[idx];
            let rows = &self.rows;
            self.slots[target]
                .treap
                .insert(idx, priority, |a, b| key.compare(rows[a].as_ref().unwrap(), rows[b].as_ref().unwrap()));
        }

        let tick = self.next_tick();
        self.slots[target].last_touched = tick;
        target
    }

    /// Returns the rows visible under `key`, in order. Creates or evicts a
    /// sort-key slot for `key` as needed.
    pub fn iter(&mut self, key: &SortKey) -> Iter<'_, R> {
        let slot = self.ensure_slot(key);
        Iter {
            rows: &self.rows,
            treap: &self.slots[slot].treap,
            cursor: self.slots[slot].treap.first(),
        }
    }
}

pub struct Iter<'a, R: Row> {
    rows: &'a [Option<R>],
    treap: &'a Treap,
    cursor: Option<usize>,
}

impl<'a, R: Row> Iterator for Iter<'a, R> {
    type Item = &'a R;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cursor?;
        self.cursor = self.treap.next(idx);
        self.rows[idx].as_ref()
    }
}
