//! Open-addressing hash table keyed by `Value`.
//!
//! Linear probing with tombstones; capacity is always a power of two and a
//! doubling rehash runs once the load factor (live entries plus tombstones)
//! crosses 0.75. Keys hash through [`Value::hash`], so unhashable object
//! kinds make `get`/`set`/`delete` fail and callers must guard.

use anyhow::Result;
use tracing::trace;

use crate::heap::Heap;
use crate::value::{Value, hash_str};

const LOAD_FACTOR: f64 = 0.75;
const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq)]
enum Entry {
    #[default]
    Vacant,
    Tombstone,
    Occupied {
        key: Value,
        value: Value,
    },
}

#[derive(Debug, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Occupied plus tombstoned slots; drives growth.
    count: usize,
    /// Live entries only.
    num_entries: usize,
    /// Diagnostic only, never behavior-affecting.
    collision_count: usize,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.num_entries
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn collision_count(&self) -> usize {
        self.collision_count
    }

    pub fn get(&self, heap: &Heap, key: Value) -> Result<Option<Value>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let hash = key.hash(heap)?;
        Ok(self.probe(heap, hash, |k| k.equals(key, heap)).found)
    }

    /// Lookup with a bare string key, hashing the string content directly.
    /// This is the hot path for attribute and variable reads; it never
    /// allocates a heap string.
    pub fn get_str(&self, heap: &Heap, key: &str) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let hash = hash_str(key);
        self.probe(heap, hash, |k| {
            k.as_obj().and_then(|r| heap.try_str(r)).is_some_and(|s| s == key)
        })
        .found
    }

    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> Result<()> {
        self.grow_if_needed(heap);

        let hash = key.hash(heap)?;
        let probe = self.probe(heap, hash, |k| k.equals(key, heap));
        if probe.collided {
            self.collision_count += 1;
        }
        if !matches!(self.entries[probe.slot], Entry::Occupied { .. }) {
            self.count += 1;
            self.num_entries += 1;
        }
        self.entries[probe.slot] = Entry::Occupied { key, value };
        Ok(())
    }

    pub fn delete(&mut self, heap: &Heap, key: Value) -> Result<bool> {
        if self.entries.is_empty() {
            return Ok(false);
        }
        let hash = key.hash(heap)?;
        let slot = self.probe(heap, hash, |k| k.equals(key, heap)).slot;
        if !matches!(self.entries[slot], Entry::Occupied { .. }) {
            return Ok(false);
        }
        self.entries[slot] = Entry::Tombstone;
        self.num_entries -= 1;
        Ok(true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Occupied { key, value } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Probe the entry chain for `hash`. Returns the slot where the key
    /// lives or, for misses, the slot an insertion should use (reusing the
    /// first tombstone seen on the way).
    fn probe(&self, _heap: &Heap, hash: u64, key_matches: impl Fn(Value) -> bool) -> ProbeResult {
        let capacity = self.entries.len();
        let mut slot = (hash as usize) & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        let mut collided = false;

        loop {
            match &self.entries[slot] {
                Entry::Vacant => {
                    break ProbeResult {
                        slot: tombstone.unwrap_or(slot),
                        found: None,
                        collided,
                    };
                }
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(slot);
                    }
                }
                Entry::Occupied { key, value } => {
                    if key_matches(*key) {
                        break ProbeResult {
                            slot,
                            found: Some(*value),
                            collided,
                        };
                    }
                }
            }
            collided = true;
            slot = (slot + 1) & (capacity - 1);
        }
    }

    fn grow_if_needed(&mut self, heap: &Heap) {
        if (self.count + 1) as f64 >= self.entries.len() as f64 * LOAD_FACTOR {
            self.grow(heap);
        }
    }

    /// Doubling rehash. Live entries move into the fresh array; tombstones
    /// are dropped.
    fn grow(&mut self, heap: &Heap) {
        let new_capacity = if self.entries.len() < MIN_CAPACITY {
            MIN_CAPACITY
        } else {
            self.entries.len() * 2
        };
        trace!(new_capacity, live = self.num_entries, "growing table");

        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::Vacant; new_capacity]);
        self.count = 0;
        self.num_entries = 0;
        self.collision_count = 0;

        for entry in old_entries {
            if let Entry::Occupied { key, value } = entry {
                let hash = match key.hash(heap) {
                    Ok(h) => h,
                    // Occupied entries were hashable when inserted.
                    Err(_) => panic!("unhashable key found during table growth"),
                };
                let slot = self
                    .probe(heap, hash, |k| k.equals(key, heap))
                    .slot;
                self.entries[slot] = Entry::Occupied { key, value };
                self.count += 1;
                self.num_entries += 1;
            }
        }
    }

}

struct ProbeResult {
    slot: usize,
    found: Option<Value>,
    collided: bool,
}
