//! The object heap: a slot arena owning every runtime object.
//!
//! Handles are index + generation pairs, so a stale [`ObjRef`] held across a
//! collection trips a panic instead of touching recycled memory. Allocation
//! never collects on its own; the interpreter asks for a collection between
//! instructions via [`Heap::should_collect`], which keeps every live value
//! either on a thread stack or inside a reachable table when marking runs.

mod gc;


use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::objects::Object;

pub use gc::GcStats;

/// Live-object count that arms the first collection.
pub const DEFAULT_GC_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    marked: bool,
    object: Option<Object>,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    num_objects: usize,
    max_objects: usize,
    gc_enabled: bool,
    pause_depth: u32,
    /// String interning: content to the one live string object with it.
    pub(crate) strings: FxHashMap<Rc<str>, ObjRef>,
    /// Shared native method objects installed on every string / table.
    pub(crate) str_methods: Option<[ObjRef; 3]>,
    pub(crate) table_methods: Option<[ObjRef; 3]>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Heap {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            num_objects: 0,
            max_objects: threshold.max(1),
            gc_enabled: false,
            pause_depth: 0,
            strings: FxHashMap::default(),
            str_methods: None,
            table_methods: None,
        }
    }

    #[inline]
    pub fn num_objects(&self) -> usize {
        self.num_objects
    }

    /// Arm or disarm the collector. Disarmed is the initial state so that
    /// embedders can build up native modules without collections racing
    /// their half-constructed object graphs.
    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.gc_enabled = enabled;
    }

    /// Temporarily hold off collections; pairs with [`Heap::resume_gc`].
    pub fn pause_gc(&mut self) {
        self.pause_depth += 1;
    }

    pub fn resume_gc(&mut self) {
        debug_assert!(self.pause_depth > 0);
        self.pause_depth = self.pause_depth.saturating_sub(1);
    }

    #[inline]
    pub fn should_collect(&self) -> bool {
        self.gc_enabled && self.pause_depth == 0 && self.num_objects >= self.max_objects
    }

    pub fn allocate(&mut self, object: Object) -> ObjRef {
        self.num_objects += 1;
        let r = if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.object.is_none());
            slot.object = Some(object);
            slot.marked = false;
            ObjRef {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                marked: false,
                object: Some(object),
            });
            ObjRef {
                index,
                generation: 0,
            }
        };
        trace!(index = r.index, total = self.num_objects, "allocated object");
        r
    }

    /// Resolve a handle. A stale or dangling handle is an engine bug, never
    /// a user-triggerable condition, so this panics rather than erroring.
    #[inline]
    pub fn get(&self, r: ObjRef) -> &Object {
        let slot = &self.slots[r.index as usize];
        match &slot.object {
            Some(object) if slot.generation == r.generation => object,
            _ => panic!("dangling object handle {}@{}", r.index, r.generation),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Object {
        let slot = &mut self.slots[r.index as usize];
        match &mut slot.object {
            Some(object) if slot.generation == r.generation => object,
            _ => panic!("dangling object handle {}@{}", r.index, r.generation),
        }
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.index as usize)
            .is_some_and(|slot| slot.generation == r.generation && slot.object.is_some())
    }

    pub(crate) fn mark(&mut self, r: ObjRef) -> bool {
        let slot = &mut self.slots[r.index as usize];
        debug_assert!(slot.generation == r.generation && slot.object.is_some());
        let first_visit = !slot.marked;
        slot.marked = true;
        first_visit
    }

    pub(crate) fn slot_indices(&self) -> std::ops::Range<usize> {
        0..self.slots.len()
    }

    pub(crate) fn slot_is_garbage(&self, index: usize) -> bool {
        let slot = &self.slots[index];
        slot.object.is_some() && !slot.marked
    }

    pub(crate) fn clear_mark(&mut self, index: usize) {
        self.slots[index].marked = false;
    }

    /// Free one slot, bumping its generation so surviving handles to it can
    /// never resolve again.
    pub(crate) fn free_slot(&mut self, index: usize) -> Object {
        let slot = &mut self.slots[index];
        let object = match slot.object.take() {
            Some(object) => object,
            None => panic!("freeing an empty heap slot"),
        };
        slot.generation = slot.generation.wrapping_add(1);
        slot.marked = false;
        self.free_list.push(index as u32);
        self.num_objects -= 1;
        object
    }

    pub(crate) fn double_threshold(&mut self) {
        self.max_objects = self.max_objects.saturating_mul(2);
    }

    pub fn gc_threshold(&self) -> usize {
        self.max_objects
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}
