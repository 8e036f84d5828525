//! Cell tables: the variable-scoping substrate.
//!
//! A `CellTable` is a [`Table`] whose values are always `Cell` objects. The
//! extra indirection is what makes closures work: two tables can hold the
//! very same cell, so an assignment through one is observed through the
//! other. `set_value` mutates an existing cell in place for exactly that
//! reason.

use crate::heap::{Heap, ObjRef};
use crate::objects::ObjectKind;
use crate::table::Table;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct CellTable {
    table: Table,
}

impl CellTable {
    pub fn new() -> CellTable {
        CellTable::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The cell bound to `name`, if any, filled or not.
    pub fn get_cell(&self, heap: &Heap, name: &str) -> Option<ObjRef> {
        let value = self.table.get_str(heap, name)?;
        match value.as_obj() {
            Some(r) if matches!(heap.get(r).kind, ObjectKind::Cell(_)) => Some(r),
            // Only cells are ever stored here.
            _ => panic!("cell table entry for '{name}' is not a cell"),
        }
    }

    /// Bind `name` to an existing cell, sharing its identity. This is the
    /// closure-capture entry point.
    pub fn set_cell(&mut self, heap: &mut Heap, name: &str, cell: ObjRef) {
        let key = Value::Obj(heap.string_copy(name));
        if let Err(err) = self.table.set(heap, key, Value::Obj(cell)) {
            // String keys always hash.
            panic!("cell table insert failed: {err}");
        }
    }

    /// The value inside the cell bound to `name`. Unfilled cells (declared
    /// but never assigned) read as absent.
    pub fn get_value(&self, heap: &Heap, name: &str) -> Option<Value> {
        let cell = self.get_cell(heap, name)?;
        match &heap.get(cell).kind {
            ObjectKind::Cell(c) if c.is_filled => Some(c.value),
            _ => None,
        }
    }

    /// Assign `name`. An existing cell is written in place, so every table
    /// sharing it observes the new value; otherwise a fresh filled cell is
    /// allocated.
    pub fn set_value(&mut self, heap: &mut Heap, name: &str, value: Value) {
        if let Some(cell) = self.get_cell(heap, name) {
            heap.cell_fill(cell, value);
            return;
        }
        let cell = heap.cell_new(value);
        self.set_cell(heap, name, cell);
    }

    /// Iterate `(key, cell)` pairs; keys are string objects, values cells.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.table.iter()
    }

    /// Names with a filled cell, as bare strings.
    pub fn names<'a>(&'a self, heap: &'a Heap) -> impl Iterator<Item = &'a str> + 'a {
        self.table.iter().filter_map(move |(key, _)| {
            key.as_obj().and_then(|r| heap.try_str(r))
        })
    }
}
