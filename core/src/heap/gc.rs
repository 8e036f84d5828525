//! Mark-sweep collection over the slot arena.
//!
//! The VM gathers the roots (thread stacks and frames, globals, module
//! caches) and hands them to [`Heap::collect`]; the heap adds its own
//! internal roots (the shared string/table protocol methods) and walks the
//! object graph with a worklist. Sweeping frees unmarked slots, evicts dead
//! strings from the intern map, and doubles the trigger threshold.

use tracing::debug;

use crate::cell_table::CellTable;
use crate::heap::{Heap, ObjRef};
use crate::objects::{FunctionBody, ObjectKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub collected: usize,
    pub live: usize,
    pub threshold: usize,
}

impl Heap {
    pub fn collect(&mut self, roots: impl IntoIterator<Item = ObjRef>) -> GcStats {
        let before = self.num_objects();

        let mut worklist: Vec<ObjRef> = roots.into_iter().collect();
        if let Some(methods) = self.str_methods {
            worklist.extend(methods);
        }
        if let Some(methods) = self.table_methods {
            worklist.extend(methods);
        }

        while let Some(r) = worklist.pop() {
            if !self.mark(r) {
                continue;
            }
            self.push_children(r, &mut worklist);
        }

        let mut collected = 0;
        for index in self.slot_indices() {
            if self.slot_is_garbage(index) {
                let object = self.free_slot(index);
                if let ObjectKind::Str(s) = &object.kind {
                    self.strings.remove(&s.chars);
                }
                collected += 1;
            } else {
                self.clear_mark(index);
            }
        }

        self.double_threshold();
        let stats = GcStats {
            collected,
            live: self.num_objects(),
            threshold: self.gc_threshold(),
        };
        debug!(
            before,
            collected = stats.collected,
            live = stats.live,
            next_threshold = stats.threshold,
            "collection finished"
        );
        stats
    }

    /// Push every handle reachable in one hop from `r`.
    fn push_children(&self, r: ObjRef, out: &mut Vec<ObjRef>) {
        let object = self.get(r);
        push_cell_table(&object.attributes.borrow(), out);

        match &object.kind {
            ObjectKind::Str(_) | ObjectKind::Code(_) => {}
            ObjectKind::Function(f) => {
                push_cell_table(&f.free_vars.borrow(), out);
                if let FunctionBody::User { code } = f.body {
                    out.push(code);
                }
            }
            ObjectKind::Table(table) => {
                for (key, value) in table.borrow().iter() {
                    push_value(key, out);
                    push_value(value, out);
                }
            }
            ObjectKind::Cell(c) => push_value(c.value, out),
            ObjectKind::Module(m) => out.extend(m.body),
            ObjectKind::Class(c) => {
                out.extend(c.superclass);
                out.extend(c.base_function);
            }
            ObjectKind::Instance(i) => {
                out.push(i.class);
                if let Some(payload) = &i.payload {
                    out.extend(payload.mark());
                }
            }
            ObjectKind::BoundMethod(bm) => {
                out.push(bm.receiver);
                out.push(bm.method);
            }
            ObjectKind::Thread(state) => {
                let state = state.borrow();
                for &value in &state.eval_stack {
                    push_value(value, out);
                }
                for frame in &state.frames {
                    out.push(frame.function);
                    out.extend(frame.entity_base);
                    push_cell_table(&frame.locals.borrow(), out);
                    for &value in &frame.protected {
                        push_value(value, out);
                    }
                }
            }
        }
    }
}

#[inline]
fn push_value(value: Value, out: &mut Vec<ObjRef>) {
    if let Value::Obj(r) = value {
        out.push(r);
    }
}

fn push_cell_table(table: &CellTable, out: &mut Vec<ObjRef>) {
    for (key, cell) in table.iter() {
        push_value(key, out);
        push_value(cell, out);
    }
}
