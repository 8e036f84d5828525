//! One instruction at a time: the fetch-decode-execute step.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Result, bail};

use crate::bytecode::{Chunk, Constant, Op};
use crate::cell_table::CellTable;
use crate::value::Value;

use super::Vm;
use super::frame::ThreadState;

/// What a single step did to the control flow of its thread.
pub(super) enum Step {
    Continue,
    /// The last frame returned; the value is the thread's result.
    ThreadFinished(Value),
    /// A return landed on a native frame. The value is handed back to the
    /// nested run loop instead of being pushed.
    ReturnedToNative(Value),
}

impl Vm {
    pub(super) fn step(&mut self, state: &Rc<RefCell<ThreadState>>) -> Result<Step> {
        let (op, chunk) = {
            let mut st = state.borrow_mut();
            let chunk = st.current_chunk();
            if st.ip >= chunk.ops.len() {
                // Falling off the end of a chunk returns nil.
                drop(st);
                return self.handle_return(state, Value::Nil);
            }
            let op = chunk.ops[st.ip];
            st.ip += 1;
            (op, chunk)
        };

        match op {
            Op::Constant(idx) => {
                let value = match chunk.constant(idx) {
                    Constant::Number(n) => Value::Number(*n),
                    Constant::Bool(b) => Value::Bool(*b),
                    Constant::Nil => Value::Nil,
                    other => bail!("cannot load a {} constant directly", other.type_name()),
                };
                state.borrow_mut().push(value)?;
            }
            Op::Nil => state.borrow_mut().push(Value::Nil)?,
            Op::Pop => {
                state.borrow_mut().pop();
            }
            Op::Dup => {
                let top = state.borrow().peek();
                state.borrow_mut().push(top)?;
            }

            Op::Add => {
                let (b, a) = pop_two(state);
                match (a, b) {
                    (Value::Number(x), Value::Number(y)) => {
                        state.borrow_mut().push(Value::Number(x + y))?;
                    }
                    _ => {
                        let adder = a
                            .as_obj()
                            .and_then(|r| self.heap.load_attribute_bypass_descriptors(r, "@add"));
                        let Some(adder) = adder else {
                            bail!(
                                "unsupported operand types for '+': {} and {}",
                                a.type_name(&self.heap),
                                b.type_name(&self.heap)
                            );
                        };
                        let sum = self.call_callable_sync(state, adder, None, &[b])?;
                        state.borrow_mut().push(sum)?;
                    }
                }
            }
            Op::Subtract => self.binary_numeric(state, "-", |x, y| Value::Number(x - y))?,
            Op::Multiply => self.binary_numeric(state, "*", |x, y| Value::Number(x * y))?,
            Op::Divide => self.binary_numeric(state, "/", |x, y| Value::Number(x / y))?,
            Op::Negate => {
                let a = state.borrow_mut().pop();
                let Value::Number(n) = a else {
                    bail!("cannot negate a {}", a.type_name(&self.heap));
                };
                state.borrow_mut().push(Value::Number(-n))?;
            }

            Op::Greater => self.binary_numeric(state, ">", |x, y| Value::Bool(x > y))?,
            Op::Less => self.binary_numeric(state, "<", |x, y| Value::Bool(x < y))?,
            Op::GreaterEqual => self.binary_numeric(state, ">=", |x, y| Value::Bool(x >= y))?,
            Op::LessEqual => self.binary_numeric(state, "<=", |x, y| Value::Bool(x <= y))?,
            Op::Equal => {
                let (b, a) = pop_two(state);
                let eq = a.equals(b, &self.heap);
                state.borrow_mut().push(Value::Bool(eq))?;
            }
            Op::And => {
                let (b, a) = pop_two(state);
                let result = Value::Bool(a.is_truthy() && b.is_truthy());
                state.borrow_mut().push(result)?;
            }
            Op::Or => {
                let (b, a) = pop_two(state);
                let result = Value::Bool(a.is_truthy() || b.is_truthy());
                state.borrow_mut().push(result)?;
            }

            Op::LoadVariable(idx) => {
                let name = chunk.name_at(idx).clone();
                let value = self.load_variable(state, &name)?;
                state.borrow_mut().push(value)?;
            }
            Op::SetVariable(idx) => {
                let name = chunk.name_at(idx).clone();
                let value = state.borrow_mut().pop();
                let locals = state.borrow().current_frame().locals.clone();
                locals
                    .borrow_mut()
                    .set_value(&mut self.heap, &name, value);
                if let Some(r) = value.as_obj() {
                    self.heap.name_if_anonymous(r, &name);
                }
            }

            Op::GetAttribute(idx) => {
                let name = chunk.name_at(idx).clone();
                let target = state.borrow_mut().pop();
                let Some(obj) = target.as_obj() else {
                    bail!("a {} has no attributes", target.type_name(&self.heap));
                };
                let value = self.get_attribute(state, obj, &name)?;
                state.borrow_mut().push(value)?;
            }
            Op::SetAttribute(idx) => {
                let name = chunk.name_at(idx).clone();
                let (value, target) = pop_two(state);
                let Some(obj) = target.as_obj() else {
                    bail!("a {} has no attributes", target.type_name(&self.heap));
                };
                self.set_attribute_value(state, obj, &name, value)?;
            }

            Op::AccessKey => {
                let (key, target) = pop_two(state);
                let getter = self.keyed_protocol(target, "@get_key")?;
                let value = self.call_callable_sync(state, getter, None, &[key])?;
                state.borrow_mut().push(value)?;
            }
            Op::SetKey => {
                let value = state.borrow_mut().pop();
                let (key, target) = pop_two(state);
                let setter = self.keyed_protocol(target, "@set_key")?;
                self.call_callable_sync(state, setter, None, &[key, value])?;
            }

            Op::MakeString(idx) => {
                let Constant::String(s) = chunk.constant(idx) else {
                    bail!(
                        "MakeString operand is a {}",
                        chunk.constant(idx).type_name()
                    );
                };
                let s = s.clone();
                let r = self.heap.string_from_rc(s);
                state.borrow_mut().push(Value::Obj(r))?;
            }
            Op::MakeTable(pairs) => {
                let popped = {
                    let mut st = state.borrow_mut();
                    let mut popped = Vec::with_capacity(pairs as usize);
                    for _ in 0..pairs {
                        let value = st.pop();
                        let key = st.pop();
                        popped.push((key, value));
                    }
                    popped
                };
                let table = self.heap.table_new();
                let inner = match &self.heap.get(table).kind {
                    crate::objects::ObjectKind::Table(t) => t.clone(),
                    _ => unreachable!(),
                };
                // Reversed so the last occurrence of a duplicate key wins.
                for (key, value) in popped.into_iter().rev() {
                    inner.borrow_mut().set(&self.heap, key, value)?;
                }
                state.borrow_mut().push(Value::Obj(table))?;
            }
            Op::MakeFunction(idx) => {
                let Constant::Code(code_chunk) = chunk.constant(idx) else {
                    bail!(
                        "MakeFunction operand is a {}",
                        chunk.constant(idx).type_name()
                    );
                };
                let code_chunk = code_chunk.clone();
                let free_vars = self.capture_free_vars(state, &code_chunk)?;
                let code = self.heap.code_new(code_chunk.clone());
                let function = self
                    .heap
                    .user_function_new(code, code_chunk.params.clone(), free_vars);
                state.borrow_mut().push(Value::Obj(function))?;
            }
            Op::MakeClass(idx) => {
                let Constant::Code(code_chunk) = chunk.constant(idx) else {
                    bail!(
                        "MakeClass operand is a {}",
                        chunk.constant(idx).type_name()
                    );
                };
                let code_chunk = code_chunk.clone();
                let superclass = state.borrow_mut().pop();
                let class = self.make_class(state, &code_chunk, superclass)?;
                state.borrow_mut().push(Value::Obj(class))?;
            }
            Op::Import(idx) => {
                let name = chunk.name_at(idx).clone();
                let module = self.import_module(state, &name)?;
                state.borrow_mut().push(module)?;
            }

            Op::Call(argc) => {
                let (callee, args) = {
                    let mut st = state.borrow_mut();
                    let mut args = vec![Value::Nil; argc as usize];
                    for slot in args.iter_mut().rev() {
                        *slot = st.pop();
                    }
                    (st.pop(), args)
                };
                self.call_value(state, callee, &args)?;
            }

            Op::Jump(offset) => {
                let mut st = state.borrow_mut();
                st.ip = offset_ip(st.ip, offset);
            }
            Op::JumpIfFalse(offset) => {
                let cond = state.borrow_mut().pop();
                if !cond.is_truthy() {
                    let mut st = state.borrow_mut();
                    st.ip = offset_ip(st.ip, offset);
                }
            }
            Op::JumpIfTrue(offset) => {
                let cond = state.borrow_mut().pop();
                if cond.is_truthy() {
                    let mut st = state.borrow_mut();
                    st.ip = offset_ip(st.ip, offset);
                }
            }

            Op::Return => {
                let ret = state.borrow_mut().pop();
                return self.handle_return(state, ret);
            }
        }

        Ok(Step::Continue)
    }

    fn binary_numeric(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        op: &str,
        f: impl Fn(f64, f64) -> Value,
    ) -> Result<()> {
        let (b, a) = pop_two(state);
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => state.borrow_mut().push(f(x, y)),
            _ => bail!(
                "unsupported operand types for '{op}': {} and {}",
                a.type_name(&self.heap),
                b.type_name(&self.heap)
            ),
        }
    }

    /// Pop a frame and route its return value: to the caller's eval stack,
    /// to a waiting native frame, or out of the thread entirely.
    pub(super) fn handle_return(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        ret: Value,
    ) -> Result<Step> {
        let mut st = state.borrow_mut();
        let frame = st.pop_frame();
        st.ip = frame.return_ip;
        if st.frames.is_empty() {
            st.finished = true;
            st.result = Some(ret);
            return Ok(Step::ThreadFinished(ret));
        }
        if st.current_frame().is_native {
            let value = if frame.discard_return { Value::Nil } else { ret };
            return Ok(Step::ReturnedToNative(value));
        }
        if !frame.discard_return {
            st.push(ret)?;
        }
        Ok(Step::Continue)
    }

    /// Name resolution: frame locals, then the function's captured free
    /// variables, then globals.
    fn load_variable(&mut self, state: &Rc<RefCell<ThreadState>>, name: &str) -> Result<Value> {
        let (locals, function) = {
            let st = state.borrow();
            let frame = st.current_frame();
            (frame.locals.clone(), frame.function)
        };
        if let Some(value) = locals.borrow().get_value(&self.heap, name) {
            return Ok(value);
        }
        let free_vars = self.heap.function(function).free_vars.clone();
        if let Some(value) = free_vars.borrow().get_value(&self.heap, name) {
            return Ok(value);
        }
        if let Some(value) = self.globals.get_value(&self.heap, name) {
            return Ok(value);
        }
        bail!("undefined variable '{name}'");
    }

    /// Build the free-variable table for a function or class body being
    /// created in the current frame. Three tiers per referenced name: share
    /// the enclosing frame's cell if the name is bound there; pre-declare an
    /// empty cell in both scopes if the enclosing chunk assigns the name
    /// later; otherwise inherit the enclosing function's own capture.
    /// Unresolved names fall through to globals at run time.
    pub(super) fn capture_free_vars(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        new_chunk: &Chunk,
    ) -> Result<CellTable> {
        let (locals, enclosing_chunk, function) = {
            let st = state.borrow();
            let frame = st.current_frame();
            (frame.locals.clone(), frame.chunk.clone(), frame.function)
        };

        let mut free_vars = CellTable::new();
        for &idx in &new_chunk.referenced_names {
            let name = new_chunk.name_at(idx).clone();

            let existing = locals.borrow().get_cell(&self.heap, &name);
            if let Some(cell) = existing {
                free_vars.set_cell(&mut self.heap, &name, cell);
                continue;
            }

            if enclosing_chunk
                .as_deref()
                .is_some_and(|c| c.assigns_name(&name))
            {
                let cell = self.heap.cell_new_empty();
                locals.borrow_mut().set_cell(&mut self.heap, &name, cell);
                free_vars.set_cell(&mut self.heap, &name, cell);
                continue;
            }

            let enclosing_free = self.heap.function(function).free_vars.clone();
            let inherited = enclosing_free.borrow().get_cell(&self.heap, &name);
            if let Some(cell) = inherited {
                free_vars.set_cell(&mut self.heap, &name, cell);
            }
        }
        Ok(free_vars)
    }

    fn keyed_protocol(&mut self, target: Value, method: &str) -> Result<Value> {
        let handler = target
            .as_obj()
            .and_then(|r| self.heap.load_attribute_bypass_descriptors(r, method));
        match handler {
            Some(handler) => Ok(handler),
            None => bail!(
                "a {} does not support keyed access",
                target.type_name(&self.heap)
            ),
        }
    }
}

fn pop_two(state: &Rc<RefCell<ThreadState>>) -> (Value, Value) {
    let mut st = state.borrow_mut();
    let top = st.pop();
    let below = st.pop();
    (top, below)
}

#[inline]
fn offset_ip(ip: usize, offset: i16) -> usize {
    (ip as i64 + offset as i64) as usize
}
