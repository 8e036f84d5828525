//! Per-thread execution state: the evaluation stack and the call stack.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Result, bail};

use crate::bytecode::Chunk;
use crate::cell_table::CellTable;
use crate::heap::ObjRef;
use crate::value::Value;

/// One call-stack entry. Native frames carry no bytecode; they exist so a
/// native call shows up in stack traces and so the values it is working
/// with stay rooted across a collection.
#[derive(Debug)]
pub struct StackFrame {
    /// Instruction pointer to restore in the caller's chunk on return.
    pub return_ip: usize,
    pub function: ObjRef,
    /// `None` for native frames.
    pub chunk: Option<Rc<Chunk>>,
    pub locals: Rc<RefCell<CellTable>>,
    /// For class and module body frames, the entity whose attribute map the
    /// locals are.
    pub entity_base: Option<ObjRef>,
    pub is_native: bool,
    /// Drop the callee's return value instead of pushing it.
    pub discard_return: bool,
    /// Extra collector roots: receiver and arguments of an in-flight native
    /// call, which live nowhere else while it runs.
    pub protected: Vec<Value>,
}

impl StackFrame {
    pub fn user(
        function: ObjRef,
        chunk: Rc<Chunk>,
        locals: Rc<RefCell<CellTable>>,
        return_ip: usize,
    ) -> StackFrame {
        StackFrame {
            return_ip,
            function,
            chunk: Some(chunk),
            locals,
            entity_base: None,
            is_native: false,
            discard_return: false,
            protected: Vec::new(),
        }
    }

    pub fn native(function: ObjRef, return_ip: usize, protected: Vec<Value>) -> StackFrame {
        StackFrame {
            return_ip,
            function,
            chunk: None,
            locals: Rc::new(RefCell::new(CellTable::new())),
            entity_base: None,
            is_native: true,
            discard_return: false,
            protected,
        }
    }
}

#[derive(Debug)]
pub struct ThreadState {
    pub name: String,
    /// Instruction pointer into the current frame's chunk.
    pub ip: usize,
    pub eval_stack: Vec<Value>,
    pub frames: Vec<StackFrame>,
    pub finished: bool,
    /// The thread body's return value, once finished.
    pub result: Option<Value>,
    eval_stack_max: usize,
    call_stack_max: usize,
}

impl ThreadState {
    pub fn new(name: impl Into<String>, eval_stack_max: usize, call_stack_max: usize) -> Self {
        ThreadState {
            name: name.into(),
            ip: 0,
            eval_stack: Vec::new(),
            frames: Vec::new(),
            finished: false,
            result: None,
            eval_stack_max,
            call_stack_max,
        }
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.eval_stack.len() >= self.eval_stack_max {
            bail!("evaluation stack overflow in thread '{}'", self.name);
        }
        self.eval_stack.push(value);
        Ok(())
    }

    pub fn peek(&self) -> Value {
        match self.eval_stack.last() {
            Some(value) => *value,
            None => panic!("evaluation stack underflow in thread '{}'", self.name),
        }
    }

    /// Popping from an empty stack is a bytecode bug, never a user error.
    pub fn pop(&mut self) -> Value {
        match self.eval_stack.pop() {
            Some(value) => value,
            None => panic!("evaluation stack underflow in thread '{}'", self.name),
        }
    }

    pub fn push_frame(&mut self, frame: StackFrame) -> Result<()> {
        if self.frames.len() >= self.call_stack_max {
            bail!("call stack overflow in thread '{}'", self.name);
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop_frame(&mut self) -> StackFrame {
        match self.frames.pop() {
            Some(frame) => frame,
            None => panic!("call stack underflow in thread '{}'", self.name),
        }
    }

    pub fn current_frame(&self) -> &StackFrame {
        match self.frames.last() {
            Some(frame) => frame,
            None => panic!("thread '{}' has no active frame", self.name),
        }
    }

    /// The chunk the thread is currently executing.
    pub fn current_chunk(&self) -> Rc<Chunk> {
        match &self.current_frame().chunk {
            Some(chunk) => chunk.clone(),
            None => panic!("thread '{}' is in a native frame", self.name),
        }
    }
}
