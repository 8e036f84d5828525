pub(super) use std::rc::Rc;

pub(super) use crate::bytecode::{Chunk, Constant, Op};
pub(super) use crate::value::Value;
pub(super) use crate::vm::{Vm, VmOptions};

pub(super) fn nconst(chunk: &mut Chunk, n: f64) -> u16 {
    chunk.add_constant(Constant::Number(n))
}

pub(super) fn sconst(chunk: &mut Chunk, s: &str) -> u16 {
    chunk.add_constant(Constant::String(Rc::from(s)))
}

pub(super) fn code_const(chunk: &mut Chunk, code: Chunk) -> u16 {
    chunk.add_constant(Constant::Code(Rc::new(code)))
}

/// A name the chunk reads as a variable.
pub(super) fn refname(chunk: &mut Chunk, name: &str) -> u16 {
    let idx = sconst(chunk, name);
    if !chunk.referenced_names.contains(&idx) {
        chunk.referenced_names.push(idx);
    }
    idx
}

/// A name the chunk assigns somewhere.
pub(super) fn setname(chunk: &mut Chunk, name: &str) -> u16 {
    let idx = sconst(chunk, name);
    if !chunk.assigned_names.contains(&idx) {
        chunk.assigned_names.push(idx);
    }
    idx
}

pub(super) fn exec_with_new_vm(chunk: Chunk) -> Value {
    let mut vm = Vm::new();
    exec(&mut vm, chunk)
}

pub(super) fn exec(vm: &mut Vm, chunk: Chunk) -> Value {
    vm.interpret(Rc::new(chunk)).unwrap()
}

pub(super) fn exec_err(chunk: Chunk) -> String {
    let mut vm = Vm::new();
    let err = vm.interpret(Rc::new(chunk)).unwrap_err();
    format!("{err:#}")
}

pub(super) fn as_num(value: Value) -> f64 {
    match value {
        Value::Number(n) => n,
        other => panic!("expected a number, got {other:?}"),
    }
}

pub(super) fn str_of(vm: &Vm, value: Value) -> String {
    match value.as_obj().and_then(|r| vm.heap.try_str(r)) {
        Some(s) => s.to_string(),
        None => panic!("expected a string, got {value:?}"),
    }
}

mod closures;
mod files;
mod modules;
mod tables;
mod threads;
