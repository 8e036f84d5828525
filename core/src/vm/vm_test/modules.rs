use std::any::Any;
use std::cell::Cell;

use anyhow::{Result, bail};

use super::*;
use crate::objects::{NativePayload, ObjectKind};

/// Module body: `answer = 42;`.
fn answer_module_chunk() -> Chunk {
    let mut m = Chunk::new();
    let answer = setname(&mut m, "answer");
    let n42 = nconst(&mut m, 42.0);
    m.ops = vec![
        Op::Constant(n42),
        Op::SetVariable(answer),
        Op::Nil,
        Op::Return,
    ];
    m
}

#[test]
fn test_vm_import_runs_the_module_once() {
    // return import("util").answer + import("util").answer;
    let mut c = Chunk::new();
    let util = sconst(&mut c, "util");
    let answer = sconst(&mut c, "answer");
    c.ops = vec![
        Op::Import(util),
        Op::GetAttribute(answer),
        Op::Import(util),
        Op::GetAttribute(answer),
        Op::Add,
        Op::Return,
    ];

    let loads = Rc::new(Cell::new(0));
    let seen = loads.clone();
    let mut vm = Vm::new();
    vm.set_module_loader(Box::new(
        move |name: &str| -> Result<Option<Rc<Chunk>>> {
            if name != "util" {
                return Ok(None);
            }
            seen.set(seen.get() + 1);
            Ok(Some(Rc::new(answer_module_chunk())))
        },
    ));
    assert_eq!(as_num(exec(&mut vm, c)), 84.0);
    assert_eq!(loads.get(), 1);
}

#[test]
fn test_vm_missing_module_is_an_error() {
    let mut c = Chunk::new();
    let nowhere = sconst(&mut c, "nowhere");
    c.ops = vec![Op::Import(nowhere), Op::Return];
    let err = exec_err(c);
    assert!(err.contains("module 'nowhere' not found"), "{err}");
}

fn triple(_vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let Value::Number(n) = args[0] else {
        bail!("triple needs a number");
    };
    Ok(Value::Number(n * 3.0))
}

#[test]
fn test_vm_native_module_values_and_functions() {
    // m = import("mathx");
    // return m.triple(14) + m.pi;
    let mut vm = Vm::new();
    let mut m = vm.register_module("mathx");
    m.value("pi", Value::Number(3.14));
    m.function("triple", &["n"], triple);
    m.finish();

    let mut c = Chunk::new();
    let mathx = sconst(&mut c, "mathx");
    let triple_attr = sconst(&mut c, "triple");
    let pi = sconst(&mut c, "pi");
    let n14 = nconst(&mut c, 14.0);
    c.ops = vec![
        Op::Import(mathx),
        Op::GetAttribute(triple_attr),
        Op::Constant(n14),
        Op::Call(1),
        Op::Import(mathx),
        Op::GetAttribute(pi),
        Op::Add,
        Op::Return,
    ];
    assert_eq!(as_num(exec(&mut vm, c)), 42.0 + 3.14);
}

struct CounterPayload {
    count: f64,
}

impl NativePayload for CounterPayload {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn counter_add(vm: &mut Vm, receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let Some(r) = receiver.and_then(Value::as_obj) else {
        bail!("add needs a receiver");
    };
    let Value::Number(n) = args[0] else {
        bail!("add needs a number");
    };
    match &mut vm.heap.get_mut(r).kind {
        ObjectKind::Instance(i) => {
            i.payload_mut::<CounterPayload>().unwrap().count += n;
            Ok(Value::Nil)
        }
        _ => bail!("add called on a non-instance"),
    }
}

fn count_get(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let r = args[0].as_obj().unwrap();
    match &vm.heap.get(r).kind {
        ObjectKind::Instance(i) => Ok(Value::Number(
            i.payload_ref::<CounterPayload>().unwrap().count,
        )),
        _ => bail!("count read on a non-instance"),
    }
}

fn count_set(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let r = args[0].as_obj().unwrap();
    let Value::Number(n) = args[2] else {
        bail!("count must be a number");
    };
    match &mut vm.heap.get_mut(r).kind {
        ObjectKind::Instance(i) => {
            i.payload_mut::<CounterPayload>().unwrap().count = n;
            Ok(Value::Nil)
        }
        _ => bail!("count write on a non-instance"),
    }
}

fn register_counter_module(vm: &mut Vm, module: &str, with_setter: bool) {
    let mut m = vm.register_module(module);
    let mut class = m.class("Counter", || Box::new(CounterPayload { count: 0.0 }));
    class.method("add", &["n"], counter_add);
    let setter = with_setter.then_some(count_set as crate::objects::NativeFn);
    class.descriptor("count", Some(count_get), setter);
    class.finish();
    m.finish();
}

#[test]
fn test_vm_native_class_payload_and_descriptor() {
    // c = import("counters").Counter();
    // c.add(5);
    // c.add(2);
    // c.count = c.count + 10;
    // return c.count;
    let mut vm = Vm::new();
    register_counter_module(&mut vm, "counters", true);

    let mut c = Chunk::new();
    let counters = sconst(&mut c, "counters");
    let counter_attr = sconst(&mut c, "Counter");
    let add = sconst(&mut c, "add");
    let count = sconst(&mut c, "count");
    let cvar = setname(&mut c, "c");
    refname(&mut c, "c");
    let n5 = nconst(&mut c, 5.0);
    let n2 = nconst(&mut c, 2.0);
    let n10 = nconst(&mut c, 10.0);
    c.ops = vec![
        Op::Import(counters),
        Op::GetAttribute(counter_attr),
        Op::Call(0),
        Op::SetVariable(cvar),
        Op::LoadVariable(cvar),
        Op::GetAttribute(add),
        Op::Constant(n5),
        Op::Call(1),
        Op::Pop,
        Op::LoadVariable(cvar),
        Op::GetAttribute(add),
        Op::Constant(n2),
        Op::Call(1),
        Op::Pop,
        Op::LoadVariable(cvar),
        Op::LoadVariable(cvar),
        Op::GetAttribute(count),
        Op::Constant(n10),
        Op::Add,
        Op::SetAttribute(count),
        Op::LoadVariable(cvar),
        Op::GetAttribute(count),
        Op::Return,
    ];
    assert_eq!(as_num(exec(&mut vm, c)), 17.0);
}

#[test]
fn test_vm_descriptor_without_setter_is_read_only() {
    // c = import("gauges").Counter();
    // c.count = 1;
    let mut vm = Vm::new();
    register_counter_module(&mut vm, "gauges", false);

    let mut c = Chunk::new();
    let gauges = sconst(&mut c, "gauges");
    let counter_attr = sconst(&mut c, "Counter");
    let count = sconst(&mut c, "count");
    let cvar = setname(&mut c, "c");
    refname(&mut c, "c");
    let n1 = nconst(&mut c, 1.0);
    c.ops = vec![
        Op::Import(gauges),
        Op::GetAttribute(counter_attr),
        Op::Call(0),
        Op::SetVariable(cvar),
        Op::LoadVariable(cvar),
        Op::Constant(n1),
        Op::SetAttribute(count),
        Op::Return,
    ];
    let err = format!("{:#}", vm.interpret(Rc::new(c)).unwrap_err());
    assert!(err.contains("descriptor for 'count' is read-only"), "{err}");
}
