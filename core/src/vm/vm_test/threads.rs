use super::*;

use crate::objects::ObjectKind;

/// `fn(id) { ... }` appending its id to the shared table three times.
/// Each append is exactly six instructions, so the scheduler's quantum
/// decides how the two workers interleave.
fn worker_chunk() -> Chunk {
    let mut w = Chunk::new();
    let shared = refname(&mut w, "shared");
    let id = refname(&mut w, "id");
    let length = sconst(&mut w, "length");
    w.params = vec![Rc::from("id")];

    // shared[shared.length()] = id;
    let append = [
        Op::LoadVariable(shared),
        Op::LoadVariable(shared),
        Op::GetAttribute(length),
        Op::Call(0),
        Op::LoadVariable(id),
        Op::SetKey,
    ];
    let mut ops = Vec::new();
    for _ in 0..3 {
        ops.extend_from_slice(&append);
    }
    ops.push(Op::Nil);
    ops.push(Op::Return);
    w.ops = ops;
    w
}

/// shared = [];
/// worker = fn(id) { ... };
/// spawn(worker, 1);
/// spawn(worker, 2);
/// return shared;
fn two_workers_chunk() -> Chunk {
    let mut c = Chunk::new();
    let shared = setname(&mut c, "shared");
    let worker = setname(&mut c, "worker");
    refname(&mut c, "shared");
    refname(&mut c, "worker");
    let spawn = refname(&mut c, "spawn");
    let worker_code = code_const(&mut c, worker_chunk());
    let n1 = nconst(&mut c, 1.0);
    let n2 = nconst(&mut c, 2.0);
    c.ops = vec![
        Op::MakeTable(0),
        Op::SetVariable(shared),
        Op::MakeFunction(worker_code),
        Op::SetVariable(worker),
        Op::LoadVariable(spawn),
        Op::LoadVariable(worker),
        Op::Constant(n1),
        Op::Call(2),
        Op::Pop,
        Op::LoadVariable(spawn),
        Op::LoadVariable(worker),
        Op::Constant(n2),
        Op::Call(2),
        Op::Pop,
        Op::LoadVariable(shared),
        Op::Return,
    ];
    c
}

fn run_two_workers(quantum: usize) -> Vec<f64> {
    let mut vm = Vm::with_options(VmOptions {
        quantum,
        ..VmOptions::default()
    });
    let out = vm.interpret(Rc::new(two_workers_chunk())).unwrap();
    let r = out.as_obj().unwrap();
    let ObjectKind::Table(table) = &vm.heap.get(r).kind else {
        panic!("expected a table result");
    };
    let table = table.clone();
    let table = table.borrow();
    (0..table.len())
        .map(|i| {
            match table.get(&vm.heap, Value::Number(i as f64)).unwrap() {
                Some(Value::Number(n)) => n,
                other => panic!("index {i} holds {other:?}"),
            }
        })
        .collect()
}

#[test]
fn test_vm_large_quantum_runs_threads_back_to_back() {
    // Each worker finishes within one quantum, so the first one drains
    // before the second starts.
    let seq = run_two_workers(10_000);
    assert_eq!(seq, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
}

#[test]
fn test_vm_small_quantum_interleaves_threads() {
    let seq = run_two_workers(6);
    let ones = seq.iter().filter(|&&n| n == 1.0).count();
    let twos = seq.iter().filter(|&&n| n == 2.0).count();
    assert_eq!((ones, twos), (3, 3), "{seq:?}");
    assert_ne!(seq, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
}

#[test]
fn test_vm_scheduling_is_deterministic() {
    assert_eq!(run_two_workers(6), run_two_workers(6));
}

#[test]
fn test_vm_quantum_of_zero_still_makes_progress() {
    // A literal zero would starve every thread; it is clamped to one step
    // per turn, so the program still finishes.
    let mut vm = Vm::with_options(VmOptions {
        quantum: 0,
        ..VmOptions::default()
    });
    assert_eq!(vm.options().quantum, 1);

    let mut c = Chunk::new();
    let n7 = nconst(&mut c, 7.0);
    c.ops = vec![Op::Constant(n7), Op::Return];
    assert_eq!(as_num(exec(&mut vm, c)), 7.0);
}

#[test]
fn test_vm_spawn_returns_a_thread() {
    // f = fn() { return nil; };
    // return get_type(spawn(f));
    let mut body = Chunk::new();
    body.ops = vec![Op::Nil, Op::Return];

    let mut c = Chunk::new();
    let f = setname(&mut c, "f");
    refname(&mut c, "f");
    let spawn = refname(&mut c, "spawn");
    let get_type = refname(&mut c, "get_type");
    let code = code_const(&mut c, body);
    c.ops = vec![
        Op::MakeFunction(code),
        Op::SetVariable(f),
        Op::LoadVariable(get_type),
        Op::LoadVariable(spawn),
        Op::LoadVariable(f),
        Op::Call(1),
        Op::Call(1),
        Op::Return,
    ];
    let mut vm = Vm::new();
    let out = exec(&mut vm, c);
    assert_eq!(str_of(&vm, out), "thread");
}

#[test]
fn test_vm_spawn_rejects_non_functions() {
    let mut c = Chunk::new();
    let spawn = refname(&mut c, "spawn");
    let n1 = nconst(&mut c, 1.0);
    c.ops = vec![
        Op::LoadVariable(spawn),
        Op::Constant(n1),
        Op::Call(1),
        Op::Return,
    ];
    let err = exec_err(c);
    assert!(err.contains("threads run user-defined functions"), "{err}");
}

#[test]
fn test_vm_spawn_needs_an_argument() {
    let mut c = Chunk::new();
    let spawn = refname(&mut c, "spawn");
    c.ops = vec![Op::LoadVariable(spawn), Op::Call(0), Op::Return];
    let err = exec_err(c);
    assert!(err.contains("spawn needs a function"), "{err}");
}
