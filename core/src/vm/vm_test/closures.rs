use super::*;

#[test]
fn test_vm_closure_shares_enclosing_cell() {
    // x = 1;
    // f = fn() { return x; };
    // x = 2;
    // return f();
    let mut body = Chunk::new();
    let x_inner = refname(&mut body, "x");
    body.ops = vec![Op::LoadVariable(x_inner), Op::Return];

    let mut c = Chunk::new();
    let x = setname(&mut c, "x");
    let f = setname(&mut c, "f");
    refname(&mut c, "f");
    let code = code_const(&mut c, body);
    let n1 = nconst(&mut c, 1.0);
    let n2 = nconst(&mut c, 2.0);
    c.ops = vec![
        Op::Constant(n1),
        Op::SetVariable(x),
        Op::MakeFunction(code),
        Op::SetVariable(f),
        Op::Constant(n2),
        Op::SetVariable(x),
        Op::LoadVariable(f),
        Op::Call(0),
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 2.0);
}

#[test]
fn test_vm_closure_captures_name_assigned_later() {
    // f = fn() { return x; };   // x not yet bound
    // x = 2;
    // return f();
    let mut body = Chunk::new();
    let x_inner = refname(&mut body, "x");
    body.ops = vec![Op::LoadVariable(x_inner), Op::Return];

    let mut c = Chunk::new();
    let f = setname(&mut c, "f");
    let x = setname(&mut c, "x");
    refname(&mut c, "f");
    let code = code_const(&mut c, body);
    let n2 = nconst(&mut c, 2.0);
    c.ops = vec![
        Op::MakeFunction(code),
        Op::SetVariable(f),
        Op::Constant(n2),
        Op::SetVariable(x),
        Op::LoadVariable(f),
        Op::Call(0),
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 2.0);
}

#[test]
fn test_vm_capture_chains_through_intermediate_function() {
    // outer = fn() {
    //   x = 10;
    //   mid = fn() {
    //     inner = fn() { return x; };
    //     return inner;
    //   };
    //   return mid();
    // };
    // h = outer();
    // return h();
    let mut inner = Chunk::new();
    let x_inner = refname(&mut inner, "x");
    inner.ops = vec![Op::LoadVariable(x_inner), Op::Return];

    let mut mid = Chunk::new();
    // x appears here only so the capture can chain through.
    refname(&mut mid, "x");
    let m_inner = setname(&mut mid, "inner");
    refname(&mut mid, "inner");
    let inner_code = code_const(&mut mid, inner);
    mid.ops = vec![
        Op::MakeFunction(inner_code),
        Op::SetVariable(m_inner),
        Op::LoadVariable(m_inner),
        Op::Return,
    ];

    let mut outer = Chunk::new();
    let o_x = setname(&mut outer, "x");
    let o_mid = setname(&mut outer, "mid");
    refname(&mut outer, "mid");
    let mid_code = code_const(&mut outer, mid);
    let n10 = nconst(&mut outer, 10.0);
    outer.ops = vec![
        Op::Constant(n10),
        Op::SetVariable(o_x),
        Op::MakeFunction(mid_code),
        Op::SetVariable(o_mid),
        Op::LoadVariable(o_mid),
        Op::Call(0),
        Op::Return,
    ];

    let mut c = Chunk::new();
    let c_outer = setname(&mut c, "outer");
    let h = setname(&mut c, "h");
    refname(&mut c, "outer");
    refname(&mut c, "h");
    let outer_code = code_const(&mut c, outer);
    c.ops = vec![
        Op::MakeFunction(outer_code),
        Op::SetVariable(c_outer),
        Op::LoadVariable(c_outer),
        Op::Call(0),
        Op::SetVariable(h),
        Op::LoadVariable(h),
        Op::Call(0),
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 10.0);
}

#[test]
fn test_vm_unresolved_name_reads_globals() {
    // f = fn() { return answer; };
    // return f();
    let mut body = Chunk::new();
    let answer = refname(&mut body, "answer");
    body.ops = vec![Op::LoadVariable(answer), Op::Return];

    let mut c = Chunk::new();
    let f = setname(&mut c, "f");
    refname(&mut c, "f");
    let code = code_const(&mut c, body);
    c.ops = vec![
        Op::MakeFunction(code),
        Op::SetVariable(f),
        Op::LoadVariable(f),
        Op::Call(0),
        Op::Return,
    ];

    let mut vm = Vm::new();
    vm.define_global("answer", Value::Number(7.0));
    assert_eq!(as_num(exec(&mut vm, c)), 7.0);
}

#[test]
fn test_vm_undefined_variable() {
    let mut c = Chunk::new();
    let zzz = refname(&mut c, "zzz");
    c.ops = vec![Op::LoadVariable(zzz), Op::Return];
    let err = exec_err(c);
    assert!(err.contains("undefined variable 'zzz'"), "{err}");
}

#[test]
fn test_vm_unfilled_capture_reads_as_undefined() {
    // f = fn() { return x; };
    // result = f();   // x declared for capture but never assigned yet
    let mut body = Chunk::new();
    let x_inner = refname(&mut body, "x");
    body.ops = vec![Op::LoadVariable(x_inner), Op::Return];

    let mut c = Chunk::new();
    let f = setname(&mut c, "f");
    let _x = setname(&mut c, "x");
    refname(&mut c, "f");
    let code = code_const(&mut c, body);
    c.ops = vec![
        Op::MakeFunction(code),
        Op::SetVariable(f),
        Op::LoadVariable(f),
        Op::Call(0),
        Op::Return,
    ];
    let err = exec_err(c);
    assert!(err.contains("undefined variable 'x'"), "{err}");
}
