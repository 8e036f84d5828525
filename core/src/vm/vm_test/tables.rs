use super::*;

#[test]
fn test_vm_table_literal_and_key_access() {
    // t = ["a": 1, "b": 2];
    // return t["b"];
    let mut c = Chunk::new();
    let a = sconst(&mut c, "a");
    let b = sconst(&mut c, "b");
    let n1 = nconst(&mut c, 1.0);
    let n2 = nconst(&mut c, 2.0);
    c.ops = vec![
        Op::MakeString(a),
        Op::Constant(n1),
        Op::MakeString(b),
        Op::Constant(n2),
        Op::MakeTable(2),
        Op::MakeString(b),
        Op::AccessKey,
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 2.0);
}

#[test]
fn test_vm_set_key_then_read_back() {
    // t = [];
    // t["k"] = 5;
    // return t["k"];
    let mut c = Chunk::new();
    let t = setname(&mut c, "t");
    refname(&mut c, "t");
    let k = sconst(&mut c, "k");
    let n5 = nconst(&mut c, 5.0);
    c.ops = vec![
        Op::MakeTable(0),
        Op::SetVariable(t),
        Op::LoadVariable(t),
        Op::MakeString(k),
        Op::Constant(n5),
        Op::SetKey,
        Op::LoadVariable(t),
        Op::MakeString(k),
        Op::AccessKey,
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 5.0);
}

#[test]
fn test_vm_missing_key_reads_as_nil() {
    // return []["nope"];
    let mut c = Chunk::new();
    let k = sconst(&mut c, "nope");
    c.ops = vec![
        Op::MakeTable(0),
        Op::MakeString(k),
        Op::AccessKey,
        Op::Return,
    ];
    assert_eq!(exec_with_new_vm(c), Value::Nil);
}

#[test]
fn test_vm_duplicate_literal_key_last_wins() {
    // return ["a": 1, "a": 2]["a"];
    let mut c = Chunk::new();
    let a = sconst(&mut c, "a");
    let n1 = nconst(&mut c, 1.0);
    let n2 = nconst(&mut c, 2.0);
    c.ops = vec![
        Op::MakeString(a),
        Op::Constant(n1),
        Op::MakeString(a),
        Op::Constant(n2),
        Op::MakeTable(2),
        Op::MakeString(a),
        Op::AccessKey,
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 2.0);
}

#[test]
fn test_vm_table_length_method() {
    // return ["a": 1, "b": 2].length();
    let mut c = Chunk::new();
    let a = sconst(&mut c, "a");
    let b = sconst(&mut c, "b");
    let length = sconst(&mut c, "length");
    let n1 = nconst(&mut c, 1.0);
    let n2 = nconst(&mut c, 2.0);
    c.ops = vec![
        Op::MakeString(a),
        Op::Constant(n1),
        Op::MakeString(b),
        Op::Constant(n2),
        Op::MakeTable(2),
        Op::GetAttribute(length),
        Op::Call(0),
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 2.0);
}

#[test]
fn test_vm_number_keys() {
    // return [0: "x", 1: "y"][1];
    let mut c = Chunk::new();
    let n0 = nconst(&mut c, 0.0);
    let n1 = nconst(&mut c, 1.0);
    let x = sconst(&mut c, "x");
    let y = sconst(&mut c, "y");
    c.ops = vec![
        Op::Constant(n0),
        Op::MakeString(x),
        Op::Constant(n1),
        Op::MakeString(y),
        Op::MakeTable(2),
        Op::Constant(n1),
        Op::AccessKey,
        Op::Return,
    ];
    let mut vm = Vm::new();
    let out = exec(&mut vm, c);
    assert_eq!(str_of(&vm, out), "y");
}

#[test]
fn test_vm_string_concatenation() {
    // return "foo" + "bar";
    let mut c = Chunk::new();
    let foo = sconst(&mut c, "foo");
    let bar = sconst(&mut c, "bar");
    c.ops = vec![
        Op::MakeString(foo),
        Op::MakeString(bar),
        Op::Add,
        Op::Return,
    ];
    let mut vm = Vm::new();
    let out = exec(&mut vm, c);
    assert_eq!(str_of(&vm, out), "foobar");
}

#[test]
fn test_vm_string_plus_number_fails() {
    // "a" + 1;
    let mut c = Chunk::new();
    let a = sconst(&mut c, "a");
    let n1 = nconst(&mut c, 1.0);
    c.ops = vec![Op::MakeString(a), Op::Constant(n1), Op::Add, Op::Return];
    let err = exec_err(c);
    assert!(
        err.contains("can only concatenate a string to a string, not a number"),
        "{err}"
    );
}

#[test]
fn test_vm_string_indexing() {
    // return "hello"[1];
    let mut c = Chunk::new();
    let hello = sconst(&mut c, "hello");
    let n1 = nconst(&mut c, 1.0);
    c.ops = vec![
        Op::MakeString(hello),
        Op::Constant(n1),
        Op::AccessKey,
        Op::Return,
    ];
    let mut vm = Vm::new();
    let out = exec(&mut vm, c);
    assert_eq!(str_of(&vm, out), "e");
}

#[test]
fn test_vm_string_index_out_of_range() {
    let mut c = Chunk::new();
    let hello = sconst(&mut c, "hello");
    let n9 = nconst(&mut c, 9.0);
    c.ops = vec![
        Op::MakeString(hello),
        Op::Constant(n9),
        Op::AccessKey,
        Op::Return,
    ];
    let err = exec_err(c);
    assert!(err.contains("string index 9 out of range"), "{err}");
}

#[test]
fn test_vm_string_length_method() {
    // return "hello".length();
    let mut c = Chunk::new();
    let hello = sconst(&mut c, "hello");
    let length = sconst(&mut c, "length");
    c.ops = vec![
        Op::MakeString(hello),
        Op::GetAttribute(length),
        Op::Call(0),
        Op::Return,
    ];
    assert_eq!(as_num(exec_with_new_vm(c)), 5.0);
}

#[test]
fn test_vm_keyed_access_needs_a_keyed_object() {
    // 1[0];
    let mut c = Chunk::new();
    let n1 = nconst(&mut c, 1.0);
    let n0 = nconst(&mut c, 0.0);
    c.ops = vec![
        Op::Constant(n1),
        Op::Constant(n0),
        Op::AccessKey,
        Op::Return,
    ];
    let err = exec_err(c);
    assert!(err.contains("a number does not support keyed access"), "{err}");
}
