use super::*;

fn vm_with_path(path: &std::path::Path) -> Vm {
    let mut vm = Vm::new();
    let s = vm.heap.string_copy(&path.display().to_string());
    vm.define_global("path", Value::Obj(s));
    vm
}

/// `return file_exists(path);`
fn exists_chunk() -> Chunk {
    let mut c = Chunk::new();
    let file_exists = refname(&mut c, "file_exists");
    let path = refname(&mut c, "path");
    c.ops = vec![
        Op::LoadVariable(file_exists),
        Op::LoadVariable(path),
        Op::Call(1),
        Op::Return,
    ];
    c
}

#[test]
fn test_vm_write_then_read_file() {
    // write_file(path, "from the vm");
    // return read_file(path);
    let dir = tempfile::tempdir().unwrap();
    let mut vm = vm_with_path(&dir.path().join("note.txt"));

    let mut c = Chunk::new();
    let write_file = refname(&mut c, "write_file");
    let read_file = refname(&mut c, "read_file");
    let path = refname(&mut c, "path");
    let contents = sconst(&mut c, "from the vm");
    c.ops = vec![
        Op::LoadVariable(write_file),
        Op::LoadVariable(path),
        Op::MakeString(contents),
        Op::Call(2),
        Op::Pop,
        Op::LoadVariable(read_file),
        Op::LoadVariable(path),
        Op::Call(1),
        Op::Return,
    ];
    let out = exec(&mut vm, c);
    assert_eq!(str_of(&vm, out), "from the vm");
}

#[test]
fn test_vm_file_exists_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("doomed.txt");
    std::fs::write(&path, "x").unwrap();
    let mut vm = vm_with_path(&path);

    assert_eq!(exec(&mut vm, exists_chunk()), Value::Bool(true));

    // delete_file(path);
    let mut c = Chunk::new();
    let delete_file = refname(&mut c, "delete_file");
    let p = refname(&mut c, "path");
    c.ops = vec![
        Op::LoadVariable(delete_file),
        Op::LoadVariable(p),
        Op::Call(1),
        Op::Return,
    ];
    exec(&mut vm, c);

    assert!(!path.exists());
    assert_eq!(exec(&mut vm, exists_chunk()), Value::Bool(false));
}

#[test]
fn test_vm_reading_a_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut vm = vm_with_path(&dir.path().join("absent.txt"));

    let mut c = Chunk::new();
    let read_file = refname(&mut c, "read_file");
    let path = refname(&mut c, "path");
    c.ops = vec![
        Op::LoadVariable(read_file),
        Op::LoadVariable(path),
        Op::Call(1),
        Op::Return,
    ];
    let err = format!("{:#}", vm.interpret(Rc::new(c)).unwrap_err());
    assert!(err.contains("reading"), "{err}");
}
