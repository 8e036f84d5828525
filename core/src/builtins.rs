//! Built-in global functions, installed into every fresh VM.

use std::cell::RefCell;
use std::fs;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use once_cell::sync::Lazy;

use crate::objects::{NativeFn, ObjectKind};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

struct BuiltinDef {
    name: &'static str,
    /// Empty means variadic; the VM enforces exact arity otherwise.
    params: &'static [&'static str],
    f: NativeFn,
}

static BUILTINS: Lazy<Vec<BuiltinDef>> = Lazy::new(|| {
    vec![
        BuiltinDef {
            name: "print",
            params: &[],
            f: builtin_print,
        },
        BuiltinDef {
            name: "input",
            params: &[],
            f: builtin_input,
        },
        BuiltinDef {
            name: "time",
            params: &[],
            f: builtin_time,
        },
        BuiltinDef {
            name: "to_string",
            params: &["value"],
            f: builtin_to_string,
        },
        BuiltinDef {
            name: "to_number",
            params: &["value"],
            f: builtin_to_number,
        },
        BuiltinDef {
            name: "has_attr",
            params: &["object", "name"],
            f: builtin_has_attr,
        },
        BuiltinDef {
            name: "get_type",
            params: &["value"],
            f: builtin_get_type,
        },
        BuiltinDef {
            name: "is_instance",
            params: &["value", "class"],
            f: builtin_is_instance,
        },
        BuiltinDef {
            name: "super",
            params: &[],
            f: builtin_super,
        },
        BuiltinDef {
            name: "spawn",
            params: &[],
            f: builtin_spawn,
        },
        BuiltinDef {
            name: "gc_collect",
            params: &[],
            f: builtin_gc_collect,
        },
        BuiltinDef {
            name: "read_file",
            params: &["path"],
            f: builtin_read_file,
        },
        BuiltinDef {
            name: "write_file",
            params: &["path", "contents"],
            f: builtin_write_file,
        },
        BuiltinDef {
            name: "file_exists",
            params: &["path"],
            f: builtin_file_exists,
        },
        BuiltinDef {
            name: "delete_file",
            params: &["path"],
            f: builtin_delete_file,
        },
    ]
});

pub(crate) fn install(vm: &mut Vm) {
    for def in BUILTINS.iter() {
        let function = vm.heap.native_function_new(def.name, def.params, def.f);
        vm.globals
            .set_value(&mut vm.heap, def.name, Value::Obj(function));
    }
}

fn str_arg(vm: &Vm, args: &[Value], index: usize, what: &str) -> Result<String> {
    match args[index].as_obj().and_then(|r| vm.heap.try_str(r)) {
        Some(s) => Ok(s.to_string()),
        None => bail!(
            "{what} must be a string, not a {}",
            args[index].type_name(&vm.heap)
        ),
    }
}

fn builtin_print(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let line = args
        .iter()
        .map(|v| v.format(&vm.heap))
        .collect::<Vec<_>>()
        .join(" ");
    println!("{line}");
    Ok(Value::Nil)
}

fn builtin_input(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    if let Some(prompt) = args.first() {
        print!("{}", prompt.format(&vm.heap));
        io::stdout().flush().context("flushing stdout")?;
    }
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading stdin")?;
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(Value::Obj(vm.heap.string_copy(trimmed)))
}

fn builtin_time(vm: &mut Vm, _receiver: Option<Value>, _args: &[Value]) -> Result<Value> {
    Ok(Value::Number(vm.elapsed_ms()))
}

fn builtin_to_string(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let text = args[0].format(&vm.heap);
    Ok(Value::Obj(vm.heap.string_copy(&text)))
}

fn builtin_to_number(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    match args[0] {
        Value::Number(_) => Ok(args[0]),
        Value::Obj(r) => match vm.heap.try_str(r) {
            Some(s) => Ok(s
                .trim()
                .parse::<f64>()
                .map(Value::Number)
                .unwrap_or(Value::Nil)),
            None => Ok(Value::Nil),
        },
        _ => Ok(Value::Nil),
    }
}

fn builtin_has_attr(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let name = str_arg(vm, args, 1, "attribute name")?;
    let found = match args[0].as_obj() {
        Some(r) => vm
            .heap
            .load_attribute_bypass_descriptors(r, &name)
            .is_some(),
        None => false,
    };
    Ok(Value::Bool(found))
}

fn builtin_get_type(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let name = args[0].type_name(&vm.heap);
    Ok(Value::Obj(vm.heap.string_copy(name)))
}

fn builtin_is_instance(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let Some(obj) = args[0].as_obj() else {
        return Ok(Value::Bool(false));
    };
    // Accepts either a class object (identity match up the chain) or a
    // class name.
    match args[1].as_obj().map(|r| (r, &vm.heap.get(r).kind)) {
        Some((class, ObjectKind::Class(_))) => {
            let ObjectKind::Instance(instance) = &vm.heap.get(obj).kind else {
                return Ok(Value::Bool(false));
            };
            let mut cursor = Some(instance.class);
            while let Some(c) = cursor {
                if c == class {
                    return Ok(Value::Bool(true));
                }
                cursor = match &vm.heap.get(c).kind {
                    ObjectKind::Class(cls) => cls.superclass,
                    _ => None,
                };
            }
            Ok(Value::Bool(false))
        }
        Some((name, ObjectKind::Str(_))) => {
            let name = vm.heap.str_value(name).to_string();
            Ok(Value::Bool(vm.heap.is_instance_of(obj, &name)))
        }
        _ => bail!(
            "is_instance needs a class or class name, not a {}",
            args[1].type_name(&vm.heap)
        ),
    }
}

/// Dispatch to the superclass version of the currently running method. The
/// receiver and method name come from the calling frame; arguments are
/// forwarded from an optional numerically-indexed table.
fn builtin_super(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let state = vm.current_thread_state();
    let (self_value, method_name) = {
        let st = state.borrow();
        let depth = st.frames.len();
        if depth < 2 {
            bail!("super() called outside a method");
        }
        let caller = &st.frames[depth - 2];
        let self_value = caller.locals.borrow().get_value(&vm.heap, "self");
        let method_name = vm.heap.function(caller.function).name.clone();
        (self_value, method_name)
    };
    let instance = match self_value.and_then(|v| v.as_obj()) {
        Some(r) => r,
        None => bail!("super() called outside a method"),
    };
    let class = match &vm.heap.get(instance).kind {
        ObjectKind::Instance(i) => i.class,
        kind => bail!("super() requires an instance receiver, not a {}", kind.type_name()),
    };
    let (class_name, superclass) = match &vm.heap.get(class).kind {
        ObjectKind::Class(c) => (c.name.clone(), c.superclass),
        _ => unreachable!(),
    };
    let Some(superclass) = superclass else {
        bail!("class '{class_name}' has no superclass");
    };

    let mut cursor = Some(superclass);
    let mut found = None;
    while let Some(c) = cursor {
        if let Some(value) = vm.heap.get_own_attribute(c, &method_name) {
            found = Some(value);
            break;
        }
        cursor = match &vm.heap.get(c).kind {
            ObjectKind::Class(cls) => cls.superclass,
            _ => None,
        };
    }
    let Some(method) = found else {
        bail!("no method '{method_name}' above class '{class_name}'");
    };
    let callee = match method.as_obj() {
        Some(r) if matches!(vm.heap.get(r).kind, ObjectKind::Function(_)) => {
            Value::Obj(vm.heap.bound_method_new(r, instance))
        }
        _ => method,
    };

    let forwarded = match args.first() {
        None => Vec::new(),
        Some(value) => table_args(vm, *value)?,
    };
    vm.call_sync(callee, &forwarded)
}

/// Pull `table[0] .. table[len-1]` out as an argument list.
fn table_args(vm: &Vm, value: Value) -> Result<Vec<Value>> {
    let table: Rc<RefCell<Table>> = match value.as_obj().map(|r| &vm.heap.get(r).kind) {
        Some(ObjectKind::Table(t)) => t.clone(),
        _ => bail!(
            "super() takes an argument table, not a {}",
            value.type_name(&vm.heap)
        ),
    };
    let table = table.borrow();
    let mut out = Vec::with_capacity(table.len());
    for i in 0..table.len() {
        match table.get(&vm.heap, Value::Number(i as f64))? {
            Some(v) => out.push(v),
            None => bail!("argument table is missing index {i}"),
        }
    }
    Ok(out)
}

fn builtin_spawn(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let Some((&function, rest)) = args.split_first() else {
        bail!("spawn needs a function");
    };
    vm.spawn_thread(function, rest)
}

fn builtin_gc_collect(vm: &mut Vm, _receiver: Option<Value>, _args: &[Value]) -> Result<Value> {
    let stats = vm.collect_garbage();
    Ok(Value::Number(stats.collected as f64))
}

fn builtin_read_file(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let path = str_arg(vm, args, 0, "path")?;
    let contents = fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(Value::Obj(vm.heap.string_copy(&contents)))
}

fn builtin_write_file(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let path = str_arg(vm, args, 0, "path")?;
    let contents = str_arg(vm, args, 1, "contents")?;
    fs::write(&path, contents).with_context(|| format!("writing {path}"))?;
    Ok(Value::Nil)
}

fn builtin_file_exists(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let path = str_arg(vm, args, 0, "path")?;
    Ok(Value::Bool(fs::exists(&path).unwrap_or(false)))
}

fn builtin_delete_file(vm: &mut Vm, _receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let path = str_arg(vm, args, 0, "path")?;
    fs::remove_file(&path).with_context(|| format!("deleting {path}"))?;
    Ok(Value::Nil)
}
