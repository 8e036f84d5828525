//! The heap object model.
//!
//! Every heap value is an [`Object`]: a kind payload plus an attribute map.
//! The attribute map is a [`CellTable`] behind an `Rc<RefCell<..>>` so the
//! interpreter can operate on it while the heap is borrowed for allocation;
//! the same pattern covers user tables and thread state. Constructors live
//! on [`Heap`] because every allocation must be owned by the arena.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use anyhow::{Result, bail};

use crate::bytecode::Chunk;
use crate::cell_table::CellTable;
use crate::heap::{Heap, ObjRef};
use crate::table::Table;
use crate::value::{Value, hash_str};
use crate::vm::Vm;
use crate::vm::frame::ThreadState;

pub const ANONYMOUS_FUNCTION: &str = "<anonymous function>";
pub const ANONYMOUS_CLASS: &str = "<anonymous class>";

/// Host functions callable from bytecode. The receiver is present for bound
/// calls; failure surfaces as a runtime error at the call site.
pub type NativeFn = fn(&mut Vm, Option<Value>, &[Value]) -> Result<Value>;

/// Extra state carried by instances of natively-defined classes. The layout
/// is fixed when the class is defined: every instance gets one payload from
/// the class's factory and keeps it for life.
pub trait NativePayload: Any {
    /// Object handles owned by this payload, reported to the collector.
    fn mark(&self) -> Vec<ObjRef> {
        Vec::new()
    }
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

#[derive(Debug)]
pub struct Object {
    pub kind: ObjectKind,
    pub attributes: Rc<RefCell<CellTable>>,
}

#[derive(Debug)]
pub enum ObjectKind {
    Str(StrObj),
    Function(FunctionObj),
    Code(Rc<Chunk>),
    Table(Rc<RefCell<Table>>),
    Cell(CellObj),
    Module(ModuleObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Thread(Rc<RefCell<ThreadState>>),
}

impl ObjectKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectKind::Str(_) => "string",
            ObjectKind::Function(_) => "function",
            ObjectKind::Code(_) => "code",
            ObjectKind::Table(_) => "table",
            ObjectKind::Cell(_) => "cell",
            ObjectKind::Module(_) => "module",
            ObjectKind::Class(_) => "class",
            ObjectKind::Instance(_) => "instance",
            ObjectKind::BoundMethod(_) => "bound_method",
            ObjectKind::Thread(_) => "thread",
        }
    }
}

#[derive(Debug)]
pub struct StrObj {
    pub chars: Rc<str>,
    pub hash: u64,
}

#[derive(Debug)]
pub struct FunctionObj {
    /// Display name, set lazily the first time the function is bound to a
    /// variable.
    pub name: String,
    pub params: Vec<Rc<str>>,
    pub free_vars: Rc<RefCell<CellTable>>,
    pub body: FunctionBody,
}

impl FunctionObj {
    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native(_))
    }
}

#[derive(Debug)]
pub enum FunctionBody {
    Native(NativeFn),
    User { code: ObjRef },
}

#[derive(Debug, Clone, Copy)]
pub struct CellObj {
    pub value: Value,
    pub is_filled: bool,
}

#[derive(Debug)]
pub struct ModuleObj {
    pub name: Rc<str>,
    /// Body function for user modules; `None` for native modules, whose
    /// attributes are registered directly.
    pub body: Option<ObjRef>,
}

pub struct ClassObj {
    pub name: String,
    pub superclass: Option<ObjRef>,
    /// Body function for user classes, run once at class-construction time
    /// with the class itself as attribute target.
    pub base_function: Option<ObjRef>,
    /// Payload factory for natively-defined classes.
    pub payload_factory: Option<Rc<dyn Fn() -> Box<dyn NativePayload>>>,
}

impl fmt::Debug for ClassObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassObj")
            .field("name", &self.name)
            .field("superclass", &self.superclass)
            .field("base_function", &self.base_function)
            .field("native", &self.payload_factory.is_some())
            .finish()
    }
}

pub struct InstanceObj {
    pub class: ObjRef,
    pub payload: Option<Box<dyn NativePayload>>,
}

impl fmt::Debug for InstanceObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceObj")
            .field("class", &self.class)
            .field("native", &self.payload.is_some())
            .finish()
    }
}

impl InstanceObj {
    pub fn payload_ref<T: NativePayload>(&self) -> Option<&T> {
        self.payload.as_ref()?.as_any().downcast_ref::<T>()
    }

    pub fn payload_mut<T: NativePayload>(&mut self) -> Option<&mut T> {
        self.payload.as_mut()?.as_any_mut().downcast_mut::<T>()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: ObjRef,
    pub method: ObjRef,
}

fn new_object(kind: ObjectKind) -> Object {
    Object {
        kind,
        attributes: Rc::new(RefCell::new(CellTable::new())),
    }
}

impl Heap {
    /// Intern-aware string constructor: identical content always yields the
    /// same object identity.
    pub fn string_copy(&mut self, s: &str) -> ObjRef {
        if let Some(&existing) = self.strings.get(s) {
            return existing;
        }
        self.string_insert(Rc::from(s))
    }

    /// Like [`Heap::string_copy`] but reuses an existing shared buffer.
    pub fn string_from_rc(&mut self, chars: Rc<str>) -> ObjRef {
        if let Some(&existing) = self.strings.get(&*chars) {
            return existing;
        }
        self.string_insert(chars)
    }

    fn string_insert(&mut self, chars: Rc<str>) -> ObjRef {
        let hash = hash_str(&chars);
        let r = self.allocate(new_object(ObjectKind::Str(StrObj {
            chars: chars.clone(),
            hash,
        })));
        // Interned before the protocol methods go in: installing them asks
        // for the attribute-name strings, which may be this very string.
        self.strings.insert(chars, r);
        self.install_string_methods(r);
        r
    }

    pub fn native_function_new(&mut self, name: &str, params: &[&str], f: NativeFn) -> ObjRef {
        let params = params.iter().map(|p| Rc::from(*p)).collect();
        self.allocate(new_object(ObjectKind::Function(FunctionObj {
            name: name.to_string(),
            params,
            free_vars: Rc::new(RefCell::new(CellTable::new())),
            body: FunctionBody::Native(f),
        })))
    }

    pub fn user_function_new(
        &mut self,
        code: ObjRef,
        params: Vec<Rc<str>>,
        free_vars: CellTable,
    ) -> ObjRef {
        self.allocate(new_object(ObjectKind::Function(FunctionObj {
            name: ANONYMOUS_FUNCTION.to_string(),
            params,
            free_vars: Rc::new(RefCell::new(free_vars)),
            body: FunctionBody::User { code },
        })))
    }

    pub fn code_new(&mut self, chunk: Rc<Chunk>) -> ObjRef {
        self.allocate(new_object(ObjectKind::Code(chunk)))
    }

    pub fn table_new(&mut self) -> ObjRef {
        let r = self.allocate(new_object(ObjectKind::Table(Rc::new(RefCell::new(
            Table::new(),
        )))));
        self.install_table_methods(r);
        r
    }

    pub fn cell_new(&mut self, value: Value) -> ObjRef {
        self.allocate(new_object(ObjectKind::Cell(CellObj {
            value,
            is_filled: true,
        })))
    }

    pub fn cell_new_empty(&mut self) -> ObjRef {
        self.allocate(new_object(ObjectKind::Cell(CellObj {
            value: Value::Nil,
            is_filled: false,
        })))
    }

    pub fn cell_fill(&mut self, cell: ObjRef, value: Value) {
        match &mut self.get_mut(cell).kind {
            ObjectKind::Cell(c) => {
                c.value = value;
                c.is_filled = true;
            }
            kind => panic!("cell_fill on a {}", kind.type_name()),
        }
    }

    pub fn module_new(&mut self, name: Rc<str>, body: Option<ObjRef>) -> ObjRef {
        self.allocate(new_object(ObjectKind::Module(ModuleObj { name, body })))
    }

    pub fn class_new(
        &mut self,
        name: &str,
        base_function: Option<ObjRef>,
        superclass: Option<ObjRef>,
    ) -> ObjRef {
        self.allocate(new_object(ObjectKind::Class(ClassObj {
            name: name.to_string(),
            superclass,
            base_function,
            payload_factory: None,
        })))
    }

    pub fn class_native_new(
        &mut self,
        name: &str,
        payload_factory: Rc<dyn Fn() -> Box<dyn NativePayload>>,
    ) -> ObjRef {
        self.allocate(new_object(ObjectKind::Class(ClassObj {
            name: name.to_string(),
            superclass: None,
            base_function: None,
            payload_factory: Some(payload_factory),
        })))
    }

    pub fn instance_new(&mut self, class: ObjRef) -> ObjRef {
        let payload = match &self.get(class).kind {
            ObjectKind::Class(c) => c.payload_factory.as_ref().map(|factory| factory()),
            kind => panic!("instance_new on a {}", kind.type_name()),
        };
        self.allocate(new_object(ObjectKind::Instance(InstanceObj {
            class,
            payload,
        })))
    }

    pub fn bound_method_new(&mut self, method: ObjRef, receiver: ObjRef) -> ObjRef {
        self.allocate(new_object(ObjectKind::BoundMethod(BoundMethodObj {
            receiver,
            method,
        })))
    }

    pub fn thread_new(&mut self, state: ThreadState) -> ObjRef {
        self.allocate(new_object(ObjectKind::Thread(Rc::new(RefCell::new(
            state,
        )))))
    }

    #[inline]
    pub fn try_str(&self, r: ObjRef) -> Option<&str> {
        match &self.get(r).kind {
            ObjectKind::Str(s) => Some(&s.chars),
            _ => None,
        }
    }

    #[inline]
    pub fn str_value(&self, r: ObjRef) -> &str {
        match &self.get(r).kind {
            ObjectKind::Str(s) => &s.chars,
            kind => panic!("expected a string, found a {}", kind.type_name()),
        }
    }

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match &self.get(r).kind {
            ObjectKind::Function(f) => f,
            kind => panic!("expected a function, found a {}", kind.type_name()),
        }
    }

    pub fn chunk_of(&self, function: ObjRef) -> Rc<Chunk> {
        match &self.function(function).body {
            FunctionBody::User { code } => match &self.get(*code).kind {
                ObjectKind::Code(chunk) => chunk.clone(),
                kind => panic!("function body is a {}", kind.type_name()),
            },
            FunctionBody::Native(_) => panic!("native function has no bytecode"),
        }
    }

    pub fn thread_state(&self, r: ObjRef) -> Rc<RefCell<ThreadState>> {
        match &self.get(r).kind {
            ObjectKind::Thread(state) => state.clone(),
            kind => panic!("expected a thread, found a {}", kind.type_name()),
        }
    }

    /// Give an anonymous function or class its display name. Called when the
    /// value is first bound to a variable.
    pub fn name_if_anonymous(&mut self, r: ObjRef, name: &str) {
        match &mut self.get_mut(r).kind {
            ObjectKind::Function(f) if f.name == ANONYMOUS_FUNCTION => {
                f.name = name.to_string();
            }
            ObjectKind::Class(c) if c.name == ANONYMOUS_CLASS => {
                c.name = name.to_string();
            }
            _ => {}
        }
    }

    pub fn set_attribute(&mut self, obj: ObjRef, name: &str, value: Value) {
        let attributes = self.get(obj).attributes.clone();
        attributes.borrow_mut().set_value(self, name, value);
    }

    pub fn get_own_attribute(&self, obj: ObjRef, name: &str) -> Option<Value> {
        self.get(obj).attributes.borrow().get_value(self, name)
    }

    /// Attribute lookup without descriptor interception: the object's own
    /// map first, then (for instances) the class chain, wrapping functions
    /// found there into fresh bound methods.
    pub fn load_attribute_bypass_descriptors(&mut self, obj: ObjRef, name: &str) -> Option<Value> {
        if let Some(value) = self.get_own_attribute(obj, name) {
            return Some(value);
        }

        let mut class = match &self.get(obj).kind {
            ObjectKind::Instance(instance) => Some(instance.class),
            _ => None,
        };
        while let Some(c) = class {
            if let Some(value) = self.get_own_attribute(c, name) {
                let value = match value.as_obj() {
                    Some(r) if matches!(self.get(r).kind, ObjectKind::Function(_)) => {
                        Value::Obj(self.bound_method_new(r, obj))
                    }
                    _ => value,
                };
                return Some(value);
            }
            class = match &self.get(c).kind {
                ObjectKind::Class(cls) => cls.superclass,
                kind => panic!("instance class is a {}", kind.type_name()),
            };
        }

        None
    }

    pub fn is_instance_of(&self, r: ObjRef, class_name: &str) -> bool {
        let ObjectKind::Instance(instance) = &self.get(r).kind else {
            return false;
        };
        let mut class = Some(instance.class);
        while let Some(c) = class {
            match &self.get(c).kind {
                ObjectKind::Class(cls) => {
                    if cls.name == class_name {
                        return true;
                    }
                    class = cls.superclass;
                }
                kind => panic!("instance class is a {}", kind.type_name()),
            }
        }
        false
    }

    pub fn format_object(&self, r: ObjRef) -> String {
        self.format_object_at(r, 0)
    }

    fn format_object_at(&self, r: ObjRef, depth: usize) -> String {
        // Tables and cells can contain themselves; stop descending instead
        // of recursing forever.
        const FORMAT_DEPTH_MAX: usize = 8;
        if depth >= FORMAT_DEPTH_MAX {
            return "...".to_string();
        }
        match &self.get(r).kind {
            ObjectKind::Str(s) => s.chars.to_string(),
            ObjectKind::Function(f) => {
                if f.is_native() {
                    format!("<native function {}>", f.name)
                } else {
                    format!("<function {}>", f.name)
                }
            }
            ObjectKind::Code(_) => "<code object>".to_string(),
            ObjectKind::Table(table) => {
                let table = table.borrow();
                let mut out = String::from("[");
                for (i, (key, value)) in table.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.format_value_at(key, depth + 1));
                    out.push_str(": ");
                    out.push_str(&self.format_value_at(value, depth + 1));
                }
                out.push(']');
                out
            }
            ObjectKind::Cell(c) => {
                format!("<cell wrapping {}>", self.format_value_at(c.value, depth + 1))
            }
            ObjectKind::Module(m) => format!("<module {}>", m.name),
            ObjectKind::Class(c) => format!("<class {}>", c.name),
            ObjectKind::Instance(i) => match &self.get(i.class).kind {
                ObjectKind::Class(c) => format!("<{} instance>", c.name),
                kind => panic!("instance class is a {}", kind.type_name()),
            },
            ObjectKind::BoundMethod(bm) => {
                let method = self.function(bm.method);
                format!(
                    "<bound method {} of {}>",
                    method.name,
                    self.format_object_at(bm.receiver, depth + 1)
                )
            }
            ObjectKind::Thread(state) => format!("<thread {}>", state.borrow().name),
        }
    }

    fn format_value_at(&self, value: Value, depth: usize) -> String {
        match value {
            Value::Obj(r) => self.format_object_at(r, depth),
            other => other.format(self),
        }
    }

    fn install_string_methods(&mut self, string: ObjRef) {
        let methods = match self.str_methods {
            Some(methods) => methods,
            None => {
                let methods = [
                    self.native_function_new("@add", &["other"], string_add),
                    self.native_function_new("@get_key", &["key"], string_get_key),
                    self.native_function_new("length", &[], string_length),
                ];
                self.str_methods = Some(methods);
                methods
            }
        };
        self.install_bound_methods(string, &["@add", "@get_key", "length"], methods);
    }

    fn install_table_methods(&mut self, table: ObjRef) {
        let methods = match self.table_methods {
            Some(methods) => methods,
            None => {
                let methods = [
                    self.native_function_new("@get_key", &["key"], table_get_key),
                    self.native_function_new("@set_key", &["key", "value"], table_set_key),
                    self.native_function_new("length", &[], table_length),
                ];
                self.table_methods = Some(methods);
                methods
            }
        };
        self.install_bound_methods(table, &["@get_key", "@set_key", "length"], methods);
    }

    fn install_bound_methods(&mut self, obj: ObjRef, names: &[&str; 3], methods: [ObjRef; 3]) {
        for (name, method) in names.iter().zip(methods) {
            let bound = self.bound_method_new(method, obj);
            self.set_attribute(obj, name, Value::Obj(bound));
        }
    }
}

fn expect_receiver(receiver: Option<Value>, what: &str) -> Result<ObjRef> {
    match receiver.and_then(Value::as_obj) {
        Some(r) => Ok(r),
        None => bail!("{what} requires a receiver"),
    }
}

fn string_add(vm: &mut Vm, receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let this = expect_receiver(receiver, "string @add")?;
    let Some(other) = args[0].as_obj().filter(|&r| vm.heap.try_str(r).is_some()) else {
        bail!(
            "can only concatenate a string to a string, not a {}",
            args[0].type_name(&vm.heap)
        );
    };
    let joined = format!("{}{}", vm.heap.str_value(this), vm.heap.str_value(other));
    Ok(Value::Obj(vm.heap.string_copy(&joined)))
}

fn string_get_key(vm: &mut Vm, receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let this = expect_receiver(receiver, "string @get_key")?;
    let Value::Number(index) = args[0] else {
        bail!("string index must be a number");
    };
    if index.fract() != 0.0 {
        bail!("string index must be an integer");
    }
    let chars = vm.heap.str_value(this);
    let index = index as i64;
    if index < 0 || index as usize >= chars.chars().count() {
        bail!("string index {index} out of range");
    }
    let ch = chars
        .chars()
        .nth(index as usize)
        .map(|c| c.to_string())
        .unwrap_or_default();
    Ok(Value::Obj(vm.heap.string_copy(&ch)))
}

fn string_length(vm: &mut Vm, receiver: Option<Value>, _args: &[Value]) -> Result<Value> {
    let this = expect_receiver(receiver, "string length")?;
    Ok(Value::Number(vm.heap.str_value(this).chars().count() as f64))
}

fn table_inner(vm: &Vm, r: ObjRef) -> Result<Rc<RefCell<Table>>> {
    match &vm.heap.get(r).kind {
        ObjectKind::Table(table) => Ok(table.clone()),
        kind => bail!("expected a table, found a {}", kind.type_name()),
    }
}

fn table_get_key(vm: &mut Vm, receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let this = expect_receiver(receiver, "table @get_key")?;
    let table = table_inner(vm, this)?;
    let found = table.borrow().get(&vm.heap, args[0])?;
    Ok(found.unwrap_or(Value::Nil))
}

fn table_set_key(vm: &mut Vm, receiver: Option<Value>, args: &[Value]) -> Result<Value> {
    let this = expect_receiver(receiver, "table @set_key")?;
    let table = table_inner(vm, this)?;
    table.borrow_mut().set(&vm.heap, args[0], args[1])?;
    Ok(Value::Nil)
}

fn table_length(vm: &mut Vm, receiver: Option<Value>, _args: &[Value]) -> Result<Value> {
    let this = expect_receiver(receiver, "table length")?;
    let table = table_inner(vm, this)?;
    let len = table.borrow().len();
    Ok(Value::Number(len as f64))
}
