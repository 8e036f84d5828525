//! Embedding surface: native modules, native classes and descriptors are
//! registered in-process, before (or between) interpreter runs.
//!
//! A registered module is importable by name exactly like a bytecode
//! module. Native classes carry a payload factory, so every instance gets
//! typed Rust state alongside its attribute map; methods reach it through
//! `InstanceObj::payload_ref` / `payload_mut`.

use std::rc::Rc;

use crate::heap::ObjRef;
use crate::objects::{NativeFn, NativePayload};
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    /// Start registering a native module under `name`. The module resolves
    /// for `import` immediately; the returned builder fills it in.
    pub fn register_module(&mut self, name: &str) -> NativeModuleBuilder<'_> {
        let module = self.heap.module_new(Rc::from(name), None);
        self.builtin_modules.push((Rc::from(name), module));
        NativeModuleBuilder { vm: self, module }
    }

    /// The class whose instances act as attribute descriptors. Created on
    /// first use. The attribute machinery checks class identity, not name,
    /// so only instances descending from this exact class intercept.
    pub fn descriptor_class(&mut self) -> ObjRef {
        if let Some(class) = self.descriptor_class {
            return class;
        }
        let class = self.heap.class_new("Descriptor", None, None);
        self.descriptor_class = Some(class);
        class
    }

    /// A descriptor instance wrapping `get`/`set` hooks. Either may be any
    /// callable; a missing `set` makes the attribute read-only.
    pub fn descriptor_new(&mut self, getter: Option<Value>, setter: Option<Value>) -> ObjRef {
        let class = self.descriptor_class();
        let instance = self.heap.instance_new(class);
        if let Some(getter) = getter {
            self.heap.set_attribute(instance, "get", getter);
        }
        if let Some(setter) = setter {
            self.heap.set_attribute(instance, "set", setter);
        }
        instance
    }
}

pub struct NativeModuleBuilder<'vm> {
    vm: &'vm mut Vm,
    module: ObjRef,
}

impl NativeModuleBuilder<'_> {
    pub fn value(&mut self, name: &str, value: Value) -> &mut Self {
        self.vm.heap.set_attribute(self.module, name, value);
        self
    }

    pub fn function(&mut self, name: &str, params: &[&str], f: NativeFn) -> &mut Self {
        let function = self.vm.heap.native_function_new(name, params, f);
        self.vm
            .heap
            .set_attribute(self.module, name, Value::Obj(function));
        self
    }

    /// Add a native class. Instances get one payload from `payload_factory`
    /// at construction and keep it for life.
    pub fn class(
        &mut self,
        name: &str,
        payload_factory: impl Fn() -> Box<dyn NativePayload> + 'static,
    ) -> NativeClassBuilder<'_> {
        let class = self.vm.heap.class_native_new(name, Rc::new(payload_factory));
        self.vm
            .heap
            .set_attribute(self.module, name, Value::Obj(class));
        NativeClassBuilder { vm: self.vm, class }
    }

    pub fn finish(self) -> ObjRef {
        self.module
    }
}

pub struct NativeClassBuilder<'vm> {
    vm: &'vm mut Vm,
    class: ObjRef,
}

impl NativeClassBuilder<'_> {
    /// Methods are stored unbound on the class; attribute lookup wraps them
    /// into bound methods per receiver.
    pub fn method(&mut self, name: &str, params: &[&str], f: NativeFn) -> &mut Self {
        let function = self.vm.heap.native_function_new(name, params, f);
        self.vm
            .heap
            .set_attribute(self.class, name, Value::Obj(function));
        self
    }

    /// The initializer run on every construction of the class.
    pub fn init(&mut self, params: &[&str], f: NativeFn) -> &mut Self {
        self.method("@init", params, f)
    }

    pub fn value(&mut self, name: &str, value: Value) -> &mut Self {
        self.vm.heap.set_attribute(self.class, name, value);
        self
    }

    /// A computed attribute backed by native hooks. The getter is called
    /// with `(object, name)`, the setter with `(object, name, value)`.
    pub fn descriptor(
        &mut self,
        name: &str,
        getter: Option<NativeFn>,
        setter: Option<NativeFn>,
    ) -> &mut Self {
        let getter = getter.map(|f| {
            Value::Obj(
                self.vm
                    .heap
                    .native_function_new("get", &["object", "name"], f),
            )
        });
        let setter = setter.map(|f| {
            Value::Obj(
                self.vm
                    .heap
                    .native_function_new("set", &["object", "name", "value"], f),
            )
        });
        let descriptor = self.vm.descriptor_new(getter, setter);
        self.vm
            .heap
            .set_attribute(self.class, name, Value::Obj(descriptor));
        self
    }

    pub fn finish(self) -> ObjRef {
        self.class
    }
}
