//! The call protocol: frame construction, native invocation, nested calls
//! back into bytecode, class instantiation and module import.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{Result, bail};

use crate::bytecode::Chunk;
use crate::cell_table::CellTable;
use crate::heap::ObjRef;
use crate::objects::{ANONYMOUS_CLASS, FunctionBody, ObjectKind};
use crate::value::Value;

use super::Vm;
use super::frame::{StackFrame, ThreadState};

enum Callee {
    Native(ObjRef),
    User(ObjRef),
    Bound {
        method: ObjRef,
        receiver: ObjRef,
        native: bool,
    },
    Class(ObjRef),
}

impl Vm {
    fn classify(&self, callee: Value) -> Result<Callee> {
        let Some(r) = callee.as_obj() else {
            bail!("a {} is not callable", callee.type_name(&self.heap));
        };
        match &self.heap.get(r).kind {
            ObjectKind::Function(f) if f.is_native() => Ok(Callee::Native(r)),
            ObjectKind::Function(_) => Ok(Callee::User(r)),
            ObjectKind::BoundMethod(bm) => Ok(Callee::Bound {
                method: bm.method,
                receiver: bm.receiver,
                native: self.heap.function(bm.method).is_native(),
            }),
            ObjectKind::Class(_) => Ok(Callee::Class(r)),
            kind => bail!("a {} is not callable", kind.type_name()),
        }
    }

    /// `Call` dispatch. User functions get a frame and run on subsequent
    /// steps; natives and class construction complete within this step and
    /// push their result directly.
    pub(super) fn call_value(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        callee: Value,
        args: &[Value],
    ) -> Result<()> {
        match self.classify(callee)? {
            Callee::Native(f) => {
                let result = self.invoke_native(state, f, None, args)?;
                state.borrow_mut().push(result)?;
            }
            Callee::User(f) => {
                self.push_user_frame(state, f, None, args, None, None, false)?;
            }
            Callee::Bound {
                method,
                receiver,
                native,
            } => {
                let receiver = Some(Value::Obj(receiver));
                if native {
                    let result = self.invoke_native(state, method, receiver, args)?;
                    state.borrow_mut().push(result)?;
                } else {
                    self.push_user_frame(state, method, receiver, args, None, None, false)?;
                }
            }
            Callee::Class(class) => {
                let instance = self.instantiate(state, class, args)?;
                state.borrow_mut().push(Value::Obj(instance))?;
            }
        }
        Ok(())
    }

    /// Call any callable and wait for its value. This is how the engine
    /// itself re-enters user code: protocol methods, descriptors,
    /// initializers.
    pub(super) fn call_callable_sync(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        callee: Value,
        receiver: Option<Value>,
        args: &[Value],
    ) -> Result<Value> {
        match self.classify(callee)? {
            Callee::Native(f) => self.invoke_native(state, f, receiver, args),
            Callee::User(f) => self.run_user_sync(state, f, receiver, args, None, None, false),
            Callee::Bound {
                method,
                receiver: bound_recv,
                native,
            } => {
                let receiver = Some(Value::Obj(bound_recv));
                if native {
                    self.invoke_native(state, method, receiver, args)
                } else {
                    self.run_user_sync(state, method, receiver, args, None, None, false)
                }
            }
            Callee::Class(class) => {
                let instance = self.instantiate(state, class, args)?;
                Ok(Value::Obj(instance))
            }
        }
    }

    /// Synchronous call entry point for builtins, which only ever run with
    /// a current thread.
    pub(crate) fn call_sync(&mut self, callee: Value, args: &[Value]) -> Result<Value> {
        let state = self.current_thread_state();
        self.call_callable_sync(&state, callee, None, args)
    }

    /// Run a native function inside a synthetic frame. The frame roots the
    /// receiver and arguments for the collector and shows the native in
    /// stack traces; on error it is deliberately left in place so the trace
    /// includes it.
    fn invoke_native(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        function: ObjRef,
        receiver: Option<Value>,
        args: &[Value],
    ) -> Result<Value> {
        let (f, declared) = {
            let fobj = self.heap.function(function);
            let f = match fobj.body {
                FunctionBody::Native(f) => f,
                FunctionBody::User { .. } => panic!("invoke_native on a user function"),
            };
            (f, fobj.params.len())
        };
        // Natives declared with parameters get an exact arity check; an
        // empty list means variadic.
        if declared > 0 && args.len() != declared {
            bail!(
                "function '{}' expects {} arguments, got {}",
                self.heap.function(function).name,
                declared,
                args.len()
            );
        }

        let mut protected = args.to_vec();
        protected.extend(receiver);
        {
            let mut st = state.borrow_mut();
            let return_ip = st.ip;
            st.push_frame(StackFrame::native(function, return_ip, protected))?;
        }
        let result = f(self, receiver, args)?;
        let mut st = state.borrow_mut();
        let frame = st.pop_frame();
        st.ip = frame.return_ip;
        Ok(result)
    }

    /// Push a frame for a user function and make it the current one. The
    /// receiver, if any, is bound as the `self` local before parameters.
    #[allow(clippy::too_many_arguments)]
    fn push_user_frame(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        function: ObjRef,
        receiver: Option<Value>,
        args: &[Value],
        entity_base: Option<ObjRef>,
        locals_override: Option<Rc<RefCell<CellTable>>>,
        discard_return: bool,
    ) -> Result<()> {
        let (params, name) = {
            let fobj = self.heap.function(function);
            (fobj.params.clone(), fobj.name.clone())
        };
        if args.len() != params.len() {
            bail!(
                "function '{}' expects {} arguments, got {}",
                name,
                params.len(),
                args.len()
            );
        }
        let chunk = self.heap.chunk_of(function);

        let locals = locals_override.unwrap_or_else(|| Rc::new(RefCell::new(CellTable::new())));
        if let Some(receiver) = receiver {
            locals
                .borrow_mut()
                .set_value(&mut self.heap, "self", receiver);
        }
        for (param, &arg) in params.iter().zip(args) {
            locals.borrow_mut().set_value(&mut self.heap, param, arg);
        }

        let mut st = state.borrow_mut();
        let mut frame = StackFrame::user(function, chunk, locals, st.ip);
        frame.entity_base = entity_base;
        frame.discard_return = discard_return;
        st.push_frame(frame)?;
        st.ip = 0;
        Ok(())
    }

    /// Run a user function to completion from native context: a boundary
    /// frame marks where the nested loop should stop, the callee's frame
    /// goes on top of it, and the loop steps until the return crosses back.
    #[allow(clippy::too_many_arguments)]
    fn run_user_sync(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        function: ObjRef,
        receiver: Option<Value>,
        args: &[Value],
        entity_base: Option<ObjRef>,
        locals_override: Option<Rc<RefCell<CellTable>>>,
        discard_return: bool,
    ) -> Result<Value> {
        let mut protected = args.to_vec();
        protected.extend(receiver);
        {
            let mut st = state.borrow_mut();
            let return_ip = st.ip;
            st.push_frame(StackFrame::native(function, return_ip, protected))?;
        }
        self.push_user_frame(
            state,
            function,
            receiver,
            args,
            entity_base,
            locals_override,
            discard_return,
        )?;
        let value = self.run_nested(state)?;
        let mut st = state.borrow_mut();
        let frame = st.pop_frame();
        st.ip = frame.return_ip;
        drop(st);
        Ok(value)
    }

    /// Frame setup for a freshly spawned thread.
    pub(super) fn push_call_frames(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        function: Value,
        args: &[Value],
    ) -> Result<()> {
        match self.classify(function)? {
            Callee::User(f) => self.push_user_frame(state, f, None, args, None, None, false),
            Callee::Bound {
                method,
                receiver,
                native: false,
            } => self.push_user_frame(
                state,
                method,
                Some(Value::Obj(receiver)),
                args,
                None,
                None,
                false,
            ),
            _ => bail!("threads run user-defined functions"),
        }
    }

    /// Construct an instance of `class`, running `@init` if the class chain
    /// defines one. Without an initializer the class takes no arguments.
    fn instantiate(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        class: ObjRef,
        args: &[Value],
    ) -> Result<ObjRef> {
        let instance = self.heap.instance_new(class);
        match self.heap.load_attribute_bypass_descriptors(instance, "@init") {
            Some(init) => {
                self.call_callable_sync(state, init, None, args)?;
            }
            None if args.is_empty() => {}
            None => {
                let name = match &self.heap.get(class).kind {
                    ObjectKind::Class(c) => c.name.clone(),
                    _ => unreachable!(),
                };
                bail!("class '{}' takes no arguments, got {}", name, args.len());
            }
        }
        Ok(instance)
    }

    /// Build a class from its body chunk: capture free variables, run the
    /// body with the class itself as the local scope, so every body-level
    /// assignment lands in the class's attribute map.
    pub(super) fn make_class(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        body_chunk: &Rc<Chunk>,
        superclass: Value,
    ) -> Result<ObjRef> {
        let superclass = match superclass {
            Value::Nil => None,
            Value::Obj(r) if matches!(self.heap.get(r).kind, ObjectKind::Class(_)) => Some(r),
            other => bail!(
                "superclass must be a class, not a {}",
                other.type_name(&self.heap)
            ),
        };

        let free_vars = self.capture_free_vars(state, body_chunk)?;
        let code = self.heap.code_new(body_chunk.clone());
        let base_fn = self
            .heap
            .user_function_new(code, body_chunk.params.clone(), free_vars);
        let class = self.heap.class_new(ANONYMOUS_CLASS, Some(base_fn), superclass);

        let locals = self.heap.get(class).attributes.clone();
        self.run_user_sync(state, base_fn, None, &[], Some(class), Some(locals), true)?;
        Ok(class)
    }

    /// Resolve an import: the module cache first, then natively-registered
    /// modules, then the embedder's loader. Loaded modules are cached
    /// before their body runs so import cycles terminate.
    pub(super) fn import_module(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        name: &str,
    ) -> Result<Value> {
        if let Some(module) = self.imported_modules.get_value(&self.heap, name) {
            return Ok(module);
        }
        if let Some(r) = self
            .builtin_modules
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, r)| *r)
        {
            let value = Value::Obj(r);
            self.imported_modules.set_value(&mut self.heap, name, value);
            return Ok(value);
        }

        let Some(chunk) = self.load_module_chunk(name)? else {
            bail!("module '{name}' not found");
        };
        let code = self.heap.code_new(chunk.clone());
        let body = self
            .heap
            .user_function_new(code, Vec::new(), CellTable::new());
        self.heap.name_if_anonymous(body, name);
        let module = self.heap.module_new(Rc::from(name), Some(body));
        let value = Value::Obj(module);
        self.imported_modules.set_value(&mut self.heap, name, value);

        let locals = self.heap.get(module).attributes.clone();
        self.run_user_sync(state, body, None, &[], Some(module), Some(locals), true)?;
        Ok(value)
    }

    fn load_module_chunk(&mut self, name: &str) -> Result<Option<Rc<Chunk>>> {
        let Some(mut loader) = self.module_loader.take() else {
            return Ok(None);
        };
        let result = loader.load(name);
        self.module_loader = Some(loader);
        result
    }

    /// Attribute read with descriptor interception: a stored value that is
    /// an instance of the descriptor class answers through its `get`.
    pub(super) fn get_attribute(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        obj: ObjRef,
        name: &str,
    ) -> Result<Value> {
        let Some(value) = self.heap.load_attribute_bypass_descriptors(obj, name) else {
            bail!(
                "a {} has no attribute '{}'",
                self.heap.get(obj).kind.type_name(),
                name
            );
        };
        let Some(descriptor) = self.as_descriptor(value) else {
            return Ok(value);
        };
        let Some(getter) = self
            .heap
            .load_attribute_bypass_descriptors(descriptor, "get")
        else {
            bail!("descriptor for '{name}' has no 'get'");
        };
        let name_obj = Value::Obj(self.heap.string_copy(name));
        self.call_callable_sync(state, getter, None, &[Value::Obj(obj), name_obj])
    }

    /// Attribute write, routed through a descriptor's `set` when the
    /// currently stored value is one.
    pub(super) fn set_attribute_value(
        &mut self,
        state: &Rc<RefCell<ThreadState>>,
        obj: ObjRef,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let existing = self.heap.load_attribute_bypass_descriptors(obj, name);
        if let Some(descriptor) = existing.and_then(|v| self.as_descriptor(v)) {
            let Some(setter) = self
                .heap
                .load_attribute_bypass_descriptors(descriptor, "set")
            else {
                bail!("descriptor for '{name}' is read-only");
            };
            let name_obj = Value::Obj(self.heap.string_copy(name));
            self.call_callable_sync(state, setter, None, &[Value::Obj(obj), name_obj, value])?;
            return Ok(());
        }
        self.heap.set_attribute(obj, name, value);
        Ok(())
    }

    /// Is `value` an instance of the descriptor class (or a subclass)?
    /// Identity-based: only instances of the class this VM created qualify.
    fn as_descriptor(&self, value: Value) -> Option<ObjRef> {
        let descriptor_class = self.descriptor_class?;
        let r = value.as_obj()?;
        let ObjectKind::Instance(instance) = &self.heap.get(r).kind else {
            return None;
        };
        let mut class = Some(instance.class);
        while let Some(c) = class {
            if c == descriptor_class {
                return Some(r);
            }
            class = match &self.heap.get(c).kind {
                ObjectKind::Class(cls) => cls.superclass,
                _ => None,
            };
        }
        None
    }
}
