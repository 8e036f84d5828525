//! The virtual machine: object heap, globals, module system and the
//! cooperative thread scheduler.
//!
//! Execution is a fetch-decode-execute loop over [`Chunk`] bytecode. Threads
//! are green: the scheduler rotates a run queue, giving each thread a fixed
//! instruction quantum, so interleaving is deterministic for a given program
//! and quantum. Collections only ever run between instructions, which is
//! what keeps raw [`ObjRef`] handles safe to hold inside a single op
//! handler.

pub mod frame;

mod calls;
mod run;

#[cfg(test)]
mod vm_test;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error};

use crate::bytecode::Chunk;
use crate::cell_table::CellTable;
use crate::heap::{DEFAULT_GC_THRESHOLD, GcStats, Heap, ObjRef};
use crate::value::Value;

use frame::{StackFrame, ThreadState};
use run::Step;

/// Loads module bytecode by name when an `Import` misses both the module
/// cache and the registered native modules.
pub trait ModuleLoader {
    fn load(&mut self, name: &str) -> Result<Option<Rc<Chunk>>>;
}

impl<F> ModuleLoader for F
where
    F: FnMut(&str) -> Result<Option<Rc<Chunk>>>,
{
    fn load(&mut self, name: &str) -> Result<Option<Rc<Chunk>>> {
        self(name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Live-object count that triggers the first collection.
    pub gc_threshold: usize,
    /// Instructions a thread runs before the scheduler rotates.
    pub quantum: usize,
    pub eval_stack_max: usize,
    pub call_stack_max: usize,
}

impl Default for VmOptions {
    fn default() -> VmOptions {
        VmOptions {
            gc_threshold: DEFAULT_GC_THRESHOLD,
            quantum: 16,
            eval_stack_max: 256,
            call_stack_max: 64,
        }
    }
}

pub struct Vm {
    pub heap: Heap,
    options: VmOptions,
    pub(crate) globals: CellTable,
    /// Cache of already-imported modules, keyed by name.
    imported_modules: CellTable,
    /// Natively-registered modules, resolved by `Import` before the loader.
    pub(crate) builtin_modules: Vec<(Rc<str>, ObjRef)>,
    module_loader: Option<Box<dyn ModuleLoader>>,
    /// Run queue; the thread at the front runs next.
    threads: VecDeque<ObjRef>,
    current_thread: Option<ObjRef>,
    main_thread: Option<ObjRef>,
    /// Lazily-created class marking attribute descriptors.
    pub(crate) descriptor_class: Option<ObjRef>,
    started: Instant,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_options(VmOptions::default())
    }

    pub fn with_options(mut options: VmOptions) -> Vm {
        // A zero quantum would never step the thread the scheduler keeps
        // requeueing.
        options.quantum = options.quantum.max(1);
        let mut vm = Vm {
            heap: Heap::with_threshold(options.gc_threshold),
            options,
            globals: CellTable::new(),
            imported_modules: CellTable::new(),
            builtin_modules: Vec::new(),
            module_loader: None,
            threads: VecDeque::new(),
            current_thread: None,
            main_thread: None,
            descriptor_class: None,
            started: Instant::now(),
        };
        crate::builtins::install(&mut vm);
        vm
    }

    pub fn set_module_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.module_loader = Some(loader);
    }

    pub fn options(&self) -> VmOptions {
        self.options
    }

    /// Milliseconds since this VM was created.
    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        self.globals.set_value(&mut self.heap, name, value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get_value(&self.heap, name)
    }

    /// Run a compiled program to completion and return the value its entry
    /// chunk returned. The entry runs as the body of a `<main>` module, so
    /// its top-level assignments become module attributes.
    pub fn interpret(&mut self, chunk: Rc<Chunk>) -> Result<Value> {
        let code = self.heap.code_new(chunk.clone());
        let base_fn = self
            .heap
            .user_function_new(code, Vec::new(), CellTable::new());
        self.heap.name_if_anonymous(base_fn, "<main>");
        let module = self.heap.module_new(Rc::from("<main>"), Some(base_fn));
        let locals = self.heap.get(module).attributes.clone();

        let mut state = ThreadState::new(
            "main",
            self.options.eval_stack_max,
            self.options.call_stack_max,
        );
        let mut frame = StackFrame::user(base_fn, chunk, locals, 0);
        frame.entity_base = Some(module);
        state.push_frame(frame)?;

        let thread = self.heap.thread_new(state);
        self.main_thread = Some(thread);
        self.threads.push_back(thread);
        self.heap.set_gc_enabled(true);

        self.run()?;

        let state = self.heap.thread_state(thread);
        let result = state.borrow().result.unwrap_or(Value::Nil);
        Ok(result)
    }

    /// The scheduler: rotate the run queue, each thread getting one quantum
    /// per turn, until every thread has finished.
    fn run(&mut self) -> Result<()> {
        while let Some(thread) = self.threads.pop_front() {
            let state = self.heap.thread_state(thread);
            if state.borrow().finished {
                continue;
            }
            self.current_thread = Some(thread);
            if let Err(err) = self.run_slice(&state) {
                self.log_stack_trace(&state.borrow(), &err);
                self.current_thread = None;
                return Err(err);
            }
            if !state.borrow().finished {
                self.threads.push_back(thread);
            }
        }
        self.current_thread = None;
        Ok(())
    }

    fn run_slice(&mut self, state: &Rc<RefCell<ThreadState>>) -> Result<()> {
        for _ in 0..self.options.quantum {
            match self.step(state)? {
                Step::Continue => {}
                Step::ThreadFinished(_) => return Ok(()),
                Step::ReturnedToNative(_) => {
                    panic!("return crossed a native boundary outside a nested call")
                }
            }
            if self.heap.should_collect() {
                self.collect_garbage();
            }
        }
        Ok(())
    }

    /// Drive the current thread until control returns to the native frame
    /// sitting on top of its call stack. Used for every call the engine
    /// itself makes into user code: protocol methods, initializers, class
    /// and module bodies. The thread keeps running past its quantum; other
    /// threads do not run while a nested call is in flight.
    pub(crate) fn run_nested(&mut self, state: &Rc<RefCell<ThreadState>>) -> Result<Value> {
        loop {
            match self.step(state)? {
                Step::Continue => {}
                Step::ReturnedToNative(value) => return Ok(value),
                Step::ThreadFinished(_) => panic!("thread finished inside a nested call"),
            }
            if self.heap.should_collect() {
                self.collect_garbage();
            }
        }
    }

    /// Gather every root and run a collection.
    pub fn collect_garbage(&mut self) -> GcStats {
        let mut roots: Vec<ObjRef> = Vec::new();
        roots.extend(self.threads.iter().copied());
        roots.extend(self.current_thread);
        roots.extend(self.main_thread);
        roots.extend(self.descriptor_class);
        roots.extend(self.builtin_modules.iter().map(|(_, r)| *r));
        push_table_roots(&self.globals, &mut roots);
        push_table_roots(&self.imported_modules, &mut roots);
        self.heap.collect(roots)
    }

    pub(crate) fn current_thread_state(&self) -> Rc<RefCell<ThreadState>> {
        match self.current_thread {
            Some(thread) => self.heap.thread_state(thread),
            None => panic!("no thread is running"),
        }
    }

    /// Queue a new thread running `function` with `args`. Returns the
    /// thread object; it starts running on the next scheduler turn.
    pub fn spawn_thread(&mut self, function: Value, args: &[Value]) -> Result<Value> {
        let state = ThreadState::new(
            self.thread_name_for(function),
            self.options.eval_stack_max,
            self.options.call_stack_max,
        );
        let thread = self.heap.thread_new(state);
        let state = self.heap.thread_state(thread);
        self.push_call_frames(&state, function, args)?;
        self.threads.push_back(thread);
        debug!(
            name = %state.borrow().name,
            queued = self.threads.len(),
            "spawned thread"
        );
        Ok(Value::Obj(thread))
    }

    fn thread_name_for(&self, function: Value) -> String {
        use crate::objects::ObjectKind;
        match function.as_obj().map(|r| &self.heap.get(r).kind) {
            Some(ObjectKind::Function(f)) => f.name.clone(),
            Some(ObjectKind::BoundMethod(bm)) => self.heap.function(bm.method).name.clone(),
            _ => "<thread>".to_string(),
        }
    }

    fn log_stack_trace(&self, state: &ThreadState, err: &anyhow::Error) {
        error!("runtime error in thread '{}': {err:#}", state.name);
        for frame in state.frames.iter().rev() {
            error!("  in {}", self.heap.function(frame.function).name);
        }
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

fn push_table_roots(table: &CellTable, roots: &mut Vec<ObjRef>) {
    for (key, cell) in table.iter() {
        if let Value::Obj(r) = key {
            roots.push(r);
        }
        if let Value::Obj(r) = cell {
            roots.push(r);
        }
    }
}
