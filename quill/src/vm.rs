use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::call::Call;
use crate::ffi::Env;
use crate::heap::{Heap, HeapError, HeapSettings};
use crate::interpreter::{self, ExecError};
use crate::memory::Memory;
use crate::program::Program;
use crate::stack::{HOST_RETURN, Stack};
use crate::value::{Array, Value};

#[derive(Debug, Clone)]
pub struct VMCreateInfo {
    /// Total value slots; the first half is the stack, the rest the heap.
    pub memory_size: usize,
    /// Instructions one execution may run before it is aborted.
    pub cycle_limit: u32,
    /// Run the per-instruction checks. Needs the `validation` feature.
    pub validate: bool,
}

impl Default for VMCreateInfo {
    fn default() -> Self {
        Self {
            memory_size: 4096,
            cycle_limit: 1_000_000,
            validate: false,
        }
    }
}

impl VMCreateInfo {
    pub fn check(&self) -> Result<(), &'static str> {
        if self.memory_size < 2 {
            return Err("memory_size must hold at least one stack and one heap slot");
        }
        if self.cycle_limit == 0 {
            return Err("cycle_limit must be > 0");
        }
        Ok(())
    }

    fn heap_settings(&self) -> HeapSettings {
        let stack_size = self.memory_size / 2;
        HeapSettings {
            heap_size: self.memory_size - stack_size,
            base: stack_size as u32,
        }
    }
}

/// Cloneable in-memory sink for `PRINT`, handy for hosts that want to
/// capture script output.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.bytes.lock().clear();
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One isolated interpreter instance: a stack, a heap and an output sink.
///
/// Programs and environments are passed per execution, so one VM can run
/// any number of programs (and a reloaded program replaces the old one
/// without touching the VM).
pub struct VM {
    pub(crate) stack: Stack,
    pub(crate) heap: Heap,
    pub(crate) cycle_limit: u32,
    pub(crate) validate: bool,
    pub(crate) output: Box<dyn Write + Send>,
}

impl VM {
    pub fn new(info: VMCreateInfo) -> Result<Self, HeapError> {
        info.check().map_err(HeapError::Settings)?;
        let settings = info.heap_settings();
        let stack = Stack::new(settings.base as usize);
        let heap = Heap::new(settings)?;

        if info.validate && cfg!(not(feature = "validation")) {
            log::warn!("validation requested but the `validation` feature is not compiled in");
        }
        log::debug!(
            "vm created: stack={} heap={} cycle_limit={}",
            stack.capacity(),
            heap.capacity(),
            info.cycle_limit
        );

        Ok(Self {
            stack,
            heap,
            cycle_limit: info.cycle_limit,
            validate: info.validate,
            output: Box::new(io::stdout()),
        })
    }

    pub fn set_output(&mut self, output: impl Write + Send + 'static) {
        self.output = Box::new(output);
    }

    /// Run from the program's entry point (address 0).
    pub fn execute(&mut self, program: &Program, env: &Env) -> Result<Value, ExecError> {
        self.stack.reset();
        interpreter::run(self, program, env, 0)
    }

    /// Run one exported function with the call's arguments.
    pub fn execute_call(
        &mut self,
        program: &Program,
        env: &Env,
        call: &Call,
    ) -> Result<Value, ExecError> {
        call.validate()?;
        self.stack.reset();
        for arg in call.args() {
            self.stack.push(*arg)?;
        }
        self.stack.push(Value::Number(HOST_RETURN as f32))?;
        log::debug!("calling {} @{}", call.name(), call.address());
        interpreter::run(self, program, env, call.address())
    }

    pub fn call(
        &mut self,
        program: &Program,
        env: &Env,
        name: &str,
        args: &[Value],
    ) -> Result<Value, ExecError> {
        let call = Call::lookup(program, name)?.with_args(args);
        self.execute_call(program, env, &call)
    }

    /// Collect with the live stack as the only roots.
    pub fn collect(&mut self) {
        self.heap.collect(self.stack.live());
    }

    pub fn allocate(&mut self, count: usize) -> Result<Array, HeapError> {
        self.heap.allocate(count, self.stack.live())
    }

    pub fn memory<'a>(&'a self, program: &'a Program) -> Memory<'a> {
        Memory::new(&program.constants, &self.heap)
    }

    /// Render a value the way `PRINT` does.
    pub fn render(&self, program: &Program, value: Value) -> String {
        self.memory(program).render(value)
    }

    pub fn string(&self, program: &Program, value: Value) -> Option<String> {
        self.memory(program).string(value)
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn cycle_limit(&self) -> u32 {
        self.cycle_limit
    }

    pub fn validates(&self) -> bool {
        self.validate && cfg!(feature = "validation")
    }
}
