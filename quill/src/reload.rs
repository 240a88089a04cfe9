//! Swapping a running script for a new version.
//!
//! A [`ScriptHost`] owns the native registry and the currently loaded
//! program together with its bound environment. [`ScriptHost::reload`]
//! builds the replacement without holding any lock and only swaps it in
//! once compilation and binding both succeeded; callers that grabbed the
//! old pair through [`ScriptHost::current`] keep a valid copy.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ast::Node;
use crate::compiler::{Compiler, Diagnostics};
use crate::ffi::{BindError, Env, Natives};
use crate::interpreter::ExecError;
use crate::program::Program;
use crate::value::Value;
use crate::vm::VM;

/// A program and the environment bound to it.
#[derive(Debug, Default)]
pub struct Loaded {
    pub program: Program,
    pub env: Env,
    /// Bumped on every successful reload.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReloadError {
    Compile(Diagnostics),
    Bind(BindError),
}

impl fmt::Display for ReloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(diag) => write!(f, "compilation failed:\n{diag}"),
            Self::Bind(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ReloadError {}

impl From<Diagnostics> for ReloadError {
    fn from(diag: Diagnostics) -> Self {
        Self::Compile(diag)
    }
}

impl From<BindError> for ReloadError {
    fn from(err: BindError) -> Self {
        Self::Bind(err)
    }
}

pub struct ScriptHost {
    natives: Natives,
    loaded: RwLock<Arc<Loaded>>,
}

impl ScriptHost {
    /// A host with nothing loaded yet.
    pub fn new(natives: Natives) -> Self {
        Self {
            natives,
            loaded: RwLock::new(Arc::new(Loaded::default())),
        }
    }

    pub fn natives(&self) -> &Natives {
        &self.natives
    }

    /// Compile, bind and swap in `root`. On error the previous program
    /// stays loaded.
    pub fn reload(&self, root: &Node) -> Result<u64, ReloadError> {
        let mut compiler = Compiler::new();
        for native in self.natives.iter() {
            if let Err(err) = compiler.offer_native(&native.name, native.arity, native.kind) {
                log::warn!("skipping native {}: {err}", native.name);
            }
        }
        let program = compiler.compile(root).inspect_err(|diag| {
            log::error!("reload rejected:\n{diag}");
        })?;
        let env = Env::bind(&program, &self.natives)?;

        let mut loaded = self.loaded.write();
        let generation = loaded.generation + 1;
        *loaded = Arc::new(Loaded {
            program,
            env,
            generation,
        });
        log::info!("script reloaded, generation {generation}");
        Ok(generation)
    }

    pub fn current(&self) -> Arc<Loaded> {
        Arc::clone(&self.loaded.read())
    }

    /// Run the loaded program's entry point on `vm`.
    pub fn execute(&self, vm: &mut VM) -> Result<Value, ExecError> {
        let loaded = self.current();
        vm.execute(&loaded.program, &loaded.env)
    }

    pub fn call(&self, vm: &mut VM, name: &str, args: &[Value]) -> Result<Value, ExecError> {
        let loaded = self.current();
        vm.call(&loaded.program, &loaded.env, name, args)
    }
}
