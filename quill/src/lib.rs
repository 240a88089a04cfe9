mod address;
pub mod ast;
mod bytecode;
mod call;
mod compiler;
mod constants;
mod ffi;
mod heap;
mod interpreter;
mod linker;
mod memory;
mod program;
mod reload;
mod stack;
mod validate;
mod value;
mod vm;

pub use address::{ADDRESS_OFFSET_BITS, Address, MAX_ADDRESS_OFFSET, Space};
pub use bytecode::{BytecodeDecoder, DecodeError, Instruction, OPERAND_SIZE, Op, OperandKind};
pub use call::{Call, CallError};
pub use compiler::{
    CompileError, CompileErrorKind, Compiler, Diagnostics, ENTRY_FUNCTION, compile,
};
pub use constants::{ConstantPool, PoolFull};
pub use ffi::{
    BindError, BindProblem, Env, NativeContext, NativeError, NativeFn, NativeFunction,
    NativeKind, Natives,
};
pub use heap::{BITS_PER_PAGE, Heap, HeapError, HeapSettings, RootProvider, chunk_mask};
pub use interpreter::{EQUALITY_EPSILON, ExecError};
pub use linker::{CodeBuilder, Fixup, InstrIndex, IrInstruction, LinkError, Linked};
pub use memory::Memory;
pub use program::{Export, Import, MAX_NAME_LENGTH, Program, ProgramError};
pub use reload::{Loaded, ReloadError, ScriptHost};
pub use stack::{FrameExit, HOST_RETURN, Stack, StackError};
pub use validate::{Violation, ViolationKind};
pub use value::{Array, Frame, Iter, MAX_ARRAY_LENGTH, Value, ValueType};
pub use vm::{OutputBuffer, VM, VMCreateInfo};
