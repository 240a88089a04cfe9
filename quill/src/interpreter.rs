use core::fmt;
use std::io::Write;

use crate::address::Address;
use crate::bytecode::{BytecodeDecoder, DecodeError, Instruction, Op};
use crate::call::CallError;
use crate::ffi::{Env, NativeContext, NativeKind};
use crate::heap::HeapError;
use crate::memory::Memory;
use crate::program::Program;
use crate::stack::{FrameExit, HOST_RETURN, Stack, StackError};
use crate::validate::Violation;
use crate::value::{Array, Iter, Value};
use crate::vm::VM;

/// Numbers closer than this compare equal.
pub const EQUALITY_EPSILON: f32 = 0.0001;

#[derive(Debug, Clone, PartialEq)]
pub enum ExecError {
    Halted,
    UnknownOpcode { pc: u32, byte: u8 },
    Truncated { pc: u32, op: Op },
    PcOutOfBounds(u32),
    CycleLimit(u32),
    AllocationFailed(HeapError),
    Validation(Violation),
    EnvNotReady,
    StackOverflow,
    StackUnderflow,
    Frame(StackError),
    TypeMismatch {
        op: Op,
        expected: &'static str,
        found: &'static str,
    },
    BadOperand { op: Op, reason: &'static str },
    BadAddress(Address),
    BadConstant(u32),
    BadImport(u32),
    DivisionByZero,
    Native { name: String, message: String },
    Call(CallError),
}

impl ExecError {
    /// Legacy numeric code for hosts that expect one.
    pub fn sentinel(&self) -> i32 {
        match self {
            Self::Halted => -1002,
            Self::UnknownOpcode { .. } | Self::Truncated { .. } | Self::PcOutOfBounds(_) => -1003,
            Self::CycleLimit(_) => -1004,
            Self::AllocationFailed(_) => -1005,
            Self::EnvNotReady => -1099,
            _ => -9999,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halted => write!(f, "execution halted"),
            Self::UnknownOpcode { pc, byte } => write!(f, "unknown opcode {byte:#04x} at #{pc}"),
            Self::Truncated { pc, op } => write!(f, "{op} at #{pc} is missing operands"),
            Self::PcOutOfBounds(pc) => write!(f, "pc #{pc} is past the end of the code"),
            Self::CycleLimit(limit) => write!(f, "cycle limit of {limit} reached"),
            Self::AllocationFailed(err) => write!(f, "allocation failed: {err}"),
            Self::Validation(v) => write!(f, "{v}"),
            Self::EnvNotReady => write!(f, "environment is not bound to this program"),
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::StackUnderflow => write!(f, "stack underflow"),
            Self::Frame(err) => write!(f, "{err}"),
            Self::TypeMismatch {
                op,
                expected,
                found,
            } => write!(f, "{op} expected {expected}, found {found}"),
            Self::BadOperand { op, reason } => write!(f, "{op}: {reason}"),
            Self::BadAddress(address) => write!(f, "cannot read address {address}"),
            Self::BadConstant(index) => write!(f, "constant #{index} does not exist"),
            Self::BadImport(index) => write!(f, "import {index} is not bound"),
            Self::DivisionByZero => write!(f, "modulo by zero"),
            Self::Native { name, message } => write!(f, "native '{name}' failed: {message}"),
            Self::Call(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<StackError> for ExecError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::Overflow => Self::StackOverflow,
            StackError::Underflow => Self::StackUnderflow,
            other => Self::Frame(other),
        }
    }
}

impl From<CallError> for ExecError {
    fn from(err: CallError) -> Self {
        Self::Call(err)
    }
}

impl From<Violation> for ExecError {
    fn from(err: Violation) -> Self {
        Self::Validation(err)
    }
}

impl From<DecodeError> for ExecError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownOpcode { offset, byte } => Self::UnknownOpcode {
                pc: offset as u32,
                byte,
            },
            DecodeError::Truncated { offset, op } => Self::Truncated {
                pc: offset as u32,
                op,
            },
        }
    }
}

enum Flow {
    Next,
    Jump(u32),
    Done(Value),
}

/// Run `program` from `pc` until it returns to the host, exits or fails.
///
/// The stack must already hold whatever the code at `pc` expects: nothing
/// for the entry point, the arguments plus a host return marker for a call
/// into an exported function.
pub fn run(vm: &mut VM, program: &Program, env: &Env, start: u32) -> Result<Value, ExecError> {
    if !env.is_ready(program) {
        return Err(ExecError::EnvNotReady);
    }

    let mut pc = start;
    let mut cycles: u32 = 0;

    loop {
        if cycles >= vm.cycle_limit {
            log::warn!("cycle limit {} hit at #{pc}", vm.cycle_limit);
            return Err(ExecError::CycleLimit(vm.cycle_limit));
        }
        cycles += 1;

        if pc as usize >= program.code.len() {
            return Err(ExecError::PcOutOfBounds(pc));
        }
        let ins = BytecodeDecoder::decode_at(&program.code, pc as usize)?;
        log::trace!("#{:<5} {:<24} depth={}", pc, ins.to_string(), vm.stack.depth());

        #[cfg(feature = "validation")]
        if vm.validate {
            crate::validate::before(&vm.stack, program, env, &ins)?;
        }

        match step(vm, program, env, &ins)? {
            Flow::Next => pc = ins.next_offset(),
            Flow::Jump(target) => pc = target,
            Flow::Done(value) => {
                log::debug!("finished after {cycles} cycles");
                return Ok(value);
            }
        }

        #[cfg(feature = "validation")]
        if vm.validate {
            crate::validate::after(&vm.stack, &ins)?;
        }
    }
}

fn mismatch(op: Op, expected: &'static str, found: Value) -> ExecError {
    ExecError::TypeMismatch {
        op,
        expected,
        found: found.type_name(),
    }
}

fn pop_number(stack: &mut Stack, op: Op) -> Result<f32, ExecError> {
    let value = stack.pop()?;
    value.as_number().ok_or_else(|| mismatch(op, "number", value))
}

fn pop_bool(stack: &mut Stack, op: Op) -> Result<bool, ExecError> {
    let value = stack.pop()?;
    value.as_bool().ok_or_else(|| mismatch(op, "bool", value))
}

fn pop_array(stack: &mut Stack, op: Op) -> Result<Array, ExecError> {
    let value = stack.pop()?;
    value.as_array().ok_or_else(|| mismatch(op, "array", value))
}

fn values_equal(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < EQUALITY_EPSILON,
        (a, b) => a == b,
    }
}

fn arithmetic(stack: &mut Stack, op: Op) -> Result<(), ExecError> {
    let a = pop_number(stack, op)?;
    let b = pop_number(stack, op)?;
    let result = match op {
        Op::Mul => Value::Number(a * b),
        Op::Div => Value::Number(a / b),
        Op::Add => Value::Number(a + b),
        Op::Sub => Value::Number(a - b),
        Op::Mod => {
            let divisor = b as i32;
            if divisor == 0 {
                return Err(ExecError::DivisionByZero);
            }
            Value::Number((a as i32).wrapping_rem(divisor) as f32)
        }
        Op::CmpLessThan => Value::Bool(a < b),
        Op::CmpMoreThan => Value::Bool(a > b),
        Op::CmpLessThanOrEqual => Value::Bool(a <= b),
        _ => Value::Bool(a >= b),
    };
    stack.push(result)?;
    Ok(())
}

fn step(vm: &mut VM, program: &Program, env: &Env, ins: &Instruction) -> Result<Flow, ExecError> {
    let op = ins.op;
    let operand = ins.operands[0];
    let stack = &mut vm.stack;

    match op {
        Op::Halt => return Err(ExecError::Halted),

        Op::And | Op::Or => {
            let a = pop_bool(stack, op)?;
            let b = pop_bool(stack, op)?;
            let result = if op == Op::And { a && b } else { a || b };
            stack.push(Value::Bool(result))?;
        }
        Op::Not => {
            let a = pop_bool(stack, op)?;
            stack.push(Value::Bool(!a))?;
        }
        Op::Mul
        | Op::Div
        | Op::Mod
        | Op::Add
        | Op::Sub
        | Op::CmpLessThan
        | Op::CmpMoreThan
        | Op::CmpLessThanOrEqual
        | Op::CmpMoreThanOrEqual => arithmetic(stack, op)?,
        Op::Neg => {
            let a = pop_number(stack, op)?;
            stack.push(Value::Number(-a))?;
        }
        Op::CmpEqual | Op::CmpNotEqual => {
            let a = stack.pop()?;
            let b = stack.pop()?;
            let equal = values_equal(a, b);
            stack.push(Value::Bool(equal == (op == Op::CmpEqual)))?;
        }

        Op::Dup1 => {
            let top = stack.peek(0)?;
            stack.push(top)?;
        }
        Op::Dup2 => {
            let below = stack.peek(1)?;
            let top = stack.peek(0)?;
            stack.push(below)?;
            stack.push(top)?;
        }
        Op::Rot2 => {
            let a = stack.pop()?;
            let b = stack.pop()?;
            stack.push(a)?;
            stack.push(b)?;
        }
        Op::PushValue => {
            let value = program
                .constants
                .get(operand as usize)
                .copied()
                .ok_or(ExecError::BadConstant(operand))?;
            stack.push(value)?;
        }
        Op::Pop1 => stack.drop_n(1)?,
        Op::Pop2 => stack.drop_n(2)?,

        Op::Jump => return Ok(Flow::Jump(operand)),
        Op::JumpIfFalse => {
            if !pop_bool(stack, op)? {
                return Ok(Flow::Jump(operand));
            }
        }
        Op::Exit => return Ok(Flow::Done(Value::Number(operand as i32 as f32))),
        Op::Call => {
            stack.push(Value::Number(ins.next_offset() as f32))?;
            return Ok(Flow::Jump(operand));
        }
        Op::EntryPoint => {
            if program.code.get(operand as usize).copied() == Some(Op::MakeFrame as u8) {
                stack.push(Value::Number(HOST_RETURN as f32))?;
            }
            return Ok(Flow::Jump(operand));
        }
        Op::MakeFrame => {
            let byte = |value: u32| {
                u8::try_from(value).map_err(|_| ExecError::BadOperand {
                    op,
                    reason: "frame size does not fit a byte",
                })
            };
            stack.make_frame(byte(ins.operands[0])?, byte(ins.operands[1])?)?;
        }
        Op::ReturnNothing | Op::ReturnValue => {
            return match stack.return_from_frame(op == Op::ReturnValue)? {
                FrameExit::Host(value) => Ok(Flow::Done(value)),
                FrameExit::Resume(pc) => Ok(Flow::Jump(pc)),
            };
        }
        Op::StoreLocal => {
            let value = stack.pop()?;
            stack.store_local(operand, value)?;
        }
        Op::LoadLocal => {
            let value = stack.load_local(operand)?;
            stack.push(value)?;
        }

        Op::Print => {
            let value = stack.pop()?;
            let text = Memory::new(&program.constants, &vm.heap).render(value);
            if let Err(err) = writeln!(vm.output, "{text}") {
                log::warn!("print failed: {err}");
            }
        }
        Op::MakeArray => make_array(vm)?,
        Op::ArrayLength => {
            let array = pop_array(stack, op)?;
            stack.push(Value::Number(array.length as f32))?;
        }
        Op::MakeIter => {
            let array = pop_array(stack, op)?;
            stack.push(Value::Iter(Iter::from(array)))?;
        }
        Op::IterNext => return iter_next(vm, program, operand),
        Op::CallNative => call_native(vm, program, env, operand)?,
    }
    Ok(Flow::Next)
}

/// `… e0 e1 … en-1 n` → `… Array`
fn make_array(vm: &mut VM) -> Result<(), ExecError> {
    let op = Op::MakeArray;
    let count = pop_number(&mut vm.stack, op)?;
    if count < 0.0 || count.fract() != 0.0 {
        return Err(ExecError::BadOperand {
            op,
            reason: "element count must be a non-negative integer",
        });
    }
    let count = count as usize;
    vm.stack.top_slice(count)?;

    let array = vm
        .heap
        .allocate(count, vm.stack.live())
        .map_err(|err| {
            log::error!("MAKE_ARRAY of {count} failed: {err}");
            ExecError::AllocationFailed(err)
        })?;
    vm.heap
        .copy_into(vm.stack.top_slice(count)?, array)
        .map_err(ExecError::AllocationFailed)?;
    vm.stack.drop_n(count)?;
    vm.stack.push(Value::Array(array))?;
    Ok(())
}

/// `… Iter` → `… Iter' element`, or pop and jump to `exit` when done.
fn iter_next(vm: &mut VM, program: &Program, exit: u32) -> Result<Flow, ExecError> {
    let top = vm.stack.peek(0)?;
    let iter = top
        .as_iter()
        .ok_or_else(|| mismatch(Op::IterNext, "iterator", top))?;

    if iter.remaining == 0 {
        vm.stack.drop_n(1)?;
        return Ok(Flow::Jump(exit));
    }

    let element = Memory::new(&program.constants, &vm.heap)
        .read(iter.current)
        .ok_or(ExecError::BadAddress(iter.current))?;
    let advanced = Iter {
        current: iter.current.offset_by(1).unwrap_or(Address::Null),
        remaining: iter.remaining - 1,
    };
    vm.stack.set(0, Value::Iter(advanced))?;
    vm.stack.push(element)?;
    Ok(Flow::Next)
}

/// Hands the top `arity` values to the native and pops them.
fn call_native(vm: &mut VM, program: &Program, env: &Env, index: u32) -> Result<(), ExecError> {
    let native = env.get(index).ok_or(ExecError::BadImport(index))?;
    let arity = native.arity as usize;

    let result = {
        let ctx = NativeContext {
            arguments: vm.stack.top_slice(arity)?,
            memory: Memory::new(&program.constants, &vm.heap),
        };
        native.call(&ctx).map_err(|err| ExecError::Native {
            name: native.name.clone(),
            message: err.message,
        })?
    };

    vm.stack.drop_n(arity)?;
    if native.kind == NativeKind::Function {
        vm.stack.push(result)?;
    }
    Ok(())
}
