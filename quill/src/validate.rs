//! Optional per-instruction checks.
//!
//! The interpreter trusts compiler output. When a VM is created with
//! `validate: true` (and the `validation` feature is compiled in) every
//! instruction is checked against the current stack before it runs and the
//! frame bookkeeping is checked after. The first violation stops execution.
#![cfg_attr(not(feature = "validation"), allow(dead_code))]

use core::fmt;

use crate::bytecode::{Instruction, Op, OperandKind};
use crate::ffi::Env;
use crate::program::Program;
use crate::stack::Stack;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ViolationKind {
    StackDepth { needed: usize, depth: usize },
    OperandType { expected: &'static str, found: &'static str },
    AddressOutOfRange(u32),
    CallTargetNotFrame(u32),
    ConstantOutOfRange(u32),
    ImportOutOfRange(u32),
    LocalOutOfRange { index: u32, count: usize },
    NoFrame,
    OperandTooLarge(u32),
    FrameCorrupted(usize),
    StackOutOfBounds(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub pc: u32,
    pub op: Op,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed at #{} {}: ", self.pc, self.op)?;
        match &self.kind {
            ViolationKind::StackDepth { needed, depth } => {
                write!(f, "needs {needed} stack values, {depth} live")
            }
            ViolationKind::OperandType { expected, found } => {
                write!(f, "expected {expected}, found {found}")
            }
            ViolationKind::AddressOutOfRange(a) => write!(f, "target @{a} is outside the code"),
            ViolationKind::CallTargetNotFrame(a) => write!(f, "call target @{a} is not MAKE_FRAME"),
            ViolationKind::ConstantOutOfRange(i) => write!(f, "constant #{i} does not exist"),
            ViolationKind::ImportOutOfRange(i) => write!(f, "import {i} is not bound"),
            ViolationKind::LocalOutOfRange { index, count } => {
                write!(f, "local {index} outside the frame's {count} slots")
            }
            ViolationKind::NoFrame => write!(f, "no active frame"),
            ViolationKind::OperandTooLarge(v) => write!(f, "operand {v} does not fit a byte"),
            ViolationKind::FrameCorrupted(i) => write!(f, "slot {i} should hold a frame"),
            ViolationKind::StackOutOfBounds(d) => write!(f, "stack depth {d} exceeds capacity"),
        }
    }
}

impl std::error::Error for Violation {}

struct Check<'a> {
    ins: &'a Instruction,
    stack: &'a Stack,
}

impl Check<'_> {
    fn fail(&self, kind: ViolationKind) -> Violation {
        Violation {
            pc: self.ins.offset,
            op: self.ins.op,
            kind,
        }
    }

    fn depth(&self, needed: usize) -> Result<(), Violation> {
        let depth = self.stack.depth();
        if depth < needed {
            return Err(self.fail(ViolationKind::StackDepth { needed, depth }));
        }
        Ok(())
    }

    /// `n` slots below the top satisfies `pred`.
    fn typed(&self, n: usize, expected: &'static str, pred: fn(&Value) -> bool) -> Result<(), Violation> {
        self.depth(n + 1)?;
        let value = self.stack.live()[self.stack.depth() - 1 - n];
        if !pred(&value) {
            return Err(self.fail(ViolationKind::OperandType {
                expected,
                found: value.type_name(),
            }));
        }
        Ok(())
    }

    fn numbers(&self, count: usize) -> Result<(), Violation> {
        (0..count).try_for_each(|n| self.typed(n, "number", |v| matches!(v, Value::Number(_))))
    }

    fn bools(&self, count: usize) -> Result<(), Violation> {
        (0..count).try_for_each(|n| self.typed(n, "bool", |v| matches!(v, Value::Bool(_))))
    }

    fn byte(&self, value: u32) -> Result<(), Violation> {
        if value > u8::MAX as u32 {
            return Err(self.fail(ViolationKind::OperandTooLarge(value)));
        }
        Ok(())
    }
}

/// Checks run before `ins` executes.
pub fn before(
    stack: &Stack,
    program: &Program,
    env: &Env,
    ins: &Instruction,
) -> Result<(), Violation> {
    let check = Check { ins, stack };

    for (kind, value) in ins.op.operands().iter().zip(ins.operands) {
        match kind {
            OperandKind::Address if value as usize >= program.code.len() => {
                return Err(check.fail(ViolationKind::AddressOutOfRange(value)));
            }
            OperandKind::Constant if value as usize >= program.constants.len() => {
                return Err(check.fail(ViolationKind::ConstantOutOfRange(value)));
            }
            _ => {}
        }
    }

    match ins.op {
        Op::And | Op::Or => check.bools(2),
        Op::Not => check.bools(1),
        Op::Mul
        | Op::Div
        | Op::Mod
        | Op::Add
        | Op::Sub
        | Op::CmpLessThan
        | Op::CmpMoreThan
        | Op::CmpLessThanOrEqual
        | Op::CmpMoreThanOrEqual => check.numbers(2),
        Op::Neg => check.numbers(1),
        Op::CmpEqual | Op::CmpNotEqual | Op::Dup2 | Op::Rot2 | Op::Pop2 => check.depth(2),
        Op::Dup1 | Op::Pop1 | Op::StoreLocal | Op::Print => {
            check.depth(1)?;
            if ins.op == Op::StoreLocal {
                local(&check, ins.operands[0])?;
            }
            Ok(())
        }
        Op::LoadLocal => local(&check, ins.operands[0]),
        Op::JumpIfFalse => check.bools(1),
        Op::Call => {
            let target = ins.operands[0] as usize;
            if program.code.get(target).copied() != Some(Op::MakeFrame as u8) {
                return Err(check.fail(ViolationKind::CallTargetNotFrame(ins.operands[0])));
            }
            Ok(())
        }
        Op::MakeFrame => {
            check.byte(ins.operands[0])?;
            check.byte(ins.operands[1])?;
            check.typed(0, "return address", |v| matches!(v, Value::Number(_)))?;
            check.depth(ins.operands[0] as usize + 1)
        }
        Op::MakeArray => {
            check.numbers(1)?;
            let count = stack.live()[stack.depth() - 1].as_number().unwrap_or(0.0);
            if count < 0.0 || count.fract() != 0.0 {
                return Err(check.fail(ViolationKind::OperandType {
                    expected: "element count",
                    found: "number",
                }));
            }
            check.depth(count as usize + 1)
        }
        Op::ArrayLength | Op::MakeIter => {
            check.typed(0, "array", |v| matches!(v, Value::Array(_)))
        }
        Op::IterNext => check.typed(0, "iterator", |v| matches!(v, Value::Iter(_))),
        Op::CallNative => match env.get(ins.operands[0]) {
            Some(native) => check.depth(native.arity as usize),
            None => Err(check.fail(ViolationKind::ImportOutOfRange(ins.operands[0]))),
        },
        Op::Halt
        | Op::PushValue
        | Op::Jump
        | Op::Exit
        | Op::EntryPoint
        | Op::ReturnNothing
        | Op::ReturnValue => Ok(()),
    }
}

fn local(check: &Check<'_>, index: u32) -> Result<(), Violation> {
    let frame = check
        .stack
        .current_frame()
        .ok_or_else(|| check.fail(ViolationKind::NoFrame))?;
    let count = frame.reserved();
    if index as usize >= count {
        return Err(check.fail(ViolationKind::LocalOutOfRange { index, count }));
    }
    Ok(())
}

/// Checks run after `ins` executed.
pub fn after(stack: &Stack, ins: &Instruction) -> Result<(), Violation> {
    let check = Check { ins, stack };
    if stack.depth() > stack.capacity() {
        return Err(check.fail(ViolationKind::StackOutOfBounds(stack.depth())));
    }
    if let Some(index) = stack.frame() {
        if !stack.live().get(index).is_some_and(Value::is_frame) {
            return Err(check.fail(ViolationKind::FrameCorrupted(index)));
        }
    }
    Ok(())
}
