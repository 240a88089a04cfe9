//! Value stack and the inline call-frame protocol.
//!
//! A call leaves its arguments and a return marker on the stack. The
//! callee's `MAKE_FRAME` then rewrites that region in place:
//!
//! ```text
//! before:  … a0 a1 ret
//! after:   … [Frame] a0 a1 l0 l1 l2
//!              ^ frame index     ^ top
//! ```
//!
//! Locals are addressed as `frame + 1 + index`, arguments being the first
//! `num_args` locals. There is no parent pointer: after a return the new
//! current frame is found by scanning down for the nearest frame marker.

use core::fmt;

use crate::value::{Frame, Value};

/// Return pc recorded for the outermost call of an execution.
pub const HOST_RETURN: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub enum StackError {
    Overflow,
    Underflow,
    NoFrame,
    BadReturnMarker(Value),
    LocalOutOfRange { index: u32, depth: usize },
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow => write!(f, "stack overflow"),
            Self::Underflow => write!(f, "stack underflow"),
            Self::NoFrame => write!(f, "no active call frame"),
            Self::BadReturnMarker(v) => {
                write!(f, "expected a return address, found {}", v.type_name())
            }
            Self::LocalOutOfRange { index, depth } => {
                write!(f, "local {index} is outside the live stack (depth {depth})")
            }
        }
    }
}

impl std::error::Error for StackError {}

/// Where execution continues after a return.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameExit {
    /// The outermost call returned; the value goes back to the host.
    Host(Value),
    /// Resume the caller at this pc.
    Resume(u32),
}

#[derive(Debug, Clone)]
pub struct Stack {
    values: Vec<Value>,
    depth: usize,
    frame: Option<usize>,
}

impl Stack {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: vec![Value::None; capacity],
            depth: 0,
            frame: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Index of the current frame marker, `None` at top level.
    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    /// The live part of the stack, bottom first.
    pub fn live(&self) -> &[Value] {
        &self.values[..self.depth]
    }

    pub fn reset(&mut self) {
        self.values.fill(Value::None);
        self.depth = 0;
        self.frame = None;
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), StackError> {
        let slot = self.values.get_mut(self.depth).ok_or(StackError::Overflow)?;
        *slot = value;
        self.depth += 1;
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, StackError> {
        if self.depth == 0 {
            return Err(StackError::Underflow);
        }
        self.depth -= 1;
        Ok(self.values[self.depth])
    }

    /// The value `n` slots below the top (0 is the top).
    #[inline]
    pub fn peek(&self, n: usize) -> Result<Value, StackError> {
        if n >= self.depth {
            return Err(StackError::Underflow);
        }
        Ok(self.values[self.depth - 1 - n])
    }

    /// Overwrite the value `n` slots below the top.
    pub fn set(&mut self, n: usize, value: Value) -> Result<(), StackError> {
        if n >= self.depth {
            return Err(StackError::Underflow);
        }
        self.values[self.depth - 1 - n] = value;
        Ok(())
    }

    pub fn drop_n(&mut self, n: usize) -> Result<(), StackError> {
        if n > self.depth {
            return Err(StackError::Underflow);
        }
        self.depth -= n;
        Ok(())
    }

    /// The top `n` values, bottom-most first.
    pub fn top_slice(&self, n: usize) -> Result<&[Value], StackError> {
        if n > self.depth {
            return Err(StackError::Underflow);
        }
        Ok(&self.values[self.depth - n..self.depth])
    }

    // ── Frames ────────────────────────────────────────────────────────

    /// Turn `… args ret` into `… [Frame] args locals`.
    pub fn make_frame(&mut self, num_args: u8, num_locals: u8) -> Result<(), StackError> {
        let marker = self.pop()?;
        let return_pc = match marker {
            Value::Number(pc) => pc as i32,
            other => return Err(StackError::BadReturnMarker(other)),
        };

        let nargs = num_args as usize;
        let nlocals = num_locals as usize;
        if nargs > self.depth {
            return Err(StackError::Underflow);
        }
        let base = self.depth - nargs;
        let new_depth = base + 1 + nargs + nlocals;
        if new_depth > self.capacity() {
            return Err(StackError::Overflow);
        }

        self.values.copy_within(base..base + nargs, base + 1);
        self.values[base] = Value::Frame(Frame {
            return_pc,
            num_args,
            num_locals,
        });
        self.values[base + 1 + nargs..new_depth].fill(Value::None);

        self.depth = new_depth;
        self.frame = Some(base);
        log::trace!("frame @{base} args={nargs} locals={nlocals} ret={return_pc}");
        Ok(())
    }

    pub fn current_frame(&self) -> Option<Frame> {
        self.frame.and_then(|index| self.values[index].as_frame())
    }

    fn local_slot(&self, index: u32) -> Result<usize, StackError> {
        let frame = self.frame.ok_or(StackError::NoFrame)?;
        let slot = frame + 1 + index as usize;
        if slot >= self.depth {
            return Err(StackError::LocalOutOfRange {
                index,
                depth: self.depth,
            });
        }
        Ok(slot)
    }

    pub fn load_local(&self, index: u32) -> Result<Value, StackError> {
        Ok(self.values[self.local_slot(index)?])
    }

    pub fn store_local(&mut self, index: u32, value: Value) -> Result<(), StackError> {
        let slot = self.local_slot(index)?;
        self.values[slot] = value;
        Ok(())
    }

    /// Leave the current frame.
    ///
    /// With `with_value`, a value left above the frame's reserved region is
    /// carried over to the caller. Returning from the outermost frame (or
    /// with no frame at all) empties the stack and hands the top value to
    /// the host instead.
    pub fn return_from_frame(&mut self, with_value: bool) -> Result<FrameExit, StackError> {
        let current = self
            .frame
            .and_then(|index| Some((index, self.values[index].as_frame()?)));

        let (index, frame) = match current {
            Some((index, frame)) if !frame.returns_to_host() => (index, frame),
            _ => {
                let result = match (with_value, self.depth) {
                    (true, depth) if depth > 0 => self.values[depth - 1],
                    _ => Value::None,
                };
                self.depth = 0;
                self.frame = None;
                return Ok(FrameExit::Host(result));
            }
        };

        let body_start = index + frame.reserved();
        let pending = match self.depth.checked_sub(1) {
            Some(top) if with_value && top > body_start => Some(self.values[top]),
            _ => None,
        };

        self.depth = index;
        if let Some(value) = pending {
            self.push(value)?;
        }
        self.frame = self.find_frame();
        log::trace!("return to pc {} frame {:?}", frame.return_pc, self.frame);
        Ok(FrameExit::Resume(frame.return_pc as u32))
    }

    /// Nearest frame marker at or below the top.
    pub fn find_frame(&self) -> Option<usize> {
        self.live().iter().rposition(Value::is_frame)
    }
}
