//! AST to bytecode.
//!
//! One walk over the tree emits index-space instructions into a
//! [`CodeBuilder`]; forward references (if chains, loop exits, calls to
//! functions declared later) are recorded as fixups and resolved when their
//! target is known. Linking to byte offsets happens once at the end.
//!
//! Binary operators evaluate the right operand first so the left one ends
//! up on top of the stack, which is the order the interpreter pops them in.

use core::fmt;

use crate::ast::{BinOp, FunSign, Literal, Node, NodeKind, Span, UnOp};
use crate::bytecode::Op;
use crate::constants::{ConstantPool, PoolFull};
use crate::ffi::NativeKind;
use crate::linker::{CodeBuilder, Fixup, InstrIndex, LinkError};
use crate::program::{Export, Import, MAX_NAME_LENGTH, Program};
use crate::value::Value;

/// Name of the function `ENTRY_POINT` jumps to.
pub const ENTRY_FUNCTION: &str = "main";

/// Calls lowered to a single opcode instead of a function call.
const INTRINSICS: [(&str, usize, Op); 2] = [("print", 1, Op::Print), ("len", 1, Op::ArrayLength)];

#[derive(Debug, Clone, PartialEq)]
pub enum CompileErrorKind {
    UnknownFunction(String),
    UnknownVariable(String),
    DuplicateFunction(String),
    DuplicateNative(String),
    DuplicateLocal(String),
    NestedFunction(String),
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    TooManyLocals(String),
    NameTooLong(usize),
    InvalidAssignTarget,
    BreakOutsideLoop,
    StatementOutsideFunction,
    OutOfMemory,
    Link(LinkError),
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction(name) => write!(f, "call to undeclared function '{name}'"),
            Self::UnknownVariable(name) => write!(f, "unknown variable '{name}'"),
            Self::DuplicateFunction(name) => write!(f, "function '{name}' is already declared"),
            Self::DuplicateNative(name) => {
                write!(f, "native function '{name}' is already declared")
            }
            Self::DuplicateLocal(name) => write!(f, "variable '{name}' is already declared"),
            Self::NestedFunction(name) => {
                write!(f, "'{name}' is declared inside another function")
            }
            Self::ArityMismatch {
                name,
                expected,
                found,
            } => write!(f, "'{name}' takes {expected} arguments, {found} given"),
            Self::TooManyLocals(name) => write!(f, "'{name}' has more than 255 arguments or locals"),
            Self::NameTooLong(len) => {
                write!(f, "name of {len} bytes exceeds the {MAX_NAME_LENGTH} byte limit")
            }
            Self::InvalidAssignTarget => write!(f, "left side of an assignment must be a variable"),
            Self::BreakOutsideLoop => write!(f, "break outside of a loop"),
            Self::StatementOutsideFunction => write!(f, "statement outside of a function"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Link(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub span: Option<Span>,
}

impl CompileError {
    fn new(kind: CompileErrorKind, span: Span) -> Self {
        Self {
            kind,
            span: Some(span),
        }
    }

    fn no_span(kind: CompileErrorKind) -> Self {
        Self { kind, span: None }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{}:{}: {}", span.start.line, span.start.column, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for CompileError {}

/// Every error recorded during one compilation, in discovery order.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostics {
    pub errors: Vec<CompileError>,
}

impl Diagnostics {
    pub fn has(&self, pred: impl Fn(&CompileErrorKind) -> bool) -> bool {
        self.errors.iter().any(|e| pred(&e.kind))
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostics {}

type Gen = Result<(), CompileError>;

#[derive(Debug)]
struct Function {
    name: String,
    arity: usize,
    frame: InstrIndex,
}

#[derive(Debug)]
struct Scope {
    locals: Vec<String>,
    /// Pending `break` jumps, one list per enclosing loop.
    loops: Vec<Vec<Fixup>>,
}

/// A host native the script may call. It only becomes an import once a
/// call resolves to it.
#[derive(Debug)]
struct Offered {
    name: String,
    arity: u8,
    kind: NativeKind,
}

/// What a call leaves on the stack, as far as the compiler can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallResult {
    Value,
    Nothing,
    Unknown,
}

#[derive(Debug)]
struct PendingCall {
    at: InstrIndex,
    name: String,
    argc: usize,
    span: Span,
}

pub struct Compiler {
    code: CodeBuilder,
    constants: ConstantPool,
    functions: Vec<Function>,
    imports: Vec<Import>,
    /// Parallel to `imports`; `None` when only the signature is known.
    import_kinds: Vec<Option<NativeKind>>,
    offered: Vec<Offered>,
    scope: Option<Scope>,
    pending: Vec<PendingCall>,
    errors: Vec<CompileError>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Compile a tree with no host-declared natives.
pub fn compile(root: &Node) -> Result<Program, Diagnostics> {
    Compiler::new().compile(root)
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            code: CodeBuilder::new(),
            constants: ConstantPool::new(),
            functions: Vec::new(),
            imports: Vec::new(),
            import_kinds: Vec::new(),
            offered: Vec::new(),
            scope: None,
            pending: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Declare a host function the script may call. Returns its import
    /// index.
    pub fn declare_native(&mut self, name: &str, arity: u8) -> Result<u32, CompileError> {
        self.add_import(name, arity as usize, None, None)
    }

    /// Make a host native callable without importing it. Only natives the
    /// script actually calls end up in the import table, in order of first
    /// use.
    pub fn offer_native(&mut self, name: &str, arity: u8, kind: NativeKind) -> Result<(), CompileError> {
        if self.is_declared(name) {
            return Err(CompileError::no_span(CompileErrorKind::DuplicateNative(
                name.to_owned(),
            )));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(CompileError::no_span(CompileErrorKind::NameTooLong(name.len())));
        }
        self.offered.push(Offered {
            name: name.to_owned(),
            arity,
            kind,
        });
        Ok(())
    }

    fn add_import(
        &mut self,
        name: &str,
        arity: usize,
        kind: Option<NativeKind>,
        span: Option<Span>,
    ) -> Result<u32, CompileError> {
        let error = |kind| CompileError { kind, span };
        if self.is_declared(name) {
            return Err(error(CompileErrorKind::DuplicateNative(name.to_owned())));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(error(CompileErrorKind::NameTooLong(name.len())));
        }
        let arity = u8::try_from(arity)
            .map_err(|_| error(CompileErrorKind::TooManyLocals(name.to_owned())))?;
        self.imports.push(Import {
            name: name.to_owned(),
            arity,
        });
        self.import_kinds.push(kind);
        Ok(self.imports.len() as u32 - 1)
    }

    fn is_declared(&self, name: &str) -> bool {
        INTRINSICS.iter().any(|(n, _, _)| *n == name)
            || self.imports.iter().any(|i| i.name == name)
            || self.offered.iter().any(|o| o.name == name)
            || self.functions.iter().any(|f| f.name == name)
    }

    /// Import index of the native `name`, importing an offered one on its
    /// first use.
    fn native_index(&mut self, name: &str) -> Option<usize> {
        if let Some(index) = self.imports.iter().position(|i| i.name == name) {
            return Some(index);
        }
        let at = self.offered.iter().position(|o| o.name == name)?;
        let offered = self.offered.remove(at);
        log::trace!("importing native {}", offered.name);
        self.imports.push(Import {
            name: offered.name,
            arity: offered.arity,
        });
        self.import_kinds.push(Some(offered.kind));
        Some(self.imports.len() - 1)
    }

    fn native_result(&self, index: usize) -> CallResult {
        match self.import_kinds.get(index).copied().flatten() {
            Some(NativeKind::Function) => CallResult::Value,
            Some(NativeKind::Action) => CallResult::Nothing,
            None => CallResult::Unknown,
        }
    }

    pub fn compile(mut self, root: &Node) -> Result<Program, Diagnostics> {
        let entry = match self.code.emit_forward(Op::EntryPoint) {
            Ok(fixup) => fixup,
            Err(err) => {
                return Err(Diagnostics {
                    errors: vec![CompileError::no_span(CompileErrorKind::Link(err))],
                });
            }
        };

        self.gen_top(root);
        self.resolve_calls();

        match self.functions.iter().find(|f| f.name == ENTRY_FUNCTION) {
            Some(main) => {
                let target = main.frame;
                self.code.bind_to(entry, target);
            }
            None => {
                log::warn!("no {ENTRY_FUNCTION}() declared, default entry halts");
                self.code.replace(entry.index(), Op::Halt, [0, 0]);
            }
        }

        if !self.errors.is_empty() {
            return Err(Diagnostics {
                errors: self.errors,
            });
        }

        let Self {
            code,
            constants,
            functions,
            imports,
            ..
        } = self;

        let linked = code.link().map_err(|err| Diagnostics {
            errors: vec![CompileError::no_span(CompileErrorKind::Link(err))],
        })?;

        let mut exports = Vec::with_capacity(functions.len());
        for function in &functions {
            let address = linked.address_of(function.frame).unwrap_or_default();
            exports.push(Export {
                name: function.name.clone(),
                arity: function.arity as u8,
                address,
            });
        }
        let entry = exports
            .iter()
            .find(|e| e.name == ENTRY_FUNCTION)
            .map(|e| e.address);

        log::debug!(
            "compiled {} functions, {} constants, {} imports",
            exports.len(),
            constants.len(),
            imports.len()
        );

        Ok(Program {
            code: linked.code,
            constants: constants.into_values(),
            imports,
            exports,
            entry,
        })
    }

    // ── Emission helpers ──────────────────────────────────────────────

    fn emit(&mut self, op: Op, operands: [u32; 2], span: Span) -> Result<InstrIndex, CompileError> {
        self.code
            .emit(op, operands)
            .map_err(|err| CompileError::new(CompileErrorKind::Link(err), span))
    }

    fn forward(&mut self, op: Op, span: Span) -> Result<Fixup, CompileError> {
        self.code
            .emit_forward(op)
            .map_err(|err| CompileError::new(CompileErrorKind::Link(err), span))
    }

    fn constant(&mut self, value: Value, span: Span) -> Result<u32, CompileError> {
        self.constants
            .insert(value)
            .map_err(|PoolFull| CompileError::new(CompileErrorKind::OutOfMemory, span))
    }

    fn scope_mut(&mut self, span: Span) -> Result<&mut Scope, CompileError> {
        self.scope
            .as_mut()
            .ok_or(CompileError::new(CompileErrorKind::StatementOutsideFunction, span))
    }

    /// A name declared again in the same function keeps its first slot.
    fn declare_local(&mut self, name: &str, span: Span) -> Result<u32, CompileError> {
        let scope = self.scope_mut(span)?;
        if let Some(slot) = scope.locals.iter().position(|l| l == name) {
            return Ok(slot as u32);
        }
        scope.locals.push(name.to_owned());
        Ok(scope.locals.len() as u32 - 1)
    }

    fn local(&mut self, name: &str, span: Span) -> Result<u32, CompileError> {
        let scope = self.scope_mut(span)?;
        scope
            .locals
            .iter()
            .position(|l| l == name)
            .map(|slot| slot as u32)
            .ok_or(CompileError::new(
                CompileErrorKind::UnknownVariable(name.to_owned()),
                span,
            ))
    }

    // ── Declarations ──────────────────────────────────────────────────

    fn gen_top(&mut self, node: &Node) {
        let result = match &node.kind {
            NodeKind::Block(items) => {
                for item in items {
                    self.gen_top(item);
                }
                Ok(())
            }
            NodeKind::FunDecl { sign, body } => self.gen_function(sign, body, node.span),
            NodeKind::FunSign(sign) => self
                .add_import(&sign.name, sign.params.len(), None, Some(node.span))
                .map(|_| ()),
            _ => Err(CompileError::new(
                CompileErrorKind::StatementOutsideFunction,
                node.span,
            )),
        };
        if let Err(err) = result {
            self.errors.push(err);
        }
    }

    fn gen_function(&mut self, sign: &FunSign, body: &Node, span: Span) -> Gen {
        if self.scope.is_some() {
            return Err(CompileError::new(
                CompileErrorKind::NestedFunction(sign.name.clone()),
                span,
            ));
        }
        if self.is_declared(&sign.name) {
            return Err(CompileError::new(
                CompileErrorKind::DuplicateFunction(sign.name.clone()),
                span,
            ));
        }
        if sign.name.len() > MAX_NAME_LENGTH {
            return Err(CompileError::new(
                CompileErrorKind::NameTooLong(sign.name.len()),
                span,
            ));
        }

        let frame = self.emit(Op::MakeFrame, [0, 0], span)?;
        let arity = sign.params.len();
        self.functions.push(Function {
            name: sign.name.clone(),
            arity,
            frame,
        });

        self.scope = Some(Scope {
            locals: Vec::new(),
            loops: Vec::new(),
        });
        let result = self.gen_function_body(sign, body, span);
        let scope = self.scope.take();
        result?;

        let locals = scope.map_or(arity, |s| s.locals.len());
        let too_many = || CompileError::new(CompileErrorKind::TooManyLocals(sign.name.clone()), span);
        let nargs = u8::try_from(arity).map_err(|_| too_many())?;
        let nlocals = u8::try_from(locals - arity).map_err(|_| too_many())?;
        self.code.patch(frame, 0, nargs as u32);
        self.code.patch(frame, 1, nlocals as u32);
        log::debug!("function {} args={nargs} locals={nlocals}", sign.name);
        Ok(())
    }

    fn gen_function_body(&mut self, sign: &FunSign, body: &Node, span: Span) -> Gen {
        for (i, param) in sign.params.iter().enumerate() {
            if sign.params[..i].contains(param) {
                return Err(CompileError::new(
                    CompileErrorKind::DuplicateLocal(param.clone()),
                    span,
                ));
            }
            self.declare_local(param, span)?;
        }
        self.gen_node(body)?;
        self.emit(Op::ReturnNothing, [0, 0], span)?;
        Ok(())
    }

    // ── Statements and expressions ────────────────────────────────────

    fn gen_node(&mut self, node: &Node) -> Gen {
        let span = node.span;
        match &node.kind {
            NodeKind::Value(literal) => {
                let index = match literal {
                    Literal::Number(n) => self.constant(Value::Number(*n), span)?,
                    Literal::Bool(b) => self.constant(Value::Bool(*b), span)?,
                    Literal::String(text) => self
                        .constants
                        .insert_string(text)
                        .map_err(|PoolFull| CompileError::new(CompileErrorKind::OutOfMemory, span))?,
                };
                self.emit(Op::PushValue, [index, 0], span)?;
            }
            NodeKind::VarRef(name) => {
                let slot = self.local(name, span)?;
                self.emit(Op::LoadLocal, [slot, 0], span)?;
            }
            NodeKind::VarDecl(name) => {
                self.declare_local(name, span)?;
            }
            NodeKind::Array(items) => {
                for item in items {
                    self.gen_node(item)?;
                }
                let count = self.constant(Value::Number(items.len() as f32), span)?;
                self.emit(Op::PushValue, [count, 0], span)?;
                self.emit(Op::MakeArray, [0, 0], span)?;
            }
            NodeKind::Block(items) => {
                for item in items {
                    if let Err(err) = self.gen_statement(item) {
                        self.errors.push(err);
                    }
                }
            }
            NodeKind::If { .. } => self.gen_if(node)?,
            NodeKind::ForEach {
                var,
                collection,
                body,
            } => self.gen_foreach(var, collection, body, span)?,
            NodeKind::Binop { op, left, right } => {
                self.gen_node(right)?;
                self.gen_node(left)?;
                self.emit(binop_opcode(*op), [0, 0], span)?;
            }
            NodeKind::Unop { op, inner } => {
                self.gen_node(inner)?;
                let op = match op {
                    UnOp::Neg => Op::Neg,
                    UnOp::Not => Op::Not,
                };
                self.emit(op, [0, 0], span)?;
            }
            NodeKind::Assign { target, value } => {
                self.gen_node(value)?;
                let slot = match &target.kind {
                    NodeKind::VarDecl(name) => self.declare_local(name, target.span)?,
                    NodeKind::VarRef(name) => self.local(name, target.span)?,
                    _ => {
                        return Err(CompileError::new(
                            CompileErrorKind::InvalidAssignTarget,
                            target.span,
                        ));
                    }
                };
                self.emit(Op::StoreLocal, [slot, 0], span)?;
            }
            NodeKind::Return(Some(value)) => {
                self.gen_node(value)?;
                self.emit(Op::ReturnValue, [0, 0], span)?;
            }
            NodeKind::Return(None) => {
                self.emit(Op::ReturnNothing, [0, 0], span)?;
            }
            NodeKind::Break => self.gen_break(span)?,
            NodeKind::FunSign(sign) | NodeKind::FunDecl { sign, .. } => {
                return Err(CompileError::new(
                    CompileErrorKind::NestedFunction(sign.name.clone()),
                    span,
                ));
            }
            NodeKind::FunCall { name, args } => {
                self.gen_call(name, args, span)?;
            }
        }
        Ok(())
    }

    /// A call whose result is known to be unused gets it popped.
    fn gen_statement(&mut self, node: &Node) -> Gen {
        let NodeKind::FunCall { name, args } = &node.kind else {
            return self.gen_node(node);
        };
        if self.gen_call(name, args, node.span)? == CallResult::Value {
            self.emit(Op::Pop1, [0, 0], node.span)?;
        }
        Ok(())
    }

    /// ```text
    /// cond; JUMP_IF_FALSE next; body; JUMP end     (for every branch
    /// next: cond; JUMP_IF_FALSE …                   but the last one)
    /// else body
    /// end:
    /// ```
    fn gen_if(&mut self, node: &Node) -> Gen {
        let mut exits = Vec::new();
        let mut current = node;

        while let NodeKind::If { cond, then, next } = &current.kind {
            self.gen_node(cond)?;
            let skip = self.forward(Op::JumpIfFalse, cond.span)?;
            self.gen_node(then)?;

            let continues = next
                .as_deref()
                .is_some_and(|n| matches!(n.kind, NodeKind::If { .. }) || has_else_body(n));
            if continues {
                exits.push(self.forward(Op::Jump, current.span)?);
            }
            self.code.bind(skip);

            match next {
                Some(next) => current = &**next,
                None => break,
            }
        }

        if !matches!(current.kind, NodeKind::If { .. }) && has_else_body(current) {
            self.gen_node(current)?;
        }
        for exit in exits {
            self.code.bind(exit);
        }
        Ok(())
    }

    /// ```text
    /// collection; MAKE_ITER
    /// head: ITER_NEXT end; STORE_LOCAL var; body; JUMP head
    /// end:
    /// ```
    fn gen_foreach(&mut self, var: &str, collection: &Node, body: &Node, span: Span) -> Gen {
        self.gen_node(collection)?;
        self.emit(Op::MakeIter, [0, 0], span)?;
        let head = self.forward(Op::IterNext, span)?;
        let head_index = head.index();
        let slot = self.declare_local(var, span)?;
        self.emit(Op::StoreLocal, [slot, 0], span)?;

        self.scope_mut(span)?.loops.push(Vec::new());
        let result = self.gen_node(body);
        let breaks = self
            .scope
            .as_mut()
            .and_then(|scope| scope.loops.pop())
            .unwrap_or_default();
        result?;

        self.emit(Op::Jump, [head_index.0, 0], span)?;
        self.code.bind(head);
        for fixup in breaks {
            self.code.bind(fixup);
        }
        Ok(())
    }

    /// Drops the loop's iterator and jumps to the loop exit.
    fn gen_break(&mut self, span: Span) -> Gen {
        let in_loop = self.scope.as_ref().is_some_and(|s| !s.loops.is_empty());
        if !in_loop {
            return Err(CompileError::new(CompileErrorKind::BreakOutsideLoop, span));
        }
        self.emit(Op::Pop1, [0, 0], span)?;
        let fixup = self.forward(Op::Jump, span)?;
        if let Some(breaks) = self.scope.as_mut().and_then(|s| s.loops.last_mut()) {
            breaks.push(fixup);
        }
        Ok(())
    }

    /// Whether a script function returns a value is not known here, so a
    /// script call used as a statement leaves its result, if any, on the
    /// stack until the caller's frame returns. Inside a loop body that
    /// result sits on top of the iterator.
    fn gen_call(&mut self, name: &str, args: &[Node], span: Span) -> Result<CallResult, CompileError> {
        let arity_error = |expected: usize| {
            CompileError::new(
                CompileErrorKind::ArityMismatch {
                    name: name.to_owned(),
                    expected,
                    found: args.len(),
                },
                span,
            )
        };

        if let Some(&(_, arity, op)) = INTRINSICS.iter().find(|(n, _, _)| *n == name) {
            if arity != args.len() {
                return Err(arity_error(arity));
            }
            for arg in args {
                self.gen_node(arg)?;
            }
            self.emit(op, [0, 0], span)?;
            let result = if op == Op::Print {
                CallResult::Nothing
            } else {
                CallResult::Value
            };
            return Ok(result);
        }

        for arg in args {
            self.gen_node(arg)?;
        }

        if let Some(index) = self.native_index(name) {
            let arity = self.imports[index].arity as usize;
            if arity != args.len() {
                return Err(arity_error(arity));
            }
            self.emit(Op::CallNative, [index as u32, 0], span)?;
            return Ok(self.native_result(index));
        } else if let Some(function) = self.functions.iter().find(|f| f.name == name) {
            if function.arity != args.len() {
                return Err(arity_error(function.arity));
            }
            let target = function.frame;
            self.emit(Op::Call, [target.0, 0], span)?;
        } else {
            let at = self.emit(Op::Call, [0, 0], span)?;
            self.pending.push(PendingCall {
                at,
                name: name.to_owned(),
                argc: args.len(),
                span,
            });
        }
        Ok(CallResult::Unknown)
    }

    /// Calls to names declared after their use.
    fn resolve_calls(&mut self) {
        for call in std::mem::take(&mut self.pending) {
            let arity_error = |expected| {
                CompileError::new(
                    CompileErrorKind::ArityMismatch {
                        name: call.name.clone(),
                        expected,
                        found: call.argc,
                    },
                    call.span,
                )
            };
            if let Some(function) = self.functions.iter().find(|f| f.name == call.name) {
                if function.arity != call.argc {
                    self.errors.push(arity_error(function.arity));
                    continue;
                }
                self.code.patch(call.at, 0, function.frame.0);
            } else if let Some(index) = self.native_index(&call.name) {
                if self.imports[index].arity as usize != call.argc {
                    self.errors.push(arity_error(self.imports[index].arity as usize));
                    continue;
                }
                self.code.replace(call.at, Op::CallNative, [index as u32, 0]);
            } else {
                self.errors.push(CompileError::new(
                    CompileErrorKind::UnknownFunction(call.name.clone()),
                    call.span,
                ));
            }
        }
    }
}

fn binop_opcode(op: BinOp) -> Op {
    match op {
        BinOp::Add => Op::Add,
        BinOp::Sub => Op::Sub,
        BinOp::Mul => Op::Mul,
        BinOp::Div => Op::Div,
        BinOp::Mod => Op::Mod,
        BinOp::And => Op::And,
        BinOp::Or => Op::Or,
        BinOp::Eq => Op::CmpEqual,
        BinOp::NotEq => Op::CmpNotEqual,
        BinOp::Less => Op::CmpLessThan,
        BinOp::Greater => Op::CmpMoreThan,
        BinOp::LessEq => Op::CmpLessThanOrEqual,
        BinOp::GreaterEq => Op::CmpMoreThanOrEqual,
    }
}

/// An else branch only produces code when it has statements.
fn has_else_body(node: &Node) -> bool {
    match &node.kind {
        NodeKind::Block(items) => !items.is_empty(),
        NodeKind::If { .. } => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::node::*;
    use crate::ast::Pos;
    use crate::bytecode::Instruction;

    fn ops(program: &Program) -> Vec<Op> {
        program.instructions().map(|i| i.unwrap().op).collect()
    }

    fn decoded(program: &Program) -> Vec<Instruction> {
        program.instructions().map(|i| i.unwrap()).collect()
    }

    fn compile_ok(root: Node) -> Program {
        match compile(&root) {
            Ok(program) => program,
            Err(diag) => panic!("unexpected compile errors:\n{diag}"),
        }
    }

    #[test]
    fn main_gets_entry_point_and_frame() {
        let program = compile_ok(block(vec![fun(
            "main",
            &[],
            vec![ret(binop(BinOp::Add, number(1.0), number(1.0)))],
        )]));
        assert_eq!(
            ops(&program),
            vec![
                Op::EntryPoint,
                Op::MakeFrame,
                Op::PushValue,
                Op::PushValue,
                Op::Add,
                Op::ReturnValue,
                Op::ReturnNothing,
            ]
        );
        let ins = decoded(&program);
        assert_eq!(ins[0].operands[0], 5, "entry jumps to main's frame");
        assert_eq!(program.entry, Some(5));
        assert_eq!(program.constants, vec![Value::Number(1.0)], "1.0 is stored once");
    }

    #[test]
    fn frame_counts_args_and_locals() {
        let program = compile_ok(fun(
            "f",
            &["a", "b"],
            vec![let_("c", var("a")), let_("d", var("b")), ret(var("c"))],
        ));
        let frame = decoded(&program)[1];
        assert_eq!(frame.op, Op::MakeFrame);
        assert_eq!(frame.operands, [2, 2]);
        assert_eq!(program.exports[0].arity, 2);
    }

    #[test]
    fn binop_emits_right_operand_first() {
        let program = compile_ok(fun(
            "f",
            &["a", "b"],
            vec![ret(binop(BinOp::Sub, var("a"), var("b")))],
        ));
        let ins = decoded(&program);
        assert_eq!(ins[2].op, Op::LoadLocal);
        assert_eq!(ins[2].operands[0], 1, "b is pushed first");
        assert_eq!(ins[3].operands[0], 0);
        assert_eq!(ins[4].op, Op::Sub);
    }

    #[test]
    fn if_chain_jumps_land_on_boundaries() {
        let program = compile_ok(fun(
            "main",
            &["x"],
            vec![
                if_chain(
                    var("x"),
                    block(vec![ret(number(1.0))]),
                    Some(if_chain(
                        boolean(false),
                        block(vec![ret(number(2.0))]),
                        Some(block(vec![ret(number(3.0))])),
                    )),
                ),
                ret(number(4.0)),
            ],
        ));
        let ins = decoded(&program);
        let jumps: Vec<_> = ins
            .iter()
            .filter(|i| i.op.has_address_operand())
            .collect();
        assert_eq!(
            jumps.iter().filter(|i| i.op == Op::Jump).count(),
            2,
            "every branch but the last skips to the end"
        );
        for jump in jumps {
            assert!(
                program.is_instruction_boundary(jump.operands[0]),
                "{jump} does not land on an instruction"
            );
        }
    }

    #[test]
    fn last_branch_without_else_has_no_exit_jump() {
        let program = compile_ok(fun(
            "f",
            &["x"],
            vec![if_chain(var("x"), block(vec![ret(number(1.0))]), None)],
        ));
        assert!(!ops(&program).contains(&Op::Jump));
        let ins = decoded(&program);
        let skip = ins.iter().find(|i| i.op == Op::JumpIfFalse).unwrap();
        let target = ins.iter().find(|i| i.offset == skip.operands[0]).unwrap();
        assert_eq!(target.op, Op::ReturnNothing);
    }

    #[test]
    fn foreach_exit_and_back_edge() {
        let program = compile_ok(fun(
            "f",
            &["xs"],
            vec![for_each("x", var("xs"), block(vec![call("print", vec![var("x")])]))],
        ));
        let ins = decoded(&program);
        let head = ins.iter().find(|i| i.op == Op::IterNext).unwrap();
        let back = ins.iter().find(|i| i.op == Op::Jump).unwrap();
        assert_eq!(back.operands[0], head.offset);
        assert_eq!(head.operands[0], back.next_offset());
        assert!(ops(&program).contains(&Op::Print));
    }

    #[test]
    fn break_pops_iterator_and_exits_loop() {
        let program = compile_ok(fun(
            "f",
            &["xs"],
            vec![for_each("x", var("xs"), block(vec![brk()]))],
        ));
        let ins = decoded(&program);
        let head = ins.iter().find(|i| i.op == Op::IterNext).unwrap();
        let pop = ins.iter().position(|i| i.op == Op::Pop1).unwrap();
        assert_eq!(ins[pop + 1].op, Op::Jump);
        assert_eq!(ins[pop + 1].operands[0], head.operands[0]);
    }

    #[test]
    fn forward_calls_are_resolved_after_the_walk() {
        let program = compile_ok(block(vec![
            fun("main", &[], vec![ret(call("later", vec![number(2.0)]))]),
            fun("later", &["x"], vec![ret(var("x"))]),
        ]));
        let ins = decoded(&program);
        let call = ins.iter().find(|i| i.op == Op::Call).unwrap();
        assert_eq!(call.operands[0], program.find_export("later").unwrap().address);
    }

    #[test]
    fn natives_lower_to_call_native() {
        let mut compiler = Compiler::new();
        compiler.declare_native("host_add", 2).unwrap();
        let program = compiler
            .compile(&block(vec![
                native("log", &["msg"]),
                fun(
                    "main",
                    &[],
                    vec![
                        call("log", vec![string("hi")]),
                        ret(call("host_add", vec![number(1.0), number(2.0)])),
                    ],
                ),
            ]))
            .unwrap();
        assert_eq!(program.imports.len(), 2);
        let natives: Vec<_> = decoded(&program)
            .into_iter()
            .filter(|i| i.op == Op::CallNative)
            .map(|i| i.operands[0])
            .collect();
        assert_eq!(natives, vec![1, 0]);
    }

    #[test]
    fn string_literal_is_a_constant_array() {
        let program = compile_ok(fun("main", &[], vec![ret(string("ok"))]));
        assert_eq!(program.constants.len(), 3);
        assert_eq!(program.constants[0], Value::Char('o'));
        assert!(matches!(program.constants[2], Value::Array(a) if a.length == 2));
    }

    #[test]
    fn missing_main_replaces_entry_with_halt() {
        let program = compile_ok(fun("helper", &[], vec![ret(number(1.0))]));
        assert_eq!(ops(&program)[0], Op::Halt);
        assert_eq!(program.entry, None);
    }

    #[test]
    fn errors_accumulate_with_locations() {
        let here = Span::point(Pos::new(10, 3, 7));
        let root = block(vec![
            fun(
                "main",
                &[],
                vec![
                    call("nowhere", vec![]),
                    var("ghost").at(here),
                    brk(),
                    fun("inner", &[], vec![]),
                ],
            ),
            native("main", &[]),
        ]);
        let diag = compile(&root).unwrap_err();
        assert!(diag.has(|k| matches!(k, CompileErrorKind::UnknownFunction(n) if n == "nowhere")));
        assert!(diag.has(|k| matches!(k, CompileErrorKind::BreakOutsideLoop)));
        assert!(diag.has(|k| matches!(k, CompileErrorKind::NestedFunction(n) if n == "inner")));
        assert!(diag.has(|k| matches!(k, CompileErrorKind::DuplicateNative(n) if n == "main")));
        assert!(
            diag.to_string().contains("3:7: unknown variable 'ghost'"),
            "{diag}"
        );
    }

    #[test]
    fn arity_is_checked_for_every_call_kind() {
        let root = block(vec![
            native("n", &["a"]),
            fun(
                "main",
                &[],
                vec![
                    call("n", vec![]),
                    call("len", vec![]),
                    call("g", vec![number(1.0)]),
                ],
            ),
            fun("g", &[], vec![]),
        ]);
        let diag = compile(&root).unwrap_err();
        let mismatches = diag
            .errors
            .iter()
            .filter(|e| matches!(e.kind, CompileErrorKind::ArityMismatch { .. }))
            .count();
        assert_eq!(mismatches, 3);
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let root = block(vec![
            fun("main", &["a", "a"], vec![]),
            fun("f", &[], vec![]),
            fun("f", &[], vec![]),
            fun("print", &[], vec![]),
        ]);
        let diag = compile(&root).unwrap_err();
        assert!(diag.has(|k| matches!(k, CompileErrorKind::DuplicateLocal(n) if n == "a")));
        assert!(diag.has(|k| matches!(k, CompileErrorKind::DuplicateFunction(n) if n == "f")));
        assert!(diag.has(|k| matches!(k, CompileErrorKind::DuplicateFunction(n) if n == "print")));
    }

    #[test]
    fn redeclared_locals_share_a_slot() {
        let program = compile_ok(fun(
            "f",
            &["a", "b"],
            vec![
                let_("sum", number(0.0)),
                for_each("x", var("a"), block(vec![])),
                for_each("x", var("b"), block(vec![])),
                if_chain(
                    boolean(true),
                    block(vec![let_("y", number(1.0))]),
                    Some(block(vec![let_("y", number(2.0))])),
                ),
                let_("sum", var("y")),
            ],
        ));
        let ins = decoded(&program);
        assert_eq!(ins[1].operands, [2, 3], "sum, x and y get one slot each");
        let stores: Vec<u32> = ins
            .iter()
            .filter(|i| i.op == Op::StoreLocal)
            .map(|i| i.operands[0])
            .collect();
        assert_eq!(stores, vec![2, 3, 3, 4, 4, 2]);
    }

    #[test]
    fn offered_natives_are_imported_on_first_use() {
        let mut compiler = Compiler::new();
        compiler.offer_native("unused", 0, NativeKind::Function).unwrap();
        compiler.offer_native("second", 1, NativeKind::Action).unwrap();
        compiler.offer_native("first", 0, NativeKind::Function).unwrap();
        assert!(matches!(
            compiler.offer_native("first", 0, NativeKind::Function),
            Err(CompileError { kind: CompileErrorKind::DuplicateNative(_), .. })
        ));

        let program = compiler
            .compile(&fun(
                "main",
                &[],
                vec![
                    call("second", vec![call("first", vec![])]),
                    call("second", vec![number(1.0)]),
                ],
            ))
            .unwrap();
        let names: Vec<&str> = program.imports.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn unused_known_results_are_popped() {
        let mut compiler = Compiler::new();
        compiler.offer_native("value", 0, NativeKind::Function).unwrap();
        compiler.offer_native("effect", 0, NativeKind::Action).unwrap();
        let program = compiler
            .compile(&fun(
                "f",
                &["xs"],
                vec![
                    call("value", vec![]),
                    call("effect", vec![]),
                    call("len", vec![var("xs")]),
                    call("print", vec![var("xs")]),
                ],
            ))
            .unwrap();
        assert_eq!(
            ops(&program)[2..],
            [
                Op::CallNative,
                Op::Pop1,
                Op::CallNative,
                Op::LoadLocal,
                Op::ArrayLength,
                Op::Pop1,
                Op::LoadLocal,
                Op::Print,
                Op::ReturnNothing,
            ]
        );
    }

    #[test]
    fn long_names_are_rejected() {
        let name = "f".repeat(MAX_NAME_LENGTH + 1);
        let diag = compile(&fun(&name, &[], vec![])).unwrap_err();
        assert_eq!(
            diag.errors[0].kind,
            CompileErrorKind::NameTooLong(MAX_NAME_LENGTH + 1)
        );

        let mut compiler = Compiler::new();
        assert!(compiler.declare_native(&name, 0).is_err());
        assert!(compiler.offer_native(&name, 0, NativeKind::Action).is_err());
    }

    #[test]
    fn statements_need_a_function() {
        let diag = compile(&block(vec![let_("x", number(1.0))])).unwrap_err();
        assert_eq!(
            diag.errors[0].kind,
            CompileErrorKind::StatementOutsideFunction
        );
    }
}
