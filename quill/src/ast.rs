/// Abstract syntax tree consumed by the code generator.
///
/// Trees come from an external parser and are assumed to be valid: names
/// resolve, types line up. Every [`Node`] carries a [`Span`] so compile
/// errors can point back at the source.
///
/// The `node` helpers at the bottom build trees with an empty span, which
/// is what embedders and tests use when there is no source text.
use core::fmt;

/// A single position in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pos {
    /// Byte offset from the start of the input (0-based).
    pub offset: usize,
    /// Line number (1-based).
    pub line: usize,
    /// Column number (1-based, in bytes).
    pub column: usize,
}

impl Pos {
    pub const fn new(offset: usize, line: usize, column: usize) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }

    pub const fn origin() -> Self {
        Self::new(0, 1, 1)
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A contiguous region of source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: Pos,
    pub end: Pos,
}

impl Span {
    pub const fn new(start: Pos, end: Pos) -> Self {
        Self { start, end }
    }

    pub const fn point(pos: Pos) -> Self {
        Self {
            start: pos,
            end: pos,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Self::point(Pos::origin())
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f32),
    Bool(bool),
    /// Lowered to a constant array of chars.
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Eq,
    NotEq,
    Less,
    Greater,
    LessEq,
    GreaterEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// Function name and parameter names.
#[derive(Debug, Clone, PartialEq)]
pub struct FunSign {
    pub name: String,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Value(Literal),
    VarRef(String),
    VarDecl(String),
    /// Array literal, built on the heap at runtime.
    Array(Vec<Node>),
    Block(Vec<Node>),
    /// One link of an if / else-if / else chain. `next` is either another
    /// `If` or the trailing else block.
    If {
        cond: Box<Node>,
        then: Box<Node>,
        next: Option<Box<Node>>,
    },
    ForEach {
        var: String,
        collection: Box<Node>,
        body: Box<Node>,
    },
    Binop {
        op: BinOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Unop {
        op: UnOp,
        inner: Box<Node>,
    },
    /// `target` is a `VarDecl` or a `VarRef`.
    Assign {
        target: Box<Node>,
        value: Box<Node>,
    },
    Return(Option<Box<Node>>),
    Break,
    /// At top level: declares a native function supplied by the host.
    FunSign(FunSign),
    FunDecl {
        sign: FunSign,
        body: Box<Node>,
    },
    FunCall {
        name: String,
        args: Vec<Node>,
    },
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}

/// Span-less constructors.
pub mod node {
    use super::*;

    fn n(kind: NodeKind) -> Node {
        Node::new(kind, Span::default())
    }

    pub fn number(value: f32) -> Node {
        n(NodeKind::Value(Literal::Number(value)))
    }

    pub fn boolean(value: bool) -> Node {
        n(NodeKind::Value(Literal::Bool(value)))
    }

    pub fn string(value: &str) -> Node {
        n(NodeKind::Value(Literal::String(value.to_owned())))
    }

    pub fn var(name: &str) -> Node {
        n(NodeKind::VarRef(name.to_owned()))
    }

    pub fn decl(name: &str) -> Node {
        n(NodeKind::VarDecl(name.to_owned()))
    }

    pub fn array(items: Vec<Node>) -> Node {
        n(NodeKind::Array(items))
    }

    pub fn block(items: Vec<Node>) -> Node {
        n(NodeKind::Block(items))
    }

    pub fn if_chain(cond: Node, then: Node, next: Option<Node>) -> Node {
        n(NodeKind::If {
            cond: Box::new(cond),
            then: Box::new(then),
            next: next.map(Box::new),
        })
    }

    pub fn for_each(var: &str, collection: Node, body: Node) -> Node {
        n(NodeKind::ForEach {
            var: var.to_owned(),
            collection: Box::new(collection),
            body: Box::new(body),
        })
    }

    pub fn binop(op: BinOp, left: Node, right: Node) -> Node {
        n(NodeKind::Binop {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    pub fn unop(op: UnOp, inner: Node) -> Node {
        n(NodeKind::Unop {
            op,
            inner: Box::new(inner),
        })
    }

    /// `let name = value`
    pub fn let_(name: &str, value: Node) -> Node {
        assign(decl(name), value)
    }

    pub fn assign(target: Node, value: Node) -> Node {
        n(NodeKind::Assign {
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    pub fn ret(value: Node) -> Node {
        n(NodeKind::Return(Some(Box::new(value))))
    }

    pub fn ret_nothing() -> Node {
        n(NodeKind::Return(None))
    }

    pub fn brk() -> Node {
        n(NodeKind::Break)
    }

    fn sign(name: &str, params: &[&str]) -> FunSign {
        FunSign {
            name: name.to_owned(),
            params: params.iter().map(|p| (*p).to_owned()).collect(),
        }
    }

    pub fn native(name: &str, params: &[&str]) -> Node {
        n(NodeKind::FunSign(sign(name, params)))
    }

    pub fn fun(name: &str, params: &[&str], body: Vec<Node>) -> Node {
        n(NodeKind::FunDecl {
            sign: sign(name, params),
            body: Box::new(block(body)),
        })
    }

    pub fn call(name: &str, args: Vec<Node>) -> Node {
        n(NodeKind::FunCall {
            name: name.to_owned(),
            args,
        })
    }
}
