//! The abstract syntax tree produced by the parser.
//!
//! Every node carries the position of its first token. Malformed regions
//! become `Expr::Bad` / `Stmt::Bad` so compilation can continue reporting
//! errors further down the file.

use strum::Display;

use crate::source::Pos;

/// An expression with its source position.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExprNode {
    pub expr: Expr,
    pub pos: Pos,
}

impl ExprNode {
    pub fn new(expr: Expr, pos: Pos) -> Self {
        Self { expr, pos }
    }

    pub fn bad(pos: Pos) -> Self {
        Self { expr: Expr::Bad, pos }
    }

    /// True when this expression is a call (possibly parenthesized), the
    /// only form `try` and `defer` accept.
    pub fn is_call(&self) -> bool {
        match &self.expr {
            Expr::Call { .. } => true,
            Expr::Paren(inner) => inner.is_call(),
            _ => false,
        }
    }
}

/// Binary operators as they appear in source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum BinaryOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "%")]
    Rem,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = ">>")]
    Shr,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "in")]
    In,
}

/// Short-circuit operators, kept apart from [`BinaryOp`] because they
/// compile to jumps, not value-model dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogicalOp {
    And,
    Or,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum UnaryOp {
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "+")]
    Pos,
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "^")]
    BitNot,
}

/// One argument in a call or element in an array literal; `splat` marks a
/// `...expr` spread.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SpreadElement {
    pub expr: ExprNode,
    pub splat: bool,
}

/// One `key: value` entry of a table literal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TableEntry {
    pub key: TableKey,
    pub value: ExprNode,
}

/// A table-literal key: a bare identifier/string (constant) or a computed
/// `[expr]` key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TableKey {
    /// `name: ...` or `"name": ...` — a constant string key.
    Name(String, Pos),
    /// `[expr]: ...` — evaluated at runtime.
    Computed(ExprNode),
}

/// One piece of an interpolated string literal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InterpPart {
    /// Literal text between interpolations (escapes already decoded).
    Fragment(String),
    /// A `{expr}` interpolation, converted to string at runtime.
    Expr(ExprNode),
}

/// A function parameter. Optional parameters follow required ones and
/// receive `nil` when the caller omits them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Param {
    pub name: String,
    pub pos: Pos,
    pub optional: bool,
}

/// A function body: a block, or a single expression shorthand that is
/// returned implicitly.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FuncBody {
    Block(Vec<StmtNode>),
    Expr(Box<ExprNode>),
}

/// A function literal.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FuncLit {
    pub params: Vec<Param>,
    /// Name of the trailing `...rest` parameter, if any.
    pub variadic: Option<(String, Pos)>,
    pub body: FuncBody,
    pub pos: Pos,
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    /// Interpolated string literal.
    Interp(Vec<InterpPart>),
    Ident(String),
    Unary {
        op: UnaryOp,
        operand: Box<ExprNode>,
    },
    Binary {
        op: BinaryOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Logical {
        op: LogicalOp,
        left: Box<ExprNode>,
        right: Box<ExprNode>,
    },
    Ternary {
        cond: Box<ExprNode>,
        then: Box<ExprNode>,
        otherwise: Box<ExprNode>,
    },
    Index {
        obj: Box<ExprNode>,
        index: Box<ExprNode>,
    },
    Slice {
        obj: Box<ExprNode>,
        low: Option<Box<ExprNode>>,
        high: Option<Box<ExprNode>>,
    },
    Selector {
        obj: Box<ExprNode>,
        field: String,
        field_pos: Pos,
    },
    Call {
        callee: Box<ExprNode>,
        args: Vec<SpreadElement>,
    },
    /// `try call(...)` — yields a `(result, err)` tuple.
    Try(Box<ExprNode>),
    /// `import("name")`.
    Import(String),
    Array(Vec<SpreadElement>),
    Table(Vec<TableEntry>),
    Func(FuncLit),
    Paren(Box<ExprNode>),
    /// Placeholder emitted during error recovery.
    Bad,
}

/// A statement with its source position.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StmtNode {
    pub stmt: Stmt,
    pub pos: Pos,
}

impl StmtNode {
    pub fn new(stmt: Stmt, pos: Pos) -> Self {
        Self { stmt, pos }
    }

    pub fn bad(pos: Pos) -> Self {
        Self { stmt: Stmt::Bad, pos }
    }
}

/// An assignment target as parsed; the compiler validates storability.
pub(crate) type AssignTarget = ExprNode;

/// The `else` arm of an `if` statement.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ElseArm {
    Block(Vec<StmtNode>),
    /// `else if ...` chains as a nested statement.
    If(Box<StmtNode>),
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Expr(ExprNode),
    /// `a := v` or `a, b := v` / `a, b := v1, v2`.
    Declare {
        names: Vec<(String, Pos)>,
        values: Vec<ExprNode>,
    },
    /// `target = v`, `target op= v`, or `t1, t2 = v1, v2`.
    Assign {
        targets: Vec<AssignTarget>,
        /// The base operator for compound assignment (`+=` etc.).
        op: Option<BinaryOp>,
        values: Vec<ExprNode>,
    },
    If {
        init: Option<Box<StmtNode>>,
        cond: ExprNode,
        then: Vec<StmtNode>,
        otherwise: Option<ElseArm>,
    },
    /// C-style `for` covering infinite (`for {}`), while (`for cond {}`),
    /// and three-clause forms.
    For {
        init: Option<Box<StmtNode>>,
        cond: Option<ExprNode>,
        post: Option<Box<StmtNode>>,
        body: Vec<StmtNode>,
    },
    /// `for k in it {}` or `for k, v in it {}`.
    ForIn {
        key: (String, Pos),
        value: Option<(String, Pos)>,
        iterable: ExprNode,
        body: Vec<StmtNode>,
    },
    Labeled {
        label: String,
        stmt: Box<StmtNode>,
    },
    Break {
        label: Option<String>,
    },
    Continue {
        label: Option<String>,
    },
    Return {
        values: Vec<ExprNode>,
    },
    /// `defer call(...)` — callee and arguments evaluate now, the call runs
    /// at frame exit.
    Defer {
        call: ExprNode,
    },
    Export {
        value: ExprNode,
    },
    Block(Vec<StmtNode>),
    Empty,
    /// Placeholder emitted during error recovery.
    Bad,
}
