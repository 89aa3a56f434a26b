//! CEL expression tree
//!
//! Operators are represented as calls using CEL's internal function names
//! (`_&&_`, `_==_`, `@in`, ...), so `a == 1` is
//! `Call { target: None, function: "_==_", args: [Ident("a"), Literal(Int(1))] }`.

use std::fmt;

pub mod operators {
    pub const CONDITIONAL: &str = "_?_:_";
    pub const LOGICAL_AND: &str = "_&&_";
    pub const LOGICAL_OR: &str = "_||_";
    pub const LOGICAL_NOT: &str = "!_";
    pub const EQUALS: &str = "_==_";
    pub const NOT_EQUALS: &str = "_!=_";
    pub const LESS: &str = "_<_";
    pub const LESS_EQUALS: &str = "_<=_";
    pub const GREATER: &str = "_>_";
    pub const GREATER_EQUALS: &str = "_>=_";
    pub const IN: &str = "@in";
    pub const ADD: &str = "_+_";
    pub const SUBTRACT: &str = "_-_";
    pub const MULTIPLY: &str = "_*_";
    pub const DIVIDE: &str = "_/_";
    pub const MODULO: &str = "_%_";
    pub const NEGATE: &str = "-_";
    pub const INDEX: &str = "_[_]";

    /// `matches` string function, always called with a target.
    pub const MATCHES: &str = "matches";
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Null,
}

impl Literal {
    /// CEL type name, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::Int(_) => "int",
            Literal::Uint(_) => "uint",
            Literal::Double(_) => "double",
            Literal::String(_) => "string",
            Literal::Bytes(_) => "bytes",
            Literal::Bool(_) => "bool",
            Literal::Null => "null_type",
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int(v) => write!(f, "{}", v),
            Literal::Uint(v) => write!(f, "{}u", v),
            Literal::Double(v) => write!(f, "{:?}", v),
            Literal::String(v) => write!(f, "{:?}", v),
            Literal::Bytes(v) => write!(f, "b{:?}", String::from_utf8_lossy(v)),
            Literal::Bool(v) => write!(f, "{}", v),
            Literal::Null => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    /// `operand.field`; `test_only` is set by the `has()` macro.
    Select {
        operand: Box<Expr>,
        field: String,
        test_only: bool,
    },
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
}

impl Expr {
    pub fn call(function: &str, args: Vec<Expr>) -> Self {
        Expr::Call {
            target: None,
            function: function.to_owned(),
            args,
        }
    }

    /// Node kind name, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Literal(_) => "LiteralKind",
            Expr::Ident(_) => "IdentKind",
            Expr::Select { .. } => "SelectKind",
            Expr::Call { .. } => "CallKind",
            Expr::List(_) => "ListKind",
            Expr::Map(_) => "MapKind",
        }
    }

    /// Dotted path for identifiers and plain selects (`labels.env`).
    pub fn as_path(&self) -> Option<String> {
        let mut fields = Vec::new();
        let mut current = self;
        loop {
            match current {
                Expr::Ident(name) => {
                    fields.push(name.as_str());
                    break;
                }
                Expr::Select {
                    operand,
                    field,
                    test_only: false,
                } => {
                    fields.push(field.as_str());
                    current = operand;
                }
                _ => return None,
            }
        }
        fields.reverse();
        Some(fields.join("."))
    }

    /// Number of nodes on the longest path from this node to a leaf.
    pub fn height(&self) -> usize {
        let children = match self {
            Expr::Literal(_) | Expr::Ident(_) => 0,
            Expr::Select { operand, .. } => operand.height(),
            Expr::Call { target, args, .. } => target
                .iter()
                .map(|t| t.height())
                .chain(args.iter().map(Expr::height))
                .max()
                .unwrap_or(0),
            Expr::List(items) => items.iter().map(Expr::height).max().unwrap_or(0),
            Expr::Map(entries) => entries
                .iter()
                .map(|(k, v)| k.height().max(v.height()))
                .max()
                .unwrap_or(0),
        };
        children + 1
    }
}
