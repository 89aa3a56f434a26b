//! CEL front end: tokenizer, parser and expression tree.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{operators, Expr, Literal};
pub use parser::parse;
