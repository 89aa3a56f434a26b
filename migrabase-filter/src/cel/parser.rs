//! Recursive-descent CEL parser
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr     = or ["?" or ":" expr]
//! or       = and {"||" and}
//! and      = relation {"&&" relation}
//! relation = addition {("<"|"<="|">="|">"|"=="|"!="|"in") addition}
//! addition = mult {("+"|"-") mult}
//! mult     = unary {("*"|"/"|"%") unary}
//! unary    = member | "!"+ member | "-"+ member
//! member   = primary {"." IDENT ["(" args ")"] | "[" expr "]"}
//! primary  = ["."] IDENT ["(" args ")"] | "(" expr ")" | list | map | literal
//! ```
//!
//! `&&` and `||` chains are built as balanced binary trees, matching the
//! shape cel-go produces for the same text.

use super::ast::{operators, Expr, Literal};
use super::lexer::{tokenize, Spanned, Token};
use crate::error::ParseError;

/// Maximum nesting of parenthesized expressions, lists and calls, and the
/// maximum height of an operator or member chain.
pub const MAX_DEPTH: usize = 100;

/// Longest accepted input, in code points.
pub const MAX_CODE_POINTS: usize = 100_000;

/// Receiver-style macros that expand to comprehensions; filters never use them.
const COMPREHENSION_MACROS: &[&str] = &["all", "exists", "exists_one", "map", "filter"];

/// Parse a CEL expression.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let size = input.chars().count();
    if size > MAX_CODE_POINTS {
        return Err(ParseError::new(
            1,
            1,
            format!(
                "expression code point size exceeds limit: size: {}, limit {}",
                size, MAX_CODE_POINTS
            ),
        ));
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    let next = parser.current();
    if next.token != Token::Eof {
        return Err(next.error(format!("mismatched input {} expecting <EOF>", next.token)));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn current(&self) -> &Spanned {
        // tokenize always ends with Eof, and `advance` never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn advance(&mut self) -> Spanned {
        let token = self.current().clone();
        if token.token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), ParseError> {
        if self.eat(&token) {
            return Ok(());
        }
        let found = self.current();
        Err(found.error(format!("mismatched input {} expecting {}", found.token, token)))
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.current().error(format!(
                "expression recursion limit exceeded: {}",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// Height of a chain after wrapping it in one more node whose other
    /// children are at most `sibling` high.
    fn deepen(&self, height: usize, sibling: usize) -> Result<usize, ParseError> {
        let height = height.max(sibling) + 1;
        if height > MAX_DEPTH {
            return Err(self.current().error(format!(
                "expression recursion limit exceeded: {}",
                MAX_DEPTH
            )));
        }
        Ok(height)
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let result = self.conditional();
        self.leave();
        result
    }

    fn conditional(&mut self) -> Result<Expr, ParseError> {
        let condition = self.or()?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }
        let then = self.or()?;
        self.expect(Token::Colon)?;
        let otherwise = self.expr()?;
        Ok(Expr::call(
            operators::CONDITIONAL,
            vec![condition, then, otherwise],
        ))
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut terms = vec![self.and()?];
        while self.eat(&Token::Or) {
            terms.push(self.and()?);
        }
        Ok(balance(operators::LOGICAL_OR, terms))
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut terms = vec![self.relation()?];
        while self.eat(&Token::And) {
            terms.push(self.relation()?);
        }
        Ok(balance(operators::LOGICAL_AND, terms))
    }

    fn relation(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.addition()?;
        let mut height = left.height();
        loop {
            let function = match self.peek() {
                Token::Eq => operators::EQUALS,
                Token::Ne => operators::NOT_EQUALS,
                Token::Lt => operators::LESS,
                Token::Le => operators::LESS_EQUALS,
                Token::Gt => operators::GREATER,
                Token::Ge => operators::GREATER_EQUALS,
                Token::In => operators::IN,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.addition()?;
            height = self.deepen(height, right.height())?;
            left = Expr::call(function, vec![left, right]);
        }
    }

    fn addition(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.multiplication()?;
        let mut height = left.height();
        loop {
            let function = match self.peek() {
                Token::Plus => operators::ADD,
                Token::Minus => operators::SUBTRACT,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplication()?;
            height = self.deepen(height, right.height())?;
            left = Expr::call(function, vec![left, right]);
        }
    }

    fn multiplication(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.unary()?;
        let mut height = left.height();
        loop {
            let function = match self.peek() {
                Token::Star => operators::MULTIPLY,
                Token::Slash => operators::DIVIDE,
                Token::Percent => operators::MODULO,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            height = self.deepen(height, right.height())?;
            left = Expr::call(function, vec![left, right]);
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Token::Not => {
                let mut count = 0;
                while self.eat(&Token::Not) {
                    count += 1;
                }
                let operand = self.member()?;
                Ok(if count % 2 == 0 {
                    operand
                } else {
                    Expr::call(operators::LOGICAL_NOT, vec![operand])
                })
            }
            Token::Minus => {
                let mut count = 0;
                while self.eat(&Token::Minus) {
                    count += 1;
                }
                // The last minus binds to a numeric literal: `-1` is a literal, not a call.
                let operand = if matches!(self.peek(), Token::Int(_) | Token::Double(_)) {
                    count -= 1;
                    let literal = self.signed_number()?;
                    self.member_suffix(literal)?
                } else {
                    self.member()?
                };
                Ok(if count % 2 == 0 {
                    operand
                } else {
                    Expr::call(operators::NEGATE, vec![operand])
                })
            }
            _ => self.member(),
        }
    }

    fn signed_number(&mut self) -> Result<Expr, ParseError> {
        let spanned = self.advance();
        match &spanned.token {
            Token::Int(digits) => parse_int(digits, true)
                .map(|v| Expr::Literal(Literal::Int(v)))
                .ok_or_else(|| spanned.error(format!("invalid int literal: -{}", digits))),
            Token::Double(v) => Ok(Expr::Literal(Literal::Double(-v))),
            other => Err(spanned.error(format!("unexpected {}", other))),
        }
    }

    fn member(&mut self) -> Result<Expr, ParseError> {
        let primary = self.primary()?;
        self.member_suffix(primary)
    }

    fn member_suffix(&mut self, mut operand: Expr) -> Result<Expr, ParseError> {
        let mut height = operand.height();
        loop {
            if self.eat(&Token::Dot) {
                let spanned = self.advance();
                let Token::Ident(field) = spanned.token.clone() else {
                    return Err(spanned.error(format!(
                        "mismatched input {} expecting IDENTIFIER",
                        spanned.token
                    )));
                };
                if self.eat(&Token::LParen) {
                    if COMPREHENSION_MACROS.contains(&field.as_str()) {
                        return Err(spanned.error(format!("unsupported macro: {}", field)));
                    }
                    let args = self.arguments(Token::RParen)?;
                    let sibling = args.iter().map(Expr::height).max().unwrap_or(0);
                    height = self.deepen(height, sibling)?;
                    operand = Expr::Call {
                        target: Some(Box::new(operand)),
                        function: field,
                        args,
                    };
                } else {
                    height = self.deepen(height, 0)?;
                    operand = Expr::Select {
                        operand: Box::new(operand),
                        field,
                        test_only: false,
                    };
                }
            } else if self.eat(&Token::LBracket) {
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                height = self.deepen(height, index.height())?;
                operand = Expr::call(operators::INDEX, vec![operand, index]);
            } else {
                return Ok(operand);
            }
        }
    }

    /// Comma-separated expressions up to `close`, allowing a trailing comma.
    fn arguments(&mut self, close: Token) -> Result<Vec<Expr>, ParseError> {
        self.enter()?;
        let mut args = Vec::new();
        while !self.eat(&close) {
            args.push(self.expr()?);
            if !self.eat(&Token::Comma) {
                self.expect(close.clone())?;
                break;
            }
        }
        self.leave();
        Ok(args)
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        let spanned = self.advance();
        match spanned.token.clone() {
            Token::Int(digits) => parse_int(&digits, false)
                .map(|v| Expr::Literal(Literal::Int(v)))
                .ok_or_else(|| spanned.error(format!("invalid int literal: {}", digits))),
            Token::Uint(v) => Ok(Expr::Literal(Literal::Uint(v))),
            Token::Double(v) => Ok(Expr::Literal(Literal::Double(v))),
            Token::Str(s) => Ok(Expr::Literal(Literal::String(s))),
            Token::Bytes(b) => Ok(Expr::Literal(Literal::Bytes(b))),
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::Null => Ok(Expr::Literal(Literal::Null)),
            Token::Dot => {
                let ident = self.advance();
                match ident.token.clone() {
                    Token::Ident(name) => self.ident_or_call(format!(".{}", name), &ident),
                    other => Err(ident.error(format!(
                        "mismatched input {} expecting IDENTIFIER",
                        other
                    ))),
                }
            }
            Token::Ident(name) => self.ident_or_call(name, &spanned),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::List(self.arguments(Token::RBracket)?)),
            Token::LBrace => self.map_entries(),
            Token::Eof => Err(spanned.error("mismatched input <EOF>, expecting an expression")),
            other => Err(spanned.error(format!("extraneous input {}", other))),
        }
    }

    fn ident_or_call(&mut self, name: String, at: &Spanned) -> Result<Expr, ParseError> {
        if *self.peek() == Token::LBrace {
            return Err(at.error(format!("unsupported message construction: {}", name)));
        }
        if !self.eat(&Token::LParen) {
            return Ok(Expr::Ident(name));
        }
        let args = self.arguments(Token::RParen)?;
        if name == "has" {
            return has_macro(args, at);
        }
        Ok(Expr::Call {
            target: None,
            function: name,
            args,
        })
    }

    fn map_entries(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let mut entries = Vec::new();
        while !self.eat(&Token::RBrace) {
            let key = self.expr()?;
            self.expect(Token::Colon)?;
            let value = self.expr()?;
            entries.push((key, value));
            if !self.eat(&Token::Comma) {
                self.expect(Token::RBrace)?;
                break;
            }
        }
        self.leave();
        Ok(Expr::Map(entries))
    }
}

/// `has(a.b)` → test-only select of `b` on `a`.
fn has_macro(mut args: Vec<Expr>, at: &Spanned) -> Result<Expr, ParseError> {
    if args.len() != 1 {
        return Err(at.error("invalid argument to has() macro"));
    }
    match args.remove(0) {
        Expr::Select { operand, field, .. } => Ok(Expr::Select {
            operand,
            field,
            test_only: true,
        }),
        _ => Err(at.error("invalid argument to has() macro")),
    }
}

fn parse_int(digits: &str, negative: bool) -> Option<i64> {
    let (radix, body) = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => (16, hex),
        None => (10, digits),
    };
    if negative {
        i64::from_str_radix(&format!("-{}", body), radix).ok()
    } else {
        i64::from_str_radix(body, radix).ok()
    }
}

/// Fold `terms` joined by `function` into a balanced tree of binary calls.
fn balance(function: &str, mut terms: Vec<Expr>) -> Expr {
    if terms.len() == 1 {
        return terms.remove(0);
    }
    let mut slots: Vec<Option<Expr>> = terms.into_iter().map(Some).collect();
    let ops = slots.len() - 1;
    balanced_tree(function, &mut slots, 0, ops - 1)
}

fn balanced_tree(function: &str, terms: &mut [Option<Expr>], lo: usize, hi: usize) -> Expr {
    let mid = (lo + hi + 1) / 2;
    let left = if mid == lo {
        take(terms, mid)
    } else {
        balanced_tree(function, terms, lo, mid - 1)
    };
    let right = if mid == hi {
        take(terms, mid + 1)
    } else {
        balanced_tree(function, terms, mid + 1, hi)
    };
    Expr::call(function, vec![left, right])
}

fn take(terms: &mut [Option<Expr>], index: usize) -> Expr {
    // Each term index is visited exactly once by balanced_tree.
    terms[index].take().unwrap_or(Expr::Literal(Literal::Null))
}
