//! CEL tokenizer

use std::fmt;

use crate::error::ParseError;

const RESERVED: &[&str] = &[
    "as", "break", "const", "continue", "else", "for", "function", "if", "import", "let", "loop",
    "package", "namespace", "return", "var", "void", "while",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    /// Decimal or `0x` digits, unsigned; the parser applies the sign.
    Int(String),
    Uint(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    True,
    False,
    Null,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Question,
    Colon,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Token::Ident(name) => return write!(f, "'{}'", name),
            Token::Int(digits) => return write!(f, "'{}'", digits),
            Token::Uint(v) => return write!(f, "'{}u'", v),
            Token::Double(v) => return write!(f, "'{}'", v),
            Token::Str(s) => return write!(f, "{:?}", s),
            Token::Bytes(_) => "bytes literal",
            Token::True => "'true'",
            Token::False => "'false'",
            Token::Null => "'null'",
            Token::In => "'in'",
            Token::Eq => "'=='",
            Token::Ne => "'!='",
            Token::Lt => "'<'",
            Token::Le => "'<='",
            Token::Gt => "'>'",
            Token::Ge => "'>='",
            Token::And => "'&&'",
            Token::Or => "'||'",
            Token::Not => "'!'",
            Token::Plus => "'+'",
            Token::Minus => "'-'",
            Token::Star => "'*'",
            Token::Slash => "'/'",
            Token::Percent => "'%'",
            Token::Question => "'?'",
            Token::Colon => "':'",
            Token::Dot => "'.'",
            Token::Comma => "','",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::LBracket => "'['",
            Token::RBracket => "']'",
            Token::LBrace => "'{'",
            Token::RBrace => "'}'",
            Token::Eof => "<EOF>",
        };
        f.write_str(text)
    }
}

/// Token with its 1-based start position.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
    pub column: usize,
}

impl Spanned {
    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, self.column, message)
    }
}

/// Tokenize `input`; the result always ends with `Token::Eof`.
pub fn tokenize(input: &str) -> Result<Vec<Spanned>, ParseError> {
    Lexer::new(input).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

/// One decoded escape sequence.
enum Escaped {
    Char(char),
    Byte(u8),
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.line, self.column, message)
    }

    fn run(mut self) -> Result<Vec<Spanned>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let (line, column) = (self.line, self.column);
            let token = match self.peek() {
                None => {
                    tokens.push(Spanned {
                        token: Token::Eof,
                        line,
                        column,
                    });
                    return Ok(tokens);
                }
                Some(c) => self.next_token(c)?,
            };
            tokens.push(Spanned {
                token,
                line,
                column,
            });
        }
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0c') {
                self.bump();
            } else if c == '/' && self.peek_at(1) == Some('/') {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn next_token(&mut self, c: char) -> Result<Token, ParseError> {
        if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit())) {
            return self.number();
        }
        if c == '"' || c == '\'' {
            return self.string(false, false);
        }
        if c == '_' || c.is_ascii_alphabetic() {
            if let Some((raw, bytes, skip)) = self.string_prefix() {
                for _ in 0..skip {
                    self.bump();
                }
                return self.string(raw, bytes);
            }
            return self.word();
        }

        let two = (c, self.peek_at(1));
        let (token, width) = match two {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            ('}', _) => (Token::RBrace, 1),
            ('=', _) => return Err(self.error("token recognition error at: '=' (use '==')")),
            _ => return Err(self.error(format!("token recognition error at: '{}'", c))),
        };
        for _ in 0..width {
            self.bump();
        }
        Ok(token)
    }

    /// Detect `r"..."`, `b'...'`, `rb"..."`, `BR'...'` prefixes.
    /// Returns (raw, bytes, prefix length).
    fn string_prefix(&self) -> Option<(bool, bool, usize)> {
        let first = self.peek()?.to_ascii_lowercase();
        let second = self.peek_at(1);
        let is_quote = |c: Option<char>| matches!(c, Some('"') | Some('\''));
        match first {
            'r' | 'b' if is_quote(second) => Some((first == 'r', first == 'b', 1)),
            'r' | 'b' => {
                let second = second?.to_ascii_lowercase();
                if second != first && matches!(second, 'r' | 'b') && is_quote(self.peek_at(2)) {
                    Some((true, true, 2))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn word(&mut self) -> Result<Token, ParseError> {
        let (line, column) = (self.line, self.column);
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c == '_' || c.is_ascii_alphanumeric() {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        Ok(match word.as_str() {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "in" => Token::In,
            w if RESERVED.contains(&w) => {
                return Err(ParseError::new(
                    line,
                    column,
                    format!("reserved identifier: {}", w),
                ))
            }
            _ => Token::Ident(word),
        })
    }

    fn digits(&mut self, out: &mut String, radix: u32) {
        while let Some(c) = self.peek() {
            if c.is_digit(radix) {
                out.push(c);
                self.bump();
            } else {
                break;
            }
        }
    }

    fn number(&mut self) -> Result<Token, ParseError> {
        let (line, column) = (self.line, self.column);
        let error = |message: String| ParseError::new(line, column, message);

        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x') | Some('X')) {
            self.bump();
            self.bump();
            let mut hex = String::new();
            self.digits(&mut hex, 16);
            if hex.is_empty() {
                return Err(error("invalid hex literal".into()));
            }
            if matches!(self.peek(), Some('u') | Some('U')) {
                self.bump();
                return u64::from_str_radix(&hex, 16)
                    .map(Token::Uint)
                    .map_err(|_| error(format!("invalid uint literal: 0x{}", hex)));
            }
            return Ok(Token::Int(format!("0x{}", hex)));
        }

        let mut text = String::new();
        self.digits(&mut text, 10);
        let mut is_float = false;

        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            text.push('.');
            self.bump();
            self.digits(&mut text, 10);
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = self.peek_at(1);
            let digit_at = if matches!(sign, Some('+') | Some('-')) { 2 } else { 1 };
            if self.peek_at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                text.push('e');
                self.bump();
                if digit_at == 2 {
                    if let Some(sign) = self.bump() {
                        text.push(sign);
                    }
                }
                self.digits(&mut text, 10);
            }
        }

        if is_float {
            return text
                .parse::<f64>()
                .map(Token::Double)
                .map_err(|_| error(format!("invalid double literal: {}", text)));
        }
        if matches!(self.peek(), Some('u') | Some('U')) {
            self.bump();
            return text
                .parse::<u64>()
                .map(Token::Uint)
                .map_err(|_| error(format!("invalid uint literal: {}", text)));
        }
        Ok(Token::Int(text))
    }

    fn string(&mut self, raw: bool, bytes: bool) -> Result<Token, ParseError> {
        let (line, column) = (self.line, self.column);
        let quote = self.bump().ok_or_else(|| self.error("unexpected end of input"))?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut text = String::new();
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(ParseError::new(line, column, "unterminated string literal"));
            };
            if c == quote {
                if !triple {
                    self.bump();
                    break;
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.bump();
                    self.bump();
                    self.bump();
                    break;
                }
            }
            if !triple && (c == '\n' || c == '\r') {
                return Err(ParseError::new(line, column, "unterminated string literal"));
            }
            self.bump();

            let piece = if c == '\\' && !raw {
                self.escape(bytes)?
            } else {
                Escaped::Char(c)
            };
            match (piece, bytes) {
                (Escaped::Char(ch), true) => {
                    let mut utf8 = [0u8; 4];
                    buf.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                }
                (Escaped::Byte(b), true) => buf.push(b),
                (Escaped::Char(ch), false) => text.push(ch),
                (Escaped::Byte(b), false) => text.push(char::from(b)),
            }
        }

        Ok(if bytes { Token::Bytes(buf) } else { Token::Str(text) })
    }

    fn escape(&mut self, bytes: bool) -> Result<Escaped, ParseError> {
        let c = self.bump().ok_or_else(|| self.error("unterminated escape sequence"))?;
        let simple = match c {
            'a' => Some('\x07'),
            'b' => Some('\x08'),
            'f' => Some('\x0c'),
            'n' => Some('\n'),
            'r' => Some('\r'),
            't' => Some('\t'),
            'v' => Some('\x0b'),
            '\\' | '\'' | '"' | '`' | '?' => Some(c),
            _ => None,
        };
        if let Some(ch) = simple {
            return Ok(Escaped::Char(ch));
        }

        match c {
            'x' | 'X' => {
                let value = self.hex_digits(2)?;
                if bytes {
                    Ok(Escaped::Byte(value as u8))
                } else {
                    char::from_u32(value)
                        .map(Escaped::Char)
                        .ok_or_else(|| self.error("invalid escape sequence"))
                }
            }
            'u' | 'U' if !bytes => {
                let width = if c == 'u' { 4 } else { 8 };
                let value = self.hex_digits(width)?;
                char::from_u32(value)
                    .map(Escaped::Char)
                    .ok_or_else(|| self.error("invalid unicode code point"))
            }
            '0'..='3' => {
                let mut value = c.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    let digit = self
                        .bump()
                        .and_then(|d| d.to_digit(8))
                        .ok_or_else(|| self.error("invalid octal escape sequence"))?;
                    value = value * 8 + digit;
                }
                if bytes {
                    Ok(Escaped::Byte(value as u8))
                } else {
                    char::from_u32(value)
                        .map(Escaped::Char)
                        .ok_or_else(|| self.error("invalid escape sequence"))
                }
            }
            _ => Err(self.error(format!("invalid escape sequence: \\{}", c))),
        }
    }

    fn hex_digits(&mut self, count: usize) -> Result<u32, ParseError> {
        let mut value = 0u32;
        for _ in 0..count {
            let digit = self
                .bump()
                .and_then(|d| d.to_digit(16))
                .ok_or_else(|| self.error("invalid hex escape sequence"))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<Token> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn operators_and_words() {
        assert_eq!(
            kinds("a == 1 && !(b in [x]) || c >= 2.5"),
            vec![
                Token::Ident("a".into()),
                Token::Eq,
                Token::Int("1".into()),
                Token::And,
                Token::Not,
                Token::LParen,
                Token::Ident("b".into()),
                Token::In,
                Token::LBracket,
                Token::Ident("x".into()),
                Token::RBracket,
                Token::RParen,
                Token::Or,
                Token::Ident("c".into()),
                Token::Ge,
                Token::Double(2.5),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(kinds("42u")[0], Token::Uint(42));
        assert_eq!(kinds("0xFF")[0], Token::Int("0xFF".into()));
        assert_eq!(kinds("0x10u")[0], Token::Uint(16));
        assert_eq!(kinds("1e3")[0], Token::Double(1000.0));
        assert_eq!(kinds(".5")[0], Token::Double(0.5));
        assert_eq!(kinds("2E-1")[0], Token::Double(0.2));
    }

    #[test]
    fn string_literals() {
        assert_eq!(kinds(r#""a\"b""#)[0], Token::Str("a\"b".into()));
        assert_eq!(kinds(r"'tab\there'")[0], Token::Str("tab\there".into()));
        assert_eq!(kinds(r"r'\d+'")[0], Token::Str(r"\d+".into()));
        assert_eq!(kinds(r#""\x41é\101""#)[0], Token::Str("AéA".into()));
        assert_eq!(kinds("'''multi\nline'''")[0], Token::Str("multi\nline".into()));
        assert_eq!(kinds(r"b'\xff'")[0], Token::Bytes(vec![0xff]));
        assert_eq!(kinds("rb'a'")[0], Token::Bytes(b"a".to_vec()));
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("a // trailing\n== 'b'"),
            vec![
                Token::Ident("a".into()),
                Token::Eq,
                Token::Str("b".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn positions_track_lines() {
        let tokens = tokenize("a ==\n  'b'").unwrap();
        assert_eq!((tokens[2].line, tokens[2].column), (2, 3));
    }

    #[test]
    fn rejects_bad_input() {
        let err = tokenize("a = 1").unwrap_err();
        assert_eq!((err.line, err.column), (1, 3));
        assert!(tokenize("'open").is_err());
        assert!(tokenize("'a\nb'").is_err());
        assert!(tokenize(r"'\q'").is_err());
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("if == 1").unwrap_err().message.contains("reserved"));
    }
}
