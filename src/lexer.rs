//! DSL Tokenizer - Source Text to Spanned Tokens
//!
//! Newlines are significant only outside brackets. Comments are not part of the
//! token stream; they are collected separately with their positions so the
//! transpiler can attribute them to neighbouring statements.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Source span (byte offsets into the original text)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Slice the exact source text covered by this span.
    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        source.get(self.start..self.end).unwrap_or("")
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,
    Pipe,
    Minus,
    Amp,
    /// Any other punctuation; never valid in an expression
    Symbol(char),
    /// Statement terminator: a newline outside brackets or `;`
    Newline,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "{}", s),
            TokenKind::Str(s) => write!(f, "{:?}", s),
            TokenKind::Int(i) => write!(f, "{}", i),
            TokenKind::Float(x) => write!(f, "{}", x),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::LBracket => write!(f, "["),
            TokenKind::RBracket => write!(f, "]"),
            TokenKind::LBrace => write!(f, "{{"),
            TokenKind::RBrace => write!(f, "}}"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Dot => write!(f, "."),
            TokenKind::Assign => write!(f, "="),
            TokenKind::Pipe => write!(f, "|"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Amp => write!(f, "&"),
            TokenKind::Symbol(c) => write!(f, "{}", c),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// 1-based line of the token start
    pub line: usize,
}

/// A `#` comment with its position; `text` includes the leading `#`.
#[derive(Debug, Clone, PartialEq)]
pub struct Comment {
    pub text: String,
    pub span: Span,
    pub line: usize,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message} at {span}")]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

/// Output of a full tokenization pass
#[derive(Debug, Clone, Default)]
pub struct TokenStream {
    pub tokens: Vec<Token>,
    pub comments: Vec<Comment>,
}

pub struct Tokenizer<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    depth: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
            line: 1,
            depth: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(input: &str) -> Result<TokenStream, LexError> {
        let mut tokenizer = Tokenizer::new(input);
        let mut stream = TokenStream::default();

        loop {
            let token = tokenizer.next_token(&mut stream.comments)?;
            let is_eof = token.kind == TokenKind::Eof;
            // Collapse runs of terminators so the parser sees at most one.
            let redundant = token.kind == TokenKind::Newline
                && stream
                    .tokens
                    .last()
                    .map_or(true, |t| t.kind == TokenKind::Newline);
            if !redundant {
                stream.tokens.push(token);
            }
            if is_eof {
                break;
            }
        }

        Ok(stream)
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map_or(self.input.len(), |(i, _)| *i)
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_second(&self) -> Option<char> {
        let mut it = self.chars.clone();
        it.next();
        it.next().map(|(_, c)| c)
    }

    fn bump(&mut self) -> Option<char> {
        let (_, c) = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn next_token(&mut self, comments: &mut Vec<Comment>) -> Result<Token, LexError> {
        loop {
            match self.peek_char() {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.bump();
                }
                Some('\\') if self.peek_second() == Some('\n') => {
                    // explicit line continuation
                    self.bump();
                    self.bump();
                }
                Some('\n') if self.depth > 0 => {
                    self.bump();
                }
                Some('#') => {
                    let start = self.pos();
                    let line = self.line;
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                    let end = self.pos();
                    let text = self.input[start..end].trim_end().to_string();
                    comments.push(Comment {
                        text,
                        span: Span::new(start, end),
                        line,
                    });
                }
                _ => break,
            }
        }

        let start = self.pos();
        let line = self.line;
        let Some(c) = self.peek_char() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                span: Span::new(start, start),
                line,
            });
        };

        let kind = match c {
            '\n' | ';' => {
                self.bump();
                TokenKind::Newline
            }
            '(' | '[' | '{' => {
                self.bump();
                self.depth += 1;
                match c {
                    '(' => TokenKind::LParen,
                    '[' => TokenKind::LBracket,
                    _ => TokenKind::LBrace,
                }
            }
            ')' | ']' | '}' => {
                self.bump();
                self.depth = self.depth.saturating_sub(1);
                match c {
                    ')' => TokenKind::RParen,
                    ']' => TokenKind::RBracket,
                    _ => TokenKind::RBrace,
                }
            }
            ',' => {
                self.bump();
                TokenKind::Comma
            }
            ':' => {
                self.bump();
                TokenKind::Colon
            }
            '=' => {
                self.bump();
                TokenKind::Assign
            }
            '|' => {
                self.bump();
                TokenKind::Pipe
            }
            '-' => {
                self.bump();
                TokenKind::Minus
            }
            '&' => {
                self.bump();
                TokenKind::Amp
            }
            '.' if !self.peek_second().is_some_and(|d| d.is_ascii_digit()) => {
                self.bump();
                TokenKind::Dot
            }
            '"' | '\'' => self.read_string(c)?,
            c if c.is_ascii_digit() || c == '.' => self.read_number()?,
            c if c.is_alphabetic() || c == '_' => self.read_ident(),
            other => {
                self.bump();
                TokenKind::Symbol(other)
            }
        };

        Ok(Token {
            kind,
            span: Span::new(start, self.pos()),
            line,
        })
    }

    fn read_ident(&mut self) -> TokenKind {
        let mut ident = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                ident.push(c);
                self.bump();
            } else {
                break;
            }
        }
        TokenKind::Ident(ident)
    }

    fn read_number(&mut self) -> Result<TokenKind, LexError> {
        let start = self.pos();
        let mut is_float = false;
        while let Some(c) = self.peek_char() {
            match c {
                '0'..='9' | '_' => {
                    self.bump();
                }
                '.' if !is_float => {
                    is_float = true;
                    self.bump();
                }
                'e' | 'E' => {
                    is_float = true;
                    self.bump();
                    if matches!(self.peek_char(), Some('+') | Some('-')) {
                        self.bump();
                    }
                }
                _ => break,
            }
        }
        let text: String = self.input[start..self.pos()]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let span = Span::new(start, self.pos());
        if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| LexError {
                    message: format!("invalid number '{}'", text),
                    span,
                })
        } else {
            text.parse::<i64>().map(TokenKind::Int).map_err(|_| LexError {
                message: format!("invalid integer '{}'", text),
                span,
            })
        }
    }

    fn read_string(&mut self, quote: char) -> Result<TokenKind, LexError> {
        let start = self.pos();
        self.bump();
        let triple = self.peek_char() == Some(quote) && self.peek_second() == Some(quote);
        if triple {
            self.bump();
            self.bump();
        } else if self.peek_char() == Some(quote) {
            // empty string
            self.bump();
            return Ok(TokenKind::Str(String::new()));
        }

        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(LexError {
                    message: "unterminated string literal".to_string(),
                    span: Span::new(start, self.pos()),
                });
            };
            match c {
                '\\' => {
                    let escaped = self.read_escape(start)?;
                    out.push_str(&escaped);
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek_char() == Some(quote) && self.peek_second() == Some(quote) {
                        self.bump();
                        self.bump();
                        break;
                    }
                    out.push(c);
                }
                '\n' if !triple => {
                    return Err(LexError {
                        message: "newline in string literal".to_string(),
                        span: Span::new(start, self.pos()),
                    });
                }
                c => out.push(c),
            }
        }
        Ok(TokenKind::Str(out))
    }

    fn read_escape(&mut self, start: usize) -> Result<String, LexError> {
        let err = |this: &mut Self, msg: &str| LexError {
            message: msg.to_string(),
            span: Span::new(start, this.pos()),
        };
        let Some(c) = self.bump() else {
            return Err(err(self, "unterminated escape"));
        };
        let s = match c {
            'n' => "\n".to_string(),
            't' => "\t".to_string(),
            'r' => "\r".to_string(),
            'b' => "\u{8}".to_string(),
            'f' => "\u{c}".to_string(),
            '0' => "\0".to_string(),
            '\\' | '"' | '\'' | '/' => c.to_string(),
            '\n' => String::new(),
            'u' => {
                let first = self.read_hex4(start)?;
                let code = if (0xD800..0xDC00).contains(&first) {
                    // surrogate pair
                    if self.bump() != Some('\\') || self.bump() != Some('u') {
                        return Err(err(self, "unpaired surrogate in escape"));
                    }
                    let second = self.read_hex4(start)?;
                    0x10000 + ((first - 0xD800) << 10) + (second.wrapping_sub(0xDC00) & 0x3FF)
                } else {
                    first
                };
                char::from_u32(code)
                    .map(|ch| ch.to_string())
                    .ok_or_else(|| err(self, "invalid unicode escape"))?
            }
            other => format!("\\{}", other),
        };
        Ok(s)
    }

    fn read_hex4(&mut self, start: usize) -> Result<u32, LexError> {
        let mut value = 0u32;
        for _ in 0..4 {
            let digit = self.bump().and_then(|c| c.to_digit(16)).ok_or_else(|| LexError {
                message: "invalid \\u escape".to_string(),
                span: Span::new(start, self.pos()),
            })?;
            value = value * 16 + digit;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Tokenizer::tokenize(src)
            .unwrap()
            .tokens
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_newlines_suppressed_inside_brackets() {
        let toks = kinds("flag(\n  \"A\",\n  x\n)\nzoom(4)");
        assert!(!toks[..toks.len() - 6].contains(&TokenKind::Newline));
        assert_eq!(toks.iter().filter(|k| **k == TokenKind::Newline).count(), 1);
    }

    #[test]
    fn test_comments_collected_with_lines() {
        let stream = Tokenizer::tokenize("# one\nzoom(4) # two\n").unwrap();
        assert_eq!(stream.comments.len(), 2);
        assert_eq!(stream.comments[0].text, "# one");
        assert_eq!(stream.comments[0].line, 1);
        assert_eq!(stream.comments[1].line, 2);
    }

    #[test]
    fn test_string_escapes_and_triple_quotes() {
        let toks = kinds(r#""a\"b\n" '''x'y''' """multi
line""""#);
        assert_eq!(toks[0], TokenKind::Str("a\"b\n".to_string()));
        assert_eq!(toks[1], TokenKind::Str("x'y".to_string()));
        assert_eq!(toks[2], TokenKind::Str("multi\nline".to_string()));
    }

    #[test]
    fn test_numbers() {
        let toks = kinds("4 2.5 1e3 .5");
        assert_eq!(toks[0], TokenKind::Int(4));
        assert_eq!(toks[1], TokenKind::Float(2.5));
        assert_eq!(toks[2], TokenKind::Float(1000.0));
        assert_eq!(toks[3], TokenKind::Float(0.5));
    }

    #[test]
    fn test_unknown_punctuation_is_a_symbol() {
        let toks = kinds("a + b");
        assert_eq!(toks[1], TokenKind::Symbol('+'));
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = Tokenizer::tokenize("flag(\"abc").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }
}
