//! DSL Parser - Tokens to Statements
//!
//! Recursive descent over the token stream. Set operators share one precedence
//! level and associate left, so `a | b - c` is `(a | b) - c`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{Arg, Expr, ExprKind, SetOp, Stmt, StmtKind};
use crate::lexer::{Comment, LexError, Span, Token, TokenKind, Tokenizer};

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("Parse error at {span}: {message}")]
pub struct ParseError {
    pub message: String,
    pub span: Span,
}

impl From<LexError> for ParseError {
    fn from(e: LexError) -> Self {
        Self {
            message: e.message,
            span: e.span,
        }
    }
}

/// A parsed source file
///
/// Statement-level syntax errors do not abort the parse: the offending
/// statement is kept as `StmtKind::Unparsed` and the error is recorded.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
    pub comments: Vec<Comment>,
    pub errors: Vec<ParseError>,
}

pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    let stream = Tokenizer::tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens: stream.tokens,
        pos: 0,
    };
    let mut errors = Vec::new();
    let statements = parser.parse_statements(&mut errors);
    Ok(Program {
        statements,
        comments: stream.comments,
        errors,
    })
}

/// Parse a single standalone expression (used for re-reading captured raw text).
pub fn parse_expression(source: &str) -> Result<Expr, ParseError> {
    let stream = Tokenizer::tokenize(source)?;
    let mut parser = Parser {
        source,
        tokens: stream.tokens,
        pos: 0,
    };
    parser.skip_newlines();
    let expr = parser.parse_expr()?;
    parser.skip_newlines();
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(Span::default(), |t| t.span)
    }

    fn current_line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn previous(&self) -> Option<&Token> {
        self.pos.checked_sub(1).and_then(|i| self.tokens.get(i))
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens.get(self.pos).cloned().unwrap_or(Token {
            kind: TokenKind::Eof,
            span: self.current_span(),
            line: self.current_line(),
        });
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError {
            message: message.into(),
            span: self.current_span(),
        })
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if *self.peek() == kind {
            Ok(self.advance())
        } else {
            self.error(format!("expected '{}', found '{}'", kind, self.peek()))
        }
    }

    fn expect_eof(&self) -> Result<(), ParseError> {
        match self.peek() {
            TokenKind::Eof => Ok(()),
            other => self.error(format!("unexpected '{}'", other)),
        }
    }

    /// Source between token `index` and the one before it spans a line break.
    fn line_break_before(&self, index: usize) -> bool {
        let (Some(prev), Some(cur)) = (
            index.checked_sub(1).and_then(|i| self.tokens.get(i)),
            self.tokens.get(index),
        ) else {
            return false;
        };
        self.source
            .get(prev.span.end..cur.span.start)
            .is_some_and(|gap| gap.contains('\n'))
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == TokenKind::Newline {
            self.advance();
        }
    }

    fn parse_statements(&mut self, errors: &mut Vec<ParseError>) -> Vec<Stmt> {
        let mut statements = Vec::new();
        loop {
            self.skip_newlines();
            if *self.peek() == TokenKind::Eof {
                break;
            }
            let start = self.pos;
            let result = self.parse_statement().and_then(|stmt| match self.peek() {
                TokenKind::Newline | TokenKind::Eof => Ok(stmt),
                // only reachable after an earlier statement left a bracket open
                _ if self.line_break_before(self.pos) => Ok(stmt),
                other => self.error(format!("expected end of statement, found '{}'", other)),
            });
            match result {
                Ok(stmt) => statements.push(stmt),
                Err(e) => {
                    errors.push(e);
                    statements.push(self.recover(start));
                }
            }
        }
        statements
    }

    /// Skip to the end of the current statement and cover it as unparsed.
    fn recover(&mut self, start: usize) -> Stmt {
        self.pos = start;
        let cut = self.unclosed_statement_end(start);
        let first = self.advance();
        let mut span = first.span;
        let mut end_line = first.line;
        while !matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) && Some(self.pos) != cut {
            let token = self.advance();
            span = span.merge(&token.span);
            end_line = token.line;
        }
        Stmt {
            kind: StmtKind::Unparsed,
            span,
            line: first.line,
            end_line,
        }
    }

    /// The lexer drops newlines inside brackets, so a bracket that never closes
    /// hides every later terminator. For such a statement, return the index of
    /// its first token on a following line.
    fn unclosed_statement_end(&self, start: usize) -> Option<usize> {
        let mut depth = 0i64;
        let mut cut = None;
        let mut index = start;
        while let Some(token) = self.tokens.get(index) {
            match token.kind {
                TokenKind::Newline | TokenKind::Eof => break,
                TokenKind::LParen | TokenKind::LBracket | TokenKind::LBrace => depth += 1,
                TokenKind::RParen | TokenKind::RBracket | TokenKind::RBrace => depth -= 1,
                _ => {}
            }
            index += 1;
            if cut.is_none() && depth > 0 && self.line_break_before(index) {
                cut = Some(index);
            }
        }
        if depth > 0 {
            cut
        } else {
            None
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        let start = self.current_span();

        let assigns = *self.peek_at(1) == TokenKind::Assign;
        if let (TokenKind::Ident(name), true) = (self.peek().clone(), assigns) {
            self.advance();
            self.advance();
            let value = self.parse_expr()?;
            let span = start.merge(&value.span);
            return Ok(Stmt {
                kind: StmtKind::Assign { name, value },
                span,
                line,
                end_line: self.previous().map_or(line, |t| t.line),
            });
        }

        let expr = self.parse_expr()?;
        Ok(Stmt {
            span: expr.span,
            kind: StmtKind::Expr(expr),
            line,
            end_line: self.previous().map_or(line, |t| t.line),
        })
    }

    pub(crate) fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Pipe => SetOp::Union,
                TokenKind::Minus => SetOp::Difference,
                TokenKind::Amp => SetOp::Intersection,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            let span = left.span.merge(&right.span);
            left = Expr {
                kind: ExprKind::BinOp {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if *self.peek() == TokenKind::Minus {
            let start = self.advance().span;
            let inner = self.parse_unary()?;
            let span = start.merge(&inner.span);
            return Ok(Expr {
                kind: ExprKind::Neg(Box::new(inner)),
                span,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let token = self.advance();
                    let TokenKind::Ident(field) = token.kind else {
                        return Err(ParseError {
                            message: "expected identifier after '.'".to_string(),
                            span: token.span,
                        });
                    };
                    let span = expr.span.merge(&token.span);
                    expr = match expr.kind {
                        ExprKind::Path(mut parts) => {
                            parts.push(field);
                            Expr {
                                kind: ExprKind::Path(parts),
                                span,
                            }
                        }
                        _ => {
                            return Err(ParseError {
                                message: "attribute access is only supported on names".to_string(),
                                span,
                            })
                        }
                    };
                }
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    let close = self.expect(TokenKind::RParen)?;
                    let span = expr.span.merge(&close.span);
                    expr = Expr {
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>, ParseError> {
        let mut args = Vec::new();
        let mut seen_keyword = false;
        while *self.peek() != TokenKind::RParen {
            let start = self.current_span();
            let assigns = *self.peek_at(1) == TokenKind::Assign;
            let name = match (self.peek().clone(), assigns) {
                (TokenKind::Ident(name), true) => {
                    self.advance();
                    self.advance();
                    seen_keyword = true;
                    Some(name)
                }
                _ => {
                    if seen_keyword {
                        return self.error("positional argument follows keyword argument");
                    }
                    None
                }
            };
            let value = self.parse_expr()?;
            let span = start.merge(&value.span);
            if let Some(ref n) = name {
                if args.iter().any(|a: &Arg| a.name.as_deref() == Some(n.as_str())) {
                    return Err(ParseError {
                        message: format!("duplicate keyword argument '{}'", n),
                        span,
                    });
                }
            }
            args.push(Arg { name, value, span });
            if *self.peek() == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        let span = token.span;
        let kind = match token.kind {
            TokenKind::Str(s) => {
                // adjacent string literals concatenate
                let mut s = s;
                let mut span = span;
                while let TokenKind::Str(next) = self.peek().clone() {
                    let t = self.advance();
                    s.push_str(&next);
                    span = span.merge(&t.span);
                }
                return Ok(Expr {
                    kind: ExprKind::Str(s),
                    span,
                });
            }
            TokenKind::Int(i) => ExprKind::Int(i),
            TokenKind::Float(f) => ExprKind::Float(f),
            TokenKind::Ident(name) => match name.as_str() {
                "true" | "True" => ExprKind::Bool(true),
                "false" | "False" => ExprKind::Bool(false),
                "null" | "None" => ExprKind::Null,
                _ => ExprKind::Path(vec![name]),
            },
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                let close = self.expect(TokenKind::RParen)?;
                return Ok(Expr {
                    kind: ExprKind::Group(Box::new(inner)),
                    span: span.merge(&close.span),
                });
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                while *self.peek() != TokenKind::RBracket {
                    items.push(self.parse_expr()?);
                    if *self.peek() == TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                let close = self.expect(TokenKind::RBracket)?;
                return Ok(Expr {
                    kind: ExprKind::List(items),
                    span: span.merge(&close.span),
                });
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                while *self.peek() != TokenKind::RBrace {
                    let key = self.parse_expr()?;
                    self.expect(TokenKind::Colon)?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if *self.peek() == TokenKind::Comma {
                        self.advance();
                    } else {
                        break;
                    }
                }
                let close = self.expect(TokenKind::RBrace)?;
                return Ok(Expr {
                    kind: ExprKind::Dict(entries),
                    span: span.merge(&close.span),
                });
            }
            other => {
                return Err(ParseError {
                    message: format!("unexpected '{}'", other),
                    span,
                })
            }
        };
        Ok(Expr { kind, span })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_expr(src: &str) -> Expr {
        let program = parse_program(src).unwrap();
        match program.statements.into_iter().next().unwrap().kind {
            StmtKind::Expr(e) => e,
            StmtKind::Assign { value, .. } => value,
            StmtKind::Unparsed => panic!("statement did not parse: {}", src),
        }
    }

    #[test]
    fn test_unclosed_bracket_does_not_swallow_rest() {
        let program =
            parse_program("flag(\"a\", gadm(\"X\")\nflag(\"b\", gadm(\"Y\"))\nzoom(2)").unwrap();
        assert_eq!(program.errors.len(), 1);
        assert_eq!(program.statements.len(), 3);
        assert!(matches!(program.statements[0].kind, StmtKind::Unparsed));
        assert_eq!(program.statements[0].end_line, 1);
        assert!(matches!(program.statements[1].kind, StmtKind::Expr(_)));
        assert!(matches!(program.statements[2].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn test_balanced_multiline_error_stays_one_statement() {
        let program = parse_program("flag(\"a\", [\n  1 +, 2])\nzoom(2)").unwrap();
        assert_eq!(program.errors.len(), 1);
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(program.statements[0].kind, StmtKind::Unparsed));
    }

    #[test]
    fn test_left_fold_of_set_operators() {
        let expr = first_expr(r#"gadm("A") | gadm("B") - gadm("C")"#);
        let ExprKind::BinOp { op, left, .. } = expr.kind else {
            panic!("expected binop");
        };
        assert_eq!(op, SetOp::Difference);
        assert!(matches!(left.kind, ExprKind::BinOp { op: SetOp::Union, .. }));
    }

    #[test]
    fn test_call_with_keyword_args() {
        let src = r#"point("Delhi", [28.6, 77.2], icon=Icon.builtin("star"))"#;
        let expr = first_expr(src);
        let (name, args) = expr.call_name().unwrap();
        assert_eq!(name, "point");
        assert_eq!(args.len(), 3);
        assert!(args[2].is_keyword("icon"));
        assert_eq!(
            args[2].value.span.slice(src),
            r#"Icon.builtin("star")"#
        );
    }

    #[test]
    fn test_assignment_and_statement_lines() {
        let program = parse_program("KURU = gadm(\"IND.1\")\n\nzoom(4)").unwrap();
        assert_eq!(program.statements.len(), 2);
        assert_eq!(program.statements[0].line, 1);
        assert_eq!(program.statements[1].line, 3);
        assert!(matches!(program.statements[0].kind, StmtKind::Assign { .. }));
    }

    #[test]
    fn test_negative_literals() {
        let expr = first_expr("[-1, -2.5]");
        assert_eq!(expr.to_literal().unwrap(), serde_json::json!([-1, -2.5]));
    }

    #[test]
    fn test_parse_error_has_span_and_recovers() {
        let src = "flag(\"A\",, )\nzoom(4)";
        let program = parse_program(src).unwrap();
        assert_eq!(program.errors.len(), 1);
        assert_eq!(program.errors[0].span.start, 9);
        assert_eq!(program.statements.len(), 2);
        assert_eq!(program.statements[0].kind, StmtKind::Unparsed);
        assert_eq!(program.statements[0].span.slice(src), "flag(\"A\",, )");
    }

    #[test]
    fn test_two_expressions_on_one_line_rejected() {
        assert_eq!(parse_program("zoom(4) zoom(5)").unwrap().errors.len(), 1);
        assert!(parse_program("zoom(4); zoom(5)").unwrap().errors.is_empty());
    }
}
