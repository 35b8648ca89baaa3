//! DSL Syntax Tree
//!
//! Every node carries its source span so unmodelled expressions can be
//! captured verbatim.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::lexer::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetOp {
    Union,
    Difference,
    Intersection,
}

impl SetOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            SetOp::Union => "|",
            SetOp::Difference => "-",
            SetOp::Intersection => "&",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    /// Bare or dotted identifier, e.g. `indian.KURU`
    Path(Vec<String>),
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
    BinOp {
        op: SetOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
    /// Parenthesized sub-expression; kept so territory grouping survives parsing
    Group(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: Option<String>,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign { name: String, value: Expr },
    Expr(Expr),
    /// A statement the parser could not read; kept as source text
    Unparsed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
    pub line: usize,
    pub end_line: usize,
}

impl Expr {
    /// Dotted path text when this is a plain path expression.
    pub fn path_name(&self) -> Option<String> {
        match &self.kind {
            ExprKind::Path(parts) => Some(parts.join(".")),
            _ => None,
        }
    }

    /// Name of the callee when this is a call through a plain path.
    pub fn call_name(&self) -> Option<(String, &[Arg])> {
        match &self.kind {
            ExprKind::Call { callee, args } => callee.path_name().map(|n| (n, args.as_slice())),
            _ => None,
        }
    }

    /// Strip redundant parentheses.
    pub fn ungrouped(&self) -> &Expr {
        match &self.kind {
            ExprKind::Group(inner) => inner.ungrouped(),
            _ => self,
        }
    }

    /// Reduce to a JSON literal when the expression contains nothing but literals.
    pub fn to_literal(&self) -> Option<Value> {
        match &self.kind {
            ExprKind::Str(s) => Some(Value::String(s.clone())),
            ExprKind::Int(i) => Some(Value::Number((*i).into())),
            ExprKind::Float(f) => Number::from_f64(*f).map(Value::Number),
            ExprKind::Bool(b) => Some(Value::Bool(*b)),
            ExprKind::Null => Some(Value::Null),
            ExprKind::List(items) => items
                .iter()
                .map(Expr::to_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            ExprKind::Dict(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    let ExprKind::Str(key) = &k.ungrouped().kind else {
                        return None;
                    };
                    map.insert(key.clone(), v.to_literal()?);
                }
                Some(Value::Object(map))
            }
            ExprKind::Neg(inner) => match &inner.ungrouped().kind {
                ExprKind::Int(i) => Some(Value::Number((-*i).into())),
                ExprKind::Float(f) => Number::from_f64(-*f).map(Value::Number),
                _ => None,
            },
            ExprKind::Group(inner) => inner.to_literal(),
            _ => None,
        }
    }
}

impl Arg {
    pub fn is_keyword(&self, name: &str) -> bool {
        self.name.as_deref() == Some(name)
    }
}

/// Positional arguments in order.
pub fn positional(args: &[Arg]) -> impl Iterator<Item = &Arg> {
    args.iter().filter(|a| a.name.is_none())
}

/// Keyword argument lookup.
pub fn keyword<'a>(args: &'a [Arg], name: &str) -> Option<&'a Arg> {
    args.iter().find(|a| a.is_keyword(name))
}
