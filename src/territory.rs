//! Territory Expressions - Set Algebra over Regions
//!
//! A `TerritoryExpr` is a left-folded tree of leaves and set operations.
//! Stored form is a flat list of parts where the first part always carries
//! `union` and parenthesized right-hand operands nest as groups.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::{positional, Expr, ExprKind, SetOp};
use crate::hashing::canonical_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKind {
    /// Administrative boundary code, e.g. `IND.31`
    Gadm,
    /// Canonical JSON of a coordinate list
    Polygon,
    /// Reference to a named territory, possibly dotted through an import alias
    Named,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TerritoryLeaf {
    pub kind: LeafKind,
    /// Always non-empty; several values mean a union of all of them
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<TerritoryPart>", try_from = "Vec<TerritoryPart>")]
pub enum TerritoryExpr {
    Leaf(TerritoryLeaf),
    BinOp {
        op: SetOp,
        left: Box<TerritoryExpr>,
        right: Box<TerritoryExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartType {
    Gadm,
    Polygon,
    Named,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartValue {
    Values(Vec<String>),
    Parts(Vec<TerritoryPart>),
}

/// One operand of a stored territory expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritoryPart {
    pub op: SetOp,
    #[serde(rename = "type")]
    pub part_type: PartType,
    pub value: PartValue,
}

#[derive(Debug, Error)]
pub enum TerritoryError {
    #[error("Territory expression has no parts")]
    Empty,

    #[error("Territory part of type {0:?} has an invalid value")]
    InvalidPart(PartType),
}

impl TerritoryExpr {
    pub fn leaf(kind: LeafKind, value: impl Into<String>) -> Self {
        TerritoryExpr::Leaf(TerritoryLeaf {
            kind,
            values: vec![value.into()],
        })
    }

    pub fn gadm(code: impl Into<String>) -> Self {
        Self::leaf(LeafKind::Gadm, code)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::leaf(LeafKind::Named, name)
    }

    pub fn bin(op: SetOp, left: TerritoryExpr, right: TerritoryExpr) -> Self {
        TerritoryExpr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Every leaf in evaluation order.
    pub fn leaves(&self) -> Vec<&TerritoryLeaf> {
        match self {
            TerritoryExpr::Leaf(leaf) => vec![leaf],
            TerritoryExpr::BinOp { left, right, .. } => {
                let mut out = left.leaves();
                out.extend(right.leaves());
                out
            }
        }
    }

    /// Names this expression refers to (bare and dotted).
    pub fn referenced_names(&self) -> Vec<&str> {
        self.leaves()
            .into_iter()
            .filter(|l| l.kind == LeafKind::Named)
            .flat_map(|l| l.values.iter().map(String::as_str))
            .collect()
    }

    /// Collapse a run of two or more `union`-joined single-valued leaves of the
    /// same kind into one multi-valued leaf. Polygons are never merged.
    pub fn compress(self) -> Self {
        let mut operands = Vec::new();
        if !collect_union_chain(&self, &mut operands) || operands.len() < 2 {
            return self;
        }
        let kind = operands[0].kind;
        let mergeable = kind != LeafKind::Polygon
            && operands
                .iter()
                .all(|leaf| leaf.kind == kind && leaf.values.len() == 1);
        if !mergeable {
            return self;
        }
        let values = operands
            .iter()
            .flat_map(|leaf| leaf.values.iter().cloned())
            .collect();
        TerritoryExpr::Leaf(TerritoryLeaf { kind, values })
    }

    /// Render back to DSL text.
    pub fn to_source(&self) -> String {
        match self {
            TerritoryExpr::Leaf(leaf) => leaf_source(leaf),
            TerritoryExpr::BinOp { op, left, right } => {
                let rhs = match right.as_ref() {
                    TerritoryExpr::BinOp { .. } => format!("({})", right.to_source()),
                    TerritoryExpr::Leaf(leaf) => leaf_source(leaf),
                };
                format!("{} {} {}", left.to_source(), op.symbol(), rhs)
            }
        }
    }
}

fn collect_union_chain<'a>(expr: &'a TerritoryExpr, out: &mut Vec<&'a TerritoryLeaf>) -> bool {
    match expr {
        TerritoryExpr::Leaf(leaf) => {
            out.push(leaf);
            true
        }
        TerritoryExpr::BinOp {
            op: SetOp::Union,
            left,
            right,
        } => match right.as_ref() {
            TerritoryExpr::Leaf(leaf) => {
                let ok = collect_union_chain(left, out);
                out.push(leaf);
                ok
            }
            _ => false,
        },
        _ => false,
    }
}

fn single_source(kind: LeafKind, value: &str) -> String {
    match kind {
        LeafKind::Gadm => format!("gadm({})", quote(value)),
        LeafKind::Polygon => format!("polygon({})", value),
        LeafKind::Named => value.to_string(),
    }
}

fn leaf_source(leaf: &TerritoryLeaf) -> String {
    if leaf.values.len() == 1 {
        return single_source(leaf.kind, &leaf.values[0]);
    }
    let joined: Vec<String> = leaf
        .values
        .iter()
        .map(|v| single_source(leaf.kind, v))
        .collect();
    format!("({})", joined.join(" | "))
}

/// Quote a string as a DSL literal.
pub fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("\"{}\"", value))
}

// --- syntax tree -> territory ---------------------------------------------

/// Read an expression as a territory, or `None` when any operand is outside
/// the territory grammar. The top level is never compressed.
pub fn parse_territory(expr: &Expr) -> Option<TerritoryExpr> {
    match &expr.kind {
        ExprKind::BinOp { op, left, right } => Some(TerritoryExpr::bin(
            *op,
            parse_territory(left)?,
            parse_operand(right)?,
        )),
        _ => parse_operand(expr),
    }
}

fn parse_operand(expr: &Expr) -> Option<TerritoryExpr> {
    match &expr.kind {
        ExprKind::Path(parts) => Some(TerritoryExpr::named(parts.join("."))),
        ExprKind::Group(inner) => parse_territory(inner).map(TerritoryExpr::compress),
        ExprKind::Call { .. } => {
            let (name, args) = expr.call_name()?;
            if args.len() != 1 || args[0].name.is_some() {
                return None;
            }
            let arg = positional(args).next()?;
            match name.as_str() {
                "gadm" => match &arg.value.ungrouped().kind {
                    ExprKind::Str(code) => Some(TerritoryExpr::gadm(code.clone())),
                    _ => None,
                },
                "polygon" => {
                    let coords = arg.value.to_literal()?;
                    let text = canonical_json(&coords).ok()?;
                    Some(TerritoryExpr::leaf(LeafKind::Polygon, text))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

// --- stored parts form -------------------------------------------------------

fn leaf_part(op: SetOp, leaf: &TerritoryLeaf) -> TerritoryPart {
    let part_type = match leaf.kind {
        LeafKind::Gadm => PartType::Gadm,
        LeafKind::Polygon => PartType::Polygon,
        LeafKind::Named => PartType::Named,
    };
    TerritoryPart {
        op,
        part_type,
        value: PartValue::Values(leaf.values.clone()),
    }
}

fn to_parts(expr: &TerritoryExpr) -> Vec<TerritoryPart> {
    match expr {
        TerritoryExpr::Leaf(leaf) => vec![leaf_part(SetOp::Union, leaf)],
        TerritoryExpr::BinOp { op, left, right } => {
            let mut parts = to_parts(left);
            parts.push(match right.as_ref() {
                TerritoryExpr::Leaf(leaf) => leaf_part(*op, leaf),
                nested => TerritoryPart {
                    op: *op,
                    part_type: PartType::Group,
                    value: PartValue::Parts(to_parts(nested)),
                },
            });
            parts
        }
    }
}

fn part_term(part: TerritoryPart) -> Result<TerritoryExpr, TerritoryError> {
    let kind = match part.part_type {
        PartType::Gadm => LeafKind::Gadm,
        PartType::Polygon => LeafKind::Polygon,
        PartType::Named => LeafKind::Named,
        PartType::Group => {
            return match part.value {
                PartValue::Parts(parts) => Ok(from_parts(parts)?.compress()),
                PartValue::Values(v) if v.is_empty() => Err(TerritoryError::Empty),
                PartValue::Values(_) => Err(TerritoryError::InvalidPart(PartType::Group)),
            }
        }
    };
    match part.value {
        PartValue::Values(values) if !values.is_empty() => {
            Ok(TerritoryExpr::Leaf(TerritoryLeaf { kind, values }))
        }
        _ => Err(TerritoryError::InvalidPart(part.part_type)),
    }
}

fn from_parts(parts: Vec<TerritoryPart>) -> Result<TerritoryExpr, TerritoryError> {
    let mut iter = parts.into_iter();
    // The first part's op is ignored: it is the union anchor.
    let mut acc = part_term(iter.next().ok_or(TerritoryError::Empty)?)?;
    for part in iter {
        let op = part.op;
        acc = TerritoryExpr::bin(op, acc, part_term(part)?);
    }
    Ok(acc)
}

impl From<TerritoryExpr> for Vec<TerritoryPart> {
    fn from(expr: TerritoryExpr) -> Self {
        to_parts(&expr)
    }
}

impl TryFrom<Vec<TerritoryPart>> for TerritoryExpr {
    type Error = TerritoryError;

    fn try_from(parts: Vec<TerritoryPart>) -> Result<Self, Self::Error> {
        from_parts(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_expression;
    use pretty_assertions::assert_eq;

    fn territory(src: &str) -> TerritoryExpr {
        parse_territory(&parse_expression(src).unwrap()).unwrap()
    }

    #[test]
    fn test_left_to_right_fold() {
        let t = territory(r#"gadm("A") | gadm("B") - gadm("C")"#);
        let expected = TerritoryExpr::bin(
            SetOp::Difference,
            TerritoryExpr::bin(SetOp::Union, TerritoryExpr::gadm("A"), TerritoryExpr::gadm("B")),
            TerritoryExpr::gadm("C"),
        );
        assert_eq!(t, expected);
    }

    #[test]
    fn test_group_compression() {
        let t = territory(r#"KURU - (gadm("A") | gadm("B") | gadm("C"))"#);
        let TerritoryExpr::BinOp { right, .. } = t else {
            panic!("expected binop");
        };
        assert_eq!(
            *right,
            TerritoryExpr::Leaf(TerritoryLeaf {
                kind: LeafKind::Gadm,
                values: vec!["A".into(), "B".into(), "C".into()],
            })
        );
    }

    #[test]
    fn test_mixed_group_not_compressed() {
        let t = territory(r#"(gadm("A") | KURU)"#);
        assert!(matches!(t, TerritoryExpr::BinOp { .. }));
        let t = territory(r#"(gadm("A") - gadm("B"))"#);
        assert!(matches!(t, TerritoryExpr::BinOp { .. }));
    }

    #[test]
    fn test_top_level_chain_not_compressed() {
        let t = territory(r#"gadm("A") | gadm("B")"#);
        assert!(matches!(t, TerritoryExpr::BinOp { .. }));
    }

    #[test]
    fn test_non_territory_operand_rejected() {
        let e = parse_expression(r#"gadm("A") | foo(1)"#).unwrap();
        assert!(parse_territory(&e).is_none());
        let e = parse_expression(r#"gadm(code)"#).unwrap();
        assert!(parse_territory(&e).is_none());
    }

    #[test]
    fn test_parts_first_op_is_union() {
        let t = territory(r#"indic.KURU - gadm("B") & (gadm("C") - gadm("D"))"#);
        let parts: Vec<TerritoryPart> = t.clone().into();
        assert_eq!(parts[0].op, SetOp::Union);
        assert_eq!(parts[1].op, SetOp::Difference);
        assert_eq!(parts[2].part_type, PartType::Group);
        let back = TerritoryExpr::try_from(parts).unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn test_source_round_trip() {
        let src = r#"(gadm("A") | gadm("B")) - (X & polygon([[1, 2], [3, 4.5], [5, 6]])) | Y"#;
        let t = territory(src);
        let emitted = t.to_source();
        assert_eq!(territory(&emitted), t);
    }

    #[test]
    fn test_stored_json_shape() {
        let t = territory(r#"gadm("A") - (gadm("B") | gadm("C"))"#);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                {"op": "union", "type": "gadm", "value": ["A"]},
                {"op": "difference", "type": "gadm", "value": ["B", "C"]}
            ])
        );
    }
}
