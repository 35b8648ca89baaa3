//! Territory Algebra Evaluator
//!
//! Resolves named territories to geometry inside an arena of scopes (the job's
//! own source plus every imported artifact). Evaluation is lazy and memoized
//! per `(scope, name)`; a name that is re-entered while being resolved is a
//! self-cycle and contributes nothing.
//!
//! Failures are best-effort: a leaf the provider cannot resolve is skipped
//! with a diagnostic instead of failing the territory.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::ast::{Expr, ExprKind, SetOp};
use crate::diagnostics::{Diagnostic, ErrorKind};
use crate::geometry::{Geometry, GeometryProvider};
use crate::ir::BuilderIR;
use crate::store::ArtifactKey;
use crate::territory::{LeafKind, TerritoryExpr, TerritoryLeaf};
use crate::transpile::icon_descriptor;

pub type ScopeId = usize;

/// Names visible to one source unit.
#[derive(Debug, Default)]
pub struct Scope {
    pub origin: Option<ArtifactKey>,
    territories: HashMap<String, TerritoryExpr>,
    constants: HashMap<String, Value>,
    /// `None` marks an import that failed or was cut by the cycle guard
    aliases: HashMap<String, Option<ScopeId>>,
    /// Bare library imports whose names are visible unqualified
    globs: Vec<ScopeId>,
    /// Definition order, for listing
    names: Vec<String>,
}

pub struct Evaluator<'a> {
    provider: &'a dyn GeometryProvider,
    scopes: Vec<Scope>,
    memo: HashMap<(ScopeId, String), Geometry>,
    resolving: HashSet<(ScopeId, String)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Evaluator<'a> {
    pub fn new(provider: &'a dyn GeometryProvider) -> Self {
        Self {
            provider,
            scopes: Vec::new(),
            memo: HashMap::new(),
            resolving: HashSet::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Register the definitions of one IR as a new scope.
    pub fn add_scope(&mut self, origin: Option<ArtifactKey>, ir: &BuilderIR) -> ScopeId {
        let mut scope = Scope {
            origin,
            ..Scope::default()
        };
        for def in &ir.territories {
            if scope.territories.insert(def.name.clone(), def.expr.clone()).is_none() {
                scope.names.push(def.name.clone());
            }
        }
        for constant in &ir.constants {
            scope
                .constants
                .insert(constant.name.clone(), constant.value.clone());
        }
        self.scopes.push(scope);
        self.scopes.len() - 1
    }

    pub fn bind_alias(&mut self, scope: ScopeId, alias: &str, target: Option<ScopeId>) {
        if let Some(s) = self.scopes.get_mut(scope) {
            s.aliases.insert(alias.to_string(), target);
        }
    }

    pub fn add_glob(&mut self, scope: ScopeId, target: ScopeId) {
        if let Some(s) = self.scopes.get_mut(scope) {
            if !s.globs.contains(&target) {
                s.globs.push(target);
            }
        }
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id)
    }

    /// Territory names defined directly in a scope, in definition order.
    pub fn territory_names(&self, scope: ScopeId) -> Vec<String> {
        self.scopes
            .get(scope)
            .map(|s| s.names.clone())
            .unwrap_or_default()
    }

    pub fn constant(&self, scope: ScopeId, name: &str) -> Option<&Value> {
        let (target, local) = self.locate(scope, name)?;
        let mut visited = HashSet::new();
        self.find_in(target, local, &mut visited, |s, n| s.constants.get(n))
    }

    pub fn diagnose(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    fn origin_label(&self, scope: ScopeId) -> Option<String> {
        self.scopes
            .get(scope)
            .and_then(|s| s.origin.as_ref())
            .map(ToString::to_string)
    }

    fn warn_in(&mut self, scope: ScopeId, kind: ErrorKind, message: String) {
        let mut diagnostic = Diagnostic::warning(kind, message);
        if let Some(origin) = self.origin_label(scope) {
            diagnostic = diagnostic.in_artifact(origin);
        }
        self.diagnostics.push(diagnostic);
    }

    /// Follow alias prefixes of a dotted name to the scope that owns the last segment.
    fn locate<'n>(&self, scope: ScopeId, name: &'n str) -> Option<(ScopeId, &'n str)> {
        let mut current = scope;
        let mut rest = name;
        while let Some((ns, tail)) = rest.split_once('.') {
            let binding = self.scopes.get(current)?.aliases.get(ns)?;
            current = (*binding)?;
            rest = tail;
        }
        Some((current, rest))
    }

    /// Search a scope and, failing that, its globs.
    fn find_in<'s, T>(
        &'s self,
        scope: ScopeId,
        name: &str,
        visited: &mut HashSet<ScopeId>,
        get: impl Fn(&'s Scope, &str) -> Option<&'s T> + Copy,
    ) -> Option<&'s T> {
        if !visited.insert(scope) {
            return None;
        }
        let s = self.scopes.get(scope)?;
        if let Some(found) = get(s, name) {
            return Some(found);
        }
        s.globs
            .iter()
            .find_map(|g| self.find_in(*g, name, visited, get))
    }

    /// Scope that defines territory `name` as seen from `scope`.
    fn owner_of(&self, scope: ScopeId, name: &str) -> Option<ScopeId> {
        let mut visited = HashSet::new();
        self.owner_in(scope, name, &mut visited)
    }

    fn owner_in(&self, scope: ScopeId, name: &str, visited: &mut HashSet<ScopeId>) -> Option<ScopeId> {
        if !visited.insert(scope) {
            return None;
        }
        let s = self.scopes.get(scope)?;
        if s.territories.contains_key(name) {
            return Some(scope);
        }
        s.globs.iter().find_map(|g| self.owner_in(*g, name, visited))
    }

    /// Resolve a (possibly dotted) territory name. Unknown names and cycles
    /// resolve to empty geometry with a diagnostic.
    pub fn resolve(&mut self, name: &str, scope: ScopeId) -> Geometry {
        self.resolve_name(name, scope).unwrap_or_default()
    }

    fn resolve_name(&mut self, name: &str, scope: ScopeId) -> Option<Geometry> {
        let Some((target, local)) = self.locate(scope, name) else {
            self.warn_in(
                scope,
                ErrorKind::Evaluation,
                format!("Unresolved namespace in territory reference '{}'", name),
            );
            return None;
        };
        let Some(owner) = self.owner_of(target, local) else {
            warn!(territory = name, "unknown territory reference");
            self.warn_in(
                scope,
                ErrorKind::Evaluation,
                format!("Unknown territory '{}'", name),
            );
            return None;
        };

        let key = (owner, local.to_string());
        if let Some(geometry) = self.memo.get(&key) {
            return Some(geometry.clone());
        }
        if self.resolving.contains(&key) {
            warn!(territory = local, scope = owner, "self-referential territory");
            self.warn_in(
                owner,
                ErrorKind::Evaluation,
                format!("Territory '{}' refers to itself; treated as empty", local),
            );
            return None;
        }

        let expr = self.scopes.get(owner)?.territories.get(local)?.clone();
        self.resolving.insert(key.clone());
        let geometry = self.evaluate(&expr, owner).unwrap_or_default();
        self.resolving.remove(&key);
        debug!(territory = local, scope = owner, units = geometry.units.len(), "resolved territory");
        self.memo.insert(key, geometry.clone());
        Some(geometry)
    }

    /// Evaluate an expression tree; the result is empty if every leaf was skipped.
    pub fn eval_territory(&mut self, expr: &TerritoryExpr, scope: ScopeId) -> Geometry {
        self.evaluate(expr, scope).unwrap_or_default()
    }

    fn evaluate(&mut self, expr: &TerritoryExpr, scope: ScopeId) -> Option<Geometry> {
        match expr {
            TerritoryExpr::Leaf(leaf) => self.eval_leaf(leaf, scope),
            TerritoryExpr::BinOp { op, left, right } => {
                let l = self.evaluate(left, scope);
                let r = self.evaluate(right, scope);
                match (l, r) {
                    (Some(l), Some(r)) => Some(match op {
                        SetOp::Union => l.union(&r),
                        SetOp::Difference => l.difference(&r),
                        SetOp::Intersection => l.intersection(&r),
                    }),
                    (Some(l), None) => Some(l),
                    (None, r) => r,
                }
            }
        }
    }

    fn eval_leaf(&mut self, leaf: &TerritoryLeaf, scope: ScopeId) -> Option<Geometry> {
        let mut acc: Option<Geometry> = None;
        for value in &leaf.values {
            let geometry = match leaf.kind {
                LeafKind::Named => self.resolve_name(value, scope),
                LeafKind::Gadm => self.provider_lookup(scope, value, |p| p.lookup_by_code(value)),
                LeafKind::Polygon => match serde_json::from_str::<Vec<[f64; 2]>>(value) {
                    Ok(coords) => self.provider_lookup(scope, value, |p| p.from_polygon(&coords)),
                    Err(e) => {
                        self.warn_in(scope, ErrorKind::Evaluation, format!("Malformed polygon: {}", e));
                        None
                    }
                },
            };
            acc = match (acc, geometry) {
                (Some(a), Some(g)) => Some(a.union(&g)),
                (a, g) => a.or(g),
            };
        }
        acc
    }

    fn provider_lookup(
        &mut self,
        scope: ScopeId,
        what: &str,
        f: impl FnOnce(&dyn GeometryProvider) -> Result<Geometry, crate::geometry::ProviderError>,
    ) -> Option<Geometry> {
        match f(self.provider) {
            Ok(g) => Some(g),
            Err(e) => {
                warn!(leaf = what, error = %e, "geometry provider failed; leaf skipped");
                self.warn_in(scope, ErrorKind::Evaluation, e.to_string());
                None
            }
        }
    }

    pub fn lookup_feature(&mut self, scope: ScopeId, source: &str, id: &str) -> Option<Geometry> {
        self.provider_lookup(scope, id, |p| p.lookup_named_feature(source, id))
    }

    pub fn lookup_code(&mut self, scope: ScopeId, code: &str) -> Option<Geometry> {
        self.provider_lookup(scope, code, |p| p.lookup_by_code(code))
    }

    /// Evaluate a value expression in the closed vocabulary: literals,
    /// constants (bare, glob or alias-qualified) and icon constructors.
    pub fn eval_value(&self, expr: &Expr, scope: ScopeId) -> Option<Value> {
        if let Some(literal) = expr.to_literal() {
            return Some(literal);
        }
        match &expr.kind {
            ExprKind::Group(inner) => self.eval_value(inner, scope),
            ExprKind::Path(parts) => self.constant(scope, &parts.join(".")).cloned(),
            ExprKind::List(items) => items
                .iter()
                .map(|item| self.eval_value(item, scope))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            ExprKind::Dict(entries) => {
                let mut map = Map::new();
                for (k, v) in entries {
                    let Value::String(key) = self.eval_value(k, scope)? else {
                        return None;
                    };
                    map.insert(key, self.eval_value(v, scope)?);
                }
                Some(Value::Object(map))
            }
            ExprKind::Neg(inner) => match self.eval_value(inner, scope)? {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(Value::from(-i))
                    } else {
                        n.as_f64().map(|f| Value::from(-f))
                    }
                }
                _ => None,
            },
            ExprKind::Call { .. } => {
                let (name, args) = expr.call_name()?;
                let values = args
                    .iter()
                    .map(|a| Some((a.name.clone(), self.eval_value(&a.value, scope)?)))
                    .collect::<Option<Vec<_>>>()?;
                icon_descriptor(&name, values)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Catalog, CatalogProvider};
    use crate::parser::parse_expression;
    use crate::transpile::source_to_ir;

    fn provider() -> CatalogProvider {
        CatalogProvider::new(Catalog {
            regions: ["A", "B", "C", "D"].iter().map(|s| s.to_string()).collect(),
            features: Default::default(),
        })
    }

    fn scope_of(ev: &mut Evaluator, src: &str) -> ScopeId {
        let ir = source_to_ir(src).unwrap().ir;
        ev.add_scope(None, &ir)
    }

    #[test]
    fn test_difference_of_union() {
        let p = provider();
        let mut ev = Evaluator::new(&p);
        let s = scope_of(&mut ev, r#"X = gadm("A") | gadm("B") - gadm("B")"#);
        assert_eq!(ev.resolve("X", s), Geometry::from_units(["A"]));
    }

    #[test]
    fn test_self_cycle_is_empty() {
        let p = provider();
        let mut ev = Evaluator::new(&p);
        let s = scope_of(&mut ev, "X = X\nY = Z | gadm(\"A\")\nZ = Y");
        assert!(ev.resolve("X", s).is_empty());
        assert_eq!(ev.resolve("Y", s), Geometry::from_units(["A"]));
        assert!(ev
            .diagnostics()
            .iter()
            .any(|d| d.message.contains("refers to itself")));
    }

    #[test]
    fn test_provider_failure_skips_leaf() {
        let p = provider();
        let mut ev = Evaluator::new(&p);
        let s = scope_of(&mut ev, r#"X = gadm("A") | gadm("NOPE") & gadm("A")"#);
        assert_eq!(ev.resolve("X", s), Geometry::from_units(["A"]));
        assert_eq!(ev.diagnostics().len(), 1);
    }

    #[test]
    fn test_multi_value_leaf_matches_chain() {
        let p = provider();
        let mut ev = Evaluator::new(&p);
        let s = scope_of(
            &mut ev,
            "X = (gadm(\"A\") | gadm(\"B\") | gadm(\"C\"))\nY = gadm(\"A\") | gadm(\"B\") | gadm(\"C\")",
        );
        assert_eq!(ev.resolve("X", s), ev.resolve("Y", s));
    }

    #[test]
    fn test_alias_and_glob_resolution() {
        let p = provider();
        let mut ev = Evaluator::new(&p);
        let lib = scope_of(&mut ev, "K = gadm(\"C\")\nREF = \"src\"");
        let root = scope_of(&mut ev, "X = lib.K | gadm(\"D\")");
        ev.bind_alias(root, "lib", Some(lib));
        assert_eq!(ev.resolve("X", root), Geometry::from_units(["C", "D"]));
        assert_eq!(ev.constant(root, "lib.REF"), Some(&Value::from("src")));

        let other = scope_of(&mut ev, "");
        ev.add_glob(other, lib);
        assert_eq!(ev.resolve("K", other), Geometry::from_units(["C"]));
    }

    #[test]
    fn test_failed_alias_resolves_empty() {
        let p = provider();
        let mut ev = Evaluator::new(&p);
        let root = scope_of(&mut ev, "X = gone.K | gadm(\"A\")");
        ev.bind_alias(root, "gone", None);
        assert_eq!(ev.resolve("X", root), Geometry::from_units(["A"]));
    }

    #[test]
    fn test_value_evaluation() {
        let p = provider();
        let mut ev = Evaluator::new(&p);
        let s = scope_of(&mut ev, "COLOR = \"red\"\nSIZE = 4");
        let expr = parse_expression("Icon.geometric(\"circle\", color=COLOR, size=-SIZE)").unwrap();
        let value = ev.eval_value(&expr, s).unwrap();
        assert_eq!(value["color"], "red");
        assert_eq!(value["size"], -4);
        let unknown = parse_expression("compute(COLOR)").unwrap();
        assert!(ev.eval_value(&unknown, s).is_none());
    }
}
