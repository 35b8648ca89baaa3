//! Resolved Scene - Renderer Input
//!
//! A scene is the flattened element stream with geometry substituted for
//! territory expressions, final options and every recovered diagnostic.
//! Raw scripts are never executed as code: for trusted jobs they go through a
//! closed-vocabulary interpreter that only understands primitive calls whose
//! arguments reduce to literals or territory expressions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::ast::StmtKind;
use crate::diagnostics::{Diagnostic, ErrorKind};
use crate::evaluator::{Evaluator, ScopeId};
use crate::geometry::Geometry;
use crate::imports::Flattened;
use crate::ir::{ArgValue, BuilderIR, Element, ElementKind, ElementValue, OpName, Options};
use crate::parser::{parse_expression, parse_program};
use crate::territory::parse_territory;
use crate::transpile::{literal_source, source_to_ir};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneElement {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub elements: Vec<SceneElement>,
    pub options: Options,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// Terminal success payload of a render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderOutput {
    pub html: String,
    /// The resolved scene as handed to the renderer
    pub payload: Value,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub index_names: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Scene serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Renderer failed: {0}")]
    Backend(String),
}

/// External renderer boundary: a pure sink from scene to markup.
pub trait SceneRenderer: Send + Sync {
    fn render(&self, scene: &Scene) -> Result<String, RenderError>;
}

/// Embeds the scene JSON in a minimal HTML document.
#[derive(Debug, Clone, Default)]
pub struct HtmlSceneRenderer {
    pub title: Option<String>,
}

impl SceneRenderer for HtmlSceneRenderer {
    fn render(&self, scene: &Scene) -> Result<String, RenderError> {
        let json = serde_json::to_string(scene)?.replace("</", "<\\/");
        let title = self.title.as_deref().unwrap_or("Map");
        Ok(format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n<div id=\"map\"></div>\n<script type=\"application/json\" id=\"mapforge-scene\">{}</script>\n</body>\n</html>\n",
            escape_html(title),
            json
        ))
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build the scene for a flattened element stream.
pub fn build_scene(ev: &mut Evaluator, flat: Flattened, trusted: bool) -> Scene {
    let mut builder = SceneBuilder {
        ev,
        trusted,
        scene: Scene::default(),
    };
    for queued in flat.elements {
        builder.element(queued.element, queued.scope);
    }
    builder.scene.options.merge(flat.options);
    let mut scene = builder.scene;
    let mut diagnostics = ev.take_diagnostics();
    diagnostics.append(&mut scene.diagnostics);
    scene.diagnostics = diagnostics;
    scene
}

struct SceneBuilder<'e, 'a> {
    ev: &'e mut Evaluator<'a>,
    trusted: bool,
    scene: Scene,
}

impl SceneBuilder<'_, '_> {
    fn note(&mut self, message: String) {
        self.scene
            .diagnostics
            .push(Diagnostic::info(ErrorKind::Evaluation, message));
    }

    fn element(&mut self, element: Element, scope: ScopeId) {
        if element.kind == ElementKind::RawScript {
            self.raw_script(&element, scope);
            return;
        }

        let label = element
            .label
            .as_ref()
            .and_then(|l| self.arg(l, scope, "label"));
        let (value, geometry) = self.value(&element, scope);
        let args = element
            .args
            .iter()
            .filter_map(|(k, v)| Some((k.clone(), self.arg(v, scope, k)?)))
            .filter(|(_, v)| !is_blank(v))
            .collect();

        self.scene.elements.push(SceneElement {
            kind: element.kind,
            label,
            value,
            geometry,
            args,
        });
    }

    fn value(&mut self, element: &Element, scope: ScopeId) -> (Option<Value>, Option<Geometry>) {
        match &element.value {
            ElementValue::None => (None, None),
            ElementValue::Territory(expr) => (None, Some(self.ev.eval_territory(expr, scope))),
            ElementValue::Feature(feature) => {
                let geometry = self.ev.lookup_feature(scope, &feature.source, &feature.id);
                let value = serde_json::to_value(feature).ok();
                (value, Some(geometry.unwrap_or_default()))
            }
            ElementValue::Literal(v) => {
                let geometry = self.code_geometry(element.kind, v, scope);
                (Some(v.clone()), geometry)
            }
            ElementValue::Raw(raw) => {
                let value = self.arg(&ArgValue::Raw(raw.clone()), scope, "value");
                let geometry = match &value {
                    Some(v) => self.code_geometry(element.kind, v, scope),
                    None => None,
                };
                (value, geometry)
            }
        }
    }

    /// Region codes given as plain values: one code for admin boundaries,
    /// a code or a list of codes (unioned) for flags.
    fn code_geometry(&mut self, kind: ElementKind, value: &Value, scope: ScopeId) -> Option<Geometry> {
        match (kind, value) {
            (ElementKind::AdminBoundary | ElementKind::Flag, Value::String(code)) => {
                Some(self.ev.lookup_code(scope, code).unwrap_or_default())
            }
            (ElementKind::Flag, Value::Array(items)) => {
                let codes = items.iter().map(Value::as_str).collect::<Option<Vec<_>>>()?;
                let mut geometry = Geometry::empty();
                for code in codes {
                    if let Some(part) = self.ev.lookup_code(scope, code) {
                        geometry = geometry.union(&part);
                    }
                }
                Some(geometry)
            }
            _ => None,
        }
    }

    /// Reduce an argument to a literal; raw expressions only for trusted jobs.
    fn arg(&mut self, value: &ArgValue, scope: ScopeId, name: &str) -> Option<Value> {
        let raw = match value {
            ArgValue::Literal(v) => return Some(v.clone()),
            ArgValue::Raw(raw) => &raw.raw,
        };
        if !self.trusted {
            self.note(format!("Expression for '{}' not evaluated: {}", name, raw));
            return None;
        }
        let evaluated = parse_expression(raw)
            .ok()
            .and_then(|expr| self.ev.eval_value(&expr, scope));
        if evaluated.is_none() {
            self.note(format!("Cannot evaluate '{}' for '{}'", raw, name));
        }
        evaluated
    }

    fn raw_script(&mut self, element: &Element, scope: ScopeId) {
        let Some(text) = element.script_text() else {
            return;
        };
        if is_comment(text) {
            return;
        }
        if !self.trusted {
            self.note(format!("Raw statement left inert: {}", first_line(text)));
            return;
        }
        match self.interpret(text, scope) {
            Some(ir) => {
                debug!(statement = first_line(text), elements = ir.elements.len(), "interpreted raw statement");
                for element in ir.elements {
                    self.element(element, scope);
                }
                self.scene.options.merge(ir.options);
            }
            None => self.note(format!("Unsupported statement left inert: {}", first_line(text))),
        }
    }

    /// Re-emit each primitive call with its arguments reduced to literals and
    /// read the result back through the transpiler.
    fn interpret(&self, script: &str, scope: ScopeId) -> Option<BuilderIR> {
        let program = parse_program(script).ok()?;
        if !program.errors.is_empty() {
            return None;
        }
        let mut calls = Vec::new();
        for stmt in &program.statements {
            let StmtKind::Expr(expr) = &stmt.kind else {
                return None;
            };
            let (name, args) = expr.call_name()?;
            let op: OpName = name.parse().ok()?;
            let mut parts = Vec::new();
            for arg in args {
                let text = match self.ev.eval_value(&arg.value, scope) {
                    Some(v) => literal_source(&v),
                    None if parse_territory(&arg.value).is_some() => {
                        arg.value.span.slice(script).trim().to_string()
                    }
                    None => return None,
                };
                parts.push(match &arg.name {
                    Some(n) => format!("{}={}", n, text),
                    None => text,
                });
            }
            calls.push(format!("{}({})", op, parts.join(", ")));
        }
        if calls.is_empty() {
            return None;
        }
        let transpiled = source_to_ir(&calls.join("\n")).ok()?;
        let clean = transpiled.errors.is_empty()
            && transpiled.ir.imports.is_empty()
            && !transpiled.ir.has_raw();
        clean.then_some(transpiled.ir)
    }
}

fn is_comment(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .all(|l| l.starts_with('#'))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

/// Null, empty strings and empty collections carry no information for the renderer.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::CatalogProvider;
    use crate::imports::ImportResolver;
    use crate::store::MemoryArtifactStore;
    use serde_json::json;

    fn scene(src: &str, trusted: bool) -> Scene {
        let provider = CatalogProvider::permissive();
        let store = MemoryArtifactStore::new();
        let mut ev = Evaluator::new(&provider);
        let ir = source_to_ir(src).unwrap().ir;
        let root = ev.add_scope(None, &ir);
        let flat = ImportResolver::new(&store, 1 << 20).flatten(&mut ev, ir, root);
        build_scene(&mut ev, flat, trusted)
    }

    #[test]
    fn test_flag_geometry_substituted() {
        let s = scene(r#"flag("X", gadm("A") | gadm("B") - gadm("C"))"#, false);
        assert_eq!(s.elements.len(), 1);
        assert_eq!(s.elements[0].label, Some(json!("X")));
        assert_eq!(s.elements[0].geometry, Some(Geometry::from_units(["A", "B"])));
    }

    #[test]
    fn test_flag_literal_codes_resolve() {
        let s = scene("flag(\"X\", \"IND\")\nflag(\"Y\", [\"A\", \"B\"])\ntext(\"T\", [0, 0])", false);
        assert_eq!(s.elements[0].geometry, Some(Geometry::from_units(["IND"])));
        assert_eq!(s.elements[1].geometry, Some(Geometry::from_units(["A", "B"])));
        assert_eq!(s.elements[2].geometry, None);
    }

    #[test]
    fn test_raw_arguments_need_trust() {
        let src = "NAME = \"Kuru\"\ntext(NAME, [1, 2])";
        let untrusted = scene(src, false);
        assert_eq!(untrusted.elements[0].label, None);
        assert!(!untrusted.diagnostics.is_empty());

        let trusted = scene(src, true);
        assert_eq!(trusted.elements[0].label, Some(json!("Kuru")));
    }

    #[test]
    fn test_raw_script_interpreted_when_trusted() {
        let src = "LEVEL = 4\nzoom(LEVEL)\n# just a note";
        let trusted = scene(src, true);
        assert_eq!(trusted.options.zoom, Some(4.0));
        assert!(trusted.diagnostics.is_empty());

        let untrusted = scene(src, false);
        assert_eq!(untrusted.options.zoom, None);
        assert_eq!(untrusted.diagnostics.len(), 1);
    }

    #[test]
    fn test_unknown_calls_stay_inert() {
        let s = scene("launch_missiles()\nX = compute(1)", true);
        assert!(s.elements.is_empty());
        assert_eq!(s.diagnostics.len(), 2);
    }

    #[test]
    fn test_blank_arguments_dropped() {
        let s = scene(r#"point("p", [0, 0], icon="", note=null, tags=[], size=3)"#, false);
        let args: Vec<&String> = s.elements[0].args.keys().collect();
        assert_eq!(args, vec!["size"]);
    }

    #[test]
    fn test_admin_and_river_geometry() {
        let s = scene("admin(\"IND.31\", level=2)\nriver(\"Ganga\", naturalearth(\"1159\"))", false);
        assert_eq!(s.elements[0].geometry, Some(Geometry::from_units(["IND.31"])));
        assert_eq!(
            s.elements[1].geometry,
            Some(Geometry::from_units(["naturalearth:1159"]))
        );
    }

    #[test]
    fn test_html_renderer_escapes_script_end() {
        let s = scene(r#"title_box("</script><b>hi</b>")"#, false);
        let html = HtmlSceneRenderer::default().render(&s).unwrap();
        assert!(!html.contains("</script><b>"));
        assert!(html.contains("mapforge-scene"));
    }
}
