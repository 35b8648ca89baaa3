//! IR Transpiler - DSL Source <-> Builder IR
//!
//! Source -> IR recognises a closed vocabulary of primitive calls. Anything
//! it cannot model is kept verbatim (`RawExpr` for one argument, a
//! `RawScript` element for a whole statement) so nothing authored is lost.
//!
//! IR -> Source is canonical: one text per structure, formatting discarded.

use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use crate::ast::{keyword, Arg, Expr, Stmt, StmtKind};
use crate::ir::{
    ArgValue, Basemap, BuilderIR, ColorSequence, ConstantDef, CssRule, DataColormap, Element,
    ElementKind, ElementValue, FeatureRef, ImportFilter, ImportStatement, NamedTerritoryDef,
    OpName, Options, RawExpr, Slider, DEFAULT_COLORMAP_COLORS, DEFAULT_STEP_H,
};
use crate::lexer::Comment;
use crate::parser::{parse_program, ParseError};
use crate::store::ArtifactRef;
use crate::territory::{parse_territory, quote};

/// Loader calls accepted as river values.
pub const FEATURE_SOURCES: [&str; 2] = ["naturalearth", "overpass"];

/// Result of reading source text into the IR
#[derive(Debug, Clone, Default)]
pub struct Transpiled {
    pub ir: BuilderIR,
    /// Statement-level problems; each offending statement survives as a raw script
    pub errors: Vec<ParseError>,
}

/// Parameter layout of an element primitive.
struct Signature {
    kind: ElementKind,
    has_label: bool,
    value: &'static str,
    extras: &'static [&'static str],
}

fn signature(op: OpName) -> Option<Signature> {
    let (kind, has_label, value, extras): (_, _, _, &'static [&'static str]) = match op {
        OpName::Flag => (ElementKind::Flag, true, "value", &[]),
        OpName::River => (ElementKind::River, true, "value", &[]),
        OpName::Path => (ElementKind::Path, true, "value", &[]),
        OpName::Point => (ElementKind::Point, true, "position", &[]),
        OpName::Text => (ElementKind::Text, true, "position", &[]),
        OpName::Admin => (ElementKind::AdminBoundary, false, "gadm", &["level"]),
        OpName::AdminRivers => (ElementKind::AdminRivers, false, "sources", &[]),
        OpName::Dataframe => (ElementKind::DataOverlay, false, "data", &[]),
        OpName::TitleBox => (ElementKind::TitleBox, false, "html", &[]),
        OpName::Music => (ElementKind::AudioTrack, false, "path", &["timestamps", "period"]),
        _ => return None,
    };
    Some(Signature {
        kind,
        has_label,
        value,
        extras,
    })
}

fn signature_for(kind: ElementKind) -> Option<Signature> {
    OpName::for_element(kind).and_then(signature)
}

fn css_rule_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([^{}]+)\{([^{}]+)\}").ok())
        .as_ref()
}

/// Split CSS text into `selector { style }` rules.
pub fn parse_css_rules(text: &str) -> Vec<CssRule> {
    let Some(re) = css_rule_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| {
            let selector = c.get(1)?.as_str().trim().to_string();
            let style = c.get(2)?.as_str().trim().to_string();
            (!selector.is_empty() && !style.is_empty()).then_some(CssRule { selector, style })
        })
        .collect()
}

// --- source -> IR ------------------------------------------------------------

pub fn source_to_ir(source: &str) -> Result<Transpiled, ParseError> {
    let program = parse_program(source)?;
    let mut reader = IrReader {
        source,
        ir: BuilderIR::default(),
        errors: program.errors,
        comments: program.comments,
        next_comment: 0,
        option_writes: BTreeMap::new(),
        import_positions: Vec::new(),
    };
    for (position, stmt) in program.statements.iter().enumerate() {
        reader.flush_comments_before(stmt.span.start);
        reader.statement(stmt, position);
    }
    reader.flush_comments_before(usize::MAX);
    reader.mark_overrides();
    Ok(Transpiled {
        ir: reader.ir,
        errors: reader.errors,
    })
}

struct IrReader<'a> {
    source: &'a str,
    ir: BuilderIR,
    errors: Vec<ParseError>,
    comments: Vec<Comment>,
    next_comment: usize,
    /// Statement position of the last local write of each option
    option_writes: BTreeMap<OpName, usize>,
    /// Statement position of each entry in `ir.imports`
    import_positions: Vec<usize>,
}

impl<'a> IrReader<'a> {
    fn mark_overrides(&mut self) {
        for (import, &position) in self.ir.imports.iter_mut().zip(&self.import_positions) {
            import.overrides = self
                .option_writes
                .iter()
                .filter(|(op, written)| op.is_scalar_option() && **written < position)
                .map(|(op, _)| *op)
                .collect();
        }
    }

    /// Emit pending comments as raw scripts, one per run of adjacent lines.
    fn flush_comments_before(&mut self, pos: usize) {
        let mut group: Vec<&Comment> = Vec::new();
        let mut groups: Vec<String> = Vec::new();
        while let Some(comment) = self.comments.get(self.next_comment) {
            if comment.span.start >= pos {
                break;
            }
            if let Some(last) = group.last() {
                if comment.line > last.line + 1 {
                    groups.push(join_comments(&group));
                    group.clear();
                }
            }
            group.push(comment);
            self.next_comment += 1;
        }
        if !group.is_empty() {
            groups.push(join_comments(&group));
        }
        for text in groups {
            self.ir.elements.push(Element::raw_script(text));
        }
    }

    fn text(&self, expr: &Expr) -> String {
        expr.span.slice(self.source).trim().to_string()
    }

    fn raw_statement(&mut self, stmt: &Stmt) {
        let text = stmt.span.slice(self.source).trim().to_string();
        self.ir.elements.push(Element::raw_script(text));
    }

    fn statement(&mut self, stmt: &Stmt, position: usize) {
        match &stmt.kind {
            StmtKind::Unparsed => self.raw_statement(stmt),
            StmtKind::Assign { name, value } => {
                if is_import_call(value) {
                    self.import(stmt, Some(name.clone()), value, position);
                } else if let Some(literal) = value.to_literal() {
                    self.ir.constants.push(ConstantDef {
                        name: name.clone(),
                        value: literal,
                    });
                } else if let Some(expr) = parse_territory(value) {
                    self.ir.territories.push(NamedTerritoryDef {
                        name: name.clone(),
                        expr,
                    });
                } else {
                    self.raw_statement(stmt);
                }
            }
            StmtKind::Expr(expr) => {
                if is_import_call(expr) {
                    self.import(stmt, None, expr, position);
                    return;
                }
                let recognised = expr
                    .call_name()
                    .and_then(|(name, args)| Some((name.parse::<OpName>().ok()?, args)));
                let handled = match recognised {
                    Some((op, args)) => match signature(op) {
                        Some(sig) => self.element(&sig, args),
                        None => {
                            let applied = self.option(op, args);
                            if applied {
                                self.option_writes.insert(op, position);
                            }
                            applied
                        }
                    },
                    None => false,
                };
                if !handled {
                    self.raw_statement(stmt);
                }
            }
        }
    }

    fn import(&mut self, stmt: &Stmt, alias: Option<String>, call: &Expr, position: usize) {
        match read_import(call) {
            Ok((artifact, filter)) => {
                self.ir.imports.push(ImportStatement {
                    alias,
                    artifact,
                    filter,
                    anchor: self.ir.elements.len(),
                    overrides: BTreeSet::new(),
                });
                self.import_positions.push(position);
            }
            Err(message) => {
                self.errors.push(ParseError {
                    message,
                    span: stmt.span,
                });
                self.raw_statement(stmt);
            }
        }
    }

    fn arg_value(&self, expr: &Expr) -> ArgValue {
        match expr.to_literal() {
            Some(v) => ArgValue::Literal(v),
            None => ArgValue::Raw(RawExpr::new(self.text(expr))),
        }
    }

    fn element(&mut self, sig: &Signature, args: &[Arg]) -> bool {
        let mut params: Vec<&str> = Vec::new();
        if sig.has_label {
            params.push("label");
        }
        params.push(sig.value);
        params.extend_from_slice(sig.extras);

        let mut element = Element::new(sig.kind);
        let mut assigned: BTreeSet<&str> = BTreeSet::new();
        let mut positional = 0;
        for arg in args {
            let name = match &arg.name {
                Some(n) => n.as_str(),
                None => {
                    let Some(&name) = params.get(positional) else {
                        return false;
                    };
                    positional += 1;
                    name
                }
            };
            if !assigned.insert(name) {
                return false;
            }
            if name == "label" && sig.has_label {
                element.label = Some(self.arg_value(&arg.value));
            } else if name == sig.value {
                element.value = self.element_value(sig.kind, &arg.value);
            } else if name == "icon" && sig.kind == ElementKind::Point {
                let value = icon_literal(&arg.value)
                    .map(ArgValue::Literal)
                    .unwrap_or_else(|| self.arg_value(&arg.value));
                element.args.insert(name.to_string(), value);
            } else {
                element.args.insert(name.to_string(), self.arg_value(&arg.value));
            }
        }
        self.ir.elements.push(element);
        true
    }

    fn element_value(&self, kind: ElementKind, expr: &Expr) -> ElementValue {
        if kind == ElementKind::Flag {
            if let Some(t) = parse_territory(expr) {
                return ElementValue::Territory(t);
            }
        }
        if kind == ElementKind::River {
            if let Some(feature) = feature_ref(expr) {
                return ElementValue::Feature(feature);
            }
        }
        match expr.to_literal() {
            Some(v) => ElementValue::Literal(v),
            None => ElementValue::Raw(RawExpr::new(self.text(expr))),
        }
    }

    /// Options only accept literal arguments; anything else stays a raw script.
    fn option(&mut self, op: OpName, args: &[Arg]) -> bool {
        let Some(call) = LiteralCall::bind(args, option_params(op)) else {
            return false;
        };
        let options = &mut self.ir.options;
        match op {
            OpName::BaseOption => {
                let Some(provider) = call.string("url_or_provider") else {
                    return false;
                };
                let name = match call.get("name") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    _ => return false,
                };
                let default = match call.get("default") {
                    None => false,
                    Some(Value::Bool(b)) => *b,
                    _ => return false,
                };
                options.basemaps.push(Basemap {
                    url_or_provider: provider,
                    name,
                    default,
                });
            }
            OpName::Css => {
                let Some(text) = call.string("text") else {
                    return false;
                };
                let rules = parse_css_rules(&text);
                if rules.is_empty() && !text.trim().is_empty() {
                    return false;
                }
                options.css_rules.extend(rules);
            }
            OpName::Zoom => {
                let Some(level) = call.number("level") else {
                    return false;
                };
                options.zoom = Some(level);
            }
            OpName::Focus => {
                let (Some(lat), Some(lon)) = (call.number("lat"), call.number("lon")) else {
                    return false;
                };
                options.focus = Some([lat, lon]);
            }
            OpName::Slider => {
                let int = |key: &str| match call.get(key) {
                    None | Some(Value::Null) => Ok(None),
                    Some(v) => v.as_i64().map(Some).ok_or(()),
                };
                let (Ok(start), Ok(end)) = (int("start"), int("end")) else {
                    return false;
                };
                let speed = match call.get("speed") {
                    None | Some(Value::Null) => None,
                    Some(v) => match v.as_f64() {
                        Some(s) => Some(s),
                        None => return false,
                    },
                };
                options.slider = Some(Slider { start, end, speed });
            }
            OpName::FlagColorSequence | OpName::AdminColorSequence => {
                let Some(sequence) = color_sequence(&call) else {
                    return false;
                };
                if op == OpName::FlagColorSequence {
                    options.flag_color_sequences.push(sequence);
                } else {
                    options.admin_color_sequences.push(sequence);
                }
            }
            OpName::DataColormap => {
                let Some(map_type) = call.string("type") else {
                    return false;
                };
                let colors = match call.get("colors") {
                    None | Some(Value::Null) => DEFAULT_COLORMAP_COLORS.to_string(),
                    Some(v) => match color_list(v) {
                        Some(c) => c,
                        None => return false,
                    },
                };
                options.data_colormap = Some(DataColormap { map_type, colors });
            }
            _ => return false,
        }
        true
    }
}

fn join_comments(group: &[&Comment]) -> String {
    group
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_import_call(expr: &Expr) -> bool {
    expr.call_name().is_some_and(|(name, _)| name == "import")
}

fn read_import(call: &Expr) -> Result<(ArtifactRef, ImportFilter), String> {
    let (_, args) = call.call_name().ok_or("import must be a call")?;
    let path_arg = args
        .iter()
        .find(|a| a.name.is_none())
        .or_else(|| keyword(args, "path"))
        .ok_or("import needs an artifact path")?;
    let Some(Value::String(path)) = path_arg.value.to_literal() else {
        return Err("import path must be a string literal".to_string());
    };
    let artifact = ArtifactRef::parse(&path).map_err(|e| e.to_string())?;

    let mut filter = ImportFilter::default();
    for arg in args {
        match arg.name.as_deref() {
            None | Some("path") => {}
            Some("filter_only") => filter.only = Some(op_set(&arg.value)?),
            Some("filter_not") => filter.not = op_set(&arg.value)?,
            Some(other) => return Err(format!("unknown import argument '{}'", other)),
        }
    }
    if args.iter().filter(|a| a.name.is_none()).count() > 1 {
        return Err("import takes a single path".to_string());
    }
    Ok((artifact, filter))
}

fn op_set(expr: &Expr) -> Result<BTreeSet<OpName>, String> {
    let Some(Value::Array(items)) = expr.to_literal() else {
        return Err("import filters must be lists of operation names".to_string());
    };
    items
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| "import filters must be lists of operation names".to_string())
                .and_then(|s| s.parse::<OpName>())
        })
        .collect()
}

fn feature_ref(expr: &Expr) -> Option<FeatureRef> {
    let (name, args) = expr.call_name()?;
    if !FEATURE_SOURCES.contains(&name.as_str()) || args.len() != 1 || args[0].name.is_some() {
        return None;
    }
    let id = match args[0].value.to_literal()? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(FeatureRef { source: name, id })
}

/// Normalize `Icon.builtin(..)`, `Icon.geometric(..)` and `Icon(icon_url=..)`
/// to literal descriptors.
fn icon_literal(expr: &Expr) -> Option<Value> {
    let (name, args) = expr.call_name()?;
    let values = args
        .iter()
        .map(|a| Some((a.name.clone(), a.value.to_literal()?)))
        .collect::<Option<Vec<_>>>()?;
    icon_descriptor(&name, values)
}

/// Build an icon descriptor from a constructor name and evaluated arguments.
pub(crate) fn icon_descriptor(name: &str, args: Vec<(Option<String>, Value)>) -> Option<Value> {
    let (kind, first) = match name {
        "Icon.builtin" => ("builtin", "name"),
        "Icon.geometric" => ("geometric", "shape"),
        "Icon" => ("url", "icon_url"),
        _ => return None,
    };
    let mut object = Map::new();
    object.insert("type".to_string(), json!(kind));
    let mut positional = 0;
    for (arg_name, value) in args {
        let key = match arg_name {
            Some(n) => n,
            None if positional == 0 => {
                positional += 1;
                first.to_string()
            }
            None => return None,
        };
        if key == "type" {
            return None;
        }
        object.insert(key, value);
    }
    if !object.get(first).is_some_and(Value::is_string) {
        return None;
    }
    if kind == "builtin" && object.len() != 2 {
        return None;
    }
    Some(Value::Object(object))
}

fn option_params(op: OpName) -> &'static [&'static str] {
    match op {
        OpName::BaseOption => &["url_or_provider", "name", "default"],
        OpName::Css => &["text"],
        OpName::Zoom => &["level"],
        OpName::Focus => &["lat", "lon"],
        OpName::Slider => &["start", "end", "speed"],
        OpName::FlagColorSequence | OpName::AdminColorSequence => &["colors", "step", "class_name"],
        OpName::DataColormap => &["type", "colors"],
        _ => &[],
    }
}

/// Call arguments bound to parameter names, all literal.
struct LiteralCall {
    values: Map<String, Value>,
}

impl LiteralCall {
    fn bind(args: &[Arg], params: &[&str]) -> Option<Self> {
        let mut values = Map::new();
        let mut positional = 0;
        for arg in args {
            let name = match &arg.name {
                Some(n) if params.contains(&n.as_str()) => n.clone(),
                Some(_) => return None,
                None => {
                    let name = params.get(positional)?;
                    positional += 1;
                    name.to_string()
                }
            };
            if values.insert(name, arg.value.to_literal()?).is_some() {
                return None;
            }
        }
        Some(Self { values })
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str).map(str::to_string)
    }

    fn number(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }
}

fn color_list(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(|v| v.join(",")),
        _ => None,
    }
}

fn color_sequence(call: &LiteralCall) -> Option<ColorSequence> {
    let colors = color_list(call.get("colors")?)?;
    let class_name = match call.get("class_name") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        _ => return None,
    };
    let (step_h, step_s, step_l) = match call.get("step") {
        None | Some(Value::Null) => (DEFAULT_STEP_H, 0.0, 0.0),
        Some(Value::Array(parts)) => {
            let nums = parts
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<_>>>()?;
            match nums.as_slice() {
                [h] => (*h, 0.0, 0.0),
                [h, s] => (*h, *s, 0.0),
                [h, s, l] => (*h, *s, *l),
                _ => return None,
            }
        }
        Some(v) => (v.as_f64()?, 0.0, 0.0),
    };
    Some(ColorSequence {
        class_name,
        colors,
        step_h,
        step_s,
        step_l,
    })
}

// --- IR -> source ------------------------------------------------------------

/// Serialize the IR to canonical DSL text.
pub fn ir_to_source(ir: &BuilderIR) -> String {
    let mut blocks: Vec<String> = Vec::new();

    let mut imports: Vec<&ImportStatement> = ir.imports.iter().collect();
    imports.sort_by_key(|i| i.anchor);

    // A scalar option an import overrides is written just before the first
    // such import instead of in the options block.
    let mut deferred: BTreeMap<usize, BTreeSet<OpName>> = BTreeMap::new();
    let mut moved = BTreeSet::new();
    for op in OpName::ALL.into_iter().filter(|op| op.is_scalar_option()) {
        let set_locally = !ir.options.clone().filtered(&only(op)).is_empty();
        let first = imports.iter().position(|i| i.overrides.contains(&op));
        if let (true, Some(index)) = (set_locally, first) {
            deferred.entry(index).or_default().insert(op);
            moved.insert(op);
        }
    }
    let emit_import = |index: usize, import: &ImportStatement, out: &mut Vec<String>| {
        if let Some(ops) = deferred.get(&index) {
            let filter = ImportFilter {
                only: Some(ops.clone()),
                not: BTreeSet::new(),
            };
            out.extend(options_source(&ir.options.clone().filtered(&filter)));
        }
        out.push(import_source(import));
    };
    let mut pending = imports.into_iter().enumerate().peekable();

    let mut header = Vec::new();
    while let Some((index, import)) = pending.next_if(|(_, i)| i.anchor == 0) {
        emit_import(index, import, &mut header);
    }
    push_block(&mut blocks, header);

    push_block(
        &mut blocks,
        ir.constants
            .iter()
            .map(|c| format!("{} = {}", c.name, literal_source(&c.value)))
            .collect(),
    );
    push_block(
        &mut blocks,
        ir.territories
            .iter()
            .map(|t| format!("{} = {}", t.name, t.expr.to_source()))
            .collect(),
    );
    let local_options = ir.options.clone().filtered(&ImportFilter {
        only: None,
        not: moved,
    });
    push_block(&mut blocks, options_source(&local_options));

    let mut body: Vec<String> = Vec::new();
    let mut previous_script = false;
    for (position, element) in ir.elements.iter().enumerate() {
        while let Some((index, import)) = pending.next_if(|(_, i)| i.anchor <= position) {
            emit_import(index, import, &mut body);
            previous_script = false;
        }
        let is_script = element.kind == ElementKind::RawScript;
        // keep separate comment groups from merging on re-read
        if is_script && previous_script {
            body.push(String::new());
        }
        body.push(element_source(element));
        previous_script = is_script;
    }
    for (index, import) in pending {
        emit_import(index, import, &mut body);
    }
    push_block(&mut blocks, body);

    let mut out = blocks.join("\n\n");
    out.push('\n');
    out
}

fn only(op: OpName) -> ImportFilter {
    ImportFilter {
        only: Some(BTreeSet::from([op])),
        not: BTreeSet::new(),
    }
}

fn push_block(blocks: &mut Vec<String>, lines: Vec<String>) {
    if !lines.is_empty() {
        blocks.push(lines.join("\n"));
    }
}

/// Re-emit source in canonical form, dropping comments.
pub fn canonicalize(source: &str) -> Result<String, ParseError> {
    let mut ir = source_to_ir(source)?.ir;
    let comment_only =
        |e: &Element| e.script_text().is_some_and(|t| t.lines().all(|l| l.trim_start().starts_with('#')));
    let mut removed_before = Vec::with_capacity(ir.elements.len() + 1);
    let mut removed = 0;
    let mut kept = Vec::with_capacity(ir.elements.len());
    for element in ir.elements.drain(..) {
        removed_before.push(removed);
        if comment_only(&element) {
            removed += 1;
        } else {
            kept.push(element);
        }
    }
    removed_before.push(removed);
    for import in &mut ir.imports {
        let shift = removed_before
            .get(import.anchor)
            .copied()
            .unwrap_or(removed);
        import.anchor -= shift;
    }
    ir.elements = kept;
    Ok(ir_to_source(&ir))
}

/// Render a literal value as DSL text.
pub fn literal_source(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn number_source(n: f64) -> String {
    literal_source(&json!(n))
}

fn arg_source(value: &ArgValue) -> String {
    match value {
        ArgValue::Raw(raw) => raw.raw.clone(),
        ArgValue::Literal(v) => literal_source(v),
    }
}

fn import_source(import: &ImportStatement) -> String {
    let mut args = vec![quote(&import.artifact.to_path())];
    if let Some(only) = &import.filter.only {
        args.push(format!("filter_only={}", op_list_source(only)));
    }
    if !import.filter.not.is_empty() {
        args.push(format!("filter_not={}", op_list_source(&import.filter.not)));
    }
    let call = format!("import({})", args.join(", "));
    match &import.alias {
        Some(alias) => format!("{} = {}", alias, call),
        None => call,
    }
}

fn op_list_source(ops: &BTreeSet<OpName>) -> String {
    let names: Vec<String> = ops.iter().map(|o| quote(o.as_str())).collect();
    format!("[{}]", names.join(", "))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn icon_source(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    let (ctor, first) = match object.get("type")?.as_str()? {
        "builtin" if object.len() == 2 => ("Icon.builtin", "name"),
        "geometric" => ("Icon.geometric", "shape"),
        "url" => ("Icon", "icon_url"),
        _ => return None,
    };
    let head = object.get(first)?.as_str()?;
    let mut args = if ctor == "Icon" {
        vec![format!("icon_url={}", quote(head))]
    } else {
        vec![quote(head)]
    };
    for (key, v) in object {
        if key == "type" || key == first {
            continue;
        }
        if !is_identifier(key) {
            return None;
        }
        args.push(format!("{}={}", key, literal_source(v)));
    }
    Some(format!("{}({})", ctor, args.join(", ")))
}

fn element_source(element: &Element) -> String {
    if let Some(text) = element.script_text() {
        return text.to_string();
    }
    let Some(sig) = signature_for(element.kind) else {
        return String::new();
    };
    let op = OpName::for_element(element.kind).map_or("", |o| o.as_str());

    let mut args: Vec<String> = Vec::new();
    // positional until the first gap, keywords after
    let mut gap = false;
    if sig.has_label {
        match &element.label {
            Some(label) => args.push(arg_source(label)),
            None => gap = true,
        }
    }
    let value = match &element.value {
        ElementValue::None => None,
        ElementValue::Territory(t) => Some(t.to_source()),
        ElementValue::Feature(f) => Some(format!("{}({})", f.source, quote(&f.id))),
        ElementValue::Literal(v) => Some(literal_source(v)),
        ElementValue::Raw(raw) => Some(raw.raw.clone()),
    };
    if let Some(value) = value {
        if gap {
            args.push(format!("{}={}", sig.value, value));
        } else {
            args.push(value);
        }
    }
    for (name, value) in &element.args {
        let text = match value {
            ArgValue::Literal(v) if name == "icon" && element.kind == ElementKind::Point => {
                icon_source(v).unwrap_or_else(|| literal_source(v))
            }
            other => arg_source(other),
        };
        args.push(format!("{}={}", name, text));
    }
    format!("{}({})", op, args.join(", "))
}

fn color_sequence_source(op: OpName, seq: &ColorSequence) -> String {
    let mut args = vec![quote(&seq.colors)];
    if let Some(class_name) = &seq.class_name {
        args.push(format!("class_name={}", quote(class_name)));
    }
    if !seq.has_default_step() {
        args.push(format!(
            "step=[{}, {}, {}]",
            number_source(seq.step_h),
            number_source(seq.step_s),
            number_source(seq.step_l)
        ));
    }
    format!("{}({})", op, args.join(", "))
}

fn options_source(options: &Options) -> Vec<String> {
    let mut lines = Vec::new();
    for basemap in &options.basemaps {
        let mut args = vec![quote(&basemap.url_or_provider)];
        if let Some(name) = &basemap.name {
            args.push(format!("name={}", quote(name)));
        }
        if basemap.default {
            args.push("default=true".to_string());
        }
        lines.push(format!("base_option({})", args.join(", ")));
    }
    if !options.css_rules.is_empty() {
        let text: Vec<String> = options
            .css_rules
            .iter()
            .map(|r| format!("{} {{ {} }}", r.selector, r.style))
            .collect();
        lines.push(format!("css({})", quote(&text.join("\n"))));
    }
    for seq in &options.flag_color_sequences {
        lines.push(color_sequence_source(OpName::FlagColorSequence, seq));
    }
    for seq in &options.admin_color_sequences {
        lines.push(color_sequence_source(OpName::AdminColorSequence, seq));
    }
    if let Some(colormap) = &options.data_colormap {
        let mut args = vec![quote(&colormap.map_type)];
        if colormap.colors != DEFAULT_COLORMAP_COLORS {
            args.push(format!("colors={}", quote(&colormap.colors)));
        }
        lines.push(format!("data_colormap({})", args.join(", ")));
    }
    if let Some(zoom) = options.zoom {
        lines.push(format!("zoom({})", number_source(zoom)));
    }
    if let Some([lat, lon]) = options.focus {
        lines.push(format!("focus({}, {})", number_source(lat), number_source(lon)));
    }
    if let Some(slider) = &options.slider {
        let mut args = Vec::new();
        if let Some(start) = slider.start {
            args.push(format!("start={}", start));
        }
        if let Some(end) = slider.end {
            args.push(format!("end={}", end));
        }
        if let Some(speed) = slider.speed {
            args.push(format!("speed={}", number_source(speed)));
        }
        lines.push(format!("slider({})", args.join(", ")));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::SetOp;
    use crate::territory::TerritoryExpr;
    use pretty_assertions::assert_eq;

    fn ir(src: &str) -> BuilderIR {
        let t = source_to_ir(src).unwrap();
        assert!(t.errors.is_empty(), "{:?}", t.errors);
        t.ir
    }

    #[test]
    fn test_flag_scenario() {
        let ir = ir(r#"flag("X", gadm("A") | gadm("B") - gadm("C"))"#);
        assert_eq!(ir.elements.len(), 1);
        let el = &ir.elements[0];
        assert_eq!(el.kind, ElementKind::Flag);
        assert_eq!(el.label, Some(ArgValue::Literal(json!("X"))));
        assert_eq!(
            el.value,
            ElementValue::Territory(TerritoryExpr::bin(
                SetOp::Difference,
                TerritoryExpr::bin(SetOp::Union, TerritoryExpr::gadm("A"), TerritoryExpr::gadm("B")),
                TerritoryExpr::gadm("C"),
            ))
        );
    }

    #[test]
    fn test_non_literal_argument_becomes_raw_expr() {
        let ir = ir("point(city_name, [28.6, 77.2], note=describe( x ))");
        let el = &ir.elements[0];
        assert_eq!(el.kind, ElementKind::Point);
        assert_eq!(el.label, Some(ArgValue::Raw(RawExpr::new("city_name"))));
        assert_eq!(el.value, ElementValue::Literal(json!([28.6, 77.2])));
        assert_eq!(
            el.args.get("note"),
            Some(&ArgValue::Raw(RawExpr::new("describe( x )")))
        );
    }

    #[test]
    fn test_unknown_statement_is_raw_script() {
        let ir = ir("configure(4)\nzoom(z)\nX = make_region()");
        assert_eq!(ir.elements.len(), 3);
        assert!(ir.elements.iter().all(|e| e.kind == ElementKind::RawScript));
        assert_eq!(ir.elements[1].script_text(), Some("zoom(z)"));
        assert!(ir.options.zoom.is_none());
    }

    #[test]
    fn test_comment_grouping() {
        let src = "# a\n# b\n\n# c\nzoom(3)\n# d\n";
        let ir = ir(src);
        let scripts: Vec<_> = ir.elements.iter().filter_map(Element::script_text).collect();
        assert_eq!(scripts, vec!["# a\n# b", "# c", "# d"]);
    }

    #[test]
    fn test_imports_are_metadata_with_anchor() {
        let src = r#"
flag("A", gadm("A"))
indic = import("/lib/indic", filter_only=["flag"])
import("/alice/map/base/2", filter_not=["zoom", "css"])
text("t", [1, 2])
"#;
        let ir = ir(src);
        assert_eq!(ir.elements.len(), 2);
        assert_eq!(ir.imports.len(), 2);
        assert_eq!(ir.imports[0].alias.as_deref(), Some("indic"));
        assert_eq!(ir.imports[0].anchor, 1);
        assert!(ir.imports[1].filter.not.contains(&OpName::Css));
    }

    #[test]
    fn test_bad_import_is_kept_and_reported() {
        let t = source_to_ir(r#"import("/widget/x")"#).unwrap();
        assert_eq!(t.errors.len(), 1);
        assert_eq!(t.ir.elements[0].kind, ElementKind::RawScript);
    }

    #[test]
    fn test_options_parsed() {
        let src = r#"
base_option("Esri.WorldImagery", name="Satellite", default=True)
css(".flag { opacity: 0.5 } .label { color: red }")
flag_color_sequence(["red", "blue"], class_name="empire", step=[0.1, 0.2, 0.3])
admin_color_sequence("green,olive")
data_colormap("LinearSegmented")
zoom(4)
focus(20.5, 78)
slider(start=-320, end=500, speed=2.5)
"#;
        let o = ir(src).options;
        assert_eq!(o.basemaps[0].name.as_deref(), Some("Satellite"));
        assert!(o.basemaps[0].default);
        assert_eq!(o.css_rules.len(), 2);
        assert_eq!(o.css_rules[1].selector, ".label");
        assert_eq!(o.flag_color_sequences[0].colors, "red,blue");
        assert_eq!(o.flag_color_sequences[0].step_l, 0.3);
        assert!(o.admin_color_sequences[0].has_default_step());
        assert_eq!(o.data_colormap.as_ref().unwrap().colors, "yellow,orange,red");
        assert_eq!(o.zoom, Some(4.0));
        assert_eq!(o.focus, Some([20.5, 78.0]));
        assert_eq!(o.slider.as_ref().unwrap().start, Some(-320));
    }

    #[test]
    fn test_icons_normalized() {
        let ir = ir(r#"
point("a", [1, 2], icon=Icon.builtin("star"))
point("b", [1, 2], icon=Icon.geometric("circle", color="red", size=12))
point("c", [1, 2], icon=Icon(icon_url="https://x.org/i.png"))
"#);
        assert_eq!(
            ir.elements[0].args["icon"],
            ArgValue::Literal(json!({"type": "builtin", "name": "star"}))
        );
        assert_eq!(
            ir.elements[1].args["icon"],
            ArgValue::Literal(json!({"type": "geometric", "shape": "circle", "color": "red", "size": 12}))
        );
        assert_eq!(
            ir.elements[2].args["icon"],
            ArgValue::Literal(json!({"type": "url", "icon_url": "https://x.org/i.png"}))
        );
    }

    #[test]
    fn test_round_trip_full_vocabulary() {
        let src = r#"
REF = "Majumdar, p. 12"
__TERRITORY_INDEX__ = ["KURU", "PANCALA"]
KURU = gadm("IND.12") | gadm("IND.13")
PANCALA = (gadm("IND.31") | gadm("IND.34")) - KURU
base_option("OpenStreetMap")
zoom(5)
flag("Kuru", KURU, period=[-1200, -500], note="x")
indic = import("/lib/indic/3")
river("Ganga", naturalearth("1159"), classes="major")
path("Uttarapatha", [[28, 77], [25, 85]])
point("Delhi", [28.6, 77.2], icon=Icon.geometric("square"))
text("Label", [22, 80])
admin(gadm="IND", level=2)
admin_rivers(["naturalearth"])
title_box("<b>Kuru</b>")
music("theme.mp3", timestamps=[0, 30])
"#;
        let first = ir(src);
        let emitted = ir_to_source(&first);
        let second = ir(&emitted);
        assert_eq!(first, second);
        assert_eq!(ir_to_source(&second), emitted);
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let src = "# lib\nB = gadm('X')|gadm( 'Y' )\nA=(gadm(\"P\")|gadm(\"Q\"))\nzoom( 3 )\n";
        let once = canonicalize(src).unwrap();
        let twice = canonicalize(&once).unwrap();
        assert_eq!(once, twice);
        assert!(!once.contains("# lib"));
        assert!(once.contains("A = (gadm(\"P\") | gadm(\"Q\"))"));
    }

    #[test]
    fn test_unclosed_call_keeps_following_statements() {
        let t = source_to_ir("flag(\"a\", gadm(\"X\")\nflag(\"b\", gadm(\"Y\"))\nzoom(2)").unwrap();
        assert_eq!(t.errors.len(), 1);
        assert_eq!(t.ir.elements.len(), 2);
        assert_eq!(t.ir.elements[0].script_text(), Some("flag(\"a\", gadm(\"X\")"));
        assert_eq!(t.ir.elements[1].kind, ElementKind::Flag);
        assert_eq!(t.ir.options.zoom, Some(2.0));
    }

    #[test]
    fn test_option_before_import_is_overridden() {
        let t = source_to_ir("zoom(3)\nfocus(1, 2)\nimport(\"/css/t\")\nfocus(5, 6)").unwrap();
        let overridden: Vec<OpName> = t.ir.imports[0].overrides.iter().copied().collect();
        assert_eq!(overridden, vec![OpName::Zoom]);
        assert_eq!(t.ir.options.focus, Some([5.0, 6.0]));

        let emitted = ir_to_source(&t.ir);
        let zoom_at = emitted.find("zoom(3)").unwrap();
        assert!(zoom_at < emitted.find("import(").unwrap());
        assert_eq!(source_to_ir(&emitted).unwrap().ir, t.ir);
    }

    #[test]
    fn test_unparsed_statement_survives() {
        let t = source_to_ir("flag(\"A\", gadm(\"A\")) + 1\nzoom(2)").unwrap();
        assert_eq!(t.errors.len(), 1);
        assert_eq!(
            t.ir.elements[0].script_text(),
            Some("flag(\"A\", gadm(\"A\")) + 1")
        );
        assert_eq!(t.ir.options.zoom, Some(2.0));
    }
}
