//! Builder IR - Structured Map Project Representation
//!
//! The IR is interchangeable with DSL source. Element order is significant:
//! it decides z-ordering and where pending imports are flushed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::store::ArtifactRef;
use crate::territory::TerritoryExpr;

/// Current Builder IR format version.
pub const IR_VERSION: &str = "1.0.0";

pub const DEFAULT_STEP_H: f64 = 1.6180339887;
pub const DEFAULT_COLORMAP_COLORS: &str = "yellow,orange,red";

/// Verbatim source text for an expression the IR does not model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawExpr {
    #[serde(rename = "__raw__")]
    pub raw: String,
}

impl RawExpr {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            raw: text.into().trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Raw(RawExpr),
    Literal(Value),
}

impl ArgValue {
    pub fn literal(&self) -> Option<&Value> {
        match self {
            ArgValue::Literal(v) => Some(v),
            ArgValue::Raw(_) => None,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, ArgValue::Raw(_))
    }
}

impl From<Value> for ArgValue {
    fn from(v: Value) -> Self {
        ArgValue::Literal(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    Flag,
    River,
    Path,
    Point,
    Text,
    AdminBoundary,
    AdminRivers,
    DataOverlay,
    TitleBox,
    AudioTrack,
    RawScript,
}

/// Named geographic feature such as a river, fetched from a given source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureRef {
    pub source: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ElementValue {
    #[default]
    None,
    Territory(TerritoryExpr),
    Feature(FeatureRef),
    Literal(Value),
    Raw(RawExpr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<ArgValue>,
    #[serde(default)]
    pub value: ElementValue,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, ArgValue>,
}

impl Element {
    pub fn new(kind: ElementKind) -> Self {
        Self {
            kind,
            label: None,
            value: ElementValue::None,
            args: BTreeMap::new(),
        }
    }

    pub fn raw_script(text: impl Into<String>) -> Self {
        Self {
            value: ElementValue::Raw(RawExpr {
                raw: text.into(),
            }),
            ..Self::new(ElementKind::RawScript)
        }
    }

    pub fn with_label(mut self, label: impl Into<Value>) -> Self {
        self.label = Some(ArgValue::Literal(label.into()));
        self
    }

    pub fn with_value(mut self, value: ElementValue) -> Self {
        self.value = value;
        self
    }

    pub fn with_arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.args
            .insert(name.to_string(), ArgValue::Literal(value.into()));
        self
    }

    /// Source text of a raw script element.
    pub fn script_text(&self) -> Option<&str> {
        match (&self.kind, &self.value) {
            (ElementKind::RawScript, ElementValue::Raw(raw)) => Some(&raw.raw),
            _ => None,
        }
    }

    /// Filter name for this element, `None` for raw scripts.
    pub fn op_name(&self) -> Option<OpName> {
        OpName::for_element(self.kind)
    }

    /// Whether any part of the element is unmodelled source text.
    pub fn has_raw(&self) -> bool {
        self.kind == ElementKind::RawScript
            || matches!(self.value, ElementValue::Raw(_))
            || self.label.as_ref().is_some_and(ArgValue::is_raw)
            || self.args.values().any(ArgValue::is_raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Basemap {
    pub url_or_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CssRule {
    pub selector: String,
    pub style: String,
}

fn default_step_h() -> f64 { DEFAULT_STEP_H }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorSequence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Comma-separated colors
    pub colors: String,
    #[serde(default = "default_step_h")]
    pub step_h: f64,
    #[serde(default)]
    pub step_s: f64,
    #[serde(default)]
    pub step_l: f64,
}

impl ColorSequence {
    pub fn has_default_step(&self) -> bool {
        self.step_h == DEFAULT_STEP_H && self.step_s == 0.0 && self.step_l == 0.0
    }
}

fn default_colormap_colors() -> String { DEFAULT_COLORMAP_COLORS.to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataColormap {
    #[serde(rename = "type")]
    pub map_type: String,
    #[serde(default = "default_colormap_colors")]
    pub colors: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

/// Render options; list fields accumulate, scalar fields are last-writer-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub basemaps: Vec<Basemap>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub css_rules: Vec<CssRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flag_color_sequences: Vec<ColorSequence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admin_color_sequences: Vec<ColorSequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_colormap: Option<DataColormap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zoom: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus: Option<[f64; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slider: Option<Slider>,
}

impl Options {
    /// Apply `other` on top of `self`.
    pub fn merge(&mut self, other: Options) {
        self.basemaps.extend(other.basemaps);
        self.css_rules.extend(other.css_rules);
        self.flag_color_sequences.extend(other.flag_color_sequences);
        self.admin_color_sequences.extend(other.admin_color_sequences);
        if other.data_colormap.is_some() {
            self.data_colormap = other.data_colormap;
        }
        if other.zoom.is_some() {
            self.zoom = other.zoom;
        }
        if other.focus.is_some() {
            self.focus = other.focus;
        }
        if other.slider.is_some() {
            self.slider = other.slider;
        }
    }

    /// Keep only the option groups allowed by an import filter.
    pub fn filtered(mut self, filter: &ImportFilter) -> Options {
        if !filter.allows(OpName::BaseOption) {
            self.basemaps.clear();
        }
        if !filter.allows(OpName::Css) {
            self.css_rules.clear();
        }
        if !filter.allows(OpName::FlagColorSequence) {
            self.flag_color_sequences.clear();
        }
        if !filter.allows(OpName::AdminColorSequence) {
            self.admin_color_sequences.clear();
        }
        if !filter.allows(OpName::DataColormap) {
            self.data_colormap = None;
        }
        if !filter.allows(OpName::Zoom) {
            self.zoom = None;
        }
        if !filter.allows(OpName::Focus) {
            self.focus = None;
        }
        if !filter.allows(OpName::Slider) {
            self.slider = None;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Options::default()
    }
}

/// Closed vocabulary of primitive operations; also the import filter vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpName {
    Flag,
    River,
    Path,
    Point,
    Text,
    Admin,
    AdminRivers,
    Dataframe,
    TitleBox,
    Music,
    BaseOption,
    Css,
    Zoom,
    Focus,
    Slider,
    FlagColorSequence,
    AdminColorSequence,
    DataColormap,
}

impl OpName {
    pub const ALL: [OpName; 18] = [
        OpName::Flag,
        OpName::River,
        OpName::Path,
        OpName::Point,
        OpName::Text,
        OpName::Admin,
        OpName::AdminRivers,
        OpName::Dataframe,
        OpName::TitleBox,
        OpName::Music,
        OpName::BaseOption,
        OpName::Css,
        OpName::Zoom,
        OpName::Focus,
        OpName::Slider,
        OpName::FlagColorSequence,
        OpName::AdminColorSequence,
        OpName::DataColormap,
    ];

    /// Options holding a single value, where the last writer wins.
    pub fn is_scalar_option(&self) -> bool {
        matches!(
            self,
            OpName::Zoom | OpName::Focus | OpName::Slider | OpName::DataColormap
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpName::Flag => "flag",
            OpName::River => "river",
            OpName::Path => "path",
            OpName::Point => "point",
            OpName::Text => "text",
            OpName::Admin => "admin",
            OpName::AdminRivers => "admin_rivers",
            OpName::Dataframe => "dataframe",
            OpName::TitleBox => "title_box",
            OpName::Music => "music",
            OpName::BaseOption => "base_option",
            OpName::Css => "css",
            OpName::Zoom => "zoom",
            OpName::Focus => "focus",
            OpName::Slider => "slider",
            OpName::FlagColorSequence => "flag_color_sequence",
            OpName::AdminColorSequence => "admin_color_sequence",
            OpName::DataColormap => "data_colormap",
        }
    }

    pub fn for_element(kind: ElementKind) -> Option<OpName> {
        Some(match kind {
            ElementKind::Flag => OpName::Flag,
            ElementKind::River => OpName::River,
            ElementKind::Path => OpName::Path,
            ElementKind::Point => OpName::Point,
            ElementKind::Text => OpName::Text,
            ElementKind::AdminBoundary => OpName::Admin,
            ElementKind::AdminRivers => OpName::AdminRivers,
            ElementKind::DataOverlay => OpName::Dataframe,
            ElementKind::TitleBox => OpName::TitleBox,
            ElementKind::AudioTrack => OpName::Music,
            ElementKind::RawScript => return None,
        })
    }

    pub fn element_kind(&self) -> Option<ElementKind> {
        Some(match self {
            OpName::Flag => ElementKind::Flag,
            OpName::River => ElementKind::River,
            OpName::Path => ElementKind::Path,
            OpName::Point => ElementKind::Point,
            OpName::Text => ElementKind::Text,
            OpName::Admin => ElementKind::AdminBoundary,
            OpName::AdminRivers => ElementKind::AdminRivers,
            OpName::Dataframe => ElementKind::DataOverlay,
            OpName::TitleBox => ElementKind::TitleBox,
            OpName::Music => ElementKind::AudioTrack,
            _ => return None,
        })
    }
}

impl fmt::Display for OpName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpName::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown operation '{}'", s))
    }
}

/// Allow/deny sets of an import; deny wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFilter {
    #[serde(rename = "filter_only", default, skip_serializing_if = "Option::is_none")]
    pub only: Option<BTreeSet<OpName>>,
    #[serde(rename = "filter_not", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub not: BTreeSet<OpName>,
}

impl ImportFilter {
    pub fn allows(&self, op: OpName) -> bool {
        if self.not.contains(&op) {
            return false;
        }
        self.only.as_ref().map_or(true, |only| only.contains(&op))
    }

    /// Raw scripts carry no operation name and always pass.
    pub fn allows_element(&self, element: &Element) -> bool {
        element.op_name().map_or(true, |op| self.allows(op))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStatement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub artifact: ArtifactRef,
    #[serde(flatten)]
    pub filter: ImportFilter,
    /// Number of local elements authored before this import
    #[serde(default)]
    pub anchor: usize,
    /// Scalar options last set locally before this import; the imported
    /// values for these take precedence over the local ones
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub overrides: BTreeSet<OpName>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTerritoryDef {
    pub name: String,
    pub expr: TerritoryExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantDef {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuilderIR {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<ImportStatement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constants: Vec<ConstantDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub territories: Vec<NamedTerritoryDef>,
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default)]
    pub options: Options,
}

impl BuilderIR {
    pub fn territory(&self, name: &str) -> Option<&TerritoryExpr> {
        self.territories
            .iter()
            .rev()
            .find(|d| d.name == name)
            .map(|d| &d.expr)
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants
            .iter()
            .rev()
            .find(|d| d.name == name)
            .map(|d| &d.value)
    }

    /// Append another IR after this one. Imports are re-anchored after the
    /// existing elements.
    pub fn append(&mut self, other: BuilderIR) {
        let offset = self.elements.len();
        self.imports.extend(other.imports.into_iter().map(|mut i| {
            i.anchor += offset;
            i
        }));
        self.constants.extend(other.constants);
        self.territories.extend(other.territories);
        self.elements.extend(other.elements);
        self.options.merge(other.options);
    }

    pub fn has_raw(&self) -> bool {
        self.elements.iter().any(Element::has_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arg_value_raw_vs_literal() {
        let raw: ArgValue = serde_json::from_value(json!({"__raw__": "x + 1"})).unwrap();
        assert_eq!(raw, ArgValue::Raw(RawExpr::new("x + 1")));
        let lit: ArgValue = serde_json::from_value(json!({"__raw__": "x", "other": 1})).unwrap();
        assert!(matches!(lit, ArgValue::Literal(_)));
    }

    #[test]
    fn test_filter_deny_wins() {
        let filter = ImportFilter {
            only: Some([OpName::Flag, OpName::Zoom].into_iter().collect()),
            not: [OpName::Flag].into_iter().collect(),
        };
        assert!(!filter.allows(OpName::Flag));
        assert!(filter.allows(OpName::Zoom));
        assert!(!filter.allows(OpName::River));
        assert!(filter.allows_element(&Element::raw_script("# note")));
    }

    #[test]
    fn test_options_merge_and_filter() {
        let mut base = Options {
            zoom: Some(3.0),
            css_rules: vec![CssRule { selector: "a".into(), style: "b".into() }],
            ..Default::default()
        };
        let theme = Options {
            zoom: Some(5.0),
            css_rules: vec![CssRule { selector: "c".into(), style: "d".into() }],
            ..Default::default()
        };
        let filter = ImportFilter {
            only: None,
            not: [OpName::Zoom].into_iter().collect(),
        };
        base.merge(theme.filtered(&filter));
        assert_eq!(base.zoom, Some(3.0));
        assert_eq!(base.css_rules.len(), 2);
    }

    #[test]
    fn test_op_name_parse() {
        assert_eq!("admin_rivers".parse::<OpName>().unwrap(), OpName::AdminRivers);
        assert!("flags".parse::<OpName>().is_err());
        for op in OpName::ALL {
            assert_eq!(op.as_str().parse::<OpName>().unwrap(), op);
        }
    }

    #[test]
    fn test_append_reanchors_imports() {
        let mut a = BuilderIR::default();
        a.elements.push(Element::new(ElementKind::Text));
        let mut b = BuilderIR::default();
        b.imports.push(ImportStatement {
            alias: None,
            artifact: ArtifactRef::parse("/map/m").unwrap(),
            filter: ImportFilter::default(),
            anchor: 0,
            overrides: BTreeSet::new(),
        });
        a.append(b);
        assert_eq!(a.imports[0].anchor, 1);
    }
}
