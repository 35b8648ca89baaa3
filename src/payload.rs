//! Job Payloads - Submission Surface and Lowering
//!
//! Every task type lowers to a `BuilderIR` before evaluation. Parsing the
//! payload is strict: unknown task types and malformed payloads are rejected
//! before anything is scheduled.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::diagnostics::JobError;
use crate::ir::{
    ArgValue, Basemap, BuilderIR, Element, ElementKind, ElementValue, IR_VERSION,
};
use crate::parser::ParseError;
use crate::store::{ArtifactKind, ArtifactRef, ArtifactStore};
use crate::territory::TerritoryExpr;
use crate::transpile::source_to_ir;

/// Constant listing the territories a catalog offers by default.
pub const TERRITORY_INDEX: &str = "__TERRITORY_INDEX__";

/// Builder IR format versions this engine accepts.
pub const SUPPORTED_IR_VERSIONS: &str = "^1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    FromGeographicPicker,
    FromCustomTerritorySet,
    FromSource,
    #[serde(rename = "fromBuilderIR")]
    FromBuilderIr,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::FromGeographicPicker,
        TaskType::FromCustomTerritorySet,
        TaskType::FromSource,
        TaskType::FromBuilderIr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::FromGeographicPicker => "fromGeographicPicker",
            TaskType::FromCustomTerritorySet => "fromCustomTerritorySet",
            TaskType::FromSource => "fromSource",
            TaskType::FromBuilderIr => "fromBuilderIR",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::invalid_payload(format!("Unknown task type: {}", s)))
    }
}

fn default_level() -> u8 { 0 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickerEntry {
    pub country: String,
    #[serde(default = "default_level")]
    pub level: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PickerPayload {
    pub entries: Vec<PickerEntry>,
    #[serde(default)]
    pub admin_rivers: bool,
    #[serde(default)]
    pub basemaps: Vec<Basemap>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerritorySource {
    #[default]
    Builtin,
    Custom,
    Hub,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerritorySetPayload {
    #[serde(default)]
    pub source: TerritorySource,
    /// Library code for the `custom` source
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
    /// Library artifact for the `hub` source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<ArtifactRef>,
    /// Territories to draw; empty selects the catalog's index
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub basemaps: Vec<Basemap>,
}

/// Auxiliary code sections a project carries next to its main body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeSections {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub imports_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub predefined_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub theme_code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runtime_code: String,
}

impl CodeSections {
    pub fn is_empty(&self) -> bool {
        self.byte_len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.imports_code.len()
            + self.predefined_code.len()
            + self.theme_code.len()
            + self.runtime_code.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePayload {
    pub code: String,
    #[serde(flatten)]
    pub sections: CodeSections,
}

impl SourcePayload {
    /// Sections joined around the main code.
    pub fn full_source(&self) -> String {
        [
            self.sections.imports_code.as_str(),
            self.sections.predefined_code.as_str(),
            self.sections.theme_code.as_str(),
            self.code.as_str(),
            self.sections.runtime_code.as_str(),
        ]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
    }
}

fn default_ir_version() -> String { IR_VERSION.to_string() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderPayload {
    #[serde(default = "default_ir_version")]
    pub ir_version: String,
    pub ir: BuilderIR,
    #[serde(flatten)]
    pub sections: CodeSections,
}

impl BuilderPayload {
    pub fn new(ir: BuilderIR) -> Self {
        Self {
            ir_version: IR_VERSION.to_string(),
            ir,
            sections: CodeSections::default(),
        }
    }

    pub fn check_version(&self) -> Result<(), JobError> {
        let version = semver::Version::parse(&self.ir_version).map_err(|_| {
            JobError::invalid_payload(format!("Invalid IR version: {}", self.ir_version))
        })?;
        let supported = semver::VersionReq::parse(SUPPORTED_IR_VERSIONS)
            .map_err(|e| JobError::invalid_payload(e.to_string()))?;
        if !supported.matches(&version) {
            return Err(JobError::invalid_payload(format!(
                "IR version {} is not supported (engine accepts {})",
                self.ir_version, SUPPORTED_IR_VERSIONS
            )));
        }
        Ok(())
    }

    /// Fold the code sections into the IR: imports, predefined and theme code
    /// before the builder elements, runtime code after them.
    pub fn into_ir(self) -> Result<(BuilderIR, Vec<ParseError>), JobError> {
        let CodeSections {
            imports_code,
            predefined_code,
            theme_code,
            runtime_code,
        } = self.sections;
        let mut ir = BuilderIR::default();
        let mut errors = Vec::new();
        for code in [imports_code, predefined_code, theme_code] {
            append_source(&mut ir, &mut errors, &code)?;
        }
        ir.append(self.ir);
        append_source(&mut ir, &mut errors, &runtime_code)?;
        Ok((ir, errors))
    }
}

fn append_source(ir: &mut BuilderIR, errors: &mut Vec<ParseError>, code: &str) -> Result<(), JobError> {
    if code.trim().is_empty() {
        return Ok(());
    }
    let transpiled = source_to_ir(code)?;
    errors.extend(transpiled.errors);
    ir.append(transpiled.ir);
    Ok(())
}

/// A parsed job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Picker(PickerPayload),
    TerritorySet(TerritorySetPayload),
    Source(SourcePayload),
    Builder(BuilderPayload),
}

impl Payload {
    pub fn parse(task_type: TaskType, value: Value) -> Result<Self, JobError> {
        let invalid = |e: serde_json::Error| {
            JobError::invalid_payload(format!("Invalid {} payload: {}", task_type, e))
        };
        let payload = match task_type {
            TaskType::FromGeographicPicker => {
                Payload::Picker(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::FromCustomTerritorySet => {
                Payload::TerritorySet(serde_json::from_value(value).map_err(invalid)?)
            }
            TaskType::FromSource => Payload::Source(serde_json::from_value(value).map_err(invalid)?),
            TaskType::FromBuilderIr => {
                let builder: BuilderPayload = serde_json::from_value(value).map_err(invalid)?;
                builder.check_version()?;
                Payload::Builder(builder)
            }
        };
        Ok(payload)
    }

    /// Number of DSL source bytes carried by the payload.
    pub fn source_bytes(&self) -> usize {
        match self {
            Payload::Picker(_) => 0,
            Payload::TerritorySet(p) => p.code.len(),
            Payload::Source(p) => p.code.len() + p.sections.byte_len(),
            Payload::Builder(p) => p.sections.byte_len(),
        }
    }
}

/// Territory listing produced for catalog renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerritoryCatalog {
    pub available_names: Vec<String>,
    pub index_names: Vec<String>,
}

/// A payload reduced to IR, ready for import resolution.
#[derive(Debug, Clone, Default)]
pub struct Lowered {
    pub ir: BuilderIR,
    pub errors: Vec<ParseError>,
    pub catalog: Option<TerritoryCatalog>,
}

/// What lowering may need beyond the payload itself.
pub struct LowerContext<'a> {
    pub store: &'a dyn ArtifactStore,
    pub builtin_library: Option<&'a ArtifactRef>,
}

pub fn lower(payload: Payload, ctx: &LowerContext) -> Result<Lowered, JobError> {
    match payload {
        Payload::Picker(p) => Ok(Lowered {
            ir: lower_picker(p),
            ..Lowered::default()
        }),
        Payload::TerritorySet(p) => lower_territory_set(p, ctx),
        Payload::Source(p) => {
            let transpiled = source_to_ir(&p.full_source())?;
            Ok(Lowered {
                ir: transpiled.ir,
                errors: transpiled.errors,
                catalog: None,
            })
        }
        Payload::Builder(p) => {
            p.check_version()?;
            let (ir, errors) = p.into_ir()?;
            Ok(Lowered {
                ir,
                errors,
                catalog: None,
            })
        }
    }
}

fn lower_picker(payload: PickerPayload) -> BuilderIR {
    let mut ir = BuilderIR::default();
    for entry in &payload.entries {
        ir.elements.push(
            Element::new(ElementKind::AdminBoundary)
                .with_value(ElementValue::Literal(Value::from(entry.country.clone())))
                .with_arg("level", entry.level),
        );
    }
    if payload.admin_rivers && !payload.entries.is_empty() {
        let countries: Vec<Value> = payload
            .entries
            .iter()
            .map(|e| Value::from(e.country.clone()))
            .collect();
        ir.elements.push(
            Element::new(ElementKind::AdminRivers).with_value(ElementValue::Literal(Value::Array(countries))),
        );
    }
    ir.options.basemaps = payload.basemaps;
    ir
}

fn lower_territory_set(payload: TerritorySetPayload, ctx: &LowerContext) -> Result<Lowered, JobError> {
    let code = match payload.source {
        TerritorySource::Custom => payload.code.clone(),
        TerritorySource::Builtin | TerritorySource::Hub => {
            let reference = match payload.source {
                TerritorySource::Hub => payload.library.as_ref(),
                _ => ctx.builtin_library,
            }
            .ok_or_else(|| JobError::invalid_payload("No territory library configured"))?;
            if reference.kind != ArtifactKind::Library {
                return Err(JobError::invalid_payload(format!(
                    "{} is not a library",
                    reference
                )));
            }
            ctx.store
                .get(reference)
                .map_err(|e| JobError::invalid_payload(e.to_string()))?
                .source_text()
        }
    };

    let transpiled = source_to_ir(&code)?;
    let library = transpiled.ir;
    let available_names = catalog_names(&library);
    let index_names = index_names(&library, &available_names);
    let selected = if payload.names.is_empty() {
        index_names.clone()
    } else {
        payload.names.clone()
    };

    // Only the library's definitions and imports feed the render; its own
    // elements are not drawn.
    let mut ir = BuilderIR {
        imports: library
            .imports
            .into_iter()
            .map(|mut i| {
                i.anchor = 0;
                i
            })
            .collect(),
        constants: library.constants,
        territories: library.territories,
        ..BuilderIR::default()
    };
    for name in selected {
        ir.elements.push(Element {
            label: Some(ArgValue::Literal(Value::from(name.clone()))),
            value: ElementValue::Territory(TerritoryExpr::named(name)),
            ..Element::new(ElementKind::Flag)
        });
    }
    ir.options.basemaps = payload.basemaps;

    Ok(Lowered {
        ir,
        errors: transpiled.errors,
        catalog: Some(TerritoryCatalog {
            available_names,
            index_names,
        }),
    })
}

/// Public territory names: assigned names not starting with `_`.
fn catalog_names(ir: &BuilderIR) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for def in &ir.territories {
        if !def.name.starts_with('_') && !names.contains(&def.name) {
            names.push(def.name.clone());
        }
    }
    names
}

fn index_names(ir: &BuilderIR, available: &[String]) -> Vec<String> {
    let Some(Value::Array(index)) = ir.constant(TERRITORY_INDEX) else {
        return available.to_vec();
    };
    let names: Vec<String> = index
        .iter()
        .filter_map(Value::as_str)
        .filter(|n| available.iter().any(|a| a == n))
        .map(str::to_string)
        .collect();
    if names.is_empty() {
        available.to_vec()
    } else {
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ArtifactKey, MemoryArtifactStore, Version};
    use serde_json::json;

    fn ctx<'a>(store: &'a MemoryArtifactStore, builtin: Option<&'a ArtifactRef>) -> LowerContext<'a> {
        LowerContext {
            store,
            builtin_library: builtin,
        }
    }

    #[test]
    fn test_task_type_names() {
        assert_eq!(
            serde_json::to_value(TaskType::FromBuilderIr).unwrap(),
            json!("fromBuilderIR")
        );
        assert_eq!("fromSource".parse::<TaskType>().unwrap(), TaskType::FromSource);
        assert!("fromNowhere".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_builder_version_gate() {
        let ok = Payload::parse(TaskType::FromBuilderIr, json!({"ir_version": "1.4.0", "ir": {}}));
        assert!(ok.is_ok());
        let err = Payload::parse(TaskType::FromBuilderIr, json!({"ir_version": "2.0.0", "ir": {}}))
            .unwrap_err();
        assert_eq!(err.kind, crate::diagnostics::ErrorKind::InvalidPayload);
    }

    #[test]
    fn test_builder_sections_wrap_elements() {
        let payload = Payload::parse(
            TaskType::FromBuilderIr,
            json!({
                "ir": {"elements": [{"type": "Text", "label": "mid", "value": {"literal": [0, 0]}}]},
                "predefined_code": "K = gadm(\"K\")",
                "runtime_code": "text(\"last\", [1, 1])",
            }),
        )
        .unwrap();
        let store = MemoryArtifactStore::new();
        let lowered = lower(payload, &ctx(&store, None)).unwrap();
        assert_eq!(lowered.ir.territories.len(), 1);
        let labels: Vec<_> = lowered
            .ir
            .elements
            .iter()
            .filter_map(|e| e.label.as_ref()?.literal().cloned())
            .collect();
        assert_eq!(labels, vec![json!("mid"), json!("last")]);
    }

    #[test]
    fn test_picker_lowering() {
        let payload = Payload::parse(
            TaskType::FromGeographicPicker,
            json!({"entries": [{"country": "IND", "level": 1}, {"country": "PAK"}], "admin_rivers": true}),
        )
        .unwrap();
        let store = MemoryArtifactStore::new();
        let ir = lower(payload, &ctx(&store, None)).unwrap().ir;
        assert_eq!(ir.elements.len(), 3);
        assert_eq!(ir.elements[0].kind, ElementKind::AdminBoundary);
        assert_eq!(ir.elements[1].args["level"], ArgValue::Literal(json!(0)));
        assert_eq!(ir.elements[2].kind, ElementKind::AdminRivers);
    }

    #[test]
    fn test_territory_catalog_from_builtin_library() {
        let store = MemoryArtifactStore::new();
        store.put(
            ArtifactKey {
                owner: "system".into(),
                kind: ArtifactKind::Library,
                name: "builtin".into(),
                version: Version::Alpha,
            },
            "_HELPER = gadm(\"H\")\nKURU = gadm(\"K\")\nPANCHALA = gadm(\"P\")\n__TERRITORY_INDEX__ = [\"PANCHALA\", \"GONE\"]",
        );
        let builtin = ArtifactRef::parse("/lib/builtin").unwrap();
        let payload = Payload::parse(TaskType::FromCustomTerritorySet, json!({})).unwrap();
        let lowered = lower(payload, &ctx(&store, Some(&builtin))).unwrap();
        let catalog = lowered.catalog.unwrap();
        assert_eq!(catalog.available_names, vec!["KURU", "PANCHALA"]);
        assert_eq!(catalog.index_names, vec!["PANCHALA"]);
        assert_eq!(lowered.ir.elements.len(), 1);
    }

    #[test]
    fn test_custom_territory_set_requires_no_store() {
        let store = MemoryArtifactStore::new();
        let payload = Payload::parse(
            TaskType::FromCustomTerritorySet,
            json!({"source": "custom", "code": "A = gadm(\"A\")\nB = gadm(\"B\")", "names": ["B"]}),
        )
        .unwrap();
        let lowered = lower(payload, &ctx(&store, None)).unwrap();
        assert_eq!(lowered.catalog.unwrap().index_names, vec!["A", "B"]);
        assert_eq!(lowered.ir.elements.len(), 1);
    }
}
