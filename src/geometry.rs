//! Geometry - Region Sets and the Provider Boundary
//!
//! Geometry is opaque to the evaluator: it only needs union, difference and
//! intersection. The reference model is a set of indivisible region units,
//! which makes the set algebra exact.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::hashing::{canonical_json, sha256_hex};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub units: BTreeSet<String>,
}

impl Geometry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_units<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            units: units.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn union(&self, other: &Geometry) -> Geometry {
        Geometry {
            units: self.units.union(&other.units).cloned().collect(),
        }
    }

    pub fn difference(&self, other: &Geometry) -> Geometry {
        Geometry {
            units: self.units.difference(&other.units).cloned().collect(),
        }
    }

    pub fn intersection(&self, other: &Geometry) -> Geometry {
        Geometry {
            units: self.units.intersection(&other.units).cloned().collect(),
        }
    }

    pub fn overlaps(&self, other: &Geometry) -> bool {
        !self.units.is_disjoint(&other.units)
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown region code: {0}")]
    UnknownCode(String),

    #[error("Unknown {origin} feature: {name}")]
    UnknownFeature { origin: String, name: String },

    #[error("Invalid polygon: {0}")]
    InvalidPolygon(String),

    #[error("Catalog error: {0}")]
    Catalog(String),
}

pub trait GeometryProvider: Send + Sync {
    fn lookup_by_code(&self, code: &str) -> Result<Geometry, ProviderError>;

    fn from_polygon(&self, coords: &[[f64; 2]]) -> Result<Geometry, ProviderError>;

    fn lookup_named_feature(&self, source: &str, name: &str) -> Result<Geometry, ProviderError>;
}

/// Region catalog: boundary codes (`IND`, `IND.31`, `IND.31.2`, ...) and named
/// features per source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub features: BTreeMap<String, Vec<String>>,
}

/// Catalog-backed provider. A code expands to the finest catalog units at or
/// below it; permissive mode treats unknown codes and features as their own unit.
pub struct CatalogProvider {
    leaves: BTreeSet<String>,
    features: BTreeMap<String, BTreeSet<String>>,
    permissive: bool,
}

impl CatalogProvider {
    pub fn new(catalog: Catalog) -> Self {
        let regions: BTreeSet<String> = catalog.regions.into_iter().collect();
        let leaves = regions
            .iter()
            .filter(|code| {
                let prefix = format!("{}.", code);
                !regions.iter().any(|other| other.starts_with(&prefix))
            })
            .cloned()
            .collect();
        let features = catalog
            .features
            .into_iter()
            .map(|(source, names)| (source, names.into_iter().collect()))
            .collect();
        Self {
            leaves,
            features,
            permissive: false,
        }
    }

    /// Provider with no catalog that accepts every code and feature.
    pub fn permissive() -> Self {
        Self {
            permissive: true,
            ..Self::new(Catalog::default())
        }
    }

    pub fn with_permissive(mut self, permissive: bool) -> Self {
        self.permissive = permissive;
        self
    }

    pub fn load(path: &Path) -> Result<Self, ProviderError> {
        let content =
            fs::read_to_string(path).map_err(|e| ProviderError::Catalog(e.to_string()))?;
        let catalog: Catalog =
            serde_json::from_str(&content).map_err(|e| ProviderError::Catalog(e.to_string()))?;
        Ok(Self::new(catalog))
    }
}

impl Default for CatalogProvider {
    fn default() -> Self {
        Self::permissive()
    }
}

impl GeometryProvider for CatalogProvider {
    fn lookup_by_code(&self, code: &str) -> Result<Geometry, ProviderError> {
        let prefix = format!("{}.", code);
        let units: BTreeSet<String> = self
            .leaves
            .iter()
            .filter(|leaf| *leaf == code || leaf.starts_with(&prefix))
            .cloned()
            .collect();
        if !units.is_empty() {
            return Ok(Geometry { units });
        }
        if self.permissive && !code.trim().is_empty() {
            return Ok(Geometry::from_units([code]));
        }
        Err(ProviderError::UnknownCode(code.to_string()))
    }

    fn from_polygon(&self, coords: &[[f64; 2]]) -> Result<Geometry, ProviderError> {
        if coords.len() < 3 {
            return Err(ProviderError::InvalidPolygon(format!(
                "need at least 3 points, got {}",
                coords.len()
            )));
        }
        if coords.iter().flatten().any(|c| !c.is_finite()) {
            return Err(ProviderError::InvalidPolygon("non-finite coordinate".into()));
        }
        let canonical =
            canonical_json(&coords).map_err(|e| ProviderError::InvalidPolygon(e.to_string()))?;
        let digest = sha256_hex(canonical.as_bytes());
        Ok(Geometry::from_units([format!("polygon:{}", &digest[..16])]))
    }

    fn lookup_named_feature(&self, source: &str, name: &str) -> Result<Geometry, ProviderError> {
        let known = self
            .features
            .get(source)
            .is_some_and(|names| names.contains(name));
        if known || self.permissive {
            return Ok(Geometry::from_units([format!("{}:{}", source, name)]));
        }
        Err(ProviderError::UnknownFeature {
            origin: source.to_string(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> CatalogProvider {
        CatalogProvider::new(Catalog {
            regions: vec!["IND".into(), "IND.1".into(), "IND.2".into(), "IND.2.1".into(), "PAK".into()],
            features: [("naturalearth".to_string(), vec!["1159".to_string()])]
                .into_iter()
                .collect(),
        })
    }

    #[test]
    fn test_code_expands_to_leaf_units() {
        let p = provider();
        assert_eq!(
            p.lookup_by_code("IND").unwrap(),
            Geometry::from_units(["IND.1", "IND.2.1"])
        );
        assert_eq!(p.lookup_by_code("IND.2").unwrap(), Geometry::from_units(["IND.2.1"]));
        assert!(p.lookup_by_code("IN").is_err());
    }

    #[test]
    fn test_set_algebra_laws() {
        let p = provider();
        let a = p.lookup_by_code("IND").unwrap();
        let b = p.lookup_by_code("IND.1").unwrap();
        assert_eq!(a.union(&a), a);
        assert!(!a.union(&b).difference(&b).overlaps(&b));
        assert_eq!(a.intersection(&b), b);
    }

    #[test]
    fn test_polygon_units_are_content_addressed() {
        let p = CatalogProvider::permissive();
        let tri = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        assert_eq!(p.from_polygon(&tri).unwrap(), p.from_polygon(&tri).unwrap());
        assert!(p.from_polygon(&tri[..2]).is_err());
    }

    #[test]
    fn test_features_and_permissive_mode() {
        let p = provider();
        assert!(p.lookup_named_feature("naturalearth", "1159").is_ok());
        assert!(p.lookup_named_feature("overpass", "1").is_err());
        let p = provider().with_permissive(true);
        assert_eq!(p.lookup_by_code("XYZ").unwrap(), Geometry::from_units(["XYZ"]));
    }
}
