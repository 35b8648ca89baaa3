//! Artifact Store - Versioned Map, Theme and Library Sources
//!
//! The store is read-only from the engine's point of view. Two backends:
//! an in-memory store (tests, embedding) and a directory tree laid out as
//! `<root>/<owner>/<kind>/<name>/<version>.mf`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use thiserror::Error;

const ARTIFACT_EXTENSION: &str = "mf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Map,
    Theme,
    Library,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Map => "map",
            ArtifactKind::Theme => "theme",
            ArtifactKind::Library => "library",
        }
    }

    /// Short token used in import paths.
    pub fn path_token(&self) -> &'static str {
        match self {
            ArtifactKind::Map => "map",
            ArtifactKind::Theme => "css",
            ArtifactKind::Library => "lib",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "map" => Some(ArtifactKind::Map),
            "css" | "theme" => Some(ArtifactKind::Theme),
            "lib" | "library" => Some(ArtifactKind::Library),
            _ => None,
        }
    }
}

/// `alpha` is the unpublished head; numbers are published snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Version {
    #[default]
    Alpha,
    Number(u64),
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Alpha => write!(f, "alpha"),
            Version::Number(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Version {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "alpha" {
            return Ok(Version::Alpha);
        }
        s.parse::<u64>()
            .map(Version::Number)
            .map_err(|_| StoreError::InvalidPath(format!("invalid version '{}'", s)))
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Version::Alpha => serializer.serialize_str("alpha"),
            Version::Number(n) => serializer.serialize_u64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Version::Number(n)),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Reference to an artifact as written in an import path. The owner may be
/// omitted when the name is unique for its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRef {
    pub owner: Option<String>,
    pub kind: ArtifactKind,
    pub name: String,
    pub version: Version,
}

impl ArtifactRef {
    /// Parse `/kind/name[/version]` or `/owner/kind/name[/version]`.
    pub fn parse(path: &str) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidPath(path.to_string());
        let trimmed = path.trim().trim_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.iter().any(|s| !valid_segment(s)) {
            return Err(invalid());
        }

        // An owner-qualified path has the kind token in second position.
        let owned = segments.len() >= 3 && ArtifactKind::from_token(segments[1]).is_some()
            && (segments.len() == 4 || ArtifactKind::from_token(segments[0]).is_none());
        let (owner, rest) = if owned {
            (Some(segments[0].to_string()), &segments[1..])
        } else {
            (None, &segments[..])
        };

        let (kind, name, version) = match rest {
            [kind, name] => (*kind, *name, Version::Alpha),
            [kind, name, version] => (*kind, *name, version.parse()?),
            _ => return Err(invalid()),
        };
        let kind = ArtifactKind::from_token(kind).ok_or_else(invalid)?;

        Ok(Self {
            owner,
            kind,
            name: name.to_string(),
            version,
        })
    }

    pub fn to_path(&self) -> String {
        match &self.owner {
            Some(owner) => format!(
                "/{}/{}/{}/{}",
                owner,
                self.kind.path_token(),
                self.name,
                self.version
            ),
            None => format!("/{}/{}/{}", self.kind.path_token(), self.name, self.version),
        }
    }

    pub fn matches(&self, key: &ArtifactKey) -> bool {
        self.kind == key.kind
            && self.name == key.name
            && self.version == key.version
            && self.owner.as_ref().map_or(true, |o| *o == key.owner)
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && s != "."
        && s != ".."
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_path())
    }
}

impl TryFrom<String> for ArtifactRef {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArtifactRef> for String {
    fn from(r: ArtifactRef) -> Self {
        r.to_path()
    }
}

/// Fully resolved identity of a stored artifact; the import cycle guard keys on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub owner: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub version: Version,
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}/{}",
            self.owner,
            self.kind.path_token(),
            self.name,
            self.version
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub key: ArtifactKey,
    /// Raw stored blob: plain DSL or a JSON envelope of code sections
    pub source: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub modified_at: DateTime<Utc>,
}

impl Artifact {
    /// DSL text relevant to this artifact's kind.
    pub fn source_text(&self) -> String {
        extract_source_text(self.key.kind, &self.source)
    }
}

/// Coarse invalidation token: the newest modification time in the store,
/// in microseconds since the epoch (0 for an empty store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DependencyEpoch(pub i64);

impl DependencyEpoch {
    pub fn from_time(t: DateTime<Utc>) -> Self {
        Self(t.timestamp_micros())
    }
}

impl fmt::Display for DependencyEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact reference {0} is ambiguous; qualify it with an owner")]
    Ambiguous(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ArtifactStore: Send + Sync {
    fn get(&self, reference: &ArtifactRef) -> Result<Artifact, StoreError>;

    fn latest_modified(&self) -> Result<DependencyEpoch, StoreError>;
}

/// Pull the kind-relevant DSL out of a stored blob. JSON envelopes carry code
/// sections by name; anything else is treated as plain DSL.
pub fn extract_source_text(kind: ArtifactKind, blob: &str) -> String {
    let trimmed = blob.trim_start();
    if !trimmed.starts_with('{') {
        return blob.to_string();
    }
    let Ok(serde_json::Value::Object(envelope)) = serde_json::from_str::<serde_json::Value>(trimmed)
    else {
        return blob.to_string();
    };
    let field = |name: &str| {
        envelope
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let sections: Vec<String> = match kind {
        ArtifactKind::Library => field("predefined_code").into_iter().collect(),
        ArtifactKind::Theme => field("theme_code").into_iter().collect(),
        ArtifactKind::Map => ["imports_code", "theme_code", "map_code", "runtime_code"]
            .iter()
            .filter_map(|name| field(name))
            .collect(),
    };
    if sections.is_empty() {
        return field("code").unwrap_or_default();
    }
    sections.join("\n\n")
}

fn select_unique(reference: &ArtifactRef, mut candidates: Vec<Artifact>) -> Result<Artifact, StoreError> {
    match candidates.len() {
        0 => Err(StoreError::NotFound(reference.to_path())),
        1 => Ok(candidates.remove(0)),
        _ => Err(StoreError::Ambiguous(reference.to_path())),
    }
}

/// In-memory store; modification stamps are strictly increasing.
pub struct MemoryArtifactStore {
    artifacts: RwLock<BTreeMap<ArtifactKey, Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            artifacts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn put(&self, key: ArtifactKey, source: impl Into<String>) -> Artifact {
        let mut artifacts = self.artifacts.write().unwrap_or_else(|p| p.into_inner());
        let newest = artifacts.values().map(|a| a.modified_at).max();
        let mut modified_at = Utc::now();
        if let Some(newest) = newest {
            if modified_at <= newest {
                modified_at = newest + chrono::Duration::microseconds(1);
            }
        }
        let artifact = Artifact {
            key: key.clone(),
            source: source.into(),
            metadata: BTreeMap::new(),
            modified_at,
        };
        artifacts.insert(key, artifact.clone());
        artifact
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().map_or(0, |a| a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn get(&self, reference: &ArtifactRef) -> Result<Artifact, StoreError> {
        let artifacts = self.artifacts.read().unwrap_or_else(|p| p.into_inner());
        let candidates = artifacts
            .iter()
            .filter(|(key, _)| reference.matches(key))
            .map(|(_, a)| a.clone())
            .collect();
        select_unique(reference, candidates)
    }

    fn latest_modified(&self) -> Result<DependencyEpoch, StoreError> {
        let artifacts = self.artifacts.read().unwrap_or_else(|p| p.into_inner());
        Ok(artifacts
            .values()
            .map(|a| DependencyEpoch::from_time(a.modified_at))
            .max()
            .unwrap_or_default())
    }
}

/// Directory-backed store, read on demand so edits on disk are picked up.
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        if !root.is_dir() {
            return Err(StoreError::NotFound(root.display().to_string()));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(&key.owner)
            .join(key.kind.as_str())
            .join(&key.name)
            .join(format!("{}.{}", key.version, ARTIFACT_EXTENSION))
    }

    pub fn put(&self, key: &ArtifactKey, source: &str) -> Result<PathBuf, StoreError> {
        let path = self.artifact_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, source)?;
        Ok(path)
    }

    fn read(&self, key: ArtifactKey) -> Result<Option<Artifact>, StoreError> {
        let path = self.artifact_path(&key);
        if !path.is_file() {
            return Ok(None);
        }
        let source = fs::read_to_string(&path)?;
        let modified_at = modified_time(&path)?;
        Ok(Some(Artifact {
            key,
            source,
            metadata: BTreeMap::new(),
            modified_at,
        }))
    }

    fn owners(&self) -> Result<Vec<String>, StoreError> {
        let mut owners = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    owners.push(name.to_string());
                }
            }
        }
        owners.sort();
        Ok(owners)
    }
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>, StoreError> {
    let modified = fs::metadata(path)?.modified()?;
    let since = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(Utc
        .timestamp_opt(since.as_secs() as i64, since.subsec_nanos())
        .single()
        .unwrap_or_else(Utc::now))
}

fn newest_in(dir: &Path, newest: &mut Option<DateTime<Utc>>) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            newest_in(&path, newest)?;
        } else if path.extension().map_or(false, |e| e == ARTIFACT_EXTENSION) {
            let t = modified_time(&path)?;
            if newest.map_or(true, |n| t > n) {
                *newest = Some(t);
            }
        }
    }
    Ok(())
}

impl ArtifactStore for DirArtifactStore {
    fn get(&self, reference: &ArtifactRef) -> Result<Artifact, StoreError> {
        let owners = match &reference.owner {
            Some(owner) => vec![owner.clone()],
            None => self.owners()?,
        };
        let mut candidates = Vec::new();
        for owner in owners {
            let key = ArtifactKey {
                owner,
                kind: reference.kind,
                name: reference.name.clone(),
                version: reference.version.clone(),
            };
            if let Some(artifact) = self.read(key)? {
                candidates.push(artifact);
            }
        }
        select_unique(reference, candidates)
    }

    fn latest_modified(&self) -> Result<DependencyEpoch, StoreError> {
        let mut newest = None;
        newest_in(&self.root, &mut newest)?;
        Ok(newest.map(DependencyEpoch::from_time).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(owner: &str, kind: ArtifactKind, name: &str) -> ArtifactKey {
        ArtifactKey {
            owner: owner.into(),
            kind,
            name: name.into(),
            version: Version::Alpha,
        }
    }

    #[test]
    fn test_parse_paths() {
        let r = ArtifactRef::parse("/lib/indic").unwrap();
        assert_eq!(r.kind, ArtifactKind::Library);
        assert_eq!(r.owner, None);
        assert_eq!(r.version, Version::Alpha);

        let r = ArtifactRef::parse("/srajan/map/mauryas/3").unwrap();
        assert_eq!(r.owner.as_deref(), Some("srajan"));
        assert_eq!(r.kind, ArtifactKind::Map);
        assert_eq!(r.version, Version::Number(3));

        let r = ArtifactRef::parse("/alice/css/dark").unwrap();
        assert_eq!(r.owner.as_deref(), Some("alice"));
        assert_eq!(r.kind, ArtifactKind::Theme);

        let r = ArtifactRef::parse("/css/dark/alpha").unwrap();
        assert_eq!(r.owner, None);
        assert_eq!(r.kind, ArtifactKind::Theme);
    }

    #[test]
    fn test_invalid_paths() {
        assert!(ArtifactRef::parse("/widget/x").is_err());
        assert!(ArtifactRef::parse("/map").is_err());
        assert!(ArtifactRef::parse("/map/x/beta").is_err());
        assert!(ArtifactRef::parse("/map/../x").is_err());
    }

    #[test]
    fn test_envelope_extraction() {
        let blob = r#"{"imports_code": "a = 1", "map_code": "zoom(3)", "predefined_code": "X = gadm(\"A\")"}"#;
        assert_eq!(extract_source_text(ArtifactKind::Map, blob), "a = 1\n\nzoom(3)");
        assert_eq!(extract_source_text(ArtifactKind::Library, blob), "X = gadm(\"A\")");
        assert_eq!(extract_source_text(ArtifactKind::Theme, r#"{"code": "zoom(2)"}"#), "zoom(2)");
        assert_eq!(extract_source_text(ArtifactKind::Map, "zoom(1)"), "zoom(1)");
    }

    #[test]
    fn test_memory_store_epoch_monotonic() {
        let store = MemoryArtifactStore::new();
        assert_eq!(store.latest_modified().unwrap(), DependencyEpoch(0));
        store.put(key("a", ArtifactKind::Map, "m"), "zoom(1)");
        let e1 = store.latest_modified().unwrap();
        store.put(key("a", ArtifactKind::Map, "m"), "zoom(2)");
        let e2 = store.latest_modified().unwrap();
        assert!(e2 > e1);
    }

    #[test]
    fn test_memory_store_ambiguous_without_owner() {
        let store = MemoryArtifactStore::new();
        store.put(key("a", ArtifactKind::Library, "l"), "");
        store.put(key("b", ArtifactKind::Library, "l"), "");
        let r = ArtifactRef::parse("/lib/l").unwrap();
        assert!(matches!(store.get(&r), Err(StoreError::Ambiguous(_))));
        let r = ArtifactRef::parse("/b/lib/l").unwrap();
        assert_eq!(store.get(&r).unwrap().key.owner, "b");
    }

    #[test]
    fn test_dir_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirArtifactStore::open(dir.path()).unwrap();
        store
            .put(&key("alice", ArtifactKind::Theme, "dark"), "zoom(5)")
            .unwrap();
        let artifact = store.get(&ArtifactRef::parse("/css/dark").unwrap()).unwrap();
        assert_eq!(artifact.source, "zoom(5)");
        assert!(store.latest_modified().unwrap() > DependencyEpoch(0));
        assert!(matches!(
            store.get(&ArtifactRef::parse("/map/missing").unwrap()),
            Err(StoreError::NotFound(_))
        ));
    }
}
