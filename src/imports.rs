//! Import Resolver - Cross-Artifact Flattening
//!
//! Map imports are queued and flushed right before the importing source's next
//! local element, so authoring order is kept across artifact boundaries.
//! Theme imports merge their options immediately. Library imports become
//! namespaces (or unqualified globs) whose territories evaluate lazily.
//!
//! Local options win over imported ones, except scalar options the source
//! set before the import statement: there the import's value stands.
//!
//! An artifact that is already being imported higher up the stack is skipped
//! with a warning; cycles never fail the job. For untrusted jobs every loaded
//! artifact is stripped the same way an untrusted payload is.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::diagnostics::{Diagnostic, ErrorKind};
use crate::evaluator::{Evaluator, ScopeId};
use crate::ir::{BuilderIR, Element, ImportFilter, ImportStatement, Options};
use crate::sanitize::{strip, SanitizeReport};
use crate::store::{Artifact, ArtifactKey, ArtifactKind, ArtifactStore};
use crate::transpile::source_to_ir;

/// An element together with the scope its names resolve in.
#[derive(Debug, Clone)]
pub struct QueuedElement {
    pub scope: ScopeId,
    pub element: Element,
}

/// Ordered output of a flattened source unit.
#[derive(Debug, Clone, Default)]
pub struct Flattened {
    pub elements: Vec<QueuedElement>,
    pub options: Options,
}

impl Flattened {
    fn absorb(&mut self, other: Flattened) {
        self.elements.extend(other.elements);
        self.options.merge(other.options);
    }

    fn filtered(self, stmt: &ImportStatement) -> Flattened {
        Flattened {
            elements: self
                .elements
                .into_iter()
                .filter(|q| stmt.filter.allows_element(&q.element))
                .collect(),
            options: self.options.filtered(&stmt.filter),
        }
    }
}

struct LoadedLibrary {
    scope: ScopeId,
    /// Map imports declared inside the library, handed to its first importer
    reexports: Vec<Flattened>,
}

pub struct ImportResolver<'a> {
    store: &'a dyn ArtifactStore,
    max_artifact_bytes: usize,
    active: Vec<ArtifactKey>,
    libraries: HashMap<ArtifactKey, LoadedLibrary>,
    exported: HashSet<ArtifactKey>,
    trusted: bool,
}

impl<'a> ImportResolver<'a> {
    pub fn new(store: &'a dyn ArtifactStore, max_artifact_bytes: usize) -> Self {
        Self {
            store,
            max_artifact_bytes,
            active: Vec::new(),
            libraries: HashMap::new(),
            exported: HashSet::new(),
            trusted: true,
        }
    }

    pub fn with_trust(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    /// Flatten an IR whose definitions already live in `scope`.
    pub fn flatten(&mut self, ev: &mut Evaluator, ir: BuilderIR, scope: ScopeId) -> Flattened {
        let BuilderIR {
            mut imports,
            elements,
            options: local_options,
            ..
        } = ir;
        imports.sort_by_key(|i| i.anchor);

        let mut out = Flattened::default();
        let mut pending: Vec<Flattened> = Vec::new();
        let mut overriding: Vec<(ImportFilter, Options)> = Vec::new();
        let mut next = 0;

        for (index, element) in elements.into_iter().enumerate() {
            while let Some(stmt) = imports.get(next).filter(|i| i.anchor <= index) {
                let contributed = self.resolve_import(ev, stmt, scope, &mut out.options, &mut pending);
                keep_overrides(stmt, contributed, &mut overriding);
                next += 1;
            }
            for batch in pending.drain(..) {
                out.absorb(batch);
            }
            out.elements.push(QueuedElement { scope, element });
        }
        for stmt in &imports[next.min(imports.len())..] {
            let contributed = self.resolve_import(ev, stmt, scope, &mut out.options, &mut pending);
            keep_overrides(stmt, contributed, &mut overriding);
        }
        for batch in pending.drain(..) {
            out.absorb(batch);
        }

        out.options.merge(local_options);
        for (filter, options) in overriding {
            out.options.merge(options.filtered(&filter));
        }
        out
    }

    /// Resolve one import into `scope`. Maps go to `pending`, themes merge
    /// into `options`, libraries bind a namespace. Returns the options the
    /// import contributed.
    pub fn resolve_import(
        &mut self,
        ev: &mut Evaluator,
        stmt: &ImportStatement,
        scope: ScopeId,
        options: &mut Options,
        pending: &mut Vec<Flattened>,
    ) -> Options {
        let Some(artifact) = self.load(ev, stmt) else {
            if let Some(alias) = &stmt.alias {
                ev.bind_alias(scope, alias, None);
            }
            return Options::default();
        };
        let key = artifact.key.clone();
        let mut contributed = Options::default();

        let target = match key.kind {
            ArtifactKind::Library => self.library(ev, artifact),
            ArtifactKind::Map | ArtifactKind::Theme => {
                if self.is_active(ev, &key) {
                    None
                } else {
                    self.active.push(key.clone());
                    let ir = self.transpile(ev, &artifact);
                    let child = ev.add_scope(Some(key.clone()), &ir);
                    let flat = self.flatten(ev, ir, child);
                    self.active.pop();

                    let flat = flat.filtered(stmt);
                    contributed = flat.options.clone();
                    if key.kind == ArtifactKind::Map {
                        debug!(artifact = %key, elements = flat.elements.len(), "queued map import");
                        pending.push(flat);
                    } else {
                        debug!(artifact = %key, "applied theme import");
                        options.merge(flat.options);
                    }
                    Some(child)
                }
            }
        };

        match (&stmt.alias, target) {
            (Some(alias), target) => ev.bind_alias(scope, alias, target),
            (None, Some(target)) if key.kind == ArtifactKind::Library => ev.add_glob(scope, target),
            _ => {}
        }

        if key.kind == ArtifactKind::Library && target.is_some() && self.exported.insert(key.clone()) {
            if let Some(library) = self.libraries.get(&key) {
                pending.extend(library.reexports.iter().cloned().map(|f| f.filtered(stmt)));
            }
        }
        contributed
    }

    fn is_active(&self, ev: &mut Evaluator, key: &ArtifactKey) -> bool {
        if !self.active.contains(key) {
            return false;
        }
        let chain: Vec<String> = self.active.iter().map(ToString::to_string).collect();
        warn!(artifact = %key, chain = %chain.join(" -> "), "circular import skipped");
        ev.diagnose(
            Diagnostic::warning(
                ErrorKind::ImportCycle,
                format!("Circular import of {} skipped", key),
            )
            .in_artifact(key.to_string()),
        );
        true
    }

    /// Materialize a library namespace once per job.
    fn library(&mut self, ev: &mut Evaluator, artifact: Artifact) -> Option<ScopeId> {
        let key = artifact.key.clone();
        if let Some(loaded) = self.libraries.get(&key) {
            return Some(loaded.scope);
        }
        if self.is_active(ev, &key) {
            return None;
        }

        self.active.push(key.clone());
        let ir = self.transpile(ev, &artifact);
        let scope = ev.add_scope(Some(key.clone()), &ir);
        let mut reexports = Vec::new();
        // Library options are not applied; only its names and map re-exports leak out.
        let mut discarded = Options::default();
        let mut imports = ir.imports;
        imports.sort_by_key(|i| i.anchor);
        for stmt in &imports {
            self.resolve_import(ev, stmt, scope, &mut discarded, &mut reexports);
        }
        self.active.pop();

        debug!(artifact = %key, names = ev.territory_names(scope).len(), "loaded library");
        self.libraries.insert(key, LoadedLibrary { scope, reexports });
        Some(scope)
    }

    fn load(&mut self, ev: &mut Evaluator, stmt: &ImportStatement) -> Option<Artifact> {
        let artifact = match self.store.get(&stmt.artifact) {
            Ok(a) => a,
            Err(e) => {
                warn!(artifact = %stmt.artifact, error = %e, "import failed");
                ev.diagnose(
                    Diagnostic::warning(ErrorKind::Evaluation, e.to_string())
                        .in_artifact(stmt.artifact.to_string()),
                );
                return None;
            }
        };
        if artifact.source.len() > self.max_artifact_bytes {
            warn!(artifact = %artifact.key, bytes = artifact.source.len(), "artifact too large");
            ev.diagnose(
                Diagnostic::warning(
                    ErrorKind::Capacity,
                    format!(
                        "Artifact is {} bytes; limit is {}",
                        artifact.source.len(),
                        self.max_artifact_bytes
                    ),
                )
                .in_artifact(artifact.key.to_string()),
            );
            return None;
        }
        if artifact.key.kind != stmt.artifact.kind {
            ev.diagnose(Diagnostic::warning(
                ErrorKind::Evaluation,
                format!("{} is not a {}", artifact.key, stmt.artifact.kind.as_str()),
            ));
            return None;
        }
        Some(artifact)
    }

    fn transpile(&self, ev: &mut Evaluator, artifact: &Artifact) -> BuilderIR {
        let ir = match source_to_ir(&artifact.source_text()) {
            Ok(t) => {
                for e in &t.errors {
                    ev.diagnose(Diagnostic::from(e).in_artifact(artifact.key.to_string()));
                }
                t.ir
            }
            Err(e) => {
                warn!(artifact = %artifact.key, error = %e, "imported source does not parse");
                ev.diagnose(Diagnostic::from(&e).in_artifact(artifact.key.to_string()));
                BuilderIR::default()
            }
        };
        if self.trusted {
            return ir;
        }
        let mut report = SanitizeReport::default();
        let ir = strip(ir, &mut report);
        if report != SanitizeReport::default() {
            info!(
                artifact = %artifact.key,
                scripts_removed = report.scripts_removed,
                icons_removed = report.icons_removed,
                "sanitized imported artifact"
            );
        }
        ir
    }
}

/// Remember the options of an import that outranks earlier local options.
fn keep_overrides(stmt: &ImportStatement, contributed: Options, overriding: &mut Vec<(ImportFilter, Options)>) {
    if stmt.overrides.is_empty() || contributed.is_empty() {
        return;
    }
    let filter = ImportFilter {
        only: Some(stmt.overrides.clone()),
        not: BTreeSet::new(),
    };
    overriding.push((filter, contributed));
}
