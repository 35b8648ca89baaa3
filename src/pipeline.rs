//! Render Pipeline - Single Worker-Side Entry Point
//!
//! A job spec goes in, a rendered artifact or a structured error comes out.
//! Everything stateful about evaluation (memo, resolving set, import stack)
//! lives inside one `execute` call and is dropped with it.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::diagnostics::{ErrorKind, JobError};
use crate::evaluator::Evaluator;
use crate::geometry::GeometryProvider;
use crate::hashing::compute_content_hash;
use crate::imports::ImportResolver;
use crate::ir::Basemap;
use crate::payload::{lower, LowerContext, Payload, TaskType};
use crate::scene::{build_scene, HtmlSceneRenderer, RenderError, RenderOutput, SceneRenderer};
use crate::store::ArtifactStore;

#[cfg(feature = "test-hooks")]
use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "test-hooks")]
static EXECUTE_CALL_COUNT: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "test-hooks")]
pub fn get_execute_call_count() -> u32 {
    EXECUTE_CALL_COUNT.load(Ordering::SeqCst)
}

#[cfg(feature = "test-hooks")]
pub fn reset_execute_call_count() {
    EXECUTE_CALL_COUNT.store(0, Ordering::SeqCst);
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job failed: {0}")]
    Job(#[from] JobError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PipelineError> for JobError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Job(job) => job,
            other => JobError::new(ErrorKind::Sandbox, other.to_string()),
        }
    }
}

/// A sanitized job, ready for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_type: TaskType,
    pub trusted: bool,
    pub payload: Payload,
}

/// One line of JSON on a worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job_id: Uuid,
    pub spec: JobSpec,
}

/// One line of JSON on a worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Ok { output: RenderOutput },
    Err { error: JobError },
}

pub struct RenderPipeline {
    store: Arc<dyn ArtifactStore>,
    provider: Arc<dyn GeometryProvider>,
    renderer: Arc<dyn SceneRenderer>,
    config: EngineConfig,
}

impl RenderPipeline {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        provider: Arc<dyn GeometryProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            provider,
            renderer: Arc::new(HtmlSceneRenderer::default()),
            config,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn SceneRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Render one job.
    pub fn execute(&self, spec: &JobSpec) -> Result<RenderOutput, PipelineError> {
        #[cfg(feature = "test-hooks")]
        EXECUTE_CALL_COUNT.fetch_add(1, Ordering::SeqCst);

        let ctx = LowerContext {
            store: self.store.as_ref(),
            builtin_library: self.config.builtin_library.as_ref(),
        };
        let lowered = lower(spec.payload.clone(), &ctx)?;

        let mut ev = Evaluator::new(self.provider.as_ref());
        for error in &lowered.errors {
            ev.diagnose(error.into());
        }
        let root = ev.add_scope(None, &lowered.ir);
        let mut resolver = ImportResolver::new(self.store.as_ref(), self.config.max_source_bytes)
            .with_trust(spec.trusted);
        let flat = resolver.flatten(&mut ev, lowered.ir, root);
        debug!(task_type = %spec.task_type, elements = flat.elements.len(), "flattened imports");

        let mut scene = build_scene(&mut ev, flat, spec.trusted);
        if scene.options.basemaps.is_empty() {
            scene.options.basemaps.push(Basemap {
                url_or_provider: self.config.default_basemap.clone(),
                name: None,
                default: true,
            });
        }

        let html = self.renderer.render(&scene)?;
        let payload = serde_json::to_value(&scene)?;
        let catalog = lowered.catalog.unwrap_or_default();
        info!(
            task_type = %spec.task_type,
            elements = scene.elements.len(),
            diagnostics = scene.diagnostics.len(),
            "rendered scene"
        );
        Ok(RenderOutput {
            content_hash: compute_content_hash(&payload)?,
            html,
            payload,
            available_names: catalog.available_names,
            index_names: catalog.index_names,
        })
    }
}

/// Serve a single request from `input`, answering on `out`.
pub fn run_worker_stdio(
    pipeline: &RenderPipeline,
    mut input: impl Read,
    mut out: impl Write,
) -> Result<(), PipelineError> {
    let mut raw = String::new();
    input.read_to_string(&mut raw)?;
    let request: WorkerRequest = serde_json::from_str(&raw)?;
    debug!(job_id = %request.job_id, "worker received job");

    let response = match pipeline.execute(&request.spec) {
        Ok(output) => WorkerResponse::Ok { output },
        Err(e) => WorkerResponse::Err { error: e.into() },
    };
    serde_json::to_writer(&mut out, &response)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{CatalogProvider, Geometry};
    use crate::payload::SourcePayload;
    use crate::scene::Scene;
    use crate::store::MemoryArtifactStore;

    fn pipeline() -> RenderPipeline {
        RenderPipeline::new(
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(CatalogProvider::permissive()),
            EngineConfig::default(),
        )
    }

    fn source_spec(code: &str) -> JobSpec {
        JobSpec {
            task_type: TaskType::FromSource,
            trusted: true,
            payload: Payload::Source(SourcePayload {
                code: code.to_string(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_execute_flag_scenario() {
        let output = pipeline()
            .execute(&source_spec(r#"flag("X", gadm("A") | gadm("B") - gadm("C"))"#))
            .unwrap();
        let scene: Scene = serde_json::from_value(output.payload.clone()).unwrap();
        assert_eq!(scene.elements[0].geometry, Some(Geometry::from_units(["A", "B"])));
        assert_eq!(scene.options.basemaps[0].url_or_provider, "Esri.WorldTopoMap");
        assert!(output.html.contains("mapforge-scene"));
    }

    #[test]
    fn test_fatal_parse_error_is_structured() {
        let err = pipeline().execute(&source_spec("flag(\"unterminated")).unwrap_err();
        let job: JobError = err.into();
        assert_eq!(job.kind, ErrorKind::Parse);
        assert!(job.span.is_some());
    }

    #[test]
    fn test_worker_stdio_protocol() {
        let request = WorkerRequest {
            job_id: Uuid::new_v4(),
            spec: source_spec("zoom(3)"),
        };
        let input = serde_json::to_vec(&request).unwrap();
        let mut out = Vec::new();
        run_worker_stdio(&pipeline(), input.as_slice(), &mut out).unwrap();
        let response: WorkerResponse = serde_json::from_slice(&out).unwrap();
        match response {
            WorkerResponse::Ok { output } => assert_eq!(output.payload["options"]["zoom"], 3.0),
            WorkerResponse::Err { error } => panic!("unexpected error {}", error),
        }
    }
}
