//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

use mapforge_core::payload::SourcePayload;
use mapforge_core::sandbox::InProcessWorker;
use mapforge_core::sanitize::{sanitize, Limits};
use mapforge_core::store::{ArtifactKey, ArtifactKind, Version};
use mapforge_core::{
    canonicalize, ir_to_source, source_to_ir, BuilderIR, CatalogProvider, EngineConfig, ErrorKind,
    Geometry, JobRequest, JobSpec, JobStatus, MemoryArtifactStore, Orchestrator, Payload,
    RenderPipeline, Scene, TaskType,
};

const SAMPLE: &str = r#"
REF = "Majumdar, p. 12"
KURU = gadm("IND.12") | gadm("IND.13")
PANCALA = (gadm("IND.31") | gadm("IND.34")) - KURU
base_option("OpenStreetMap")
zoom(5)
flag("Kuru", KURU, period=[-1200, -500])
flag("Pancala", PANCALA & gadm("IND.31"))
point("Delhi", [28.6, 77.2], icon=Icon.builtin("star"))
text(caption, [22, 80])
# closing note
"#;

fn map_key(name: &str) -> ArtifactKey {
    ArtifactKey {
        owner: "hub".to_string(),
        kind: ArtifactKind::Map,
        name: name.to_string(),
        version: Version::Alpha,
    }
}

fn create_pipeline(store: Arc<MemoryArtifactStore>) -> RenderPipeline {
    RenderPipeline::new(
        store,
        Arc::new(CatalogProvider::permissive()),
        EngineConfig::default(),
    )
}

fn render(pipeline: &RenderPipeline, code: &str, trusted: bool) -> Scene {
    let spec = JobSpec {
        task_type: TaskType::FromSource,
        trusted,
        payload: Payload::Source(SourcePayload {
            code: code.to_string(),
            ..Default::default()
        }),
    };
    let output = pipeline.execute(&spec).unwrap();
    serde_json::from_value(output.payload).unwrap()
}

fn source_request(actor: &str, code: &str) -> JobRequest {
    JobRequest {
        task_type: TaskType::FromSource,
        actor_key: actor.to_string(),
        trusted: false,
        payload: json!({ "code": code }),
    }
}

#[test]
fn invariant_ir_source_round_trip() {
    let first = source_to_ir(SAMPLE).unwrap();
    assert!(first.errors.is_empty());

    let emitted = ir_to_source(&first.ir);
    let second = source_to_ir(&emitted).unwrap();
    assert_eq!(first.ir, second.ir);

    // IR survives its JSON form untouched
    let json = serde_json::to_string(&first.ir).unwrap();
    let restored: BuilderIR = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, first.ir);
}

#[test]
fn invariant_canonicalize_is_idempotent() {
    let once = canonicalize(SAMPLE).unwrap();
    let twice = canonicalize(&once).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn invariant_canonical_form_renders_identically() {
    let pipeline = create_pipeline(Arc::new(MemoryArtifactStore::new()));
    let code = "X = (gadm(\"A\") | gadm(\"B\") | gadm(\"C\")) - gadm(\"B\")\nflag(\"X\", X)";
    let original = render(&pipeline, code, true);
    let canonical = render(&pipeline, &canonicalize(code).unwrap(), true);
    assert_eq!(original.elements, canonical.elements);
    assert_eq!(original.elements[0].geometry, Some(Geometry::from_units(["A", "C"])));
}

#[test]
fn invariant_set_algebra_folds_left_to_right() {
    let pipeline = create_pipeline(Arc::new(MemoryArtifactStore::new()));
    let scene = render(
        &pipeline,
        "flag(\"X\", gadm(\"A\") | gadm(\"B\") - gadm(\"B\"))\nflag(\"Y\", gadm(\"A\") | (gadm(\"B\") - gadm(\"B\")))",
        true,
    );
    assert_eq!(scene.elements[0].geometry, Some(Geometry::from_units(["A"])));
    assert_eq!(scene.elements[1].geometry, Some(Geometry::from_units(["A"])));

    let scene = render(&pipeline, "flag(\"Z\", gadm(\"A\") - gadm(\"A\") | gadm(\"B\"))", true);
    assert_eq!(scene.elements[0].geometry, Some(Geometry::from_units(["B"])));
}

#[test]
fn invariant_self_reference_terminates() {
    let pipeline = create_pipeline(Arc::new(MemoryArtifactStore::new()));
    let scene = render(&pipeline, "X = X\nflag(\"X\", X | gadm(\"A\"))", true);
    assert_eq!(scene.elements[0].geometry, Some(Geometry::from_units(["A"])));
    assert!(scene
        .diagnostics
        .iter()
        .any(|d| d.message.contains("refers to itself")));
}

#[test]
fn invariant_mutual_map_imports_terminate() {
    let store = Arc::new(MemoryArtifactStore::new());
    store.put(map_key("a"), "import(\"/map/b\")\ntext(\"a\", [0, 0])");
    store.put(map_key("b"), "import(\"/map/a\")\ntext(\"b\", [0, 0])");
    let pipeline = create_pipeline(store);

    let scene = render(&pipeline, "import(\"/map/a\")", true);
    let labels: Vec<_> = scene
        .elements
        .iter()
        .filter_map(|e| e.label.as_ref()?.as_str().map(String::from))
        .collect();
    assert_eq!(labels, vec!["b", "a"]);
    assert!(scene
        .diagnostics
        .iter()
        .any(|d| d.kind == ErrorKind::ImportCycle));
}

#[test]
fn invariant_untrusted_payload_is_inert() {
    let limits = Limits {
        max_source_bytes: 1 << 20,
        max_elements: 100,
        max_audio_bytes: 1 << 20,
    };
    let payload = Payload::parse(
        TaskType::FromSource,
        json!({"code": "run_anything()\npoint(\"p\", [1, 2], icon=\"https://evil.example/x.png\")"}),
    )
    .unwrap();
    let (payload, report) = sanitize(payload, false, &limits).unwrap();
    assert_eq!(report.scripts_removed, 1);
    assert_eq!(report.icons_removed, 1);

    let pipeline = create_pipeline(Arc::new(MemoryArtifactStore::new()));
    let output = pipeline
        .execute(&JobSpec {
            task_type: TaskType::FromSource,
            trusted: false,
            payload,
        })
        .unwrap();
    let elements = output.payload["elements"].as_array().unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0]["type"], "Point");
    assert!(elements[0].get("args").map_or(true, |a| a.get("icon").is_none()));
}

#[test]
fn invariant_untrusted_imports_are_inert() {
    let store = Arc::new(MemoryArtifactStore::new());
    store.put(
        map_key("pins"),
        "run_anything()\npoint(\"p\", [1, 2], icon=\"https://evil.example/x.png\")",
    );
    let pipeline = create_pipeline(store);

    let untrusted = render(&pipeline, "import(\"/map/pins\")", false);
    assert_eq!(untrusted.elements.len(), 1);
    assert!(untrusted.elements[0].args.get("icon").is_none());

    let trusted = render(&pipeline, "import(\"/map/pins\")", true);
    assert!(trusted.elements.iter().any(|e| e.args.contains_key("icon")));
}

#[test]
fn invariant_untrusted_raw_expression_not_evaluated() {
    let pipeline = create_pipeline(Arc::new(MemoryArtifactStore::new()));
    let untrusted = render(&pipeline, "NAME = \"Delhi\"\ntext(NAME, [0, 0])", false);
    assert_eq!(untrusted.elements[0].label, None);

    let trusted = render(&pipeline, "NAME = \"Delhi\"\ntext(NAME, [0, 0])", true);
    assert_eq!(trusted.elements[0].label, Some(json!("Delhi")));
}

#[tokio::test]
async fn invariant_artifact_change_invalidates_cache() {
    let store = Arc::new(MemoryArtifactStore::new());
    store.put(map_key("base"), "text(\"v1\", [0, 0])");
    let config = EngineConfig::default();
    let pipeline = Arc::new(create_pipeline(Arc::clone(&store)));
    let orchestrator = Orchestrator::new(Arc::new(InProcessWorker::new(pipeline)), store.clone(), &config);

    let first = orchestrator.submit(source_request("a", "import(\"/map/base\")")).await.unwrap();
    assert_eq!(first.status, JobStatus::Succeeded);
    let repeat = orchestrator.submit(source_request("a", "import(\"/map/base\")")).await.unwrap();
    assert!(repeat.cached);
    assert_eq!(
        repeat.output.as_ref().unwrap().content_hash,
        first.output.as_ref().unwrap().content_hash
    );

    store.put(map_key("base"), "text(\"v2\", [0, 0])");
    let fresh = orchestrator.submit(source_request("a", "import(\"/map/base\")")).await.unwrap();
    assert!(!fresh.cached);
    let scene: Scene = serde_json::from_value(fresh.output.unwrap().payload).unwrap();
    assert_eq!(scene.elements[0].label, Some(json!("v2")));
}

#[tokio::test]
async fn invariant_rejected_job_never_runs() {
    let store = Arc::new(MemoryArtifactStore::new());
    let mut config = EngineConfig::default();
    config.max_source_bytes = 16;
    let pipeline = Arc::new(create_pipeline(Arc::clone(&store)));
    let orchestrator = Orchestrator::new(Arc::new(InProcessWorker::new(pipeline)), store, &config);

    let err = orchestrator
        .submit(source_request("a", "text(\"a long label\", [0, 0])"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Capacity);
    assert!(orchestrator.running("a").is_empty());
    assert_eq!(orchestrator.cache_len(), 0);
}

#[cfg(feature = "test-hooks")]
#[tokio::test]
async fn invariant_submit_sanitizes_before_execution() {
    use mapforge_core::pipeline::get_execute_call_count;
    use mapforge_core::sanitize::get_sanitize_call_count;

    let store = Arc::new(MemoryArtifactStore::new());
    let pipeline = Arc::new(create_pipeline(Arc::clone(&store)));
    let orchestrator = Orchestrator::new(
        Arc::new(InProcessWorker::new(pipeline)),
        store,
        &EngineConfig::default(),
    );

    // Counters are process-wide; other tests only ever add to them
    let sanitized = get_sanitize_call_count();
    let executed = get_execute_call_count();
    orchestrator.submit(source_request("hooks", "zoom(7)")).await.unwrap();
    let cached = orchestrator.submit(source_request("hooks", "zoom(7)")).await.unwrap();
    assert!(cached.cached);
    assert!(get_sanitize_call_count() >= sanitized + 2);
    assert!(get_execute_call_count() >= executed + 1);
}
