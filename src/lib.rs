//! MapForge Core - Map DSL Compiler and Render Engine
//!
//! # Layers
//! 1. Compiler: DSL source and BuilderIR convert into each other
//! 2. Evaluator: territory algebra resolved lazily across imported artifacts
//! 3. Orchestrator: sanitized, cached, cancellable renders in isolated workers

pub mod lexer;
pub mod ast;
pub mod parser;
pub mod territory;
pub mod ir;
pub mod transpile;
pub mod store;
pub mod geometry;
pub mod diagnostics;
pub mod evaluator;
pub mod imports;
pub mod scene;
pub mod payload;
pub mod sanitize;
pub mod hashing;
pub mod cache;
pub mod config;
pub mod pipeline;
pub mod sandbox;

pub use parser::{parse_program, ParseError};
pub use transpile::{canonicalize, ir_to_source, source_to_ir, Transpiled};
pub use ir::{BuilderIR, Element, ElementKind, OpName, Options};
pub use territory::TerritoryExpr;
pub use store::{ArtifactRef, ArtifactStore, DirArtifactStore, MemoryArtifactStore};
pub use geometry::{CatalogProvider, Geometry, GeometryProvider};
pub use diagnostics::{Diagnostic, ErrorKind, JobError};
pub use payload::{Payload, TaskType};
pub use hashing::{canonical_json, compute_cache_key, compute_content_hash};
pub use config::EngineConfig;
pub use pipeline::{JobSpec, PipelineError, RenderPipeline};
pub use sandbox::{JobReport, JobRequest, JobStatus, Orchestrator, Worker};
pub use scene::{RenderOutput, Scene};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
