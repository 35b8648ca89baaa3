//! MapForge CLI - Bridge interface for host services
//!
//! Commands: parse, emit, canonicalize, render, worker
//! Outputs JSON to stdout, logs to stderr
//! Returns non-zero on failure

use clap::{Parser, Subcommand};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use mapforge_core::config::WorkerMode;
use mapforge_core::pipeline::run_worker_stdio;
use mapforge_core::sandbox::build_worker;
use mapforge_core::{
    canonicalize, ir_to_source, source_to_ir, ArtifactStore, BuilderIR, CatalogProvider,
    DirArtifactStore, EngineConfig, GeometryProvider, JobRequest, MemoryArtifactStore,
    Orchestrator, RenderPipeline, TaskType,
};

#[derive(Parser)]
#[command(name = "mapforge-cli")]
#[command(about = "MapForge CLI - Map DSL compiler and renderer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Artifact store directory (in-memory and empty when omitted)
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Geometry catalog JSON (permissive when omitted)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Engine config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse DSL source into BuilderIR
    Parse {
        /// Source file (stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Emit DSL source from BuilderIR JSON
    Emit {
        /// IR file (stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Rewrite source into canonical form
    Canonicalize {
        file: Option<PathBuf>,
    },

    /// Render a job through the orchestrator
    Render {
        /// Task type, e.g. fromSource
        #[arg(short, long)]
        task: TaskType,

        /// JSON payload for the task type
        #[arg(short, long)]
        payload: String,

        #[arg(short, long, default_value = "cli")]
        actor: String,

        /// Allow raw statements and external resources
        #[arg(long)]
        trusted: bool,

        /// Run the job inside this process instead of a worker process
        #[arg(long)]
        in_process: bool,
    },

    /// Serve one job over stdin/stdout
    Worker,
}

fn read_input(file: Option<&Path>) -> io::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => println!("{}", serde_json::json!({ "success": false, "error": e.to_string() })),
    }
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    print_json(&serde_json::json!({ "success": false, "error": message.to_string() }));
    ExitCode::FAILURE
}

struct Engine {
    store: Arc<dyn ArtifactStore>,
    provider: Arc<dyn GeometryProvider>,
    config: EngineConfig,
}

fn load_engine(cli: &Cli) -> Result<Engine, String> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    let store: Arc<dyn ArtifactStore> = match &cli.store_dir {
        Some(dir) => Arc::new(DirArtifactStore::open(dir).map_err(|e| e.to_string())?),
        None => Arc::new(MemoryArtifactStore::new()),
    };
    let provider: Arc<dyn GeometryProvider> = match &cli.catalog {
        Some(path) => Arc::new(CatalogProvider::load(path).map_err(|e| e.to_string())?),
        None => Arc::new(CatalogProvider::permissive()),
    };
    Ok(Engine {
        store,
        provider,
        config,
    })
}

/// Global flags a self-spawned worker needs to see the same engine.
fn forwarded_args(cli: &Cli) -> Vec<String> {
    let mut args = Vec::new();
    for (flag, value) in [
        ("--store-dir", &cli.store_dir),
        ("--catalog", &cli.catalog),
        ("--config", &cli.config),
    ] {
        if let Some(path) = value {
            args.push(flag.to_string());
            args.push(path.display().to_string());
        }
    }
    args
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Parse { file } => {
            let source = match read_input(file.as_deref()) {
                Ok(s) => s,
                Err(e) => return fail(format!("Failed to read source: {}", e)),
            };
            match source_to_ir(&source) {
                Ok(out) => {
                    print_json(&serde_json::json!({
                        "success": true,
                        "ir": out.ir,
                        "errors": out.errors,
                    }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    print_json(&serde_json::json!({ "success": false, "error": e }));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Emit { file } => {
            let raw = match read_input(file.as_deref()) {
                Ok(s) => s,
                Err(e) => return fail(format!("Failed to read IR: {}", e)),
            };
            let ir: BuilderIR = match serde_json::from_str(&raw) {
                Ok(ir) => ir,
                Err(e) => return fail(format!("Invalid IR: {}", e)),
            };
            print_json(&serde_json::json!({ "success": true, "source": ir_to_source(&ir) }));
            ExitCode::SUCCESS
        }

        Commands::Canonicalize { file } => {
            let source = match read_input(file.as_deref()) {
                Ok(s) => s,
                Err(e) => return fail(format!("Failed to read source: {}", e)),
            };
            match canonicalize(&source) {
                Ok(text) => {
                    print_json(&serde_json::json!({ "success": true, "source": text }));
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    print_json(&serde_json::json!({ "success": false, "error": e }));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Render {
            task,
            payload,
            actor,
            trusted,
            in_process,
        } => {
            let payload: serde_json::Value = match serde_json::from_str(payload) {
                Ok(p) => p,
                Err(e) => return fail(format!("Invalid payload: {}", e)),
            };
            let engine = match load_engine(&cli) {
                Ok(e) => e,
                Err(e) => return fail(e),
            };

            let mut config = engine.config.clone();
            if *in_process {
                config.worker.mode = WorkerMode::InProcess;
            }
            if config.worker.mode == WorkerMode::Process && config.worker.program.is_none() {
                let mut args = forwarded_args(&cli);
                args.extend(config.worker.args.drain(..));
                config.worker.args = args;
            }

            let pipeline = Arc::new(RenderPipeline::new(
                Arc::clone(&engine.store),
                engine.provider,
                config.clone(),
            ));
            let worker = match build_worker(&config, pipeline) {
                Ok(w) => w,
                Err(e) => return fail(e),
            };
            let orchestrator = Orchestrator::new(worker, engine.store, &config);

            let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => return fail(format!("Failed to start runtime: {}", e)),
            };
            let request = JobRequest {
                task_type: *task,
                actor_key: actor.clone(),
                trusted: *trusted,
                payload,
            };
            match runtime.block_on(orchestrator.submit(request)) {
                Ok(report) => {
                    let success = report.output.is_some();
                    match serde_json::to_value(&report) {
                        Ok(value) => print_json(&value),
                        Err(e) => return fail(e),
                    }
                    if success {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(e) => {
                    print_json(&serde_json::json!({ "success": false, "error": e }));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Worker => {
            let engine = match load_engine(&cli) {
                Ok(e) => e,
                Err(e) => return fail(e),
            };
            let pipeline = RenderPipeline::new(engine.store, engine.provider, engine.config);
            match run_worker_stdio(&pipeline, io::stdin().lock(), io::stdout().lock()) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    tracing::error!(error = %e, "worker failed");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
