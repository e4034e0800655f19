use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simlab_artifact::{register, NewArtifact};
use simlab_core::{Record, SimlabConfig, SimlabError};
use simlab_runner::{
    create_run, load_checkpoint, runs, runs_by_name, CancelToken, FullSystemInputs, RunReport,
    RunSpec, Supervisor, TaskDispatch, WorkerPool,
};
use simlab_store::{open_store, Filter, ProvenanceStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "simlab",
    version = "0.3.0",
    about = "Artifact provenance and simulator run supervision"
)]
struct Cli {
    /// Defaults to ./simlab.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    binary: PathBuf,
    #[arg(long)]
    script: PathBuf,
    /// Artifact ids checked for drift before the run starts.
    #[arg(long = "artifact")]
    artifacts: Vec<Uuid>,
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    results_root: Option<PathBuf>,
    /// Passed to the run script in order.
    #[arg(last = true)]
    params: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    RegisterArtifact {
        path: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long = "type")]
        kind: String,
        #[arg(long = "command")]
        build_command: String,
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        #[arg(long)]
        documentation: String,
        #[arg(long = "input")]
        inputs: Vec<Uuid>,
        #[arg(long)]
        json: bool,
    },
    CreateStandaloneRun {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    CreateFullSystemRun {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        kernel: PathBuf,
        #[arg(long)]
        kernel_artifact: Uuid,
        #[arg(long)]
        disk_image: PathBuf,
        #[arg(long)]
        disk_image_artifact: Uuid,
        #[arg(long)]
        json: bool,
    },
    /// Supervises runs from their checkpoints (file or output directory).
    ExecuteRun {
        #[arg(required = true)]
        checkpoints: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    QueryRuns {
        #[arg(long)]
        fs_only: bool,
        /// Ignores --fs-only.
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    QueryArtifacts {
        #[arg(long = "type")]
        kind: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Regular expression on the name; requires --type.
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long, default_value_t = 0)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    Download {
        id: Uuid,
        dest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Status {
        checkpoint: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.config.as_deref(), cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<SimlabError>()
                    .map(SimlabError::code)
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(config_path: Option<&Path>, command: Commands) -> Result<Option<Value>> {
    let config = SimlabConfig::discover(config_path)?;
    let store = open_store(&config.store)?;
    match command {
        Commands::RegisterArtifact {
            path,
            name,
            kind,
            build_command,
            cwd,
            documentation,
            inputs,
            json,
        } => {
            let registration = register(
                store.as_ref(),
                NewArtifact {
                    command: build_command,
                    name,
                    working_directory: cwd,
                    kind,
                    path,
                    documentation,
                    inputs,
                },
            )?;
            for mismatch in &registration.diagnostics {
                warn!(
                    artifact_id = %mismatch.artifact_id,
                    field = mismatch.field.as_str(),
                    "{}",
                    mismatch
                );
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "register-artifact",
                    "created": registration.created,
                    "artifact": serde_json::to_value(&registration.artifact)?,
                    "diagnostics": serde_json::to_value(&registration.diagnostics)?,
                })));
            }
            let verb = if registration.created {
                "registered"
            } else {
                "already registered"
            };
            println!("{}: {}", verb, registration.artifact);
        }
        Commands::CreateStandaloneRun { run, json } => {
            let spec = run_spec(&config, run, None);
            let descriptor = create_run(store.as_ref(), spec, &config.supervisor.checkpoint_name)?;
            return created_run_output(&config, &descriptor, json);
        }
        Commands::CreateFullSystemRun {
            run,
            kernel,
            kernel_artifact,
            disk_image,
            disk_image_artifact,
            json,
        } => {
            let inputs = FullSystemInputs {
                kernel_path: kernel,
                disk_image_path: disk_image,
                kernel_artifact_id: kernel_artifact,
                disk_image_artifact_id: disk_image_artifact,
            };
            let spec = run_spec(&config, run, Some(inputs));
            let descriptor = create_run(store.as_ref(), spec, &config.supervisor.checkpoint_name)?;
            return created_run_output(&config, &descriptor, json);
        }
        Commands::ExecuteRun { checkpoints, json } => {
            let cancel = CancelToken::new();
            install_signal_cancel(cancel.clone());
            let supervisor = Arc::new(Supervisor::with_cancel(
                Arc::clone(&store),
                config.supervisor.clone(),
                cancel,
            ));
            let pool = WorkerPool::new(supervisor, config.workers);
            for path in &checkpoints {
                let run = load_checkpoint(&resolve_checkpoint(&config, path))?;
                let task_id = Uuid::new_v4().to_string();
                info!(run_id = %run.id, task_id = %task_id, "dispatching run");
                pool.execute(run, task_id)?;
            }
            let results = pool.join();
            let mut entries = Vec::new();
            let mut first_error = None;
            for done in results {
                match done.result {
                    Ok(report) => {
                        if !json {
                            match &report {
                                RunReport::Skipped { .. } => {
                                    println!("skipped (already recorded): {}", done.run)
                                }
                                RunReport::Completed { .. } => println!("{}", done.run),
                            }
                        }
                        entries.push(json!({
                            "task_id": done.task_id,
                            "run_id": done.run_id.to_string(),
                            "report": serde_json::to_value(&report)?,
                        }));
                    }
                    Err(e) => {
                        if !json {
                            eprintln!("{}: {}", done.run, e);
                        }
                        entries.push(json!({
                            "task_id": done.task_id,
                            "run_id": done.run_id.to_string(),
                            "error": {"code": e.code(), "message": e.to_string()},
                        }));
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": first_error.is_none(),
                    "command": "execute-run",
                    "runs": entries,
                })));
            }
            if let Some(e) = first_error {
                return Err(e.into());
            }
        }
        Commands::QueryRuns {
            fs_only,
            name,
            limit,
            json,
        } => {
            let matching: Box<dyn Iterator<Item = simlab_core::Result<_>>> = match &name {
                Some(name) => Box::new(runs_by_name(store.as_ref(), name, limit)?),
                None => Box::new(runs(store.as_ref(), fs_only, limit)?),
            };
            let mut found = Vec::new();
            for run in matching {
                let run = run?;
                if json {
                    found.push(serde_json::to_value(&run)?);
                } else {
                    println!("{}  {}", run.id, run);
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "query-runs",
                    "runs": found,
                })));
            }
        }
        Commands::QueryArtifacts {
            kind,
            name,
            pattern,
            limit,
            json,
        } => {
            let iter = match (kind, pattern) {
                (Some(kind), Some(pattern)) => {
                    store.search_by_type_and_name_pattern(&kind, &pattern, limit)?
                }
                (None, Some(_)) => return Err(anyhow!("--pattern requires --type")),
                (kind, None) => store.find(Filter { name, kind, ..Filter::default() }, limit)?,
            };
            let mut found = Vec::new();
            for record in iter {
                if let Record::Artifact(artifact) = record? {
                    if json {
                        found.push(serde_json::to_value(&artifact)?);
                    } else {
                        println!("{}", artifact);
                    }
                }
            }
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "query-artifacts",
                    "artifacts": found,
                })));
            }
        }
        Commands::Download { id, dest, json } => {
            store.download_file(id, &dest)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "download",
                    "id": id.to_string(),
                    "dest": dest.display().to_string(),
                })));
            }
            println!("downloaded {} to {}", id, dest.display());
        }
        Commands::Status { checkpoint, json } => {
            let run = load_checkpoint(&resolve_checkpoint(&config, &checkpoint))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "run": serde_json::to_value(&run)?,
                })));
            }
            println!("{}", run);
            println!("kill_reason: {}", run.kill_reason.as_str());
            if let Some(code) = run.exit_code {
                println!("exit_code: {}", code);
            }
        }
    }
    Ok(None)
}

fn run_spec(
    config: &SimlabConfig,
    args: RunArgs,
    full_system: Option<FullSystemInputs>,
) -> RunSpec {
    RunSpec {
        name: args.name,
        binary_path: args.binary,
        script_path: args.script,
        results_root: args
            .results_root
            .unwrap_or_else(|| config.results_root.clone()),
        referenced_artifacts: args.artifacts,
        extra_params: args.params,
        full_system,
        timeout_seconds: args
            .timeout
            .unwrap_or(config.supervisor.default_timeout_secs),
    }
}

fn created_run_output(
    config: &SimlabConfig,
    run: &simlab_core::RunDescriptor,
    json: bool,
) -> Result<Option<Value>> {
    let checkpoint = run.output_directory.join(&config.supervisor.checkpoint_name);
    if json {
        return Ok(Some(json!({
            "ok": true,
            "command": "create-run",
            "run_id": run.id.to_string(),
            "hash": run.hash,
            "output_directory": run.output_directory.display().to_string(),
            "checkpoint": checkpoint.display().to_string(),
        })));
    }
    println!("created: {}", run);
    println!("checkpoint: {}", checkpoint.display());
    Ok(None)
}

fn resolve_checkpoint(config: &SimlabConfig, path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(&config.supervisor.checkpoint_name)
    } else {
        path.to_path_buf()
    }
}

/// Cancels `token` on ctrl-c or SIGTERM so the supervisor kills its child
/// and records `kill_reason = signal`.
fn install_signal_cancel(token: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "cannot install signal handler");
                return;
            }
        };
        runtime.block_on(async {
            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    // SIGTERM not supported
                    Err(_) => std::future::pending::<()>().await,
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = terminate => {},
            }
        });
        warn!("termination requested; killing running simulators");
        token.cancel();
    });
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::RegisterArtifact { json, .. }
        | Commands::CreateStandaloneRun { json, .. }
        | Commands::CreateFullSystemRun { json, .. }
        | Commands::ExecuteRun { json, .. }
        | Commands::QueryRuns { json, .. }
        | Commands::QueryArtifacts { json, .. }
        | Commands::Download { json, .. }
        | Commands::Status { json, .. } => *json,
    }
}
