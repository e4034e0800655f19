use crate::checkpoint::write_checkpoint;
use chrono::Utc;
use sha2::{Digest, Sha256};
use simlab_core::{
    ensure_dir, model::file_name_lossy, KillReason, Result, RunDescriptor, RunState, RunVariant,
    SimlabError, FULL_SYSTEM_RUN_TYPE, STANDALONE_RUN_TYPE,
};
use simlab_store::{Key, ProvenanceStore};
use std::path::{Component, Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Kernel and disk image a full-system run boots.
#[derive(Debug, Clone)]
pub struct FullSystemInputs {
    pub kernel_path: PathBuf,
    pub disk_image_path: PathBuf,
    pub kernel_artifact_id: Uuid,
    pub disk_image_artifact_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub binary_path: PathBuf,
    pub script_path: PathBuf,
    /// Root under which the output directory is derived.
    pub results_root: PathBuf,
    pub referenced_artifacts: Vec<Uuid>,
    pub extra_params: Vec<String>,
    pub full_system: Option<FullSystemInputs>,
    pub timeout_seconds: u64,
}

/// Name of the directory holding the binary, e.g. `X86` for
/// `build/X86/gem5.opt`.
pub fn binary_tag(binary_path: &Path) -> String {
    binary_path
        .parent()
        .map(file_name_lossy)
        .unwrap_or_default()
}

/// File name of the script up to its first `.`.
pub fn script_name(script_path: &Path) -> String {
    let name = file_name_lossy(script_path);
    match name.split_once('.') {
        Some((stem, _)) => stem.to_string(),
        None => name,
    }
}

/// Maps a free-form value onto a single path component.
pub fn path_component(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    match replaced.as_str() {
        "" | "." | ".." => format!("_{}", replaced),
        _ => replaced,
    }
}

pub fn output_directory(
    results_root: &Path,
    binary_path: &Path,
    script_path: &Path,
    variant: &RunVariant,
    extra_params: &[String],
) -> PathBuf {
    let mut dir = results_root.to_path_buf();
    dir.push(path_component(&binary_tag(binary_path)));
    dir.push(path_component(&script_name(script_path)));
    if let RunVariant::FullSystem {
        kernel_path,
        disk_image_path,
        ..
    } = variant
    {
        dir.push(path_component(&file_name_lossy(kernel_path)));
        dir.push(path_component(&file_name_lossy(disk_image_path)));
    }
    for param in extra_params {
        dir.push(path_component(param));
    }
    dir
}

/// Identity of an experiment. Parameters are joined with a single space, so
/// `["a b"]` and `["a", "b"]` hash alike.
pub fn run_hash(
    referenced_artifacts: &[Uuid],
    script_path: &Path,
    extra_params: &[String],
    variant: &RunVariant,
) -> String {
    let mut hasher = Sha256::new();
    for id in referenced_artifacts {
        hasher.update(id.as_bytes());
    }
    hasher.update(script_path.to_string_lossy().as_bytes());
    hasher.update(extra_params.join(" ").as_bytes());
    if let RunVariant::FullSystem {
        kernel_artifact_id,
        disk_image_artifact_id,
        ..
    } = variant
    {
        hasher.update(kernel_artifact_id.as_bytes());
        hasher.update(disk_image_artifact_id.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let joined = std::env::current_dir()?.join(path);
    Ok(joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

fn require_file(label: &str, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(SimlabError::Config(format!(
            "{} {} does not exist",
            label,
            path.display()
        )));
    }
    Ok(())
}

/// Builds a run, creates its output directory and writes the first
/// checkpoint into it.
pub fn create_run(
    store: &dyn ProvenanceStore,
    spec: RunSpec,
    checkpoint_name: &str,
) -> Result<RunDescriptor> {
    require_file("simulator binary", &spec.binary_path)?;
    require_file("run script", &spec.script_path)?;

    let (variant, kind) = match spec.full_system {
        Some(fs) => {
            require_file("kernel", &fs.kernel_path)?;
            require_file("disk image", &fs.disk_image_path)?;
            (
                RunVariant::FullSystem {
                    kernel_artifact_id: fs.kernel_artifact_id,
                    disk_image_artifact_id: fs.disk_image_artifact_id,
                    kernel_path: fs.kernel_path,
                    disk_image_path: fs.disk_image_path,
                },
                FULL_SYSTEM_RUN_TYPE,
            )
        }
        None => (RunVariant::Standalone, STANDALONE_RUN_TYPE),
    };

    let mut run = RunDescriptor {
        id: Uuid::new_v4(),
        name: spec.name,
        kind: kind.to_string(),
        variant,
        binary_tag: binary_tag(&spec.binary_path),
        script_name: script_name(&spec.script_path),
        output_directory: PathBuf::new(),
        command: vec![],
        hash: String::new(),
        binary_path: spec.binary_path,
        script_path: spec.script_path,
        extra_params: spec.extra_params,
        referenced_artifacts: spec.referenced_artifacts,
        timeout_seconds: spec.timeout_seconds,
        state: RunState::Created,
        outcome: None,
        kill_reason: KillReason::None,
        exit_code: None,
        result_artifact_id: None,
        running: false,
        pid: None,
        task_id: None,
        enqueue_time: Utc::now(),
        start_time: None,
        last_poll_time: None,
        end_time: None,
    };

    for id in run.all_artifact_ids() {
        if !store.contains(&Key::Id(id))? {
            return Err(SimlabError::Config(format!(
                "referenced artifact {} is not registered",
                id
            )));
        }
    }

    let results_root = absolute(&spec.results_root)?;
    run.output_directory = output_directory(
        &results_root,
        &run.binary_path,
        &run.script_path,
        &run.variant,
        &run.extra_params,
    );
    ensure_dir(&run.output_directory)?;

    run.hash = run_hash(
        &run.referenced_artifacts,
        &run.script_path,
        &run.extra_params,
        &run.variant,
    );
    run.command = build_command(&run);
    write_checkpoint(&run, checkpoint_name)?;
    info!(
        run_id = %run.id,
        hash = %run.hash,
        outdir = %run.output_directory.display(),
        "created run"
    );
    Ok(run)
}

fn build_command(run: &RunDescriptor) -> Vec<String> {
    let mut command = vec![
        run.binary_path.to_string_lossy().to_string(),
        "-re".to_string(),
        format!("--outdir={}", run.output_directory.display()),
        run.script_path.to_string_lossy().to_string(),
    ];
    if let RunVariant::FullSystem {
        kernel_path,
        disk_image_path,
        ..
    } = &run.variant
    {
        command.push(kernel_path.to_string_lossy().to_string());
        command.push(disk_image_path.to_string_lossy().to_string());
    }
    command.extend(run.extra_params.iter().cloned());
    command
}
