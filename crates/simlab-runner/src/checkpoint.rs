use simlab_core::{atomic_write_json_pretty, read_json, Result, RunDescriptor};
use std::path::{Path, PathBuf};

pub fn checkpoint_path(run: &RunDescriptor, checkpoint_name: &str) -> PathBuf {
    run.output_directory.join(checkpoint_name)
}

/// Atomically replaces the run's checkpoint so pollers never see a torn file.
pub fn write_checkpoint(run: &RunDescriptor, checkpoint_name: &str) -> Result<()> {
    atomic_write_json_pretty(&checkpoint_path(run, checkpoint_name), run)
}

pub fn load_checkpoint(path: &Path) -> Result<RunDescriptor> {
    read_json(path)
}
