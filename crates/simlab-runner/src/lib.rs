//! Run descriptors and the supervisor that drives them to a recorded result.

mod archive;
mod cancel;
mod checkpoint;
mod descriptor;
mod dispatch;
mod lock;
mod query;
mod supervisor;

pub use archive::archive_output;
pub use cancel::CancelToken;
pub use checkpoint::{checkpoint_path, load_checkpoint, write_checkpoint};
pub use descriptor::{
    binary_tag, create_run, output_directory, path_component, run_hash, script_name,
    FullSystemInputs, RunSpec,
};
pub use dispatch::{TaskDispatch, TaskResult, WorkerPool};
pub use lock::{acquire_run_lock, lock_path, RunLock};
pub use query::{runs, runs_by_name};
pub use supervisor::{
    tail_contains_marker, RunReport, Supervisor, RESULTS_ARTIFACT_NAME, RESULTS_DOCUMENTATION,
};
