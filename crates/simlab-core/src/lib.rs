pub mod config;
pub mod digest;
pub mod error;
pub mod fsutil;
pub mod model;
pub mod text;

pub use config::{SimlabConfig, SupervisorConfig};
pub use digest::{sha256_bytes, sha256_file};
pub use error::{Result, SimlabError};
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, read_json};
pub use model::{
    Artifact, GitProvenance, KillReason, Record, RunDescriptor, RunOutcome, RunState, RunVariant,
    FULL_SYSTEM_RUN_TYPE, STANDALONE_RUN_TYPE,
};
pub use text::normalize_doc;
