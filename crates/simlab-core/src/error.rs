use std::path::PathBuf;
use uuid::Uuid;

pub type Result<T, E = SimlabError> = std::result::Result<T, E>;

/// Errors surfaced by artifact registration, the store and the run supervisor.
///
/// Timeouts, kernel panics and termination signals are not errors: they are
/// recorded as a [`crate::KillReason`] on the run.
#[derive(Debug, thiserror::Error)]
pub enum SimlabError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(
        "documentation too short ({len} < {min} characters); it is how future readers \
         will learn what this artifact is and how it was built"
    )]
    DocumentationTooShort { len: usize, min: usize },
    #[error("path {} is neither a file nor a directory", .0.display())]
    NotFound(PathBuf),
    #[error("provenance check failed for {}: {reason}", path.display())]
    Provenance { path: PathBuf, reason: String },
    #[error("hash {hash} is already claimed by record {stored_id}: {detail}")]
    DuplicateHashMismatch {
        hash: String,
        stored_id: Uuid,
        detail: String,
    },
    #[error(
        "artifact {artifact_id} ({}) changed since registration: \
         recorded {recorded}, found {current}",
        path.display()
    )]
    ArtifactDrift {
        artifact_id: Uuid,
        path: PathBuf,
        recorded: String,
        current: String,
    },
    #[error("failed to archive results in {}: {reason}", dir.display())]
    Archive { dir: PathBuf, reason: String },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("store conflict for {id}: {reason}")]
    StoreConflict { id: Uuid, reason: String },
    #[error("no record for {0} in store")]
    MissingRecord(String),
    #[error("output directory {} is already being supervised", .0.display())]
    RunInProgress(PathBuf),
    #[error("run {0} was not started: supervisor is shutting down")]
    Cancelled(Uuid),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl SimlabError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::DocumentationTooShort { .. } => "documentation_too_short",
            Self::NotFound(_) => "not_found",
            Self::Provenance { .. } => "provenance_error",
            Self::DuplicateHashMismatch { .. } => "duplicate_hash_mismatch",
            Self::ArtifactDrift { .. } => "artifact_drift",
            Self::Archive { .. } => "archive_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::StoreConflict { .. } => "store_conflict",
            Self::MissingRecord(_) => "missing_record",
            Self::RunInProgress(_) => "run_in_progress",
            Self::Cancelled(_) => "cancelled",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
        }
    }

    pub fn provenance(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Provenance {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
