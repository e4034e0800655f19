use crate::git::git_provenance;
use simlab_core::{sha256_file, Artifact, Result, SimlabError};

/// Recomputes the value an artifact was registered with: HEAD of its
/// repository for git-backed artifacts, the SHA-256 of the file otherwise.
/// A file that no longer exists yields `"missing"`.
pub fn current_verification_value(artifact: &Artifact) -> Result<String> {
    if artifact.is_git_backed() {
        return Ok(git_provenance(&artifact.path)?.commit_id);
    }
    if !artifact.path.is_file() {
        return Ok("missing".to_string());
    }
    sha256_file(&artifact.path)
}

/// Fails with `ArtifactDrift` when the artifact on disk no longer matches
/// its record.
pub fn check_fresh(artifact: &Artifact) -> Result<()> {
    let current = current_verification_value(artifact)?;
    let recorded = artifact.verification_value();
    if current != recorded {
        return Err(SimlabError::ArtifactDrift {
            artifact_id: artifact.id,
            path: artifact.path.clone(),
            recorded: recorded.to_string(),
            current,
        });
    }
    Ok(())
}
