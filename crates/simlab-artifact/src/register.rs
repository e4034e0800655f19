use crate::compare::{compare, MetadataMismatch};
use crate::git::git_provenance;
use simlab_core::{normalize_doc, sha256_file, Artifact, Record, Result, SimlabError};
use simlab_store::{Key, ProvenanceStore};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

pub const MIN_DOCUMENTATION_LEN: usize = 10;

/// Everything the caller knows about a build product before registration.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub command: String,
    pub name: String,
    pub working_directory: PathBuf,
    pub kind: String,
    pub path: PathBuf,
    pub documentation: String,
    pub inputs: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub artifact: Artifact,
    /// Metadata that differs from the record already holding this content.
    pub diagnostics: Vec<MetadataMismatch>,
    /// `false` when the content was already registered.
    pub created: bool,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(path.canonicalize()?)
}

/// Registers a build product, or resolves it to the existing record with the
/// same content hash.
pub fn register(store: &dyn ProvenanceStore, spec: NewArtifact) -> Result<Registration> {
    let documentation = normalize_doc(&spec.documentation);
    if documentation.chars().count() < MIN_DOCUMENTATION_LEN {
        return Err(SimlabError::DocumentationTooShort {
            len: documentation.chars().count(),
            min: MIN_DOCUMENTATION_LEN,
        });
    }
    if !spec.working_directory.exists() {
        return Err(SimlabError::Config(format!(
            "working directory {} does not exist",
            spec.working_directory.display()
        )));
    }
    for input in &spec.inputs {
        if !store.contains(&Key::Id(*input))? {
            return Err(SimlabError::Config(format!(
                "input artifact {} is not registered",
                input
            )));
        }
    }

    let (content_hash, git) = if spec.path.is_file() {
        (sha256_file(&spec.path)?, None)
    } else if spec.path.is_dir() {
        let git = git_provenance(&spec.path)?;
        (git.commit_id.clone(), Some(git))
    } else {
        return Err(SimlabError::NotFound(spec.path));
    };

    let mut candidate = Artifact {
        id: Uuid::nil(),
        name: spec.name,
        kind: spec.kind,
        documentation,
        command: normalize_doc(&spec.command),
        path: absolute(&spec.path)?,
        content_hash,
        git,
        working_directory: absolute(&spec.working_directory)?,
        inputs: spec.inputs,
    };

    if let Some(existing) = store.get(&Key::Hash(candidate.content_hash.clone()))? {
        let stored = match existing {
            Record::Artifact(a) => a,
            Record::Run(run) => {
                return Err(SimlabError::DuplicateHashMismatch {
                    hash: candidate.content_hash,
                    stored_id: run.id,
                    detail: "hash is held by a run record".into(),
                })
            }
        };
        candidate.id = stored.id;
        let comparison = compare(&candidate, &stored);
        if !comparison.equal {
            return Err(SimlabError::DuplicateHashMismatch {
                hash: candidate.content_hash,
                stored_id: stored.id,
                detail: format!("stored record has content hash {}", stored.content_hash),
            });
        }
        debug!(
            artifact_id = %stored.id,
            mismatches = comparison.mismatches.len(),
            "content already registered"
        );
        return Ok(Registration {
            artifact: candidate,
            diagnostics: comparison.mismatches,
            created: false,
        });
    }

    candidate.id = Uuid::new_v4();
    if candidate.git.is_none() {
        store.upload(candidate.id, &candidate.path)?;
    }
    store.put(candidate.id, &Record::Artifact(candidate.clone()))?;
    info!(
        artifact_id = %candidate.id,
        name = %candidate.name,
        kind = %candidate.kind,
        hash = %candidate.content_hash,
        "registered artifact"
    );
    Ok(Registration {
        artifact: candidate,
        diagnostics: vec![],
        created: true,
    })
}
