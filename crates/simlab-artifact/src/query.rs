use crate::{DISK_IMAGE_TYPE, KERNEL_TYPE, SIMULATOR_BINARY_TYPE};
use simlab_core::{Artifact, Record, Result, SimlabError};
use simlab_store::{Key, ProvenanceStore, RecordIter};
use uuid::Uuid;

/// Loads the artifact record stored under `id`. A run record under that id
/// is reported as missing.
pub fn load_artifact(store: &dyn ProvenanceStore, id: Uuid) -> Result<Artifact> {
    match store.get(&Key::Id(id))? {
        Some(Record::Artifact(a)) => Ok(a),
        Some(Record::Run(_)) => Err(SimlabError::MissingRecord(format!(
            "{} is a run, not an artifact",
            id
        ))),
        None => Err(SimlabError::MissingRecord(format!("artifact {}", id))),
    }
}

fn artifacts(iter: RecordIter) -> impl Iterator<Item = Result<Artifact>> {
    iter.filter_map(|r| match r {
        Ok(Record::Artifact(a)) => Some(Ok(a)),
        Ok(Record::Run(_)) => None,
        Err(e) => Some(Err(e)),
    })
}

pub fn artifacts_by_type(
    store: &dyn ProvenanceStore,
    kind: &str,
    limit: usize,
) -> Result<impl Iterator<Item = Result<Artifact>>> {
    Ok(artifacts(store.search_by_type(kind, limit)?))
}

pub fn artifacts_by_name(
    store: &dyn ProvenanceStore,
    name: &str,
    limit: usize,
) -> Result<impl Iterator<Item = Result<Artifact>>> {
    Ok(artifacts(store.search_by_name(name, limit)?))
}

pub fn disk_images(
    store: &dyn ProvenanceStore,
    limit: usize,
) -> Result<impl Iterator<Item = Result<Artifact>>> {
    artifacts_by_type(store, DISK_IMAGE_TYPE, limit)
}

pub fn kernels(
    store: &dyn ProvenanceStore,
    limit: usize,
) -> Result<impl Iterator<Item = Result<Artifact>>> {
    artifacts_by_type(store, KERNEL_TYPE, limit)
}

pub fn simulator_binaries(
    store: &dyn ProvenanceStore,
    limit: usize,
) -> Result<impl Iterator<Item = Result<Artifact>>> {
    artifacts_by_type(store, SIMULATOR_BINARY_TYPE, limit)
}
