use simlab_core::{Record, Result, RunDescriptor, FULL_SYSTEM_RUN_TYPE, STANDALONE_RUN_TYPE};
use simlab_store::ProvenanceStore;

/// Recorded runs, standalone first and then full-system. `limit == 0` means
/// unbounded.
pub fn runs(
    store: &dyn ProvenanceStore,
    full_system_only: bool,
    limit: usize,
) -> Result<impl Iterator<Item = Result<RunDescriptor>>> {
    let standalone = if full_system_only {
        None
    } else {
        Some(store.search_by_type(STANDALONE_RUN_TYPE, limit)?)
    };
    let full_system = store.search_by_type(FULL_SYSTEM_RUN_TYPE, limit)?;
    Ok(standalone
        .into_iter()
        .flatten()
        .chain(full_system)
        .filter_map(|r| match r {
            Ok(Record::Run(run)) => Some(Ok(run)),
            Ok(Record::Artifact(_)) => None,
            Err(e) => Some(Err(e)),
        })
        .take(if limit == 0 { usize::MAX } else { limit }))
}

pub fn runs_by_name(
    store: &dyn ProvenanceStore,
    name: &str,
    limit: usize,
) -> Result<impl Iterator<Item = Result<RunDescriptor>>> {
    let by_name = store.search_by_name(name, 0)?;
    Ok(by_name
        .filter_map(|r| match r {
            Ok(Record::Run(run)) => Some(Ok(run)),
            Ok(Record::Artifact(_)) => None,
            Err(e) => Some(Err(e)),
        })
        .take(if limit == 0 { usize::MAX } else { limit }))
}
