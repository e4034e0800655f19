use crate::{check_put_id, Filter, Key, ProvenanceStore, RecordIter};
use simlab_core::{Record, Result, SimlabError};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    order: Vec<Uuid>,
    records: HashMap<Uuid, Record>,
    by_hash: HashMap<String, Uuid>,
    blobs: HashMap<Uuid, Vec<u8>>,
}

/// Process-local store, shared between threads through an `Arc`.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> SimlabError {
        SimlabError::StoreUnavailable("in-memory store lock poisoned".into())
    }
}

impl ProvenanceStore for InMemoryStore {
    fn put(&self, id: Uuid, record: &Record) -> Result<()> {
        check_put_id(id, record)?;
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        if state.records.contains_key(&id) {
            return Err(SimlabError::StoreConflict {
                id,
                reason: "id already present".into(),
            });
        }
        let hash = record.hash().to_string();
        if state.by_hash.contains_key(&hash) {
            debug!(%id, %hash, "hash already indexed; keeping first record");
        } else {
            state.by_hash.insert(hash, id);
        }
        state.order.push(id);
        state.records.insert(id, record.clone());
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Record>> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let id = match key {
            Key::Id(id) => Some(*id),
            Key::Hash(h) => state.by_hash.get(h).copied(),
        };
        Ok(id.and_then(|id| state.records.get(&id).cloned()))
    }

    fn upload(&self, id: Uuid, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        let mut state = self.state.write().map_err(|_| Self::poisoned())?;
        state.blobs.insert(id, bytes);
        Ok(())
    }

    fn download_file(&self, id: Uuid, dest: &Path) -> Result<()> {
        let state = self.state.read().map_err(|_| Self::poisoned())?;
        let bytes = state
            .blobs
            .get(&id)
            .ok_or_else(|| SimlabError::MissingRecord(format!("blob {}", id)))?;
        fs::write(dest, bytes)?;
        Ok(())
    }

    fn find(&self, filter: Filter, limit: usize) -> Result<RecordIter> {
        let order = {
            let state = self.state.read().map_err(|_| Self::poisoned())?;
            state.order.clone()
        };
        let state = Arc::clone(&self.state);
        let iter = order
            .into_iter()
            .filter_map(move |id| {
                let guard = match state.read() {
                    Ok(g) => g,
                    Err(_) => return Some(Err(Self::poisoned())),
                };
                let found = guard
                    .records
                    .get(&id)
                    .filter(|r| filter.matches(r))
                    .cloned();
                found.map(Ok)
            })
            .take(if limit == 0 { usize::MAX } else { limit });
        Ok(Box::new(iter))
    }
}
