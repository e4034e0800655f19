//! Persistence contract for artifact and run records plus their blobs.
//!
//! Records are addressed either by their id or by their hash (artifact
//! content hash or run hash). Writes are append-only: an id is written once
//! and any second write for it is rejected.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::InMemoryStore;

use regex::Regex;
use simlab_core::{Record, Result, SimlabError};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Id(Uuid),
    Hash(String),
}

impl Key {
    /// Strings that parse as a UUID address a record id, anything else a hash.
    pub fn parse(raw: &str) -> Key {
        match Uuid::parse_str(raw) {
            Ok(id) => Key::Id(id),
            Err(_) => Key::Hash(raw.to_string()),
        }
    }
}

impl From<Uuid> for Key {
    fn from(id: Uuid) -> Self {
        Key::Id(id)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Id(id) => write!(f, "id {}", id),
            Key::Hash(h) => write!(f, "hash {}", h),
        }
    }
}

/// Matching records in insertion order. Consumed once; call the query
/// again to restart.
pub type RecordIter = Box<dyn Iterator<Item = Result<Record>> + Send>;

#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub name: Option<String>,
    pub kind: Option<String>,
    pub name_pattern: Option<Regex>,
}

impl Filter {
    pub fn matches(&self, record: &Record) -> bool {
        if let Some(name) = &self.name {
            if record.name() != name {
                return false;
            }
        }
        if let Some(kind) = &self.kind {
            if record.kind() != kind {
                return false;
            }
        }
        if let Some(pattern) = &self.name_pattern {
            if !pattern.is_match(record.name()) {
                return false;
            }
        }
        true
    }
}

pub trait ProvenanceStore: Send + Sync {
    /// Inserts `record` under `id`. Fails with `StoreConflict` when the ids
    /// disagree or `id` is already present.
    fn put(&self, id: Uuid, record: &Record) -> Result<()>;

    fn get(&self, key: &Key) -> Result<Option<Record>>;

    fn contains(&self, key: &Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn upload(&self, id: Uuid, path: &Path) -> Result<()>;

    /// Restores the blob stored for `id` to `dest`, overwriting it.
    fn download_file(&self, id: Uuid, dest: &Path) -> Result<()>;

    /// `limit == 0` means unbounded.
    fn find(&self, filter: Filter, limit: usize) -> Result<RecordIter>;

    fn search_by_name(&self, name: &str, limit: usize) -> Result<RecordIter> {
        self.find(
            Filter {
                name: Some(name.to_string()),
                ..Filter::default()
            },
            limit,
        )
    }

    fn search_by_type(&self, kind: &str, limit: usize) -> Result<RecordIter> {
        self.find(
            Filter {
                kind: Some(kind.to_string()),
                ..Filter::default()
            },
            limit,
        )
    }

    fn search_by_name_and_type(&self, name: &str, kind: &str, limit: usize) -> Result<RecordIter> {
        self.find(
            Filter {
                name: Some(name.to_string()),
                kind: Some(kind.to_string()),
                ..Filter::default()
            },
            limit,
        )
    }

    fn search_by_type_and_name_pattern(
        &self,
        kind: &str,
        pattern: &str,
        limit: usize,
    ) -> Result<RecordIter> {
        let regex = Regex::new(pattern).map_err(|e| {
            SimlabError::Config(format!("invalid name pattern '{}': {}", pattern, e))
        })?;
        self.find(
            Filter {
                kind: Some(kind.to_string()),
                name_pattern: Some(regex),
                ..Filter::default()
            },
            limit,
        )
    }
}

pub(crate) fn check_put_id(id: Uuid, record: &Record) -> Result<()> {
    if record.id() != id {
        return Err(SimlabError::StoreConflict {
            id,
            reason: format!("record carries id {}", record.id()),
        });
    }
    Ok(())
}

/// Opens the backend named by `uri`: `memory://`, `file://<dir>` or a bare
/// directory path.
pub fn open_store(uri: &str) -> Result<Arc<dyn ProvenanceStore>> {
    if uri == "memory://" || uri == "memory" {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    if let Some(path) = uri.strip_prefix("file://") {
        return Ok(Arc::new(FileStore::open(Path::new(path))?));
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        return Err(SimlabError::Config(format!(
            "unsupported store scheme '{}' in {}",
            scheme, uri
        )));
    }
    Ok(Arc::new(FileStore::open(Path::new(uri))?))
}

#[cfg(test)]
pub(crate) mod testutil {
    use simlab_core::{Artifact, Record};
    use std::path::PathBuf;
    use uuid::Uuid;

    pub fn artifact_record(name: &str, kind: &str, hash: &str) -> Record {
        Record::Artifact(Artifact {
            id: Uuid::new_v4(),
            name: name.to_string(),
            kind: kind.to_string(),
            documentation: "artifact used by store tests".to_string(),
            command: "true".to_string(),
            path: PathBuf::from("/tmp/none"),
            content_hash: hash.to_string(),
            git: None,
            working_directory: PathBuf::from("/tmp"),
            inputs: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parse_distinguishes_ids_from_hashes() {
        let id = Uuid::new_v4();
        assert_eq!(Key::parse(&id.to_string()), Key::Id(id));
        assert_eq!(
            Key::parse("9f86d081884c7d65"),
            Key::Hash("9f86d081884c7d65".to_string())
        );
    }

    #[test]
    fn open_store_rejects_unknown_scheme() {
        let err = open_store("mongodb://localhost").err().expect("must fail");
        assert!(matches!(err, SimlabError::Config(_)), "got {:?}", err);
        assert!(open_store("memory://").is_ok());
    }

    #[test]
    fn name_pattern_filter_uses_regex() {
        let store = InMemoryStore::new();
        for (name, hash) in [("vmlinux-4.19", "a"), ("vmlinux-5.4", "b"), ("bzImage", "c")] {
            let rec = testutil::artifact_record(name, "kernel", hash);
            store.put(rec.id(), &rec).expect("put");
        }
        let names: Vec<String> = store
            .search_by_type_and_name_pattern("kernel", "^vmlinux-", 0)
            .expect("query")
            .map(|r| r.expect("record").name().to_string())
            .collect();
        assert_eq!(names, vec!["vmlinux-4.19", "vmlinux-5.4"]);
        assert!(store
            .search_by_type_and_name_pattern("kernel", "(", 0)
            .is_err());
    }
}
