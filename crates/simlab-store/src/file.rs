use crate::{check_put_id, Filter, Key, ProvenanceStore, RecordIter};
use chrono::Utc;
use simlab_core::{ensure_dir, sha256_bytes, Record, Result, SimlabError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

const RECORDS_DIR: &str = "records";
const HASHES_DIR: &str = "hashes";
const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";

/// Directory-backed store: one JSON document per id under `records/`, a
/// hash → id index under `hashes/`, and raw blobs under `blobs/`.
///
/// Documents are published with `hard_link`, which fails atomically when the
/// target exists, so concurrent writers (threads or processes) can never
/// overwrite an existing id.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

fn unavailable(context: &str, path: &Path, err: std::io::Error) -> SimlabError {
    SimlabError::StoreUnavailable(format!("{} {}: {}", context, path.display(), err))
}

impl FileStore {
    pub fn open(root: &Path) -> Result<Self> {
        for sub in [RECORDS_DIR, HASHES_DIR, BLOBS_DIR, TMP_DIR] {
            let dir = root.join(sub);
            ensure_dir(&dir).map_err(|e| {
                SimlabError::StoreUnavailable(format!("cannot open {}: {}", dir.display(), e))
            })?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.root.join(RECORDS_DIR).join(format!("{}.json", id))
    }

    fn hash_path(&self, hash: &str) -> PathBuf {
        let safe = !hash.is_empty()
            && hash
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        let name = if safe {
            hash.to_string()
        } else {
            sha256_bytes(hash.as_bytes())
        };
        self.root.join(HASHES_DIR).join(name)
    }

    fn blob_path(&self, id: Uuid) -> PathBuf {
        self.root.join(BLOBS_DIR).join(id.to_string())
    }

    fn tmp_path(&self, label: &str) -> PathBuf {
        self.root.join(TMP_DIR).join(format!(
            "{}.{}.{}.{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros(),
            Uuid::new_v4().simple()
        ))
    }

    /// Stages `bytes` and links them to `target`. Returns `false` when the
    /// target already exists.
    fn publish_new(&self, target: &Path, bytes: &[u8]) -> Result<bool> {
        let tmp = self.tmp_path("publish");
        let staged = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()
        })();
        if let Err(e) = staged {
            let _ = fs::remove_file(&tmp);
            return Err(unavailable("cannot stage", &tmp, e));
        }
        let linked = fs::hard_link(&tmp, target);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(unavailable("cannot publish", target, e)),
        }
    }

    fn read_record(path: &Path) -> Result<Option<Record>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("cannot read", path, e)),
        }
    }

    fn lookup_hash(&self, hash: &str) -> Result<Option<Uuid>> {
        let path = self.hash_path(hash);
        match fs::read_to_string(&path) {
            Ok(raw) => Uuid::parse_str(raw.trim()).map(Some).map_err(|e| {
                SimlabError::StoreUnavailable(format!(
                    "corrupt hash index {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable("cannot read", &path, e)),
        }
    }
}

impl ProvenanceStore for FileStore {
    fn put(&self, id: Uuid, record: &Record) -> Result<()> {
        check_put_id(id, record)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        if !self.publish_new(&self.record_path(id), &bytes)? {
            return Err(SimlabError::StoreConflict {
                id,
                reason: "id already present".into(),
            });
        }
        let hash = record.hash();
        if !self.publish_new(&self.hash_path(hash), id.to_string().as_bytes())? {
            debug!(%id, hash, "hash already indexed; keeping first record");
        }
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<Record>> {
        let id = match key {
            Key::Id(id) => *id,
            Key::Hash(h) => match self.lookup_hash(h)? {
                Some(id) => id,
                None => return Ok(None),
            },
        };
        Self::read_record(&self.record_path(id))
    }

    fn contains(&self, key: &Key) -> Result<bool> {
        match key {
            Key::Id(id) => Ok(self.record_path(*id).is_file()),
            Key::Hash(h) => Ok(self.lookup_hash(h)?.is_some()),
        }
    }

    fn upload(&self, id: Uuid, path: &Path) -> Result<()> {
        let tmp = self.tmp_path("blob");
        fs::copy(path, &tmp).map_err(|e| unavailable("cannot stage blob from", path, e))?;
        let target = self.blob_path(id);
        fs::rename(&tmp, &target).map_err(|e| unavailable("cannot store blob", &target, e))?;
        Ok(())
    }

    fn download_file(&self, id: Uuid, dest: &Path) -> Result<()> {
        let src = self.blob_path(id);
        if !src.is_file() {
            return Err(SimlabError::MissingRecord(format!("blob {}", id)));
        }
        fs::copy(&src, dest)?;
        Ok(())
    }

    fn find(&self, filter: Filter, limit: usize) -> Result<RecordIter> {
        let dir = self.root.join(RECORDS_DIR);
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .map_err(|e| unavailable("cannot list", &dir, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect();
        // Directory order is unspecified; sort by insertion time, then name.
        paths.sort_by_cached_key(|p| {
            let modified = fs::metadata(p).and_then(|m| m.modified()).ok();
            (modified, p.clone())
        });
        let iter = paths
            .into_iter()
            .filter_map(move |path| match Self::read_record(&path) {
                Ok(Some(record)) if filter.matches(&record) => Some(Ok(record)),
                Ok(_) => None,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable record");
                    Some(Err(e))
                }
            })
            .take(if limit == 0 { usize::MAX } else { limit });
        Ok(Box::new(iter))
    }
}
