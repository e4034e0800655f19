use simlab_core::{Result, SimlabError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

fn archive_error(dir: &Path, reason: impl ToString) -> SimlabError {
    SimlabError::Archive {
        dir: dir.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Deflates everything under `dir` into `dir/<archive_name>`, with entry
/// names relative to `dir`. A previous archive of the same name is replaced
/// and never included.
pub fn archive_output(dir: &Path, archive_name: &str) -> Result<PathBuf> {
    let archive_path = dir.join(archive_name);
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| archive_error(dir, e))?;
        if entry.path() == archive_path {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| archive_error(dir, e))?;
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");
        let kind = entry.file_type();
        if kind.is_dir() {
            entries.push((format!("{}/", name), None));
        } else if kind.is_file() {
            entries.push((name, Some(entry.path().to_path_buf())));
        }
    }

    let file = fs::File::create(&archive_path).map_err(|e| archive_error(dir, e))?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, source) in entries {
        match source {
            None => zip
                .add_directory(name, options)
                .map_err(|e| archive_error(dir, e))?,
            Some(path) => {
                zip.start_file(name, options)
                    .map_err(|e| archive_error(dir, e))?;
                let mut src = fs::File::open(&path).map_err(|e| archive_error(dir, e))?;
                io::copy(&mut src, &mut zip).map_err(|e| archive_error(dir, e))?;
            }
        }
    }
    zip.finish().map_err(|e| archive_error(dir, e))?;
    Ok(archive_path)
}
