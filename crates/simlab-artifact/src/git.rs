use simlab_core::{GitProvenance, Result, SimlabError};
use std::path::{Path, PathBuf};
use std::process::Command;

fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| SimlabError::provenance(dir, format!("cannot run git: {}", e)))
}

fn git_stdout(dir: &Path, args: &[&str]) -> Result<Option<String>> {
    let out = git(dir, args)?;
    if !out.status.success() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
}

/// Origin, HEAD commit and repository root of the repository containing
/// `path`. Fails when there is no repository or when tracked files have
/// staged or unstaged changes; untracked files and submodules are ignored.
pub fn git_provenance(path: &Path) -> Result<GitProvenance> {
    let path = path
        .canonicalize()
        .map_err(|e| SimlabError::provenance(path, format!("cannot resolve path: {}", e)))?;
    let dir: PathBuf = if path.is_file() {
        path.parent().map(Path::to_path_buf).unwrap_or(path.clone())
    } else {
        path.clone()
    };

    let status = git(
        &dir,
        &[
            "status",
            "--porcelain",
            "--ignore-submodules",
            "--untracked-files=no",
        ],
    )?;
    if !status.status.success() {
        return Err(SimlabError::provenance(&dir, "git repository does not exist"));
    }
    if !status.stdout.iter().all(u8::is_ascii_whitespace) {
        return Err(SimlabError::provenance(
            &dir,
            "git repository has uncommitted changes",
        ));
    }

    let commit_id = git_stdout(&dir, &["log", "-n1", "--pretty=format:%H"])?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SimlabError::provenance(&dir, "git repository has no commits"))?;
    let origin_url = git_stdout(&dir, &["remote", "get-url", "origin"])?.filter(|s| !s.is_empty());
    let repo_root = git_stdout(&dir, &["rev-parse", "--show-toplevel"])?
        .map(PathBuf::from)
        .ok_or_else(|| SimlabError::provenance(&dir, "cannot resolve repository root"))?;

    Ok(GitProvenance {
        origin_url,
        commit_id,
        repo_root,
    })
}
