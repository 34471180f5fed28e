use std::path::Path;

use tracing::debug;

pub const LOCAL_REVISION: &str = "local";

/// Commit id checked out in `data_dir`, read straight from `.git` without a git binary.
pub fn read_git_revision(data_dir: &Path) -> Option<String> {
    let git_dir = data_dir.join(".git");
    let head = std::fs::read_to_string(git_dir.join("HEAD")).ok()?;
    let head = head.trim();

    let Some(reference) = head.strip_prefix("ref:") else {
        return (!head.is_empty()).then(|| head.to_string());
    };
    let reference = reference.trim();
    if let Ok(loose) = std::fs::read_to_string(git_dir.join(reference)) {
        let loose = loose.trim();
        if !loose.is_empty() {
            return Some(loose.to_string());
        }
    }

    // After `git gc` the ref only lives in packed-refs.
    let packed = std::fs::read_to_string(git_dir.join("packed-refs")).ok()?;
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .find_map(|line| {
            let (sha, name) = line.split_once(' ')?;
            (name.trim() == reference).then(|| sha.to_string())
        })
}

pub fn resolve_revision(explicit: Option<&str>, data_dir: &Path) -> String {
    if let Some(revision) = explicit.filter(|r| !r.trim().is_empty()) {
        return revision.to_string();
    }
    match read_git_revision(data_dir) {
        Some(revision) => revision,
        None => {
            debug!(data_dir = %data_dir.display(), "no git HEAD in data dir");
            LOCAL_REVISION.to_string()
        }
    }
}
