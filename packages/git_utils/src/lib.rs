// ABOUTME: Git integration utilities for reading branch and working tree state of projects.
// ABOUTME: Every failure is folded into a sentinel so the probe never blocks a scan.

use git2::{ErrorCode, Repository, StatusOptions};
use nodefleet_core::types::{VcsBranch, VcsDirty, VcsInfo};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Failed to open repository: {0}")]
    Open(#[source] git2::Error),

    #[error("Failed to read branch: {0}")]
    Branch(#[source] git2::Error),

    #[error("Failed to read status: {0}")]
    Status(#[source] git2::Error),
}

/// Probe the Git state of a project directory.
///
/// Only the project directory itself is considered: a project nested inside
/// some parent repository reports `NotARepository`.
pub fn probe(project_path: &Path) -> VcsInfo {
    if !project_path.join(".git").exists() {
        return VcsInfo::not_a_repository();
    }

    let repo = match Repository::open(project_path) {
        Ok(repo) => repo,
        Err(e) => {
            debug!("No readable git repository at {}: {}", project_path.display(), e);
            return VcsInfo::unavailable();
        }
    };

    let branch = read_branch(&repo).unwrap_or_else(|e| {
        debug!("Git branch probe failed for {}: {}", project_path.display(), e);
        VcsBranch::Unavailable
    });
    let dirty = read_dirty(&repo).unwrap_or_else(|e| {
        debug!("Git status probe failed for {}: {}", project_path.display(), e);
        VcsDirty::Unknown
    });

    VcsInfo { branch, dirty }
}

/// Like [`probe`], but surfaces the underlying error.
pub fn try_probe(project_path: &Path) -> Result<VcsInfo, VcsError> {
    let repo = Repository::open(project_path).map_err(VcsError::Open)?;
    let branch = read_branch(&repo)?;
    let dirty = read_dirty(&repo)?;

    debug!(
        "Git state for {}: branch={} dirty={:?}",
        project_path.display(),
        branch,
        dirty
    );

    Ok(VcsInfo { branch, dirty })
}

fn read_branch(repo: &Repository) -> Result<VcsBranch, VcsError> {
    let head = match repo.head() {
        Ok(head) => head,
        // Fresh repository without commits: HEAD is symbolic to a branch that does not exist yet
        Err(e) if e.code() == ErrorCode::UnbornBranch => {
            let target = repo
                .find_reference("HEAD")
                .ok()
                .and_then(|r| r.symbolic_target().map(|s| s.to_string()));
            return Ok(match target {
                Some(name) => VcsBranch::Branch(
                    name.strip_prefix("refs/heads/").unwrap_or(&name).to_string(),
                ),
                None => VcsBranch::Unknown,
            });
        }
        Err(e) => return Err(VcsError::Branch(e)),
    };

    if repo.head_detached().map_err(VcsError::Branch)? {
        let commit = head.peel_to_commit().map_err(VcsError::Branch)?;
        let short = commit
            .as_object()
            .short_id()
            .map_err(VcsError::Branch)?
            .as_str()
            .unwrap_or_default()
            .to_string();
        return Ok(VcsBranch::Detached(short));
    }

    Ok(head
        .shorthand()
        .map(|s| VcsBranch::Branch(s.to_string()))
        .unwrap_or(VcsBranch::Unknown))
}

fn read_dirty(repo: &Repository) -> Result<VcsDirty, VcsError> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .include_ignored(false)
        .recurse_untracked_dirs(false);

    let statuses = repo.statuses(Some(&mut opts)).map_err(VcsError::Status)?;
    Ok(VcsDirty::from_bool(!statuses.is_empty()))
}
