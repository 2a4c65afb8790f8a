use git2::{Repository, RepositoryInitOptions, Signature};
use nodefleet_core::types::{VcsBranch, VcsDirty};
use nodefleet_git_utils::probe;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn init_repo(path: &Path) -> Repository {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    Repository::init_opts(path, &opts).unwrap()
}

fn commit_all(repo: &Repository, message: &str) -> git2::Oid {
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("Test User", "test@example.com").unwrap();

    let parents = match repo.head() {
        Ok(head) => vec![head.peel_to_commit().unwrap()],
        Err(_) => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}

#[test]
fn test_not_a_repository() {
    let temp_dir = TempDir::new().unwrap();
    let info = probe(temp_dir.path());
    assert_eq!(info.branch, VcsBranch::NotARepository);
    assert_eq!(info.dirty, VcsDirty::Unknown);
}

#[test]
fn test_nested_in_parent_repo_is_not_a_repository() {
    let temp_dir = TempDir::new().unwrap();
    init_repo(temp_dir.path());
    let project = temp_dir.path().join("app");
    fs::create_dir(&project).unwrap();

    assert_eq!(probe(&project).branch, VcsBranch::NotARepository);
}

#[test]
fn test_unborn_branch_reports_initial_head() {
    let temp_dir = TempDir::new().unwrap();
    init_repo(temp_dir.path());

    let info = probe(temp_dir.path());
    assert_eq!(info.branch, VcsBranch::Branch("main".to_string()));
    assert_eq!(info.dirty, VcsDirty::Clean);
}

#[test]
fn test_clean_then_dirty() {
    let temp_dir = TempDir::new().unwrap();
    let repo = init_repo(temp_dir.path());
    fs::write(temp_dir.path().join("package.json"), "{}").unwrap();
    commit_all(&repo, "initial");

    let info = probe(temp_dir.path());
    assert_eq!(info.branch, VcsBranch::Branch("main".to_string()));
    assert_eq!(info.dirty, VcsDirty::Clean);

    fs::write(temp_dir.path().join("index.js"), "console.log(1)").unwrap();
    assert_eq!(probe(temp_dir.path()).dirty, VcsDirty::Dirty);
}

#[test]
fn test_detached_head() {
    let temp_dir = TempDir::new().unwrap();
    let repo = init_repo(temp_dir.path());
    fs::write(temp_dir.path().join("package.json"), "{}").unwrap();
    let oid = commit_all(&repo, "initial");
    repo.set_head_detached(oid).unwrap();

    let info = probe(temp_dir.path());
    match info.branch {
        VcsBranch::Detached(short) => {
            assert!(!short.is_empty());
            assert!(oid.to_string().starts_with(&short));
        }
        other => panic!("expected detached head, got {:?}", other),
    }
}

#[test]
fn test_broken_git_dir_is_unavailable() {
    let temp_dir = TempDir::new().unwrap();
    fs::create_dir(temp_dir.path().join(".git")).unwrap();
    assert_eq!(probe(temp_dir.path()).branch, VcsBranch::Unavailable);
}

#[test]
fn test_try_probe_surfaces_open_error() {
    let temp_dir = TempDir::new().unwrap();
    let err = nodefleet_git_utils::try_probe(temp_dir.path()).unwrap_err();
    assert!(matches!(err, nodefleet_git_utils::VcsError::Open(_)));
}
