//! Patch application against the working tree.
//!
//! `git apply` does the actual work so application stays all-or-nothing
//! and whitespace-tolerant. The check variant validates without mutating;
//! the same code path serves the refresh engine's dry runs.

use crate::error::BotError;
use crate::patch;
use crate::utils;
use git2::{DiffOptions, Repository};
use std::fs;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Apply `patch_text` to `file` under `root`. With `expected_hash` set,
/// the file's current SHA-256 must match or the patch is considered stale
/// and nothing is touched. The hash check is advisory: comments written
/// before hashes existed pass `None` and rely on the structural checks.
pub async fn apply_patch(
    root: &Path,
    file: &str,
    patch_text: &str,
    expected_hash: Option<&str>,
) -> Result<(), BotError> {
    run_git_apply(root, file, patch_text, expected_hash, false).await
}

/// Dry run: verify the patch would apply cleanly, without mutating.
pub async fn check_patch(root: &Path, file: &str, patch_text: &str) -> Result<(), BotError> {
    run_git_apply(root, file, patch_text, None, true).await
}

async fn run_git_apply(
    root: &Path,
    file: &str,
    patch_text: &str,
    expected_hash: Option<&str>,
    check_only: bool,
) -> Result<(), BotError> {
    let target = root.join(file);
    if !target.exists() {
        return Err(BotError::NotFound {
            path: file.to_string(),
        });
    }

    if let Some(expected) = expected_hash.filter(|h| !h.is_empty()) {
        let actual = utils::sha256_hex(&target)?;
        if actual != expected {
            return Err(BotError::StaleFile {
                path: file.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }

    let fixed = patch::fix(patch_text);
    if !patch::validate(&fixed) {
        return Err(BotError::MalformedPatch {
            reason: "patch failed structural validation after repair".to_string(),
        });
    }
    // A hunk ending in a change line gets anchored to end-of-file by git;
    // extend it with real context so mid-file hunks apply where they claim.
    let file_text = String::from_utf8_lossy(&fs::read(&target)?).into_owned();
    let anchored = patch::anchor_trailing_context(&fixed, &file_text);
    let full_patch = complete_diff(file, &anchored);

    let mut command = Command::new("git");
    command
        .arg("apply")
        .arg("--ignore-whitespace")
        .arg("--whitespace=fix");
    if check_only {
        command.arg("--check");
    }
    command
        .current_dir(root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(full_patch.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut diagnostic = format!("git apply: {}\npatch was:\n{}", stderr.trim(), full_patch);
    if let Ok(history) = recent_history(root, file) {
        if !history.is_empty() {
            diagnostic.push_str(&format!("\nrecent commits touching {}:\n{}", file, history));
        }
    }
    Err(BotError::ApplyConflict {
        path: file.to_string(),
        diagnostic,
    })
}

/// Turn a bare hunk fragment into a complete diff document. Both sides
/// point at the same path: these are working-tree patches, not
/// cross-revision diffs. git treats a missing trailing newline as a
/// corrupt patch, so one is always ensured.
pub fn complete_diff(file: &str, patch_text: &str) -> String {
    let mut full = if patch_text.starts_with("---") {
        patch_text.to_string()
    } else {
        format!("--- a/{}\n+++ b/{}\n{}", file, file, patch_text)
    };
    if !full.ends_with('\n') {
        full.push('\n');
    }
    full
}

/// Short log of the most recent commits touching `file`, to help a human
/// understand why a patch's context drifted. Best-effort: callers ignore
/// errors (e.g. when `root` is not a repository).
fn recent_history(root: &Path, file: &str) -> Result<String, BotError> {
    let repo = Repository::open(root)?;
    let mut revwalk = repo.revwalk()?;
    revwalk.push_head()?;

    let mut entries: Vec<String> = Vec::new();
    for oid in revwalk.take(200) {
        let oid = oid?;
        let commit = repo.find_commit(oid)?;
        let tree = commit.tree()?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree()?),
            Err(_) => None,
        };
        let mut opts = DiffOptions::new();
        opts.pathspec(file);
        let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;
        if diff.deltas().len() > 0 {
            let id = oid.to_string();
            entries.push(format!(
                "{} {}",
                &id[..8.min(id.len())],
                commit.summary().unwrap_or("")
            ));
            if entries.len() >= 5 {
                break;
            }
        }
    }
    Ok(entries.join("\n"))
}
