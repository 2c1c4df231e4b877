//! Downstream patch refresh.
//!
//! After one issue's patch is applied, every other pending issue on the
//! same file below the applied line carries a stale patch: line numbers
//! shifted. The engine regenerates each of those patches against the
//! current file content, dry-run-verifies them, and rewrites only the
//! hidden metadata of the affected comments. Candidates fail or succeed
//! independently; the batch always runs to completion.

use crate::apply;
use crate::comment::{self, CommentState, Issue};
use crate::error::BotError;
use crate::github::{GithubClient, ReviewComment};
use crate::utils;
use colored::Colorize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_COMMENTS: usize = 50;
const HEAD_TAIL_LINES: usize = 200;
const AROUND_WINDOWS: &[usize] = &[120, 80, 60, 40, 20, 10];
const MAX_CONTEXT_CHARS: usize = 250_000;

/// Regenerates a patch for one issue against the current file content.
/// A seam so the engine is testable without a network.
pub trait PatchOracle {
    async fn regenerate(&self, issue: &Issue, context: &str) -> Result<String, BotError>;
}

/// The comment-store write the engine performs per refreshed candidate.
pub trait CommentStore {
    async fn update_review_comment(&self, comment_id: u64, body: &str) -> Result<(), BotError>;
}

impl CommentStore for GithubClient {
    async fn update_review_comment(&self, comment_id: u64, body: &str) -> Result<(), BotError> {
        GithubClient::update_review_comment(self, comment_id, body).await
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct RefreshOptions {
    /// Root of the checked-out repository.
    pub root: PathBuf,
    /// Worst-case bound on comment updates per apply event.
    pub max_comments: usize,
}

impl RefreshOptions {
    pub fn from_env(root: PathBuf) -> RefreshOptions {
        let max_comments = env::var("REFRESH_MAX_COMMENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_COMMENTS);
        RefreshOptions { root, max_comments }
    }
}

/// Downstream-only selection: bot-authored issue comments on the applied
/// file, still in `analyzed` state, with a numeric line strictly after the
/// applied line, ascending. Comments at or before the applied line are
/// assumed consistent already and are never touched; same goes for the
/// applied comment itself.
pub fn downstream_candidates<'a>(
    applied_file: &str,
    applied_line: u32,
    applied_comment_id: Option<u64>,
    comments: &'a [ReviewComment],
) -> Vec<(&'a ReviewComment, Issue, u32)> {
    let mut candidates: Vec<(&ReviewComment, Issue, u32)> = Vec::new();
    for candidate in comments {
        if !comment::is_bot_issue_comment(candidate) {
            continue;
        }
        if comment::comment_state(&candidate.body) != CommentState::Analyzed {
            continue;
        }
        let Some(issue) = Issue::from_comment(&candidate.body) else {
            continue;
        };
        if issue.file != applied_file {
            continue;
        }
        let Some(line) = issue.line else {
            continue;
        };
        if applied_comment_id == Some(candidate.id) {
            continue;
        }
        if line <= applied_line {
            continue;
        }
        candidates.push((candidate, issue, line));
    }
    candidates.sort_by_key(|(_, _, line)| *line);
    candidates
}

/// Bounded context for the oracle: head of file, a window around the
/// stale line, tail of file. The window shrinks until the whole thing
/// fits `max_chars`; as a last resort the context is truncated hard.
pub fn context_slices(file_text: &str, approx_line: Option<u32>, max_chars: usize) -> String {
    let lines: Vec<&str> = file_text.lines().collect();

    let join_slice = |start: usize, end: usize| -> String {
        let chunk = &lines[start.min(lines.len())..end.min(lines.len())];
        if chunk.is_empty() {
            String::new()
        } else {
            format!("{}\n", chunk.join("\n"))
        }
    };

    let head = join_slice(0, HEAD_TAIL_LINES);
    let tail = join_slice(lines.len().saturating_sub(HEAD_TAIL_LINES), lines.len());

    let around_at = |window: usize| -> String {
        match approx_line {
            Some(line) if line >= 1 && (line as usize) <= lines.len() => {
                let idx = line as usize - 1;
                join_slice(idx.saturating_sub(window), idx + window)
            }
            _ => String::new(),
        }
    };

    let assemble = |around: &str| -> String {
        format!(
            "FILE_CONTEXT_BEGIN\n=== FILE_HEAD ===\n{}=== FILE_AROUND_LINE ===\n{}=== FILE_TAIL ===\n{}FILE_CONTEXT_END\n",
            head, around, tail
        )
    };

    let mut context = assemble(&around_at(AROUND_WINDOWS[0]));
    if context.len() <= max_chars {
        return context;
    }
    for window in &AROUND_WINDOWS[1..] {
        context = assemble(&around_at(*window));
        if context.len() <= max_chars {
            return context;
        }
    }

    let suffix = format!("\n\n...[TRUNCATED CONTEXT: {} chars total]...\n", context.len());
    let keep = max_chars.saturating_sub(suffix.len());
    let mut truncated: String = context.chars().take(keep).collect();
    truncated.push_str(&suffix);
    truncated
}

/// Prompt for regenerating one stale patch; the old patch rides along as
/// intent reference only.
pub fn build_refresh_prompt(issue: &Issue) -> String {
    format!(
        "Target file: {}\n\
         Issue severity: {}\n\
         Issue category: {}\n\
         Method/area: {}\n\n\
         Issue description:\n{}\n\n\
         Original recommendation (may include code snippet):\n{}\n\n\
         Original patch (stale; use only as intent reference):\n{}\n",
        issue.file,
        issue.severity.trim(),
        issue.category.trim(),
        issue.method.trim(),
        issue.description.trim(),
        issue.recommendation.trim(),
        issue.patch.trim(),
    )
}

/// Refresh every downstream candidate. Per-candidate failures are logged
/// and counted, never propagated: partial success is the steady state.
pub async fn refresh<O: PatchOracle, S: CommentStore>(
    applied: &Issue,
    applied_comment_id: Option<u64>,
    comments: &[ReviewComment],
    oracle: &O,
    store: &S,
    opts: &RefreshOptions,
) -> Result<RefreshReport, BotError> {
    let applied_line = applied.line.ok_or_else(|| BotError::InvalidMetadata {
        reason: "applied issue has no numeric line; cannot order downstream comments".to_string(),
    })?;
    if applied.file.trim().is_empty() {
        return Err(BotError::InvalidMetadata {
            reason: "applied issue has no file".to_string(),
        });
    }

    let mut report = RefreshReport::default();
    let mut candidates =
        downstream_candidates(&applied.file, applied_line, applied_comment_id, comments);
    if candidates.is_empty() {
        println!("No downstream issue comments found to refresh.");
        return Ok(report);
    }
    if candidates.len() > opts.max_comments {
        println!(
            "{}",
            format!(
                "⚠️ Limiting refresh to first {} downstream comments (found {})",
                opts.max_comments,
                candidates.len()
            )
            .yellow()
        );
        candidates.truncate(opts.max_comments);
    }

    let target = opts.root.join(&applied.file);
    if !target.exists() {
        return Err(BotError::NotFound {
            path: applied.file.clone(),
        });
    }
    // One read and one hash for the whole batch, so every refreshed patch
    // is consistent against the same file snapshot.
    let file_text = String::from_utf8_lossy(&fs::read(&target)?).into_owned();
    let current_hash = utils::sha256_hex(&target)?;

    for (candidate, issue, line) in candidates {
        println!("---\nRefreshing comment #{} at {}:{}", candidate.id, applied.file, line);
        match refresh_one(
            candidate,
            &issue,
            line,
            &file_text,
            &current_hash,
            &opts.root,
            oracle,
            store,
        )
        .await
        {
            Ok(true) => report.updated += 1,
            Ok(false) => {
                println!("No body change detected; skipping update");
                report.skipped += 1;
            }
            Err(err) => {
                println!(
                    "{}",
                    format!("❌ Failed to refresh comment #{}: {}", candidate.id, err).red()
                );
                report.failed += 1;
            }
        }
    }

    println!(
        "\n=== Refresh Summary ===\nUpdated comments: {}\nSkipped comments: {}\nFailed comments:  {}",
        report.updated, report.skipped, report.failed
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn refresh_one<O: PatchOracle, S: CommentStore>(
    candidate: &ReviewComment,
    issue: &Issue,
    line: u32,
    file_text: &str,
    current_hash: &str,
    root: &Path,
    oracle: &O,
    store: &S,
) -> Result<bool, BotError> {
    let context = format!(
        "REPOSITORY_FILE_PATH: {}\nAPPROX_LINE: {}\nCURRENT_FILE_SHA256: {}\n\n{}",
        issue.file,
        line,
        current_hash,
        context_slices(file_text, Some(line), MAX_CONTEXT_CHARS)
    );

    let raw = oracle.regenerate(issue, &context).await?;
    let fixed = crate::patch::fix(&raw);
    if !crate::patch::validate(&fixed) {
        return Err(BotError::MalformedPatch {
            reason: "regenerated patch failed structural validation".to_string(),
        });
    }

    // Dry run against the working tree; a conflicting regeneration leaves
    // the comment untouched.
    apply::check_patch(root, &issue.file, &fixed).await?;

    let mut updated = issue.clone();
    updated.patch = fixed;
    updated.file_hash = current_hash.to_string();
    let new_body = comment::replace_issue_data(&candidate.body, &updated)?;
    if new_body == candidate.body {
        return Ok(false);
    }
    store.update_review_comment(candidate.id, &new_body).await?;
    println!("✓ Updated ISSUE_DATA patch in-place");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn issue_body(file: &str, line: u32, patch: &str) -> String {
        let issue = Issue {
            file: file.to_string(),
            line: Some(line),
            severity: "MEDIUM".to_string(),
            description: "missing log".to_string(),
            patch: patch.to_string(),
            file_hash: "stalehash".to_string(),
            ..Issue::default()
        };
        format!(
            "**🤖 MEDIUM - logging**\n\n{}\n\n{}\n\n{}\n",
            comment::APPLY_CTA_LINE,
            issue.to_marker().unwrap(),
            comment::status_marker(CommentState::Analyzed),
        )
    }

    fn bot_comment(id: u64, file: &str, line: u32) -> ReviewComment {
        ReviewComment::for_tests(id, &issue_body(file, line, "@@ -1,1 +1,2 @@\n a\n+b"), None)
    }

    #[test]
    fn downstream_filtering_is_same_file_strictly_later() {
        let comments = vec![
            bot_comment(1, "F", 5),
            bot_comment(2, "F", 10),
            bot_comment(3, "F", 20),
            bot_comment(4, "F", 11),
            bot_comment(5, "G", 15),
        ];
        let picked = downstream_candidates("F", 10, None, &comments);
        let lines: Vec<u32> = picked.iter().map(|(_, _, line)| *line).collect();
        assert_eq!(lines, vec![11, 20]);
    }

    #[test]
    fn applied_comment_itself_is_excluded() {
        let comments = vec![bot_comment(7, "F", 30)];
        assert!(downstream_candidates("F", 10, Some(7), &comments).is_empty());
        assert_eq!(downstream_candidates("F", 10, Some(9), &comments).len(), 1);
    }

    #[test]
    fn non_analyzed_comments_are_never_candidates() {
        let mut applied = bot_comment(1, "F", 20);
        applied.body = comment::set_state(&applied.body, CommentState::Applied);
        let comments = vec![applied, bot_comment(2, "F", 25)];
        let picked = downstream_candidates("F", 10, None, &comments);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].0.id, 2);
    }

    #[test]
    fn human_comments_are_never_candidates() {
        let human = ReviewComment::for_tests(1, "looks wrong around line 30", Some("alice"));
        assert!(downstream_candidates("F", 10, None, &[human]).is_empty());
    }

    #[test]
    fn context_slices_contains_window_markers() {
        let text = (1..=500).map(|i| format!("line {}\n", i)).collect::<String>();
        let context = context_slices(&text, Some(250), MAX_CONTEXT_CHARS);
        assert!(context.starts_with("FILE_CONTEXT_BEGIN\n=== FILE_HEAD ===\nline 1\n"));
        assert!(context.contains("=== FILE_AROUND_LINE ===\n"));
        assert!(context.contains("line 250\n"));
        let expected_tail = "=== FILE_TAIL ===\nline 301\n".to_string()
            + &(302..=500).map(|i| format!("line {}\n", i)).collect::<String>()
            + "FILE_CONTEXT_END\n";
        assert!(context.ends_with(&expected_tail));
    }

    #[test]
    fn context_slices_shrinks_then_truncates() {
        let text = (1..=2000).map(|i| format!("line number {}\n", i)).collect::<String>();
        let context = context_slices(&text, Some(1000), 2_000);
        assert!(context.len() <= 2_000);
        assert!(context.contains("TRUNCATED CONTEXT"));
    }

    struct ScriptedOracle {
        patches: HashMap<u32, String>,
    }

    impl PatchOracle for ScriptedOracle {
        async fn regenerate(&self, issue: &Issue, _context: &str) -> Result<String, BotError> {
            let line = issue.line.unwrap_or(0);
            self.patches
                .get(&line)
                .cloned()
                .ok_or_else(|| BotError::Oracle("no scripted patch".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        updates: Mutex<Vec<(u64, String)>>,
    }

    impl CommentStore for RecordingStore {
        async fn update_review_comment(&self, comment_id: u64, body: &str) -> Result<(), BotError> {
            self.updates
                .lock()
                .unwrap()
                .push((comment_id, body.to_string()));
            Ok(())
        }
    }

    fn numbered_file(dir: &Path, name: &str, lines: usize) {
        let content: String = (1..=lines).map(|i| format!("content line {}\n", i)).collect();
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn refresh_batch_partial_failure() {
        let dir = tempfile::tempdir().unwrap();
        numbered_file(dir.path(), "app.txt", 40);

        let comments = vec![
            bot_comment(11, "app.txt", 12),
            bot_comment(12, "app.txt", 20),
            bot_comment(13, "app.txt", 30),
        ];
        let mut patches = HashMap::new();
        patches.insert(12, "@@ -12,1 +12,2 @@\n content line 12\n+added after 12".to_string());
        patches.insert(20, "@@ -20,1 +20,2 @@\n content line 20\n+added after 20".to_string());
        // Valid format, but the context does not exist: dry run must fail.
        patches.insert(30, "@@ -30,1 +30,2 @@\n NOT THE REAL LINE\n+oops".to_string());
        let oracle = ScriptedOracle { patches };
        let store = RecordingStore::default();

        let applied = Issue {
            file: "app.txt".to_string(),
            line: Some(5),
            ..Issue::default()
        };
        let opts = RefreshOptions {
            root: dir.path().to_path_buf(),
            max_comments: DEFAULT_MAX_COMMENTS,
        };
        let report = refresh(&applied, Some(99), &comments, &oracle, &store, &opts)
            .await
            .unwrap();

        assert_eq!(
            report,
            RefreshReport {
                updated: 2,
                skipped: 0,
                failed: 1
            }
        );

        let updates = store.updates.lock().unwrap();
        let ids: Vec<u64> = updates.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![11, 12]);
        // Refreshed metadata carries the new patch and the batch hash.
        let refreshed = Issue::from_comment(&updates[0].1).unwrap();
        assert!(refreshed.patch.contains("added after 12"));
        assert_eq!(
            refreshed.file_hash,
            utils::sha256_hex(&dir.path().join("app.txt")).unwrap()
        );
        // The failed candidate's comment was never written to.
        assert!(!ids.contains(&13));
        // Dry runs only: the file itself is untouched.
        let on_disk = std::fs::read_to_string(dir.path().join("app.txt")).unwrap();
        assert!(on_disk.contains("content line 30"));
        assert!(!on_disk.contains("added after 12"));
    }

    #[tokio::test]
    async fn refresh_caps_candidate_count() {
        let dir = tempfile::tempdir().unwrap();
        numbered_file(dir.path(), "app.txt", 40);

        let comments: Vec<ReviewComment> = (0..5)
            .map(|i| bot_comment(20 + i, "app.txt", 12 + i as u32))
            .collect();
        let oracle = ScriptedOracle {
            patches: HashMap::new(),
        };
        let store = RecordingStore::default();
        let applied = Issue {
            file: "app.txt".to_string(),
            line: Some(5),
            ..Issue::default()
        };
        let opts = RefreshOptions {
            root: dir.path().to_path_buf(),
            max_comments: 2,
        };
        let report = refresh(&applied, None, &comments, &oracle, &store, &opts)
            .await
            .unwrap();
        // Oracle has no scripted patches: both attempted candidates fail,
        // but only max_comments of them are attempted at all.
        assert_eq!(report.failed, 2);
        assert_eq!(report.updated + report.skipped + report.failed, 2);
    }

    #[tokio::test]
    async fn refresh_requires_numeric_line() {
        let applied = Issue {
            file: "app.txt".to_string(),
            line: None,
            ..Issue::default()
        };
        let oracle = ScriptedOracle {
            patches: HashMap::new(),
        };
        let store = RecordingStore::default();
        let opts = RefreshOptions {
            root: PathBuf::from("."),
            max_comments: DEFAULT_MAX_COMMENTS,
        };
        let err = refresh(&applied, None, &[], &oracle, &store, &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::InvalidMetadata { .. }));
    }
}
