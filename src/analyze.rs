//! PR analysis: changed files in, one review comment per finding out.
//!
//! Per-file oracle failures are logged and skipped so one bad file never
//! sinks the whole run. A finding only becomes a comment when its patch
//! survives validation; posting a patch we already know cannot apply
//! would just produce a dead /apply-fix button.

use crate::ai_funcs::{self, OracleResponse};
use crate::error::BotError;
use crate::github::GithubClient;
use crate::patch;
use crate::render;
use crate::utils;
use colored::Colorize;
use std::fs;
use std::path::Path;

const SEVERITIES: &[&str] = &["LOW", "MEDIUM", "HIGH", "CRITICAL"];

/// Rank for threshold filtering; unknown severities count as MEDIUM.
pub fn severity_rank(severity: &str) -> usize {
    let severity = severity.trim().to_uppercase();
    SEVERITIES
        .iter()
        .position(|s| *s == severity)
        .unwrap_or(1)
}

/// Analyze every changed file of the PR and post review comments for the
/// findings at or above `min_severity`. Returns how many were posted.
pub async fn analyze_pr(
    gh: &GithubClient,
    root: &Path,
    pr_number: u64,
    min_severity: &str,
) -> Result<usize, BotError> {
    let min_rank = severity_rank(min_severity);
    let files = gh.pr_files(pr_number).await?;
    let head_sha = gh.pr_head_sha(pr_number).await?;

    let mut posted = 0usize;
    for file in &files {
        if file.status == "removed" {
            continue;
        }
        let path = root.join(&file.filename);
        if !path.exists() {
            println!(
                "{}",
                format!("⚠️ Skipping {} (not in workspace)", file.filename).yellow()
            );
            continue;
        }

        println!("Analyzing file: {}", file.filename);
        let file_text = String::from_utf8_lossy(&fs::read(&path)?).into_owned();
        let mut context = format!("File: {}\n", file.filename);
        utils::append_with_newline(&file_text, &mut context);

        let response = match ai_funcs::complete(ai_funcs::ANALYZE_SYSTEM_MESSAGE, context).await {
            Ok(response) => response,
            Err(err) => {
                println!(
                    "{}",
                    format!("❌ Analysis failed for {}: {}", file.filename, err).red()
                );
                continue;
            }
        };

        let issues = match ai_funcs::decode_response(&response) {
            OracleResponse::Issues(list) => list,
            OracleResponse::Single(issue) => vec![*issue],
            OracleResponse::Raw(text) => {
                println!(
                    "{}",
                    format!(
                        "⚠️ Unstructured oracle response for {} ({} chars); skipping",
                        file.filename,
                        text.len()
                    )
                    .yellow()
                );
                continue;
            }
        };

        let file_hash = utils::sha256_hex(&path)?;
        for mut issue in issues {
            if severity_rank(&issue.severity) < min_rank {
                continue;
            }
            // The model sometimes reports a different path than the file
            // it was shown; our path and hash are authoritative.
            issue.file = file.filename.clone();
            issue.file_hash = file_hash.clone();
            issue.patch = patch::fix(&issue.patch);
            if !patch::validate(&issue.patch) {
                println!(
                    "{}",
                    format!(
                        "⚠️ Dropping finding at {}:{} (patch failed validation)",
                        issue.file,
                        issue.line.unwrap_or(0)
                    )
                    .yellow()
                );
                continue;
            }
            let Some(line) = issue.line else {
                println!(
                    "{}",
                    format!("⚠️ Dropping finding in {} (no line number)", issue.file).yellow()
                );
                continue;
            };

            let body = render::render_issue_comment(&issue)?;
            gh.create_review_comment(pr_number, &body, &head_sha, &issue.file, line)
                .await?;
            posted += 1;
            println!("✓ Posted finding at {}:{}", issue.file, line);
        }
    }

    Ok(posted)
}
