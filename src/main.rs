mod ai_funcs;
mod analyze;
mod apply;
mod comment;
mod error;
mod github;
mod patch;
mod refresh;
mod render;
mod trigger;
mod utils;

use clap::Parser;
use colored::Colorize;
use comment::{CommentState, Issue};
use error::BotError;
use github::GithubClient;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use utils::{Args, Command};

fn exit_msg(message: &str) -> ! {
    eprintln!("{}", message.red());
    process::exit(1);
}

fn exit_err(message: &str, err: BotError) -> ! {
    exit_msg(&format!("{} {}", message, err));
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Command::Analyze {
            owner,
            repo,
            pr,
            min_severity,
        } => {
            println!("Analysing PR changes: {}/{} #{}\n", owner, repo, pr);
            let gh = GithubClient::new(&owner, &repo);
            match analyze::analyze_pr(&gh, Path::new("."), pr, &min_severity).await {
                Ok(posted) => println!("\n✓ Posted {} finding(s)", posted),
                Err(e) => exit_err("Failed to analyze PR:", e),
            }
        }
        Command::CheckTrigger {
            owner,
            repo,
            pr,
            comment_id,
            output_file,
        } => run_check_trigger(&owner, &repo, pr, comment_id, &output_file).await,
        Command::Apply {
            owner,
            repo,
            comment_id,
            context_file,
        } => run_apply(&owner, &repo, comment_id, context_file.as_deref()).await,
        Command::SetState {
            owner,
            repo,
            comment_id,
            state,
        } => run_set_state(&owner, &repo, comment_id, &state).await,
        Command::Refresh {
            owner,
            repo,
            pr,
            applied_comment_id,
        } => run_refresh(&owner, &repo, pr, applied_comment_id).await,
    }
}

/// Gate an apply reply. Outputs `should_apply=false` (exit 0) when the
/// reply is not a trigger or the parent has already been applied; exits
/// non-zero only on API failures.
async fn run_check_trigger(owner: &str, repo: &str, pr: u64, comment_id: u64, output_file: &str) {
    let gh = GithubClient::new(owner, repo);

    fn deny(reason: &str, output_file: &str) -> ! {
        println!("{}", reason);
        write_trigger_outputs(&trigger::TriggerContext::not_triggered(), output_file);
        process::exit(0);
    }

    let trigger_comment = match gh.get_review_comment(comment_id).await {
        Ok(c) => c,
        Err(e) => {
            let _ = utils::set_github_output("should_apply", "false");
            exit_err("Failed to fetch trigger comment:", e);
        }
    };
    if !trigger::is_apply_trigger(&trigger_comment.body) {
        deny("No /apply-fix trigger found in comment", output_file);
    }

    let all_comments = match gh.list_review_comments(pr).await {
        Ok(c) => c,
        Err(e) => {
            let _ = utils::set_github_output("should_apply", "false");
            exit_err("Failed to list PR comments:", e);
        }
    };
    let parent_id = match trigger::find_thread_root(&trigger_comment, &all_comments) {
        Some(root) => root.id,
        // A trigger with no parent may itself carry the issue.
        None if Issue::from_comment(&trigger_comment.body).is_some() => trigger_comment.id,
        None => deny("Trigger reply has no parent issue comment", output_file),
    };

    // The gate must see the parent's state as it is right now, never a
    // value cached from the listing above.
    let parent = match gh.get_review_comment(parent_id).await {
        Ok(c) => c,
        Err(e) => {
            let _ = utils::set_github_output("should_apply", "false");
            exit_err("Failed to fetch parent comment:", e);
        }
    };
    if let Err(e) = trigger::should_apply(&parent) {
        deny(&format!("{}; skipping", e), output_file);
    }

    let context = trigger::TriggerContext::confirmed(&trigger_comment, &parent);
    write_trigger_outputs(&context, output_file);
    println!(
        "✓ Got parent comment #{} (state={})",
        parent.id,
        comment::comment_state(&parent.body)
    );
    println!(
        "  Triggered by comment #{} from {}",
        trigger_comment.id,
        trigger_comment.author().unwrap_or("unknown")
    );
}

fn write_trigger_outputs(context: &trigger::TriggerContext, output_file: &str) {
    match serde_json::to_string_pretty(context) {
        Ok(json) => {
            if let Err(e) = fs::write(output_file, json) {
                exit_msg(&format!("Failed to write {}: {}", output_file, e));
            }
        }
        Err(e) => exit_msg(&format!("Failed to serialize trigger context: {}", e)),
    }
    let _ = utils::set_github_output(
        "should_apply",
        if context.triggered { "true" } else { "false" },
    );
    if let Some(id) = context.comment_id {
        let _ = utils::set_github_output("comment_id", &id.to_string());
    }
    if let Some(id) = context.parent_comment_id {
        let _ = utils::set_github_output("parent_comment_id", &id.to_string());
    }
}

/// Apply the patch from an issue comment, then flip the comment to
/// `applied`. The context file only names the comment; its body is always
/// re-fetched so the state gate never trusts a value captured by an
/// earlier workflow step.
async fn run_apply(owner: &str, repo: &str, comment_id: Option<u64>, context_file: Option<&str>) {
    let gh = GithubClient::new(owner, repo);

    let id = match (comment_id, context_file) {
        (Some(id), _) => id,
        (None, Some(path)) => {
            let json = match fs::read_to_string(path) {
                Ok(json) => json,
                Err(e) => exit_msg(&format!("Failed to read {}: {}", path, e)),
            };
            let context: trigger::TriggerContext = match serde_json::from_str(&json) {
                Ok(context) => context,
                Err(e) => exit_msg(&format!("Failed to parse {}: {}", path, e)),
            };
            match context.parent_comment_id {
                Some(id) => id,
                None => exit_msg("Trigger context has no parent comment id; nothing to apply"),
            }
        }
        (None, None) => exit_msg("Either --comment-id or --context-file is required"),
    };

    let current = match gh.get_review_comment(id).await {
        Ok(c) => c,
        Err(e) => exit_err("Failed to fetch issue comment:", e),
    };
    let body = current.body;

    let state = comment::comment_state(&body);
    if state != CommentState::Analyzed {
        exit_msg(&format!(
            "Comment state is '{}'; only analyzed comments can be applied",
            state
        ));
    }

    let Some(issue) = Issue::from_comment(&body) else {
        exit_msg(
            "Could not parse issue from comment.\n\
             Make sure the comment includes hidden JSON metadata: <!-- ISSUE_DATA: {...} -->",
        );
    };
    if issue.patch.trim().is_empty() {
        exit_msg("Issue metadata has no patch; re-run the analysis to regenerate comments");
    }

    println!("Applying patch to {}", issue.file);
    let expected_hash = (!issue.file_hash.is_empty()).then_some(issue.file_hash.as_str());
    if let Err(e) = apply::apply_patch(Path::new("."), &issue.file, &issue.patch, expected_hash).await
    {
        exit_err("Failed to apply patch:", e);
    }
    println!("✅ Applied changes to {}", issue.file);

    let new_body = comment::set_state(&body, CommentState::Applied);
    if new_body != body {
        if let Err(e) = gh.update_review_comment(id, &new_body).await {
            exit_err("Patch applied but failed to update comment state:", e);
        }
        println!("✓ Set comment #{} state to 'applied'", id);
    }
}

async fn run_set_state(owner: &str, repo: &str, comment_id: u64, state: &str) {
    let Some(new_state) = CommentState::parse(state) else {
        exit_msg(&format!(
            "Invalid state '{}'; must be one of: analyzed, applied, gc-integrated",
            state
        ));
    };

    let gh = GithubClient::new(owner, repo);
    let current = match gh.get_review_comment(comment_id).await {
        Ok(c) => c,
        Err(e) => exit_err("Failed to fetch comment:", e),
    };

    let new_body = comment::set_state(&current.body, new_state);
    if new_body == current.body {
        println!("✓ Comment #{} already in state '{}'", comment_id, new_state);
        return;
    }
    if let Err(e) = gh.update_review_comment(comment_id, &new_body).await {
        exit_err("Failed to update comment:", e);
    }
    println!("✓ Set comment #{} state to '{}'", comment_id, new_state);
}

/// Refresh downstream patches after an apply. Partial failure is the
/// expected steady state and still exits 0; only setup errors (bad
/// metadata, missing file, API failures) are fatal.
async fn run_refresh(owner: &str, repo: &str, pr: u64, applied_comment_id: u64) {
    let gh = GithubClient::new(owner, repo);

    let applied_comment = match gh.get_review_comment(applied_comment_id).await {
        Ok(c) => c,
        Err(e) => exit_err("Failed to fetch applied comment:", e),
    };
    let Some(applied_issue) = Issue::from_comment(&applied_comment.body) else {
        exit_msg("Could not parse ISSUE_DATA from applied comment body");
    };
    let Some(applied_line) = applied_issue.line else {
        exit_msg("Applied ISSUE_DATA has no numeric line; cannot order downstream comments");
    };
    println!(
        "Refreshing patches for file: {} (downstream line > {})",
        applied_issue.file, applied_line
    );

    let all_comments = match gh.list_review_comments(pr).await {
        Ok(c) => c,
        Err(e) => exit_err("Failed to list PR comments:", e),
    };

    let oracle = ai_funcs::OpenAiOracle::new();
    let opts = refresh::RefreshOptions::from_env(PathBuf::from("."));
    match refresh::refresh(
        &applied_issue,
        Some(applied_comment_id),
        &all_comments,
        &oracle,
        &gh,
        &opts,
    )
    .await
    {
        Ok(_report) => {}
        Err(e) => exit_err("Refresh failed:", e),
    }
}
