//! Issue/comment metadata codec.
//!
//! A bot comment body has three zones: the human-readable rendering, one
//! hidden `<!-- ISSUE_DATA: {...} -->` JSON block, and at most one hidden
//! `<!-- STATUS: <state> -->` marker. The codec rewrites the hidden zones
//! in place and never touches the visible text, except for the one
//! call-to-action swap on the analyzed -> applied transition.

use crate::error::BotError;
use crate::github::ReviewComment;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Visible line inviting the reviewer to apply the patch.
pub const APPLY_CTA_LINE: &str = "Reply with `/apply-fix` to apply this change automatically.";
/// Substring of the CTA used when deciding whether a comment is ours.
pub const APPLY_CTA_PREFIX: &str = "Reply with `/apply-fix`";
/// Trigger command in a reply comment.
pub const APPLY_TRIGGER: &str = "/apply-fix";
/// Replacement for the CTA once a patch has been applied.
pub const APPLIED_LINE: &str = "✅ Applied";
/// Every bot issue comment starts with this.
pub const BOT_MARKER: &str = "**🤖";

fn issue_data_re() -> Regex {
    Regex::new(r"(?s)<!--\s*ISSUE_DATA:\s*(.+?)\s*-->").expect("issue data regex")
}

fn status_re() -> Regex {
    Regex::new(r"<!--\s*STATUS:\s*([A-Za-z-]+)\s*-->").expect("status regex")
}

/// One AI finding, as embedded in a comment body.
///
/// Unknown keys (generated artifacts like `monitor_image`, `commit_message`)
/// are carried through `extra` untouched so a metadata rewrite never drops
/// fields written by other tooling.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub file: String,
    #[serde(
        default,
        deserialize_with = "de_line",
        skip_serializing_if = "Option::is_none"
    )]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub impact: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub patch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_hash: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Line numbers arrive as integers, numeric strings, or "N/A".
fn de_line<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_line))
}

pub fn parse_line(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("n/a") {
                None
            } else {
                s.parse().ok()
            }
        }
        _ => None,
    }
}

impl Issue {
    /// Extract the hidden ISSUE_DATA block from a comment body.
    /// `None` means "not a bot comment or the block is unreadable" and is
    /// deliberately not an error; callers decide whether absence matters.
    pub fn from_comment(body: &str) -> Option<Issue> {
        let caps = issue_data_re().captures(body)?;
        let raw = caps.get(1)?.as_str();
        serde_json::from_str(raw)
            .or_else(|_| serde_json::from_str(raw.trim()))
            .ok()
    }

    /// The hidden block for this issue, with compact stable-order JSON and
    /// non-ASCII preserved.
    pub fn to_marker(&self) -> Result<String, BotError> {
        Ok(format!("<!-- ISSUE_DATA: {} -->", serde_json::to_string(self)?))
    }
}

/// Rewrite the JSON payload of the existing ISSUE_DATA block, leaving all
/// surrounding text (including the STATUS marker) untouched. Errors when
/// the body has no block; this function never appends one.
pub fn replace_issue_data(body: &str, issue: &Issue) -> Result<String, BotError> {
    let re = issue_data_re();
    if !re.is_match(body) {
        return Err(BotError::InvalidMetadata {
            reason: "no ISSUE_DATA block found to replace".to_string(),
        });
    }
    let marker = issue.to_marker()?;
    Ok(re.replace(body, NoExpand(&marker)).into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentState {
    Analyzed,
    Applied,
    GcIntegrated,
}

impl CommentState {
    pub fn as_str(self) -> &'static str {
        match self {
            CommentState::Analyzed => "analyzed",
            CommentState::Applied => "applied",
            CommentState::GcIntegrated => "gc-integrated",
        }
    }

    pub fn parse(s: &str) -> Option<CommentState> {
        match s.trim().to_lowercase().as_str() {
            "analyzed" => Some(CommentState::Analyzed),
            "applied" => Some(CommentState::Applied),
            "gc-integrated" => Some(CommentState::GcIntegrated),
            _ => None,
        }
    }

    /// Lifecycle position; states only ever advance.
    fn rank(self) -> u8 {
        match self {
            CommentState::Analyzed => 0,
            CommentState::Applied => 1,
            CommentState::GcIntegrated => 2,
        }
    }
}

impl fmt::Display for CommentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn status_marker(state: CommentState) -> String {
    format!("<!-- STATUS: {} -->", state)
}

/// Read the STATUS marker; a missing or unknown marker means `analyzed`
/// (comments created before the marker existed have none).
pub fn comment_state(body: &str) -> CommentState {
    status_re()
        .captures(body)
        .and_then(|caps| CommentState::parse(&caps[1]))
        .unwrap_or(CommentState::Analyzed)
}

/// Replace or append the STATUS marker. Idempotent: a body already in
/// `state` is returned unchanged, and a downgrade request is ignored
/// (states advance monotonically). On the transition to `applied` the
/// visible call-to-action line is swapped for the applied line, first
/// occurrence only.
pub fn set_state(body: &str, state: CommentState) -> String {
    let current = comment_state(body);
    if state.rank() < current.rank() || state == current {
        return body.to_string();
    }

    let re = status_re();
    let marker = status_marker(state);
    let mut new_body = if re.is_match(body) {
        re.replace(body, NoExpand(&marker)).into_owned()
    } else {
        format!("{}\n\n{}\n", body.trim_end(), marker)
    };

    if state == CommentState::Applied && new_body.contains(APPLY_CTA_LINE) {
        new_body = new_body.replacen(APPLY_CTA_LINE, APPLIED_LINE, 1);
    }
    new_body
}

/// Guard used before editing any comment: only bot-generated issue
/// comments qualify. Requires the hidden ISSUE_DATA block plus at least
/// one visible bot signal, so a human comment that merely quotes our
/// markers is still off-limits unless it looks like ours.
pub fn is_bot_issue_comment(comment: &ReviewComment) -> bool {
    if !comment.body.contains("ISSUE_DATA") {
        return false;
    }
    if comment.body.contains(APPLY_CTA_PREFIX) {
        return true;
    }
    if comment.body.trim_start().starts_with(BOT_MARKER) {
        return true;
    }
    comment.author().is_some_and(|login| login.ends_with("[bot]"))
}
