//! Apply-trigger gating.
//!
//! A human replies `/apply-fix` to a bot issue comment; the workflow hands
//! us the reply. The gate resolves the root issue comment through the
//! reply tree, re-fetches it fresh, and only lets the apply proceed while
//! that comment is still in `analyzed` state. This is the sole defense
//! against double-application, so the state must never be taken from an
//! earlier step of the same run.

use crate::comment::{self, CommentState};
use crate::error::BotError;
use crate::github::ReviewComment;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// What the workflow needs to know about a confirmed trigger. Later steps
/// read ids out of this; bodies in here are informational only and must
/// never be used to gate an apply.
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerContext {
    pub triggered: bool,
    pub comment_id: Option<u64>,
    pub comment_author: Option<String>,
    pub parent_comment_id: Option<u64>,
    pub parent_comment_body: Option<String>,
}

impl TriggerContext {
    pub fn not_triggered() -> TriggerContext {
        TriggerContext {
            triggered: false,
            comment_id: None,
            comment_author: None,
            parent_comment_id: None,
            parent_comment_body: None,
        }
    }

    pub fn confirmed(trigger: &ReviewComment, parent: &ReviewComment) -> TriggerContext {
        TriggerContext {
            triggered: true,
            comment_id: Some(trigger.id),
            comment_author: trigger.author().map(str::to_string),
            parent_comment_id: Some(parent.id),
            parent_comment_body: Some(parent.body.clone()),
        }
    }
}

/// True when a reply body carries the apply command.
pub fn is_apply_trigger(body: &str) -> bool {
    body.trim().to_lowercase().contains(comment::APPLY_TRIGGER)
}

/// Walk `in_reply_to_id` pointers up to the root of the reply thread.
/// A visited set guards against cycles in malformed data; a dangling
/// parent id stops the walk at the last known comment. Returns `None`
/// when the trigger has no parent at all.
pub fn find_thread_root<'a>(
    trigger: &'a ReviewComment,
    comments: &'a [ReviewComment],
) -> Option<&'a ReviewComment> {
    let by_id: HashMap<u64, &ReviewComment> = comments.iter().map(|c| (c.id, c)).collect();

    let mut visited: HashSet<u64> = HashSet::new();
    visited.insert(trigger.id);
    let mut current = trigger;
    while let Some(parent_id) = current.in_reply_to_id {
        if !visited.insert(parent_id) {
            break;
        }
        match by_id.get(&parent_id) {
            Some(parent) => current = parent,
            None => break,
        }
    }

    if current.id == trigger.id {
        None
    } else {
        Some(current)
    }
}

/// The gate itself: apply is permitted iff the parent comment is still
/// `analyzed` (or predates state markers). Anything else is a state
/// conflict and the caller must not apply.
pub fn should_apply(parent: &ReviewComment) -> Result<(), BotError> {
    match comment::comment_state(&parent.body) {
        CommentState::Analyzed => Ok(()),
        state => Err(BotError::StateConflict {
            id: parent.id,
            state,
        }),
    }
}
