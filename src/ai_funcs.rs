//! AI oracle plumbing: one chat-completion call in, tolerant decoding out.
//!
//! The model is asked for strict JSON but in practice returns raw JSON,
//! JSON wrapped in markdown fences, or JSON buried in prose. Decoding
//! tries each interpretation in a fixed order and falls back to treating
//! the response as unstructured text.

use crate::comment::Issue;
use crate::error::BotError;
use crate::refresh::{self, PatchOracle};
use async_openai::types::{
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use futures::StreamExt;
use regex::Regex;
use serde_json::Value;

const COMPLETION_TOKENS: u16 = 2048;
const MODEL: &str = "gpt-4-1106-preview";

pub const ANALYZE_SYSTEM_MESSAGE: &str = include_str!("analyze-system-message.txt");
pub const REFRESH_SYSTEM_MESSAGE: &str = include_str!("refresh-system-message.txt");

/// What the oracle gave us, in decreasing order of structure.
#[derive(Debug)]
pub enum OracleResponse {
    Issues(Vec<Issue>),
    Single(Box<Issue>),
    Raw(String),
}

fn to_oracle<E: std::fmt::Display>(err: E) -> BotError {
    BotError::Oracle(err.to_string())
}

/// One blocking chat-completion call; the streamed chunks are collected
/// into a single response string.
pub async fn complete(system_message: &str, user_message: String) -> Result<String, BotError> {
    let client = async_openai::Client::new();
    let request = CreateChatCompletionRequestArgs::default()
        .max_tokens(COMPLETION_TOKENS)
        .model(MODEL)
        .messages([
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_message)
                .build()
                .map_err(to_oracle)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_message.as_str())
                .build()
                .map_err(to_oracle)?
                .into(),
        ])
        .build()
        .map_err(to_oracle)?;

    let mut stream = client
        .chat()
        .create_stream(request)
        .await
        .map_err(to_oracle)?;

    let mut text = String::new();
    while let Some(result) = stream.next().await {
        let response = result.map_err(to_oracle)?;
        for chat_choice in response.choices.iter() {
            if let Some(ref content) = chat_choice.delta.content {
                text.push_str(content);
            }
        }
    }
    Ok(text)
}

/// First well-formed JSON object or array in the text: tries the whole
/// text, then a ```json fence, then the widest brace/bracket span.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() || value.is_array() {
            return Some(value);
        }
    }
    if let Some(inner) = fenced_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(inner.trim()) {
            if value.is_object() || value.is_array() {
                return Some(value);
            }
        }
    }
    for pattern in [r"(?s)\{.*\}", r"(?s)\[.*\]"] {
        let re = Regex::new(pattern).expect("json span regex");
        if let Some(m) = re.find(trimmed) {
            if let Ok(value) = serde_json::from_str::<Value>(m.as_str()) {
                return Some(value);
            }
        }
    }
    None
}

/// Content of the first ```json code fence, if any.
fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```json")?;
    let after_marker = &text[start + "```json".len()..];
    let content_start = after_marker.find('\n').map_or(0, |i| i + 1);
    let content = &after_marker[content_start..];
    let end = content.find("```")?;
    Some(&content[..end])
}

/// Interpretation priority: a list of issues, then a single issue, then
/// unstructured text.
pub fn decode_response(text: &str) -> OracleResponse {
    if let Some(value) = extract_json(text) {
        if value.is_array() {
            if let Ok(list) = serde_json::from_value::<Vec<Issue>>(value.clone()) {
                return OracleResponse::Issues(list);
            }
        }
        if let Some(object) = value.as_object() {
            if let Some(issues) = object.get("issues") {
                if let Ok(list) = serde_json::from_value::<Vec<Issue>>(issues.clone()) {
                    return OracleResponse::Issues(list);
                }
            }
            if let Ok(single) = serde_json::from_value::<Issue>(value.clone()) {
                return OracleResponse::Single(Box::new(single));
            }
        }
    }
    OracleResponse::Raw(text.to_string())
}

/// Pull a patch out of a refresh response: `{"patch": ...}`, a nested
/// `{"result": {"patch": ...}}`, or raw diff text when there is no JSON.
pub fn extract_patch(text: &str) -> Option<String> {
    if let Some(value) = extract_json(text) {
        if let Some(patch) = value.get("patch").and_then(Value::as_str) {
            if !patch.trim().is_empty() {
                return Some(patch.to_string());
            }
        }
        if let Some(patch) = value
            .get("result")
            .and_then(|r| r.get("patch"))
            .and_then(Value::as_str)
        {
            if !patch.trim().is_empty() {
                return Some(patch.to_string());
            }
        }
        return None;
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// The production patch oracle used by the refresh engine.
pub struct OpenAiOracle;

impl OpenAiOracle {
    pub fn new() -> OpenAiOracle {
        OpenAiOracle
    }
}

impl PatchOracle for OpenAiOracle {
    async fn regenerate(&self, issue: &Issue, context: &str) -> Result<String, BotError> {
        let prompt = refresh::build_refresh_prompt(issue);
        let response = complete(REFRESH_SYSTEM_MESSAGE, format!("{}\n\n{}", context, prompt)).await?;
        extract_patch(&response)
            .ok_or_else(|| BotError::Oracle("no patch in oracle response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_accepts_raw_object() {
        let value = extract_json(r#"{"patch":"x"}"#).unwrap();
        assert_eq!(value["patch"], "x");
    }

    #[test]
    fn extract_json_accepts_fenced_block() {
        let text = "Here you go:\n```json\n{\"patch\":\"y\"}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["patch"], "y");
    }

    #[test]
    fn extract_json_finds_object_in_prose() {
        let text = "Sure! The result is {\"patch\":\"z\"} as requested.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["patch"], "z");
    }

    #[test]
    fn extract_json_rejects_scalar_and_garbage() {
        assert!(extract_json("42").is_none());
        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn decode_response_prefers_issue_list() {
        let text = r#"{"issues":[{"file":"a.js","line":3},{"file":"b.js","line":7}]}"#;
        match decode_response(text) {
            OracleResponse::Issues(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[0].file, "a.js");
            }
            other => panic!("expected issue list, got {:?}", other),
        }
    }

    #[test]
    fn decode_response_bare_array() {
        let text = r#"[{"file":"a.js","line":1}]"#;
        assert!(matches!(decode_response(text), OracleResponse::Issues(_)));
    }

    #[test]
    fn decode_response_single_issue() {
        let text = r#"{"file":"a.js","line":3,"severity":"HIGH"}"#;
        match decode_response(text) {
            OracleResponse::Single(issue) => assert_eq!(issue.line, Some(3)),
            other => panic!("expected single issue, got {:?}", other),
        }
    }

    #[test]
    fn decode_response_falls_back_to_raw() {
        assert!(matches!(
            decode_response("I could not find any problems."),
            OracleResponse::Raw(_)
        ));
    }

    #[test]
    fn extract_patch_from_json_and_nested_result() {
        assert_eq!(
            extract_patch(r#"{"patch":"@@ -1,1 +1,2 @@\n a\n+b"}"#).as_deref(),
            Some("@@ -1,1 +1,2 @@\n a\n+b")
        );
        assert_eq!(
            extract_patch(r#"{"result":{"patch":"@@ -1,1 +1,2 @@\n a\n+b"}}"#).as_deref(),
            Some("@@ -1,1 +1,2 @@\n a\n+b")
        );
    }

    #[test]
    fn extract_patch_json_without_patch_is_none() {
        assert_eq!(extract_patch(r#"{"message":"done"}"#), None);
    }

    #[test]
    fn extract_patch_raw_text_passthrough() {
        let raw = "@@ -1,1 +1,2 @@\n a\n+b";
        assert_eq!(extract_patch(raw).as_deref(), Some(raw));
        assert_eq!(extract_patch("   "), None);
    }
}
