//! Parsing of model responses: scratchpad blocks and JSON task arrays.
//!
//! Planner and reconciler responses are free text that must contain a
//! JSON array of tasks, optionally inside a fenced code block, and may
//! carry a rewritten scratchpad in a fenced `scratchpad` block.

use thiserror::Error;

use crate::task::TaskDraft;

/// Errors from extracting tasks out of a model response.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("response contains no JSON array")]
    NoArray,

    #[error("task array is not valid JSON: {0}")]
    BadJson(#[from] serde_json::Error),
}

/// Extract the rewritten scratchpad from a fenced block:
///
/// ````text
/// ```scratchpad
/// ...free text...
/// ```
/// ````
///
/// Returns `None` when the response carries no scratchpad block.
pub fn extract_scratchpad(text: &str) -> Option<String> {
    let start_marker = "```scratchpad";
    let start = text.find(start_marker)?;
    let body_start = start + start_marker.len();
    let rest = &text[body_start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_owned())
}

/// Extract and parse the first JSON task array in the response.
///
/// Accepts a fenced ```` ```json ```` block or a bare array anywhere in
/// the text. Scratchpad blocks are ignored so prose inside them cannot
/// shadow the array.
pub fn extract_task_array(text: &str) -> Result<Vec<TaskDraft>, ParseError> {
    let without_scratchpad = strip_scratchpad(text);
    let candidate = json_fence(&without_scratchpad)
        .or_else(|| balanced_array(&without_scratchpad))
        .ok_or(ParseError::NoArray)?;
    let drafts: Vec<TaskDraft> = serde_json::from_str(&candidate)?;
    Ok(drafts)
}

fn strip_scratchpad(text: &str) -> String {
    let start_marker = "```scratchpad";
    let Some(start) = text.find(start_marker) else {
        return text.to_owned();
    };
    let rest = &text[start + start_marker.len()..];
    match rest.find("```") {
        Some(end) => format!("{}{}", &text[..start], &rest[end + 3..]),
        None => text[..start].to_owned(),
    }
}

/// Contents of the first ```json fenced block, if any.
fn json_fence(text: &str) -> Option<String> {
    let start_marker = "```json";
    let start = text.find(start_marker)?;
    let rest = &text[start + start_marker.len()..];
    let end = rest.find("```")?;
    let body = rest[..end].trim();
    body.starts_with('[').then(|| body.to_owned())
}

/// First balanced `[...]` region, tracking strings and escapes.
fn balanced_array(text: &str) -> Option<String> {
    let start = text.find('[')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_owned());
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
