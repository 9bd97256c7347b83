//! Keyword intent classifier for execution-phase user messages.
//!
//! The classifier is authoritative; an LLM-backed classifier can replace
//! it behind the same `classify` signature.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SUBTASK_ID: Regex = Regex::new(r"\bt(\d+)\b").unwrap();
    static ref REDO: Regex =
        Regex::new(r"(?i)\b(redo|retry|do (it|that) again|rewrite|try again)\b").unwrap();
    static ref STATUS: Regex =
        Regex::new(r"(?i)\b(status|progress|how far|where are (we|you)|what's left|remaining)\b")
            .unwrap();
    static ref SKIP: Regex = Regex::new(r"(?i)\bskip\b").unwrap();
    static ref APPEND: Regex =
        Regex::new(r"(?i)\b(add|append)\b.*\b(step|subtask|task)\b").unwrap();
}

/// What the user wants from an execution-phase message.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Redo a subtask (the mentioned one, or the last completed).
    Redo { target: Option<String> },
    /// Structural plan change; checked against the lock rules downstream.
    PlanEdit { edit: PlanEditKind },
    /// Progress question; answered with a status summary.
    Status,
    /// Anything else.
    Chat,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanEditKind {
    Skip { target: Option<String> },
    Append { title: String },
}

pub fn classify(text: &str) -> Intent {
    let target = SUBTASK_ID
        .captures(text)
        .map(|c| format!("t{}", &c[1]));

    if REDO.is_match(text) {
        return Intent::Redo { target };
    }
    if SKIP.is_match(text) {
        return Intent::PlanEdit {
            edit: PlanEditKind::Skip { target },
        };
    }
    if APPEND.is_match(text) {
        // Everything after the step/subtask keyword becomes the title.
        let title = text
            .split_once(':')
            .map(|(_, rest)| rest.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| text.trim().to_string());
        return Intent::PlanEdit {
            edit: PlanEditKind::Append { title },
        };
    }
    if STATUS.is_match(text) {
        return Intent::Status;
    }
    Intent::Chat
}
