//! Safe mode: refuse steps that would commit to a purchase or enrollment.

use crate::types::Action;

const BLOCKED_KEYWORDS: &[&str] = &[
    "checkout",
    "payment",
    "pay",
    "enroll",
    "subscribe",
    "purchase",
    "buy",
];

/// Returns the refusal reason if the step touches a blocked keyword in any
/// of its textual parameters. Checked before the action reaches the browser.
pub fn blocked_reason(action: &Action) -> Option<String> {
    let haystack = match action {
        Action::Navigate { url } => url.clone(),
        Action::Click { selector } => selector.clone(),
        Action::Type { selector, text } => format!("{selector} {text}"),
        Action::Press { selector, key } => format!("{selector} {key}"),
        Action::Scroll { .. } | Action::Wait { .. } | Action::Screenshot => return None,
    }
    .to_lowercase();

    BLOCKED_KEYWORDS
        .iter()
        .find(|keyword| haystack.contains(**keyword))
        .map(|keyword| format!("blocked by safe mode: '{keyword}' action refused"))
}
