//! Session text rendering: `{placeholder}` substitution from the answer map.

use std::collections::HashMap;

use crate::types::ANSWER_FIRST_NAME;

/// Replaces `{name}`, `{first_name}` and `{<answer_key>}` placeholders with
/// values from `answers`. Unknown placeholders are left untouched.
pub fn render(template: &str, answers: &HashMap<String, serde_json::Value>) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    let mut result = template.to_string();
    for (key, value) in answers {
        let Some(text) = value_text(value) else {
            continue;
        };
        result = result.replace(&format!("{{{key}}}"), &text);
    }

    let name = answers
        .get(ANSWER_FIRST_NAME)
        .and_then(value_text)
        .unwrap_or_default();
    result.replace("{name}", &name)
}

fn value_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
