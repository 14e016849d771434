use serde_json::Value;

use journey_core::types::{AnswerKind, BranchRule};

/// Why an answer was not accepted; carries the corrective prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerRejection {
    pub kind: AnswerKind,
}

impl AnswerRejection {
    /// Prompt sent back to the user. The question stays open.
    pub fn prompt(&self) -> &'static str {
        match self.kind {
            AnswerKind::Text => "Please send your answer as a text message.",
            AnswerKind::Number => "Please enter a valid number, for example 42 or 1,250.",
            AnswerKind::Money => "Please enter a valid amount, for example 1500 or $1,500.00.",
            AnswerKind::Country => "Please tell us your country.",
        }
    }
}

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₽', '₹', '₩', '₺', '₴', '₦', '₱', '฿', '¢'];

/// Evaluates question answers and reply branches.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyEvaluator;

impl ReplyEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Validates `raw` against `kind` and converts it to the stored value.
    pub fn validate_answer(&self, kind: AnswerKind, raw: &str) -> Result<Value, AnswerRejection> {
        let reject = || AnswerRejection { kind };
        let trimmed = raw.trim();
        match kind {
            AnswerKind::Text => {
                if trimmed.is_empty() {
                    return Err(reject());
                }
                Ok(Value::from(trimmed))
            }
            AnswerKind::Number => parse_number(trimmed).ok_or_else(reject),
            AnswerKind::Money => parse_money(trimmed).ok_or_else(reject),
            AnswerKind::Country => {
                if trimmed.is_empty() {
                    return Err(reject());
                }
                if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Ok(Value::from(trimmed.to_ascii_uppercase()));
                }
                Ok(Value::from(trimmed))
            }
        }
    }

    /// Step order selected by `rule` for `reply`. `None` means continue
    /// linearly.
    pub fn select_branch(&self, rule: &BranchRule, reply: &str) -> Option<i32> {
        if matches_keyword(&rule.keyword, reply) {
            rule.on_match
        } else {
            rule.on_miss
        }
    }
}

/// Case-insensitive substring match. An empty keyword matches everything.
pub fn matches_keyword(keyword: &str, text: &str) -> bool {
    let keyword = keyword.trim();
    keyword.is_empty() || text.to_lowercase().contains(&keyword.to_lowercase())
}

fn strip_separators(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, ',' | '_' | '\''))
        .collect()
}

fn finite(value: f64) -> Option<Value> {
    value.is_finite().then(|| Value::from(value))
}

fn parse_number(raw: &str) -> Option<Value> {
    let cleaned = strip_separators(raw);
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.contains('.') {
        cleaned.parse::<f64>().ok().and_then(finite)
    } else {
        cleaned.parse::<i64>().ok().map(Value::from)
    }
}

fn parse_money(raw: &str) -> Option<Value> {
    let cleaned: String = strip_separators(raw)
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().and_then(finite)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_with_separators() {
        let eval = ReplyEvaluator::new();
        assert_eq!(
            eval.validate_answer(AnswerKind::Number, "1,200.50"),
            Ok(serde_json::json!(1200.5))
        );
        assert_eq!(
            eval.validate_answer(AnswerKind::Number, " 12 000 "),
            Ok(serde_json::json!(12000))
        );
        assert!(eval.validate_answer(AnswerKind::Number, "abc").is_err());
        assert!(eval.validate_answer(AnswerKind::Number, "").is_err());
    }

    #[test]
    fn test_money_strips_currency() {
        let eval = ReplyEvaluator::new();
        assert_eq!(
            eval.validate_answer(AnswerKind::Money, "$1,500"),
            Ok(serde_json::json!(1500.0))
        );
        assert_eq!(
            eval.validate_answer(AnswerKind::Money, "€ 99.90"),
            Ok(serde_json::json!(99.9))
        );
        let err = eval.validate_answer(AnswerKind::Money, "lots").unwrap_err();
        assert_eq!(err.kind, AnswerKind::Money);
        assert!(err.prompt().contains("amount"));
    }

    #[test]
    fn test_text_and_country() {
        let eval = ReplyEvaluator::new();
        assert_eq!(
            eval.validate_answer(AnswerKind::Text, "  hello "),
            Ok(serde_json::json!("hello"))
        );
        assert!(eval.validate_answer(AnswerKind::Text, "   ").is_err());
        assert_eq!(
            eval.validate_answer(AnswerKind::Country, "de"),
            Ok(serde_json::json!("DE"))
        );
        assert_eq!(
            eval.validate_answer(AnswerKind::Country, "Germany"),
            Ok(serde_json::json!("Germany"))
        );
    }

    #[test]
    fn test_select_branch() {
        let eval = ReplyEvaluator::new();
        let rule = BranchRule {
            keyword: "Yes".into(),
            on_match: Some(5),
            on_miss: None,
        };
        assert_eq!(eval.select_branch(&rule, "oh YES please"), Some(5));
        assert_eq!(eval.select_branch(&rule, "no"), None);
        assert!(matches_keyword("", "anything"));
    }
}
