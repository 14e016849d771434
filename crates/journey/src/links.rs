//! Outbound URL rewriting.

use std::ops::Range;

use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::capabilities::LinkTracker;

const LEADING_PUNCTUATION: &[char] = &['(', '[', '{', '"', '\'', '<'];
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '"', '\''];

/// Byte ranges of the `http(s)://` URLs found in `text`.
pub fn find_urls(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    let ends = text
        .char_indices()
        .chain(std::iter::once((text.len(), ' ')));

    for (idx, ch) in ends {
        if ch.is_whitespace() {
            if let Some(begin) = start.take() {
                if let Some(span) = url_span(text, begin, idx) {
                    spans.push(span);
                }
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    spans
}

fn url_span(text: &str, begin: usize, end: usize) -> Option<Range<usize>> {
    let raw = &text[begin..end];
    let token = raw.trim_start_matches(LEADING_PUNCTUATION);
    let begin = begin + (raw.len() - token.len());
    let lower = token.to_ascii_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return None;
    }
    let trimmed = token.trim_end_matches(TRAILING_PUNCTUATION);
    Url::parse(trimmed).ok()?;
    Some(begin..begin + trimmed.len())
}

/// Replaces every URL in `text` with its tracked form. A URL the tracker
/// fails to wrap is kept as is.
pub async fn rewrite_links(
    tracker: &dyn LinkTracker,
    tenant_id: Uuid,
    workflow_id: Uuid,
    step_id: Uuid,
    text: &str,
) -> String {
    let spans = find_urls(text);
    if spans.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        out.push_str(&text[cursor..span.start]);
        let original = &text[span.clone()];
        match tracker.wrap(tenant_id, workflow_id, step_id, original).await {
            Ok(wrapped) => out.push_str(&wrapped),
            Err(e) => {
                warn!(step_id = %step_id, url = %original, error = %e, "Link tracking failed, sending original URL");
                out.push_str(original);
            }
        }
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;

    struct Redirects;

    #[async_trait]
    impl LinkTracker for Redirects {
        async fn wrap(&self, _: Uuid, _: Uuid, _: Uuid, url: &str) -> anyhow::Result<String> {
            if url.contains("broken") {
                return Err(anyhow!("tracker down"));
            }
            Ok(format!("https://t.example/r?u={}", url.len()))
        }
    }

    #[test]
    fn test_find_urls_trims_punctuation() {
        let text = "See https://example.com/a, or (http://x.io/b). Not ftp://c";
        let found: Vec<&str> = find_urls(text).into_iter().map(|r| &text[r]).collect();
        assert_eq!(found, vec!["https://example.com/a", "http://x.io/b"]);
    }

    #[test]
    fn test_find_urls_none() {
        assert!(find_urls("plain text only").is_empty());
        assert!(find_urls("https://").is_empty());
    }

    #[tokio::test]
    async fn test_rewrite_links_falls_back_on_error() {
        let id = Uuid::new_v4();
        let text = "Go https://ok.example/x now, or https://broken.example/y";
        let out = rewrite_links(&Redirects, id, id, id, text).await;
        assert_eq!(
            out,
            "Go https://t.example/r?u=20 now, or https://broken.example/y"
        );
    }
}
