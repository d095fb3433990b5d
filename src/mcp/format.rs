//! Plain-text response shaping for the tools.
//!
//! Search responses are a numbered list of passages separated by rule lines, followed by the
//! leftover source URLs; fetch responses are a minimal markdown block. Anonymous callers get
//! a closing line nudging them toward an account, and clamped `result_count` values get a
//! note describing the accepted range.

use serde_json::{Value, json};
use time::format_description::well_known::Rfc3339;

use crate::auth::Identity;
use crate::config::get_config;
use crate::ratelimit::LimitWindow;
use crate::retrieval::SearchOutcome;
use crate::store::corpus::Page;

/// Rule line drawn between ranked results.
const RESULT_SEPARATOR_WIDTH: usize = 80;

/// Closing line appended for anonymous callers.
const ANONYMOUS_FOOTER: &str =
    "Tip: sign up and pass a bearer token to get higher rate limits and usage history.";

/// Wrap plain text in a single-item MCP tool result.
pub fn text_result(text: String) -> Value {
    json!({ "content": [ { "type": "text", "text": text } ] })
}

/// Render the ranked results and additional URLs of a search.
pub fn format_search_response(
    outcome: &SearchOutcome,
    identity: &Identity,
    clamped_from: Option<i64>,
) -> String {
    let mut out = String::new();
    let separator = "─".repeat(RESULT_SEPARATOR_WIDTH);

    if outcome.ranked.is_empty() {
        out.push_str("No matching documentation found.\n");
    }

    for (position, entry) in outcome.ranked.iter().enumerate() {
        if position > 0 {
            out.push_str(&separator);
            out.push('\n');
        }
        let result = &entry.result;
        let title = if result.context.is_empty() {
            result.url.as_str()
        } else {
            result.context.as_str()
        };
        if result.is_merged() {
            out.push_str(&format!(
                "[{}] [Merged from {} sections] {}\n",
                position + 1,
                result.merged_from.len(),
                title
            ));
        } else {
            out.push_str(&format!("[{}] {}\n", position + 1, title));
        }
        out.push_str(&result.content);
        out.push('\n');
        out.push_str(&format!(
            "Source: {} ({} chars)\n",
            result.url,
            result.content.len()
        ));
        if result.is_merged() {
            out.push_str(&format!(
                "Complete content available via fetch(url: \"{}\")\n",
                result.url
            ));
        }
    }

    if !outcome.additional_urls.is_empty() {
        out.push('\n');
        out.push_str("Additional relevant documentation:\n");
        for url in &outcome.additional_urls {
            out.push_str(&format!("- {url}\n"));
        }
    }

    if let Some(requested) = clamped_from {
        let max = get_config().search_max_results;
        out.push('\n');
        out.push_str(&format!(
            "Note: result_count {requested} was adjusted; the accepted range is 1-{max}.\n"
        ));
    }

    if identity.is_anonymous() {
        out.push('\n');
        out.push_str(ANONYMOUS_FOOTER);
        out.push('\n');
    }

    out
}

/// Render a fetched page.
pub fn format_fetch_response(page: &Page, identity: &Identity) -> String {
    let mut out = format!("Source: {}\n\n{}\n", page.url, page.content);
    if identity.is_anonymous() {
        out.push('\n');
        out.push_str(ANONYMOUS_FOOTER);
        out.push('\n');
    }
    out
}

/// Render the plain-text message returned when a rate limit denies a tool call.
pub fn format_rate_limit_message(
    window: LimitWindow,
    limit: u32,
    resets_at: time::OffsetDateTime,
    identity: &Identity,
) -> String {
    let resets = resets_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| resets_at.to_string());
    let scope = match window {
        LimitWindow::Short => format!("{limit} requests per minute"),
        LimitWindow::Long => format!("{limit} requests per week"),
    };
    let upgrade = if identity.is_anonymous() {
        "Create a free account and pass a bearer token for higher limits."
    } else {
        "Upgrade your plan for higher limits."
    };
    format!("Rate limit reached: {scope}. The window resets at {resets}. {upgrade}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::ensure_test_config;
    use crate::retrieval::RankedResult;
    use crate::retrieval::merge::ProcessedResult;
    use time::OffsetDateTime;

    fn anonymous() -> Identity {
        Identity::Anonymous {
            ip: "1.2.3.4".into(),
        }
    }

    fn ranked(id: &str, context: &str, content: &str, merged_from: &[&str]) -> RankedResult {
        RankedResult {
            result: ProcessedResult {
                id: id.into(),
                url: format!("https://docs.example/{id}"),
                context: context.into(),
                content: content.into(),
                merged_from: merged_from.iter().map(|s| (*s).to_string()).collect(),
            },
            score: 0.5,
        }
    }

    #[test]
    fn search_text_numbers_results_and_separates_them() {
        ensure_test_config();
        let outcome = SearchOutcome {
            ranked: vec![
                ranked("a", "Navigation", "How to navigate.", &["a"]),
                ranked("b", "", "Plain body.", &["b"]),
            ],
            additional_urls: vec!["https://docs.example/extra".into()],
        };
        let text = format_search_response(&outcome, &anonymous(), None);
        assert!(text.contains("[1] Navigation"));
        assert!(text.contains("[2] https://docs.example/b"));
        assert!(text.contains(&"─".repeat(80)));
        assert!(text.contains("Additional relevant documentation:"));
        assert!(text.contains("- https://docs.example/extra"));
        assert!(text.contains("Tip: sign up"));
    }

    #[test]
    fn merged_results_point_to_fetch() {
        ensure_test_config();
        let outcome = SearchOutcome {
            ranked: vec![ranked("a", "Merged: X | Y", "both bodies", &["a", "b"])],
            additional_urls: vec![],
        };
        let text = format_search_response(&outcome, &anonymous(), None);
        assert!(text.contains("[Merged from 2 sections]"));
        assert!(text.contains("fetch(url: \"https://docs.example/a\")"));
    }

    #[test]
    fn clamp_note_mentions_the_accepted_range() {
        ensure_test_config();
        let outcome = SearchOutcome::default();
        let text = format_search_response(&outcome, &anonymous(), Some(999));
        assert!(text.contains("result_count 999 was adjusted"));
        assert!(text.contains("1-10"));
    }

    #[test]
    fn authenticated_responses_skip_the_footer() {
        ensure_test_config();
        let identity = Identity::Authenticated(crate::auth::UserIdentity {
            user_id: 1,
            email: "a@b.c".into(),
            plan: crate::auth::PlanTier::Pro,
            token: "at_0123456789abcdef0123456789abcdef".into(),
        });
        let text = format_search_response(&SearchOutcome::default(), &identity, None);
        assert!(!text.contains("Tip: sign up"));
    }

    #[test]
    fn rate_limit_message_names_the_window() {
        ensure_test_config();
        let resets = OffsetDateTime::from_unix_timestamp(1_700_000_000).expect("ts");
        let text = format_rate_limit_message(LimitWindow::Short, 60, resets, &anonymous());
        assert!(text.contains("60 requests per minute"));
        assert!(text.contains("Create a free account"));

        let text = format_rate_limit_message(LimitWindow::Long, 1000, resets, &anonymous());
        assert!(text.contains("1000 requests per week"));
    }

    #[test]
    fn fetch_text_is_a_minimal_block() {
        ensure_test_config();
        let page = Page {
            id: "p1".into(),
            url: "https://docs.example/page".into(),
            content: "Full body.".into(),
        };
        let text = format_fetch_response(&page, &anonymous());
        assert!(text.starts_with("Source: https://docs.example/page\n\nFull body.\n"));
        assert!(text.contains("Tip: sign up"));
    }
}
