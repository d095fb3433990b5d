//! Handler for the `fetch` tool, including URL validation and normalization.

use std::time::Instant;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::mcp::format::{format_fetch_response, format_rate_limit_message, text_result};
use crate::mcp::protocol::RpcError;
use crate::mcp::tools::{ToolContext, ToolDeps, parse_arguments};
use crate::ratelimit::RateCheck;
use crate::store::identity::FetchLogEntry;

/// Longest URL accepted, in bytes.
const MAX_URL_LEN: usize = 200;

/// Raw `fetch` arguments accepted from MCP clients.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FetchArgs {
    /// URL of the page to return.
    url: String,
}

/// Validate and canonicalize a client-supplied URL.
///
/// Rejects malformed or suspicious shapes (duplicated scheme, repeated
/// `/documentation/` segments, repeated domain, overlong, BOM characters) and
/// normalizes the rest: lowercase scheme and host, trailing slashes stripped
/// except at the root, query and fragment dropped except for YouTube, and
/// `youtu.be` short links rewritten to canonical watch URLs.
pub(crate) fn normalize_url(raw: &str) -> Result<String, &'static str> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("`url` must not be empty");
    }
    if raw.contains('\u{feff}') {
        return Err("`url` contains a byte-order mark");
    }
    if raw.len() > MAX_URL_LEN {
        return Err("`url` is too long");
    }
    if raw.matches("://").count() > 1 {
        return Err("`url` repeats its scheme");
    }

    let parsed = reqwest::Url::parse(raw).map_err(|_| "`url` is not a valid absolute URL")?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err("`url` must use http or https");
    }
    let Some(host) = parsed.host_str() else {
        return Err("`url` must include a host");
    };
    let host = host.to_lowercase();
    let path = parsed.path();
    if path.matches("/documentation/").count() > 1 {
        return Err("`url` repeats /documentation/ segments");
    }
    if path.to_lowercase().contains(&host) {
        return Err("`url` repeats its domain");
    }

    // youtu.be short links become canonical watch URLs.
    if host == "youtu.be" {
        let video_id = path.trim_matches('/');
        if video_id.is_empty() {
            return Err("`url` is missing a video id");
        }
        return Ok(format!("https://www.youtube.com/watch?v={video_id}"));
    }

    let mut normalized = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{port}"));
    }
    if path == "/" || path.is_empty() {
        normalized.push('/');
    } else {
        normalized.push_str(path.trim_end_matches('/'));
    }

    // Query strings only carry meaning for YouTube watch URLs; drop them elsewhere,
    // along with fragments.
    let is_youtube = host == "www.youtube.com" || host == "youtube.com" || host == "m.youtube.com";
    if is_youtube {
        if let Some(query) = parsed.query() {
            normalized.push('?');
            normalized.push_str(query);
        }
    }

    Ok(normalized)
}

/// Execute the `fetch` tool.
pub(crate) async fn run(
    deps: &ToolDeps,
    ctx: &ToolContext<'_>,
    arguments: Option<Value>,
) -> Result<Value, RpcError> {
    let args: FetchArgs = parse_arguments(arguments)?;
    let requested_url = args.url.trim().to_string();
    let normalized = normalize_url(&requested_url).map_err(RpcError::invalid_params)?;

    let started = Instant::now();
    let log = |page_id: Option<String>, status: u16, error_code: Option<&str>| FetchLogEntry {
        identity_key: ctx.identity.key(),
        token: ctx.identity.token().map(str::to_string),
        requested_url: requested_url.clone(),
        actual_url: normalized.clone(),
        page_id,
        latency_ms: started.elapsed().as_millis() as u64,
        status,
        error_code: error_code.map(str::to_string),
        client_ip: ctx.client_ip.to_string(),
    };

    match deps.limiter.check(ctx.identity).await {
        Ok(RateCheck::Allowed) => {}
        Ok(RateCheck::Denied {
            window,
            limit,
            resets_at,
        }) => {
            deps.identity_store
                .log_fetch(log(None, 429, Some("rate_limited")));
            let message = format_rate_limit_message(window, limit, resets_at, ctx.identity);
            return Ok(text_result(message));
        }
        Err(err) => {
            tracing::error!(error = %err, "Rate-limit check failed");
            deps.identity_store
                .log_fetch(log(None, 500, Some("store_unavailable")));
            return Err(RpcError::internal_error("Fetch temporarily unavailable"));
        }
    }

    let page = match deps.corpus.page_by_url(&normalized).await {
        Ok(Some(page)) => page,
        Ok(None) => {
            deps.identity_store
                .log_fetch(log(None, 404, Some("not_found")));
            return Err(RpcError::invalid_params_with(
                format!("Document not found: {normalized}"),
                json!({ "status": 404 }),
            ));
        }
        Err(err) => {
            tracing::error!(error = %err, "Page lookup failed");
            deps.identity_store
                .log_fetch(log(None, 500, Some("store_unavailable")));
            return Err(RpcError::internal_error("Fetch temporarily unavailable"));
        }
    };

    let text = format_fetch_response(&page, ctx.identity);
    deps.identity_store
        .log_fetch(log(Some(page.id.clone()), 200, None));
    tracing::info!(
        identity = %ctx.identity.key(),
        url = %page.url,
        latency_ms = started.elapsed().as_millis() as u64,
        "Fetch completed"
    );
    Ok(text_result(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::test_support::ensure_test_config;
    use crate::mcp::inflight::ProgressTable;
    use crate::mcp::protocol::INVALID_PARAMS;
    use crate::mcp::tools::test_support::{StubIdentity, StubRetrieval, deps_with_page};
    use crate::store::corpus::Page;

    #[test]
    fn normalization_lowercases_scheme_and_host() {
        assert_eq!(
            normalize_url("HTTPS://Developer.Apple.COM/documentation/swiftui"),
            Ok("https://developer.apple.com/documentation/swiftui".into())
        );
    }

    #[test]
    fn normalization_strips_trailing_slashes_except_root() {
        assert_eq!(
            normalize_url("https://developer.apple.com/documentation/swiftui///"),
            Ok("https://developer.apple.com/documentation/swiftui".into())
        );
        assert_eq!(
            normalize_url("https://developer.apple.com"),
            Ok("https://developer.apple.com/".into())
        );
    }

    #[test]
    fn normalization_drops_query_and_fragment_for_ordinary_hosts() {
        assert_eq!(
            normalize_url("https://developer.apple.com/docs?lang=swift#overview"),
            Ok("https://developer.apple.com/docs".into())
        );
    }

    #[test]
    fn youtube_queries_are_preserved() {
        assert_eq!(
            normalize_url("https://www.youtube.com/watch?v=abc123"),
            Ok("https://www.youtube.com/watch?v=abc123".into())
        );
    }

    #[test]
    fn youtu_be_links_become_watch_urls() {
        assert_eq!(
            normalize_url("https://youtu.be/abc123"),
            Ok("https://www.youtube.com/watch?v=abc123".into())
        );
    }

    #[test]
    fn duplicated_scheme_is_rejected() {
        assert!(normalize_url("https://https://developer.apple.com/docs").is_err());
    }

    #[test]
    fn repeated_documentation_segments_are_rejected() {
        assert!(
            normalize_url("https://developer.apple.com/documentation/swiftui/documentation/app")
                .is_err()
        );
    }

    #[test]
    fn repeated_domain_is_rejected() {
        assert!(
            normalize_url("https://developer.apple.com/developer.apple.com/docs").is_err()
        );
    }

    #[test]
    fn overlong_urls_are_rejected() {
        let url = format!("https://developer.apple.com/{}", "a".repeat(200));
        assert!(normalize_url(&url).is_err());
    }

    #[test]
    fn bom_characters_are_rejected() {
        assert!(normalize_url("https://developer.apple.com/\u{feff}docs").is_err());
    }

    #[tokio::test]
    async fn fetch_serves_the_normalized_url() {
        ensure_test_config();
        let page = Page {
            id: "p1".into(),
            url: "https://www.youtube.com/watch?v=abc123".into(),
            content: "Video transcript.".into(),
        };
        let deps = deps_with_page(StubRetrieval::default(), StubIdentity::default(), page);
        let table = ProgressTable::new();
        let identity = Identity::Anonymous {
            ip: "1.2.3.4".into(),
        };
        let ctx = ToolContext {
            identity: &identity,
            client_ip: "1.2.3.4",
            progress: None,
            progress_table: &table,
        };

        let result = run(
            &deps,
            &ctx,
            Some(serde_json::json!({ "url": "https://youtu.be/abc123" })),
        )
        .await
        .expect("result");
        let text = result["content"][0]["text"].as_str().expect("text");
        assert!(text.contains("Video transcript."));
    }

    #[tokio::test]
    async fn unknown_urls_yield_not_found_params_errors() {
        ensure_test_config();
        let deps = deps_with_page(
            StubRetrieval::default(),
            StubIdentity::default(),
            Page {
                id: "p1".into(),
                url: "https://docs.example/known".into(),
                content: "body".into(),
            },
        );
        let table = ProgressTable::new();
        let identity = Identity::Anonymous {
            ip: "1.2.3.4".into(),
        };
        let ctx = ToolContext {
            identity: &identity,
            client_ip: "1.2.3.4",
            progress: None,
            progress_table: &table,
        };

        let err = run(
            &deps,
            &ctx,
            Some(serde_json::json!({ "url": "https://docs.example/unknown" })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert_eq!(err.data.expect("data")["status"], 404);
    }
}
