//! Handler for the `search` tool.

use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;

use crate::config::get_config;
use crate::mcp::format::{format_rate_limit_message, format_search_response, text_result};
use crate::mcp::protocol::RpcError;
use crate::mcp::tools::{ToolContext, ToolDeps, parse_arguments};
use crate::ratelimit::RateCheck;
use crate::store::identity::SearchLogEntry;

/// Longest query accepted, in characters.
const MAX_QUERY_CHARS: usize = 10_000;

/// Raw `search` arguments accepted from MCP clients.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SearchArgs {
    /// Natural language query.
    query: String,
    /// Optional ranked-result count.
    #[serde(default)]
    result_count: Option<i64>,
}

/// Execute the `search` tool.
pub(crate) async fn run(
    deps: &ToolDeps,
    ctx: &ToolContext<'_>,
    arguments: Option<Value>,
) -> Result<Value, RpcError> {
    let args: SearchArgs = parse_arguments(arguments)?;
    let query = args.query.trim().to_string();
    if query.is_empty() {
        return Err(RpcError::invalid_params("`query` must not be empty"));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(RpcError::invalid_params(format!(
            "`query` must be at most {MAX_QUERY_CHARS} characters"
        )));
    }

    let config = get_config();
    let requested = args.result_count.unwrap_or(config.search_default_results as i64);
    let clamped = requested.clamp(1, config.search_max_results as i64) as usize;
    let clamped_from = (clamped as i64 != requested).then_some(requested);

    let started = Instant::now();
    let log = |result_count: usize, status: u16, error_code: Option<&str>| SearchLogEntry {
        identity_key: ctx.identity.key(),
        token: ctx.identity.token().map(str::to_string),
        query: query.clone(),
        result_count,
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
            // Limit breaches are tool output, not protocol errors.
            deps.identity_store
                .log_search(log(0, 429, Some("rate_limited")));
            let message = format_rate_limit_message(window, limit, resets_at, ctx.identity);
            return Ok(text_result(message));
        }
        Err(err) => {
            tracing::error!(error = %err, "Rate-limit check failed");
            deps.identity_store
                .log_search(log(0, 500, Some("store_unavailable")));
            return Err(RpcError::internal_error("Search temporarily unavailable"));
        }
    }

    ctx.progress(0.1, "retrieving candidates");
    let outcome = match deps.retrieval.search(&query, clamped).await {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::error!(error = %err, "Retrieval failed");
            deps.identity_store
                .log_search(log(0, 500, Some("retrieval_failed")));
            return Err(RpcError::internal_error("Search temporarily unavailable"));
        }
    };
    ctx.progress(0.9, "formatting results");

    let text = format_search_response(&outcome, ctx.identity, clamped_from);
    deps.identity_store
        .log_search(log(outcome.ranked.len(), 200, None));
    tracing::info!(
        identity = %ctx.identity.key(),
        results = outcome.ranked.len(),
        latency_ms = started.elapsed().as_millis() as u64,
        "Search completed"
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
    use crate::mcp::tools::test_support::{StubIdentity, StubRetrieval, deps_with};
    use serde_json::json;

    fn anonymous() -> Identity {
        Identity::Anonymous {
            ip: "1.2.3.4".into(),
        }
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        ensure_test_config();
        let deps = deps_with(StubRetrieval::default(), StubIdentity::default());
        let table = ProgressTable::new();
        let identity = anonymous();
        let ctx = ToolContext {
            identity: &identity,
            client_ip: "1.2.3.4",
            progress: None,
            progress_table: &table,
        };
        let err = run(&deps, &ctx, Some(json!({ "query": "   " })))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(err.message.contains("query"));
    }

    #[tokio::test]
    async fn oversized_query_is_rejected() {
        ensure_test_config();
        let deps = deps_with(StubRetrieval::default(), StubIdentity::default());
        let table = ProgressTable::new();
        let identity = anonymous();
        let ctx = ToolContext {
            identity: &identity,
            client_ip: "1.2.3.4",
            progress: None,
            progress_table: &table,
        };
        let err = run(
            &deps,
            &ctx,
            Some(json!({ "query": "x".repeat(10_001) })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn result_count_is_clamped_with_a_note() {
        ensure_test_config();
        let retrieval = StubRetrieval::with_results(3);
        let deps = deps_with(retrieval, StubIdentity::default());
        let table = ProgressTable::new();
        let identity = anonymous();
        let ctx = ToolContext {
            identity: &identity,
            client_ip: "1.2.3.4",
            progress: None,
            progress_table: &table,
        };
        let result = run(
            &deps,
            &ctx,
            Some(json!({ "query": "swift", "result_count": 999 })),
        )
        .await
        .expect("result");
        let text = result["content"][0]["text"].as_str().expect("text");
        assert!(text.contains("result_count 999 was adjusted"));
    }

    #[tokio::test]
    async fn rate_limited_calls_return_text_not_errors() {
        ensure_test_config();
        let deps = deps_with(StubRetrieval::default(), StubIdentity::denying());
        let table = ProgressTable::new();
        let identity = anonymous();
        let ctx = ToolContext {
            identity: &identity,
            client_ip: "1.2.3.4",
            progress: None,
            progress_table: &table,
        };
        let result = run(&deps, &ctx, Some(json!({ "query": "swift" })))
            .await
            .expect("tool result");
        let text = result["content"][0]["text"].as_str().expect("text");
        assert!(text.contains("Rate limit reached"));
    }
}
