use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use docsmcp::auth::AuthResolver;
use docsmcp::embedding::HttpEmbeddingClient;
use docsmcp::mcp::server::McpServer;
use docsmcp::mcp::tools::ToolDeps;
use docsmcp::ratelimit::RateLimiter;
use docsmcp::rerank::HttpRerankClient;
use docsmcp::retrieval::HybridRetrievalEngine;
use docsmcp::store::corpus::CorpusStore;
use docsmcp::store::identity::{IdentityApi, IdentityStore};
use docsmcp::store::writeback::WritebackQueue;
use docsmcp::{config, http, logging, store, tasks};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    config::init_config();
    let _log_guard =
        logging::init_tracing(config::get_config().log_file.as_deref().map(Path::new));

    let pool = store::connect_pool()
        .await
        .expect("Failed to connect to Postgres");
    let (writeback, _writeback_handle) = WritebackQueue::spawn(pool.clone());

    let identity_store: Arc<dyn IdentityApi> =
        Arc::new(IdentityStore::new(pool.clone(), writeback));
    let corpus = Arc::new(CorpusStore::new(pool));
    let embedding =
        Arc::new(HttpEmbeddingClient::from_config().expect("Failed to build embedding client"));
    let rerank = Arc::new(HttpRerankClient::from_config().expect("Failed to build rerank client"));
    let retrieval = Arc::new(HybridRetrievalEngine::new(corpus.clone(), embedding, rerank));

    let deps = ToolDeps {
        retrieval,
        corpus,
        identity_store: identity_store.clone(),
        limiter: RateLimiter::new(identity_store.clone()),
    };
    let server = Arc::new(McpServer::new(
        deps,
        AuthResolver::new(identity_store),
        config::get_config().sessions_enabled,
    ));
    let _cleanup = tasks::spawn_cleanup(server.clone());

    let app = http::create_router(server);
    let (listener, port) = bind_listener().await.expect("Failed to bind listener");
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 8700..=8799;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 8700-8799",
    ))
}
