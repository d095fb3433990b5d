#![deny(missing_docs)]

//! Core library for the Docs MCP retrieval server.

/// Request identity resolution and the identity model.
pub mod auth;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// HTTP transport binding.
pub mod http;
/// Structured logging and tracing setup.
pub mod logging;
/// Model Context Protocol server implementation.
pub mod mcp;
/// Per-identity rate limiting.
pub mod ratelimit;
/// Reranker client abstraction and adapters.
pub mod rerank;
/// Hybrid retrieval engine.
pub mod retrieval;
/// Postgres-backed storage adapters.
pub mod store;
/// Background maintenance scheduler.
pub mod tasks;
