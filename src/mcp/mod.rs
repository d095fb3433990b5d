//! Model Context Protocol server implementation.
//!
//! Split by concern: [`protocol`] owns the JSON-RPC framing and error taxonomy, [`session`]
//! and [`inflight`] own the protocol state machines, [`server`] dispatches methods, and
//! [`tools`] holds the `search`/`fetch` executors with their [`schemas`] and plain-text
//! [`format`] helpers.

pub mod format;
pub mod inflight;
pub mod protocol;
pub mod schemas;
pub mod server;
pub mod session;
pub mod tools;
