//! Integration tests for the MCP client runtime
//!
//! Transports are replaced by in-memory fakes at the `Connector` and
//! `AuthSessionFactory` seams; the daemon runs in-process on a temporary
//! socket, started through a `DaemonLauncher` fake.
//!
//! Run with: cargo test -p mcp-runtime --test runtime
//!
//! Test structure:
//! - support: fake connector, connections, and auth sessions
//! - orchestrator: caching, close, eviction
//! - oauth_promotion: HTTP negotiation and authorization retries
//! - scan: non-interactive listing of every server
//! - daemon: socket round trip, staleness restarts, keep-alive routing

#[path = "runtime/support.rs"]
mod support;

#[path = "runtime/orchestrator.rs"]
mod orchestrator;

#[path = "runtime/oauth_promotion.rs"]
mod oauth_promotion;

#[path = "runtime/scan.rs"]
mod scan;

#[path = "runtime/daemon.rs"]
mod daemon;
