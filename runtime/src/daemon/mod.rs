//! Keep-alive daemon
//!
//! One daemon per resolved configuration keeps expensive servers warm
//! between CLI invocations. It talks over a Unix socket, so this module is
//! Unix-only.
//!
//! ```text
//! ┌─────────────┐     Unix Socket     ┌──────────────────┐
//! │    mcprt    │ ←────────────────→  │   DaemonHost     │
//! └─────────────┘                     └────────┬─────────┘
//!                                              │ Runtime
//!                   ┌──────────────────────────┼─────────────────────┐
//!                   ↓                          ↓                     ↓
//!           ┌───────────────┐        ┌───────────────┐     ┌───────────────┐
//!           │   browser     │        │    serena     │     │   simulator   │
//!           │ (keep-alive)  │        │ (keep-alive)  │     │ (keep-alive)  │
//!           └───────────────┘        └───────────────┘     └───────────────┘
//! ```

mod client;
mod host;
mod launcher;
pub mod metadata;
pub mod protocol;

pub use client::DaemonClient;
pub use host::DaemonHost;
pub use launcher::{DaemonLauncher, LaunchRequest, ProcessLauncher};
pub use metadata::{DaemonMetadata, DaemonPaths, DAEMON_DIR_ENV};
pub use protocol::{DaemonStatus, ServerStatus};
