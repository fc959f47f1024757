//! Pokecode: local orchestration backend for AI coding agent sessions.
//!
//! Drives long-running agent processes (Claude Code, Codex CLI) on behalf of
//! clients: a durable session + message store, a job queue with one active
//! job per session, a worker pool streaming agent output into the store, and
//! an SSE bridge fanning events out to subscribers.

#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]

/// HTTP surface and SSE bridge.
pub mod api;
/// Process-local event bus.
pub mod bus;
/// Configuration loading.
pub mod config;
/// Core domain types and error taxonomy.
pub mod core;
/// Daemon runtime files and ops plumbing.
pub mod daemon;
/// Raw agent SDK message parsing.
pub mod parser;
/// Agent runners (Claude Code, Codex).
pub mod runners;
/// Session, message, and queue services.
pub mod services;
/// Persistent storage (SQLite).
pub mod store;
/// Worker pool driving job execution.
pub mod worker;
