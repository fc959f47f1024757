//! HTTP surface: typed service operations mapped onto routes, plus the SSE
//! bridge for live session streams.

mod error;
/// Message routes (post prompt, cursor reads, raw export, cancel).
pub mod messages;
/// Router construction and the HTTP server entry point.
pub mod server;
/// Session CRUD routes.
pub mod sessions;
/// Server-sent-event bridge.
pub mod sse;

pub use error::ApiError;
pub use server::{AppState, create_router, serve};
