//! HTTP and WebSocket surface for the gateway.
//!
//! One axum router: model listing and fleet health over plain HTTP,
//! chat sessions over WebSocket with heartbeat supervision.

pub mod history;
pub mod server;
pub mod ws;

pub use history::{HistoryStore, MemoryHistory, StoredTurn};
pub use server::{router, serve, AppState};
pub use ws::{SessionKey, SessionRegistry};
