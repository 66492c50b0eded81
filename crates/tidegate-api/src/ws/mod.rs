//! WebSocket chat sessions.

pub mod chat;
pub mod frames;
pub mod liveness;
pub mod session;

pub use chat::ws_chat_handler;
pub use frames::{Inbound, Outbound};
pub use liveness::Liveness;
pub use session::{SessionKey, SessionPhase, SessionRegistry};
