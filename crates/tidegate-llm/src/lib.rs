//! LLM backend pool for tidegate.
//!
//! Holds the endpoint registry with per-endpoint health statistics, the
//! backend selector, the two protocol adapters (line-delimited JSON and
//! SSE/OpenAI-compatible), and the gateway facade that ties them together.

pub mod cache;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod selector;

pub use cache::{MemoryCache, ResponseCache};
pub use gateway::{Gateway, GenerationRequest, HealthReport, StreamingGeneration};
pub use protocol::{Completion, FragmentStream, ProtocolAdapter, TokenUsage};
pub use registry::{Endpoint, EndpointRegistry, EndpointStats};
pub use selector::BackendSelector;
