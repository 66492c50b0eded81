//! Router and server entry point.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use tidegate_core::{ContextBuilder, GatewayError, Summarizer};
use tidegate_llm::{Gateway, HealthReport};

use crate::history::HistoryStore;
use crate::ws::{ws_chat_handler, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub history: Arc<dyn HistoryStore>,
    pub sessions: Arc<SessionRegistry>,
    pub context: Arc<ContextBuilder>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
}

impl AppState {
    pub fn new(gateway: Gateway, history: Arc<dyn HistoryStore>) -> Self {
        let context = Arc::new(ContextBuilder::new(gateway.config().context_budget));
        Self {
            gateway: Arc::new(gateway),
            history,
            sessions: Arc::new(SessionRegistry::new()),
            context,
            summarizer: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/models", get(list_models_handler))
        .route("/api/models/status", get(models_status_handler))
        .route("/ws/chat/:chat_id", get(ws_chat_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, addr: &str) -> Result<(), GatewayError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(state))
        .await
        .map_err(GatewayError::Io)
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<String>,
    default_model: String,
}

/// `GET /api/models` — union of models across healthy endpoints.
async fn list_models_handler(State(state): State<AppState>) -> Json<ModelsResponse> {
    let mut models = state.gateway.list_models().await;
    models.sort();
    Json(ModelsResponse {
        models,
        default_model: state.gateway.config().default_model.clone(),
    })
}

/// `GET /api/models/status` — probe the fleet and report health.
async fn models_status_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.gateway.health_check().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistory;
    use tidegate_core::GatewayConfig;

    #[tokio::test]
    async fn test_router_builds() {
        let gateway = Gateway::new(GatewayConfig::default()).unwrap();
        let state = AppState::new(gateway, Arc::new(MemoryHistory::new()));
        let _router = router(state);
    }
}
