//! OpenAI-compatible SSE protocol.
//!
//! Routes: `GET /v1/models`, `POST /v1/chat/completions`,
//! `POST /v1/embeddings`. Streaming responses arrive as `data: ` frames;
//! the literal `data: [DONE]` sentinel terminates the stream. Frames
//! whose first choice carries no delta content (role-only deltas, usage
//! frames) are ignored.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use tidegate_core::GatewayError;

use crate::registry::Endpoint;

use super::{
    status_error, transport_error, wire_messages, ChatCall, Completion, FragmentStream,
    HttpTimeouts, ProtocolAdapter, TokenUsage, WireMessage,
};

pub struct SseAdapter {
    client: Client,
    timeouts: HttpTimeouts,
}

impl SseAdapter {
    pub fn new(timeouts: HttpTimeouts) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self { client, timeouts })
    }
}

fn authorize(
    builder: reqwest::RequestBuilder,
    endpoint: &Endpoint,
) -> reqwest::RequestBuilder {
    match endpoint.api_key() {
        Some(key) => builder.header("Authorization", format!("Bearer {key}")),
        None => builder,
    }
}

#[async_trait]
impl ProtocolAdapter for SseAdapter {
    async fn list_models(&self, endpoint: &Endpoint) -> Result<Vec<String>, GatewayError> {
        let url = format!("{}/v1/models", endpoint.url());
        let deadline = self.timeouts.metadata;

        let response = authorize(self.client.get(&url), endpoint)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| transport_error(e, deadline))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, deadline))?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let models: ModelsResponse = serde_json::from_str(&body)?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn complete(
        &self,
        endpoint: &Endpoint,
        call: &ChatCall,
    ) -> Result<Completion, GatewayError> {
        let url = format!("{}/v1/chat/completions", endpoint.url());
        let deadline = self.timeouts.request;
        let request = completion_request(call, false);

        tracing::debug!(endpoint = endpoint.name(), model = %call.model, "chat request");

        let response = authorize(self.client.post(&url), endpoint)
            .timeout(deadline)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, deadline))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, deadline))?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let reply: CompletionResponse = serde_json::from_str(&body)?;
        let choice = reply
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Generation("no choices in response".to_string()))?;

        Ok(Completion {
            content: choice.message.content,
            usage: reply
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }

    async fn stream(
        &self,
        endpoint: &Endpoint,
        call: &ChatCall,
    ) -> Result<FragmentStream, GatewayError> {
        let (tx, rx) = mpsc::channel(64);

        let url = format!("{}/v1/chat/completions", endpoint.url());
        let deadline = self.timeouts.streaming;
        let request = serde_json::to_value(completion_request(call, true))?;
        let client = self.client.clone();
        let api_key = endpoint.api_key().map(str::to_string);
        let name = endpoint.name().to_string();

        tokio::spawn(async move {
            let mut builder = client.post(&url).timeout(deadline).json(&request);
            if let Some(key) = &api_key {
                builder = builder.header("Authorization", format!("Bearer {key}"));
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx.send(Err(transport_error(e, deadline))).await;
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let _ = tx.send(Err(status_error(status, &body))).await;
                return;
            }

            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                // Notice a departed consumer while waiting on the backend,
                // not just when the next send fails; returning here drops
                // the response and closes the upstream connection.
                let chunk = tokio::select! {
                    _ = tx.closed() => return,
                    chunk = bytes.next() => match chunk {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => {
                            let _ = tx.send(Err(transport_error(e, deadline))).await;
                            return;
                        }
                        None => break,
                    },
                };
                buffer.extend_from_slice(&chunk);

                // Frames can split across chunks, so only complete lines
                // leave the buffer.
                while let Some(nl) = buffer.iter().position(|&b| b == b'\n') {
                    let line = String::from_utf8_lossy(&buffer[..nl]).trim().to_string();
                    buffer.drain(..=nl);

                    match parse_sse_frame(&line) {
                        SseFrame::Done => return,
                        SseFrame::Fragment(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        SseFrame::Ignore => {}
                    }
                }
            }

            tracing::warn!(endpoint = %name, "stream ended without [DONE] sentinel");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn embed(
        &self,
        endpoint: &Endpoint,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>, GatewayError> {
        let url = format!("{}/v1/embeddings", endpoint.url());
        let deadline = self.timeouts.embedding;

        let response = authorize(self.client.post(&url), endpoint)
            .timeout(deadline)
            .json(&EmbeddingsRequest { model, input: text })
            .send()
            .await
            .map_err(|e| transport_error(e, deadline))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, deadline))?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let reply: EmbeddingsResponse = serde_json::from_str(&body)?;
        reply
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| GatewayError::Generation("no embedding in response".to_string()))
    }
}

fn completion_request(call: &ChatCall, stream: bool) -> CompletionRequest<'_> {
    CompletionRequest {
        model: &call.model,
        messages: wire_messages(&call.messages),
        temperature: call.temperature,
        max_tokens: call.max_tokens,
        stream,
    }
}

/// Classification of one SSE line.
#[derive(Debug, PartialEq)]
enum SseFrame {
    /// Terminal `data: [DONE]` sentinel.
    Done,
    /// Delta content to forward.
    Fragment(String),
    /// Empty line, comment, role-only delta, or unparseable frame.
    Ignore,
}

fn parse_sse_frame(line: &str) -> SseFrame {
    if line.is_empty() {
        return SseFrame::Ignore;
    }
    let payload = match line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
        Some(payload) => payload.trim(),
        None => return SseFrame::Ignore,
    };
    if payload == "[DONE]" {
        return SseFrame::Done;
    }
    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => {
            let delta = event
                .choices
                .into_iter()
                .next()
                .map(|c| c.delta.content)
                .unwrap_or_default();
            if delta.is_empty() {
                SseFrame::Ignore
            } else {
                SseFrame::Fragment(delta)
            }
        }
        Err(_) => {
            tracing::warn!("skipping malformed SSE frame");
            SseFrame::Ignore
        }
    }
}

// Wire types.

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dropped_stream_closes_upstream_connection() {
        use std::sync::{Arc, Mutex};

        use axum::body::{Body, Bytes};
        use axum::routing::post;
        use tokio::sync::oneshot;

        use crate::registry::EndpointRegistry;
        use tidegate_core::{EndpointConfig, ProtocolKind};

        struct BodyGuard(Option<oneshot::Sender<()>>);
        impl Drop for BodyGuard {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        let (dropped_tx, dropped_rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(dropped_tx)));
        let app = axum::Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let slot = slot.clone();
                async move {
                    let guard = BodyGuard(slot.lock().unwrap().take());
                    // One delta, then the backend stalls forever.
                    Body::from_stream(async_stream::stream! {
                        let _guard = guard;
                        yield Ok::<_, std::io::Error>(Bytes::from_static(
                            b"data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n",
                        ));
                        futures::future::pending::<()>().await;
                    })
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let registry = EndpointRegistry::from_config(&[EndpointConfig::new(
            "stall",
            ProtocolKind::SseOpenai,
            format!("http://{addr}"),
        )]);
        let endpoint = registry.get("stall").unwrap();
        let adapter = SseAdapter::new(HttpTimeouts {
            request: Duration::from_secs(5),
            streaming: Duration::from_secs(30),
            metadata: Duration::from_secs(5),
            embedding: Duration::from_secs(5),
        })
        .unwrap();
        let call = ChatCall {
            model: "m".into(),
            messages: Vec::new(),
            temperature: 0.7,
            max_tokens: None,
        };

        let mut stream = adapter.stream(&endpoint, &call).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "He");

        // Abandoning the consumer must close the backend connection
        // promptly, not after the streaming deadline.
        drop(stream);
        tokio::time::timeout(Duration::from_secs(2), dropped_rx)
            .await
            .expect("upstream connection stayed open")
            .unwrap();
    }

    #[test]
    fn test_done_sentinel() {
        assert_eq!(parse_sse_frame("data: [DONE]"), SseFrame::Done);
        assert_eq!(parse_sse_frame("data:[DONE]"), SseFrame::Done);
    }

    #[test]
    fn test_content_fragment() {
        let frame = parse_sse_frame(r#"data: {"choices":[{"delta":{"content":"He"}}]}"#);
        assert_eq!(frame, SseFrame::Fragment("He".to_string()));
    }

    #[test]
    fn test_role_only_delta_ignored() {
        let frame = parse_sse_frame(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#);
        assert_eq!(frame, SseFrame::Ignore);
    }

    #[test]
    fn test_empty_and_non_data_lines_ignored() {
        assert_eq!(parse_sse_frame(""), SseFrame::Ignore);
        assert_eq!(parse_sse_frame(": keep-alive"), SseFrame::Ignore);
        assert_eq!(parse_sse_frame("event: message"), SseFrame::Ignore);
    }

    #[test]
    fn test_malformed_frame_ignored() {
        assert_eq!(parse_sse_frame("data: {broken"), SseFrame::Ignore);
    }

    #[test]
    fn test_fragment_sequence_with_malformed_line() {
        let lines = [
            r#"data: {"choices":[{"delta":{"content":"He"}}]}"#,
            "data: {garbled",
            r#"data: {"choices":[{"delta":{"content":"llo"}}]}"#,
            "data: [DONE]",
        ];
        let mut collected = String::new();
        for line in lines {
            match parse_sse_frame(line) {
                SseFrame::Fragment(text) => collected.push_str(&text),
                SseFrame::Done => break,
                SseFrame::Ignore => {}
            }
        }
        assert_eq!(collected, "Hello");
    }

    #[test]
    fn test_blocking_response_normalization() {
        let reply: CompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}],
                "usage":{"prompt_tokens":5,"completion_tokens":3,"total_tokens":8}}"#,
        )
        .unwrap();
        assert_eq!(reply.choices[0].message.content, "hi");
        let usage = reply.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 5);
        assert_eq!(usage.completion_tokens, 3);
    }

    #[test]
    fn test_request_shape() {
        let call = ChatCall {
            model: "gpt-4o-mini".into(),
            messages: Vec::new(),
            temperature: 0.0,
            max_tokens: None,
        };
        let json = serde_json::to_value(completion_request(&call, true)).unwrap();
        assert_eq!(json["stream"], true);
        assert!(json.get("max_tokens").is_none());
    }
}
