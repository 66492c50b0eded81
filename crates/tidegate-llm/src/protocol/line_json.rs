//! Line-delimited JSON chat protocol (Ollama-style).
//!
//! Routes: `GET /api/tags`, `POST /api/chat`, `POST /api/embeddings`.
//! Streaming responses arrive as one JSON object per line; the object
//! carrying `done: true` terminates the stream. Malformed lines are
//! skipped so a single garbled chunk cannot kill a long generation.

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

pub struct LineJsonAdapter {
    client: Client,
    timeouts: HttpTimeouts,
}

impl LineJsonAdapter {
    pub fn new(timeouts: HttpTimeouts) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self { client, timeouts })
    }
}

#[async_trait]
impl ProtocolAdapter for LineJsonAdapter {
    async fn list_models(&self, endpoint: &Endpoint) -> Result<Vec<String>, GatewayError> {
        let url = format!("{}/api/tags", endpoint.url());
        let deadline = self.timeouts.metadata;

        let response = self
            .client
            .get(&url)
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

        let tags: TagsResponse = serde_json::from_str(&body)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn complete(
        &self,
        endpoint: &Endpoint,
        call: &ChatCall,
    ) -> Result<Completion, GatewayError> {
        let url = format!("{}/api/chat", endpoint.url());
        let deadline = self.timeouts.request;
        let request = chat_request(call, false);

        tracing::debug!(endpoint = endpoint.name(), model = %call.model, "chat request");

        let response = self
            .client
            .post(&url)
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

        let reply: ChatResponse = serde_json::from_str(&body)?;
        Ok(Completion {
            content: reply.message.content,
            usage: reply.eval_count.map(|completion| {
                TokenUsage::new(reply.prompt_eval_count.unwrap_or(0), completion)
            }),
        })
    }

    async fn stream(
        &self,
        endpoint: &Endpoint,
        call: &ChatCall,
    ) -> Result<FragmentStream, GatewayError> {
        let (tx, rx) = mpsc::channel(64);

        let url = format!("{}/api/chat", endpoint.url());
        let deadline = self.timeouts.streaming;
        let request = serde_json::to_value(chat_request(call, true))?;
        let client = self.client.clone();
        let name = endpoint.name().to_string();

        tokio::spawn(async move {
            let result = client
                .post(&url)
                .timeout(deadline)
                .json(&request)
                .send()
                .await;

            let response = match result {
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

                while let Some(nl) = buffer.iter().position(|&b| b == b'\n') {
                    let line = String::from_utf8_lossy(&buffer[..nl]).trim().to_string();
                    buffer.drain(..=nl);
                    if line.is_empty() {
                        continue;
                    }

                    match parse_chat_line(&line) {
                        Some(parsed) => {
                            // The terminal object carries stats, not text.
                            if parsed.done {
                                return;
                            }
                            if !parsed.content.is_empty()
                                && tx.send(Ok(parsed.content)).await.is_err()
                            {
                                // Receiver went away mid-stream.
                                return;
                            }
                        }
                        None => {
                            tracing::warn!(endpoint = %name, "skipping malformed stream line");
                        }
                    }
                }
            }

            tracing::warn!(endpoint = %name, "stream ended without terminal object");
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn embed(
        &self,
        endpoint: &Endpoint,
        model: &str,
        text: &str,
    ) -> Result<Vec<f32>, GatewayError> {
        let url = format!("{}/api/embeddings", endpoint.url());
        let deadline = self.timeouts.embedding;

        let response = self
            .client
            .post(&url)
            .timeout(deadline)
            .json(&EmbeddingsRequest {
                model,
                prompt: text,
            })
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
        Ok(reply.embedding)
    }
}

fn chat_request(call: &ChatCall, stream: bool) -> ChatRequest<'_> {
    ChatRequest {
        model: &call.model,
        messages: wire_messages(&call.messages),
        stream,
        temperature: call.temperature,
        options: call.max_tokens.map(|num_predict| Options { num_predict }),
    }
}

/// One parsed line of a streaming chat response.
#[derive(Debug, PartialEq)]
struct ChatLine {
    content: String,
    done: bool,
}

fn parse_chat_line(line: &str) -> Option<ChatLine> {
    let frame: StreamFrame = serde_json::from_str(line).ok()?;
    Some(ChatLine {
        content: frame.message.content,
        done: frame.done,
    })
}

// Wire types.

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Options>,
}

#[derive(Debug, Serialize)]
struct Options {
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    message: ResponseMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}
