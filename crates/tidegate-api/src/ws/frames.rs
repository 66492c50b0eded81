//! JSON wire frames for the chat WebSocket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames the client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// One user turn.
    Message {
        content: String,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    Ping,
    Pong,
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Connected {
        chat_id: String,
        user_id: String,
    },
    /// Acknowledges that the user turn was persisted.
    UserMessage {
        message_id: Uuid,
        content: String,
        created_at: DateTime<Utc>,
    },
    StreamStart {
        message_id: Uuid,
    },
    StreamChunk {
        message_id: Uuid,
        content: String,
    },
    /// Terminal frame; repeats the full text so clients never depend on
    /// having seen every chunk.
    StreamEnd {
        message_id: Uuid,
        content: String,
        tokens_used: u32,
        complete: bool,
    },
    StreamError {
        message_id: Uuid,
        error: String,
    },
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_frame() {
        let frame: Inbound =
            serde_json::from_str(r#"{"type":"message","content":"hello","model":"m1"}"#).unwrap();
        match frame {
            Inbound::Message {
                content,
                model,
                temperature,
                max_tokens,
            } => {
                assert_eq!(content, "hello");
                assert_eq!(model.as_deref(), Some("m1"));
                assert!(temperature.is_none());
                assert!(max_tokens.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_inbound_control_frames() {
        assert!(matches!(
            serde_json::from_str::<Inbound>(r#"{"type":"ping"}"#).unwrap(),
            Inbound::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<Inbound>(r#"{"type":"pong"}"#).unwrap(),
            Inbound::Pong
        ));
    }

    #[test]
    fn test_unknown_inbound_type_rejected() {
        assert!(serde_json::from_str::<Inbound>(r#"{"type":"shutdown"}"#).is_err());
    }

    #[test]
    fn test_stream_end_frame_shape() {
        let id = Uuid::new_v4();
        let frame = Outbound::StreamEnd {
            message_id: id,
            content: "full text".to_string(),
            tokens_used: 2,
            complete: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "stream_end");
        assert_eq!(json["message_id"], id.to_string());
        assert_eq!(json["complete"], true);
    }

    #[test]
    fn test_connected_frame_shape() {
        let frame = Outbound::Connected {
            chat_id: "c1".to_string(),
            user_id: "u1".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["chat_id"], "c1");
    }
}
