//! WebSocket message types for the `/ws` chat endpoint. Client ↔ server JSON.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::conversation::{Exchange, Source};

/// Client → server: new question plus the prior conversation as context.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage<'a> {
    pub message: &'a str,
    pub history: &'a [Exchange],
}

impl<'a> RequestMessage<'a> {
    pub fn new(message: &'a str, history: &'a [Exchange]) -> Self {
        Self { message, history }
    }
}

/// Encode a request frame. `history` is the conversation before `text` was submitted.
pub fn encode_request(text: &str, history: &[Exchange]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RequestMessage::new(text, history))
}

/// Server → client: streamed fragment.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkMessage {
    pub content: String,
}

/// Server → client: final answer.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteMessage {
    pub content: String,
    #[serde(default)]
    pub sources: Option<Vec<Source>>,
}

/// Server → client: failure reported by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorMessage {
    pub content: String,
}

/// One server frame; discriminator is the JSON "type" field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Chunk(String),
    Complete { content: String, sources: Vec<Source> },
    Error(String),
    Unknown(String),
}

/// A frame that could not be classified into a [`ServerMessage`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing type")]
    MissingType,
    #[error("malformed {typ} message: {source}")]
    Malformed {
        typ: String,
        #[source]
        source: serde_json::Error,
    },
}

fn field<T: serde::de::DeserializeOwned>(
    typ: &str,
    value: &serde_json::Value,
) -> Result<T, DecodeError> {
    T::deserialize(value).map_err(|source| DecodeError::Malformed {
        typ: typ.to_string(),
        source,
    })
}

fn deduplicate_sources(sources: Vec<Source>) -> Vec<Source> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for source in sources {
        if seen.insert(source.url.clone()) {
            unique.push(source);
        }
    }
    unique
}

impl ServerMessage {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        let typ = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(DecodeError::MissingType)?;
        match typ {
            "chunk" => {
                let m: ChunkMessage = field(typ, value)?;
                Ok(ServerMessage::Chunk(m.content))
            }
            "complete" => {
                let m: CompleteMessage = field(typ, value)?;
                Ok(ServerMessage::Complete {
                    content: m.content,
                    sources: deduplicate_sources(m.sources.unwrap_or_default()),
                })
            }
            "error" => {
                let m: ErrorMessage = field(typ, value)?;
                Ok(ServerMessage::Error(m.content))
            }
            _ => Ok(ServerMessage::Unknown(value.to_string())),
        }
    }
}

/// Decode one text frame received from the server.
pub fn decode_frame(raw: &str) -> Result<ServerMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    ServerMessage::from_json(&value)
}
