//! Streaming chat client for the Mind Search answering service (conversation
//! model, WebSocket protocol, reconnecting transport, stream assembly).
//! Used by the `mind-search` terminal binary.

pub mod assembler;
pub mod client;
pub mod config;
pub mod conversation;
pub mod messages;
pub mod preferences;
pub mod transport;

pub use assembler::{
    Fold, Phase, StreamAssembler, CONNECTION_LOST_MESSAGE, EMPTY_ANSWER_FALLBACK, PLACEHOLDER,
};
pub use client::{ChatClient, ChatSnapshot, ClientError};
pub use config::{default_config_path, ClientSettings, Config, ConfigError, ServerSection, UiSection};
pub use conversation::{Conversation, Exchange, Role, Source};
pub use messages::{decode_frame, encode_request, DecodeError, ServerMessage};
pub use preferences::{Preferences, PreferencesError, ThemePreference};
pub use transport::{ConnectionState, Transport, TransportError};
