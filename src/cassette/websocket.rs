//! WebSocket exchanges stored alongside HTTP interactions

use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as WireCloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// A recorded WebSocket connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketExchange {
    /// Upgrade URL
    pub url: String,
    /// Frames in the order they crossed the proxy
    pub messages: Vec<WebSocketMessage>,
    /// Close frame, when the connection was closed cleanly
    #[serde(default)]
    pub close_frame: Option<CloseFrame>,
}

/// One recorded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSocketMessage {
    /// Which peer sent it
    pub direction: Direction,
    /// Milliseconds since the connection opened
    pub timestamp_ms: u64,
    /// Frame contents
    pub payload: MessagePayload,
}

/// Frame direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Client to server
    Sent,
    /// Server to client
    Received,
}

/// Frame payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MessagePayload {
    /// UTF-8 text frame
    Text(String),
    /// Binary frame
    Binary(Vec<u8>),
    /// Ping control frame
    Ping(Vec<u8>),
    /// Pong control frame
    Pong(Vec<u8>),
}

/// Close frame contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseFrame {
    /// Close status code
    pub code: u16,
    /// Close reason
    pub reason: String,
}

impl WebSocketExchange {
    /// Empty exchange for `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            messages: Vec::new(),
            close_frame: None,
        }
    }

    /// Record a wire frame.
    ///
    /// Close frames end the exchange and are stored in `close_frame`;
    /// raw frames carry nothing worth replaying and are dropped.
    pub fn push_wire(&mut self, direction: Direction, timestamp_ms: u64, message: &Message) {
        match message {
            Message::Close(frame) => {
                self.close_frame = Some(frame.as_ref().map_or_else(
                    || CloseFrame {
                        code: u16::from(CloseCode::Normal),
                        reason: String::new(),
                    },
                    CloseFrame::from,
                ));
            }
            other => {
                if let Some(payload) = MessagePayload::from_wire(other) {
                    self.messages.push(WebSocketMessage {
                        direction,
                        timestamp_ms,
                        payload,
                    });
                }
            }
        }
    }

    /// Frames sent by the server, in order
    pub fn received(&self) -> impl Iterator<Item = &WebSocketMessage> {
        self.messages
            .iter()
            .filter(|m| m.direction == Direction::Received)
    }
}

impl MessagePayload {
    /// Convert a tungstenite message; `None` for close and raw frames
    #[must_use]
    pub fn from_wire(message: &Message) -> Option<Self> {
        match message {
            Message::Text(text) => Some(Self::Text(text.to_string())),
            Message::Binary(data) => Some(Self::Binary(data.to_vec())),
            Message::Ping(data) => Some(Self::Ping(data.to_vec())),
            Message::Pong(data) => Some(Self::Pong(data.to_vec())),
            Message::Close(_) | Message::Frame(_) => None,
        }
    }

    /// Convert back into a tungstenite message for replay
    #[must_use]
    pub fn to_wire(&self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text.clone()),
            Self::Binary(data) => Message::Binary(data.clone()),
            Self::Ping(data) => Message::Ping(data.clone()),
            Self::Pong(data) => Message::Pong(data.clone()),
        }
    }

    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
        }
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&WireCloseFrame<'_>> for CloseFrame {
    fn from(frame: &WireCloseFrame<'_>) -> Self {
        Self {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
        }
    }
}
