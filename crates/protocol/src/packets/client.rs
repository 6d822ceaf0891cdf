//! Client -> Server message parsing.

use crate::ProtocolError;
use serde::Deserialize;

/// Parsed client intent.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Proposed new position.
    PlayerUpdate { pos_x: f64, pos_y: f64 },
    /// Keepalive; answered with `pong`.
    Ping,
}

impl ClientMessage {
    /// Parse a client message from a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let message: ClientMessage = serde_json::from_str(text)?;
        if let ClientMessage::PlayerUpdate { pos_x, pos_y } = message {
            if !pos_x.is_finite() || !pos_y.is_finite() {
                return Err(ProtocolError::NonFiniteCoordinate);
            }
        }
        Ok(message)
    }
}
