//! Reassembled messages.
//!
//! A [`Message`] is what a connection delivers through its `MessageReceived`
//! event: the payload of one or more transport frames, concatenated in receive
//! order, together with a [`MessageType`] tag. Binary is the default type; text
//! is only a tag and is never validated or transformed by this crate.
//!
//! # Examples
//!
//! ```
//! use wschannel_core::message::{Message, MessageType};
//!
//! let msg = Message::text("hello");
//! assert_eq!(msg.as_text(), Some("hello"));
//!
//! let msg: Message = vec![1u8, 2, 3].into();
//! assert_eq!(msg.message_type(), MessageType::Binary);
//! assert_eq!(msg.len(), 3);
//! ```

use crate::error::{Error, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;

/// The logical type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageType {
    /// Raw bytes.
    #[default]
    Binary,
    /// UTF-8 text.
    Text,
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The message payload.
    pub data: Bytes,
    /// Whether the payload is binary or text.
    pub msg_type: MessageType,
}

impl Message {
    /// Creates a message with an explicit type.
    pub fn new(data: impl Into<Bytes>, msg_type: MessageType) -> Self {
        Self {
            data: data.into(),
            msg_type,
        }
    }

    /// Creates a binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(data, MessageType::Binary)
    }

    /// Creates a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text.into().into_bytes(), MessageType::Text)
    }

    /// Returns the message type.
    pub fn message_type(&self) -> MessageType {
        self.msg_type
    }

    /// Returns `true` for text messages.
    pub fn is_text(&self) -> bool {
        self.msg_type == MessageType::Text
    }

    /// Returns `true` for binary messages.
    pub fn is_binary(&self) -> bool {
        self.msg_type == MessageType::Binary
    }

    /// Returns the payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Decodes the payload as UTF-8, regardless of the type tag.
    ///
    /// Returns `None` if the payload is not valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consumes the message, returning its payload.
    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Deserializes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(Error::from)
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Self::binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::binary(data)
    }
}

impl From<&'static [u8]> for Message {
    fn from(data: &'static [u8]) -> Self {
        Self::binary(Bytes::from_static(data))
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_is_default_type() {
        assert_eq!(MessageType::default(), MessageType::Binary);
        let msg = Message::from(vec![1, 2, 3]);
        assert!(msg.is_binary());
        assert_eq!(msg.as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_text_message() {
        let msg = Message::text("Hello, World!");
        assert!(msg.is_text());
        assert_eq!(msg.as_text(), Some("Hello, World!"));
        assert_eq!(msg.len(), 13);
    }

    #[test]
    fn test_binary_payload_decodes_as_text() {
        let msg = Message::binary(&b"ping"[..]);
        assert!(msg.is_binary());
        assert_eq!(msg.as_text(), Some("ping"));
    }

    #[test]
    fn test_invalid_utf8_is_not_text() {
        let msg = Message::binary(vec![0xff, 0xfe]);
        assert_eq!(msg.as_text(), None);
    }

    #[test]
    fn test_empty_message() {
        let msg = Message::binary(Bytes::new());
        assert!(msg.is_empty());
    }

    #[test]
    fn test_json_parsing() {
        #[derive(serde::Deserialize)]
        struct Packet {
            kind: String,
        }

        let msg = Message::text(r#"{"kind":"chat"}"#);
        let packet: Packet = msg.json().unwrap();
        assert_eq!(packet.kind, "chat");
    }

    #[test]
    fn test_invalid_json() {
        let msg = Message::text("not json");
        let result: Result<serde_json::Value> = msg.json();
        assert!(matches!(result, Err(Error::Json(_))));
    }
}
