//! Messages and per-send message contexts.
//!
//! A [`Message`] is an opaque byte buffer; the runtime never interprets its
//! content. Lengths are bytewise and content carries no terminator. A
//! [`MessageContext`] overlays per-send message properties and optional
//! endpoint overrides (for sendmsg-style datagram routing) on top of the
//! connection's defaults.

use crate::endpoint::{LocalEndpoint, RemoteEndpoint};
use crate::properties::MessageProperties;

/// An opaque sequence of bytes handed to or delivered by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    content: Vec<u8>,
}

impl Message {
    /// Build a message owning a copy of the given content.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Message {
            content: content.into(),
        }
    }

    /// Build a message with no content.
    pub fn empty() -> Self {
        Message {
            content: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.content
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.content
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Message::new(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Message::new(value)
    }
}

/// Per-send overlay: message properties plus optional endpoint overrides.
///
/// The overrides only apply to datagram transports; a `remote_endpoint`
/// override redirects a single send without re-establishing the connection.
#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub message_properties: MessageProperties,
    pub local_endpoint: Option<LocalEndpoint>,
    pub remote_endpoint: Option<RemoteEndpoint>,
}

impl MessageContext {
    pub fn new() -> Self {
        MessageContext {
            message_properties: MessageProperties::build(),
            local_endpoint: None,
            remote_endpoint: None,
        }
    }

    pub fn with_properties(message_properties: MessageProperties) -> Self {
        MessageContext {
            message_properties,
            local_endpoint: None,
            remote_endpoint: None,
        }
    }

    pub fn with_remote_endpoint(mut self, remote: RemoteEndpoint) -> Self {
        self.remote_endpoint = Some(remote);
        self
    }

    /// Whether the context marks its message as the connection's last.
    /// An absent context (`None`) is never final.
    pub fn is_final(ctx: Option<&MessageContext>) -> bool {
        ctx.map_or(false, |c| c.message_properties.is_final())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_owns_its_content() {
        let message = Message::new(b"hello world".to_vec());
        assert_eq!(message.len(), 11);
        assert_eq!(message.as_bytes(), b"hello world");
    }

    #[test]
    fn message_length_is_bytewise() {
        // No terminator is added or assumed.
        let message = Message::new(vec![0u8, 1, 2, 0]);
        assert_eq!(message.len(), 4);
    }

    #[test]
    fn absent_context_is_not_final() {
        assert!(!MessageContext::is_final(None));

        let mut ctx = MessageContext::new();
        assert!(!MessageContext::is_final(Some(&ctx)));

        ctx.message_properties.set_final();
        assert!(MessageContext::is_final(Some(&ctx)));
    }
}
