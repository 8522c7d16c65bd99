use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message container used by the outbox and dispatch pipeline.
///
/// `Envelope` bundles a message body together with its associated headers.
///
/// ## Design
///
/// - `H` represents message metadata (identifiers, expiry, application
///   properties)
/// - `M` represents the actual message body
///
/// The dispatcher works with [`Message`], the cloud-to-device instantiation
/// carrying [`MessageHeaders`] and an opaque byte body.
///
/// ## Conversion
///
/// `Envelope` implements `From<(H, M)>` for ergonomic construction when headers
/// and payload are already available as a tuple.
///
/// ## Example
///
/// ```rust
/// use devicebound::{Envelope, MessageHeaders};
///
/// let envelope: Envelope<_, _> = (MessageHeaders::default(), b"ping".to_vec()).into();
/// assert_eq!(envelope.message, b"ping");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// A cloud-to-device message: [`MessageHeaders`] plus an opaque body.
pub type Message = Envelope<MessageHeaders, Vec<u8>>;

/// Headers of a cloud-to-device message.
///
/// Application properties are kept sorted by key so that two messages with the
/// same properties always encode to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Absolute time after which the message should be discarded by the hub.
    pub expiry_time: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Message {
    /// Create a message with empty headers around `body`.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Envelope {
            headers: MessageHeaders::default(),
            message: body.into(),
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.headers.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.headers.correlation_id = Some(id.into());
        self
    }

    pub fn with_expiry_time(mut self, expiry: DateTime<Utc>) -> Self {
        self.headers.expiry_time = Some(expiry);
        self
    }

    pub fn with_user_id(mut self, user: impl Into<String>) -> Self {
        self.headers.user_id = Some(user.into());
        self
    }

    /// Attach an application property. A later value for the same key wins.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.properties.insert(key.into(), value.into());
        self
    }

    /// Message body.
    pub fn body(&self) -> &[u8] {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_headers() {
        let msg = Message::new("hello")
            .with_message_id("m-1")
            .with_correlation_id("c-1")
            .with_user_id("svc")
            .with_property("k", "v1")
            .with_property("k", "v2");

        assert_eq!(msg.headers.message_id.as_deref(), Some("m-1"));
        assert_eq!(msg.headers.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(msg.headers.user_id.as_deref(), Some("svc"));
        assert_eq!(msg.headers.properties.len(), 1);
        assert_eq!(msg.headers.properties["k"], "v2");
        assert_eq!(msg.body(), b"hello");
    }

    #[test]
    fn headers_deserialize_without_properties() {
        let json = r#"{"message_id":"a","correlation_id":null,"expiry_time":null,"user_id":null}"#;
        let headers: MessageHeaders = serde_json::from_str(json).unwrap();
        assert_eq!(headers.message_id.as_deref(), Some("a"));
        assert!(headers.properties.is_empty());
    }
}
