//! Delivery outcomes reported back to message producers.

use std::fmt;

/// Disposition of a delivered message as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcknowledgementState {
    Accepted,
    Received,
    Modified,
    Rejected,
    /// The message was not processed, either because the connection closed
    /// before it was acknowledged or because it never reached the transport.
    Released,
}

impl fmt::Display for AcknowledgementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AcknowledgementState::Accepted => "accepted",
            AcknowledgementState::Received => "received",
            AcknowledgementState::Modified => "modified",
            AcknowledgementState::Rejected => "rejected",
            AcknowledgementState::Released => "released",
        };
        f.write_str(s)
    }
}

/// Outcome handed to a message's completion callback.
///
/// Status fields are forwarded untouched from the transport; they are `None`
/// when the outcome was produced locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub state: AcknowledgementState,
    pub status_code: Option<String>,
    pub status_description: Option<String>,
}

impl Acknowledgement {
    pub fn new(state: AcknowledgementState) -> Self {
        Self {
            state,
            status_code: None,
            status_description: None,
        }
    }

    /// Terminal outcome for messages drained on close.
    pub fn released() -> Self {
        Self::new(AcknowledgementState::Released)
    }

    pub fn with_status_code(mut self, code: impl Into<String>) -> Self {
        self.status_code = Some(code.into());
        self
    }

    pub fn with_status_description(mut self, description: impl Into<String>) -> Self {
        self.status_description = Some(description.into());
        self
    }

    pub fn is_released(&self) -> bool {
        self.state == AcknowledgementState::Released
    }
}
