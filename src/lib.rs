#![doc = include_str!("../README.md")]

pub mod ack;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod outbox;
pub mod target;
pub mod transport;
pub mod wire;

#[doc(inline)]
pub use ack::{Acknowledgement, AcknowledgementState};

#[doc(inline)]
pub use config::DispatcherConfig;

#[doc(inline)]
pub use envelope::{Envelope, Message, MessageHeaders};

#[doc(inline)]
pub use outbox::{DeliveryTag, MessageSentCallback, OutboundMessage};

#[doc(inline)]
pub use target::Target;

#[doc(inline)]
pub use transport::{Link, LinkEvent, Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use dispatcher::{
    DefaultDispatchHook, DispatchHook, DispatchRunError, DispatchRunErrorKind, Dispatcher,
    LinkState,
};
