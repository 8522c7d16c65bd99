//! Pending and in-flight message tracking.
//!
//! The outbox holds every message between the moment a producer hands it
//! over and the moment its completion callback fires:
//!
//! - [`Outbox`] / [`OutboxReceiver`]: FIFO of messages not yet handed to the
//!   transport. Producers append from any thread without locking; a single
//!   consumer (the dispatcher) pops from the front.
//! - [`InFlight`]: messages submitted to the transport, keyed by
//!   [`DeliveryTag`], awaiting acknowledgement.
//! - [`TagAllocator`]: source of delivery tags.
//!
//! ## Completion guarantee
//!
//! An [`OutboundMessage`] owns its callback and invokes it exactly once:
//! either explicitly when resolved, or with a `Released` outcome when it is
//! dropped unresolved.

mod in_flight;
mod tag;

use tokio::sync::mpsc;

use crate::{Acknowledgement, Message, Target};

pub use in_flight::InFlight;
pub use tag::{DeliveryTag, MAX_DELIVERY_TAG, TagAllocator};

/// Completion callback of an outbound message.
///
/// Receives the final outcome and the caller's context. The context is `None`
/// when the message was released by a connection shutdown.
///
/// Implemented for every `FnOnce(Acknowledgement, Option<C>) + Send` closure.
pub trait MessageSentCallback<C>: Send {
    fn on_message_sent(self: Box<Self>, ack: Acknowledgement, context: Option<C>);
}

impl<C, F> MessageSentCallback<C> for F
where
    F: FnOnce(Acknowledgement, Option<C>) + Send,
{
    fn on_message_sent(self: Box<Self>, ack: Acknowledgement, context: Option<C>) {
        (*self)(ack, context)
    }
}

struct Completion<C> {
    callback: Box<dyn MessageSentCallback<C>>,
    context: C,
}

/// A message on its way to a device, together with its completion callback.
pub struct OutboundMessage<C> {
    target: Target,
    message: Message,
    completion: Option<Completion<C>>,
}

impl<C> OutboundMessage<C> {
    pub fn new(
        target: Target,
        message: Message,
        callback: impl MessageSentCallback<C> + 'static,
        context: C,
    ) -> Self {
        Self {
            target,
            message,
            completion: Some(Completion {
                callback: Box::new(callback),
                context,
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Complete the message with `ack`, handing the caller's context back.
    pub fn resolve(mut self, ack: Acknowledgement) {
        if let Some(Completion { callback, context }) = self.completion.take() {
            callback.on_message_sent(ack, Some(context));
        }
    }

    /// Complete the message with a `Released` outcome and no context.
    pub fn release(mut self) {
        self.fire_released();
    }

    fn fire_released(&mut self) {
        if let Some(Completion { callback, .. }) = self.completion.take() {
            callback.on_message_sent(Acknowledgement::released(), None);
        }
    }
}

impl<C> Drop for OutboundMessage<C> {
    fn drop(&mut self) {
        if self.completion.is_some() {
            tracing::debug!(to = %self.target, "Releasing message dropped before completion");
            self.fire_released();
        }
    }
}

impl<C> std::fmt::Debug for OutboundMessage<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("target", &self.target)
            .field("message", &self.message)
            .field("resolved", &self.completion.is_none())
            .finish()
    }
}

/// Producer side of the pending queue.
///
/// Cheap to clone; publishing never blocks and never fails. Once the
/// receiving side has been closed, published messages are released on the
/// spot.
pub struct Outbox<C> {
    tx: mpsc::UnboundedSender<OutboundMessage<C>>,
}

impl<C> Clone for Outbox<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Consumer side of the pending queue.
pub struct OutboxReceiver<C> {
    rx: mpsc::UnboundedReceiver<OutboundMessage<C>>,
}

/// Create a connected pending queue.
pub fn channel<C>() -> (Outbox<C>, OutboxReceiver<C>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Outbox { tx }, OutboxReceiver { rx })
}

impl<C> Outbox<C> {
    /// Append a message to the back of the queue.
    pub fn publish(&self, message: OutboundMessage<C>) {
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            tracing::debug!(to = %message.target, "Outbox closed, releasing message");
            message.release();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<C> OutboxReceiver<C> {
    /// Take the message at the front of the queue, if any.
    pub fn pop(&mut self) -> Option<OutboundMessage<C>> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Refuse further messages and return everything still queued, in order.
    pub fn close_and_drain(&mut self) -> Vec<OutboundMessage<C>> {
        self.rx.close();
        let mut drained = Vec::with_capacity(self.rx.len());
        while let Ok(message) = self.rx.try_recv() {
            drained.push(message);
        }
        drained
    }
}
