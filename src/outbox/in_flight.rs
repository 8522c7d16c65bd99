use std::collections::HashMap;

use crate::{
    Acknowledgement,
    outbox::{DeliveryTag, OutboundMessage},
};

/// Messages submitted to the transport and still awaiting acknowledgement,
/// keyed by delivery tag.
pub struct InFlight<C> {
    entries: HashMap<DeliveryTag, OutboundMessage<C>>,
}

impl<C> Default for InFlight<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<C> InFlight<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `message` under `tag`.
    ///
    /// Tags are unique while in flight. Should a tag still be occupied, the
    /// displaced message is released rather than silently lost.
    pub fn insert(&mut self, tag: DeliveryTag, message: OutboundMessage<C>) {
        if let Some(displaced) = self.entries.insert(tag, message) {
            tracing::error!(%tag, "Delivery tag reused while still in flight");
            displaced.resolve(
                Acknowledgement::released().with_status_description("delivery tag reused"),
            );
        }
    }

    /// Stop tracking `tag`, returning its message if it was in flight.
    pub fn remove(&mut self, tag: DeliveryTag) -> Option<OutboundMessage<C>> {
        self.entries.remove(&tag)
    }

    pub fn contains(&self, tag: DeliveryTag) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Remove every entry, leaving the table empty.
    pub fn drain(&mut self) -> Vec<(DeliveryTag, OutboundMessage<C>)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
