use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::{
    Acknowledgement, AcknowledgementState,
    outbox::DeliveryTag,
    transport::{Delivery, Link, LinkEvent},
};

/// In-memory link for testing or local pipelines.
///
/// Records every delivery in a shared queue and raises [`LinkEvent`]s on the
/// channel returned by [`InMemoryLink::new`]. Useful for:
/// - Unit and integration testing
/// - Simulating a hub without a real broker
/// - Debugging message flows
///
/// Opening the link immediately raises [`LinkEvent::Opened`]; flow credit and
/// acknowledgements are raised explicitly through [`grant_credit`] and
/// [`acknowledge`].
///
/// [`grant_credit`]: InMemoryLink::grant_credit
/// [`acknowledge`]: InMemoryLink::acknowledge
#[derive(Clone)]
pub struct InMemoryLink {
    state: Arc<Mutex<LinkState>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Default)]
struct LinkState {
    endpoint: Option<String>,
    deliveries: Vec<Delivery>,
    settled: Vec<(Vec<u8>, AcknowledgementState)>,
    close_calls: usize,
    refuse_submits: bool,
}

impl InMemoryLink {
    /// Create a link and the receiving end of its event channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let link = Self {
            state: Arc::new(Mutex::new(LinkState::default())),
            events,
        };
        (link, rx)
    }

    /// Deliveries submitted so far, in submission order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().await.deliveries.clone()
    }

    /// Return all deliveries and clear the internal queue.
    pub async fn take_deliveries(&self) -> Vec<Delivery> {
        std::mem::take(&mut self.state.lock().await.deliveries)
    }

    /// Endpoint passed to the last `open` call.
    pub async fn endpoint(&self) -> Option<String> {
        self.state.lock().await.endpoint.clone()
    }

    /// Inbound deliveries settled by the dispatcher.
    pub async fn settled(&self) -> Vec<(Vec<u8>, AcknowledgementState)> {
        self.state.lock().await.settled.clone()
    }

    pub async fn close_calls(&self) -> usize {
        self.state.lock().await.close_calls
    }

    /// Make subsequent submissions fail.
    pub async fn refuse_submits(&self, refuse: bool) {
        self.state.lock().await.refuse_submits = refuse;
    }

    /// Raise a flow-control event.
    pub fn grant_credit(&self) {
        self.emit(LinkEvent::Ready);
    }

    /// Settle the delivery sent under `tag` as the remote peer would.
    pub fn acknowledge(&self, tag: DeliveryTag, ack: Acknowledgement) {
        self.emit(LinkEvent::Acknowledged { tag, ack });
    }

    /// Deliver an inbound message on the link.
    pub fn inbound(&self, tag: impl Into<Vec<u8>>) {
        self.emit(LinkEvent::Inbound { tag: tag.into() });
    }

    /// Close the link from the remote side.
    pub fn remote_close(&self, error: Option<String>) {
        self.emit(LinkEvent::Closed { error });
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Link event receiver dropped");
        }
    }
}

#[async_trait::async_trait]
impl Link for InMemoryLink {
    type Error = std::io::Error;

    async fn open(&mut self, endpoint: &str) -> Result<(), Self::Error> {
        self.state.lock().await.endpoint = Some(endpoint.to_owned());
        self.emit(LinkEvent::Opened);
        Ok(())
    }

    /// "Send" a delivery by appending it to the in-memory queue.
    #[tracing::instrument(skip_all, fields(tag = %delivery.tag))]
    async fn submit(&mut self, delivery: Delivery) -> Result<(), Self::Error> {
        let mut state = self.state.lock().await;
        if state.refuse_submits {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "link refused delivery",
            ));
        }
        tracing::debug!(bytes = delivery.payload.len(), "Delivery stored in in-memory link");
        state.deliveries.push(delivery);
        Ok(())
    }

    async fn settle_inbound(
        &mut self,
        tag: &[u8],
        state: AcknowledgementState,
    ) -> Result<(), Self::Error> {
        self.state.lock().await.settled.push((tag.to_vec(), state));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.state.lock().await.close_calls += 1;
        Ok(())
    }
}
