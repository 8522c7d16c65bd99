//! Dispatch loop for delivering queued messages over a link.
//!
//! This module implements the cloud-to-device *dispatcher* that:
//!
//! - Accepts messages from any thread into the pending queue
//! - Sends at most one queued message per trigger (flow credit or timer tick)
//! - Tracks every sent message by delivery tag until it is acknowledged
//! - Correlates acknowledgements back to the producer's callback
//! - Releases everything still pending or in flight when the link closes
//! - Exposes lifecycle hooks for observability and customization
//!
//! All operations that touch the in-flight table alongside a drain step run
//! under a single dispatch lock. Closing is a one-shot transition: whichever
//! caller flips the closing flag first drains, later calls return
//! immediately.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_stream::{Stream, StreamExt as _};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    Acknowledgement, AcknowledgementState, DispatcherConfig, Message, Target,
    outbox::{self, DeliveryTag, InFlight, MessageSentCallback, OutboundMessage, TagAllocator},
    target::ENDPOINT,
    transport::{Delivery, Link, LinkEvent, SubmitService, Transport, TransportError},
    wire::{self, EncodeError},
};

/// Lifecycle of the sender link as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Closing,
}

struct DispatchState<L, S, C> {
    link: LinkState,
    transport: Transport<L, S>,
    pending: outbox::OutboxReceiver<C>,
    in_flight: InFlight<C>,
}

/// Cloud-to-device dispatcher.
///
/// Generic parameters:
/// - `L`: Link implementation
/// - `C`: Context type handed back to message callbacks
/// - `S`: Submission service (see [`Transport::layer`])
/// - `HK`: Hook implementation for lifecycle events
///
/// Share it behind an `Arc` to enqueue from several tasks while
/// [`run`](Dispatcher::run) drives the link.
pub struct Dispatcher<L, C, S = SubmitService<L>, HK = DefaultDispatchHook> {
    outbox: outbox::Outbox<C>,
    state: Mutex<DispatchState<L, S, C>>,
    tags: TagAllocator,
    closing: AtomicBool,
    shutdown: CancellationToken,
    hook: HK,
    config: DispatcherConfig,
}

impl<L, C, S> Dispatcher<L, C, S, DefaultDispatchHook> {
    /// Create a new dispatcher with the default hook implementation.
    pub fn new(transport: Transport<L, S>, config: DispatcherConfig) -> Self {
        let (outbox, pending) = outbox::channel();
        Self {
            outbox,
            state: Mutex::new(DispatchState {
                link: LinkState::Closed,
                transport,
                pending,
                in_flight: InFlight::new(),
            }),
            tags: TagAllocator::new(),
            closing: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            hook: DefaultDispatchHook,
            config,
        }
    }
}

impl<L, C, S, HK> Dispatcher<L, C, S, HK> {
    /// Replace the dispatcher hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatchHook>(self, hook: HK2) -> Dispatcher<L, C, S, HK2> {
        Dispatcher {
            outbox: self.outbox,
            state: self.state,
            tags: self.tags,
            closing: self.closing,
            shutdown: self.shutdown,
            hook,
            config: self.config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}

impl<L, C, S, HK> Dispatcher<L, C, S, HK>
where
    L: Link + Send,
    S: Service<Delivery, Response = ()> + Send,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
    C: Send + 'static,
    HK: DispatchHook,
{
    /// Queue `message` for `target`.
    ///
    /// Never blocks and never fails: the outcome, including failures, is only
    /// reported through `callback`, exactly once.
    pub fn enqueue(
        &self,
        target: Target,
        message: Message,
        callback: impl MessageSentCallback<C> + 'static,
        context: C,
    ) {
        self.hook.on_message_queued(&target);
        self.outbox
            .publish(OutboundMessage::new(target, message, callback, context));
    }

    /// Queue `message` for a device.
    pub fn send_to_device(
        &self,
        device_id: impl Into<String>,
        message: Message,
        callback: impl MessageSentCallback<C> + 'static,
        context: C,
    ) {
        self.enqueue(Target::device(device_id), message, callback, context);
    }

    /// Queue `message` for a module of a device.
    pub fn send_to_module(
        &self,
        device_id: impl Into<String>,
        module_id: impl Into<String>,
        message: Message,
        callback: impl MessageSentCallback<C> + 'static,
        context: C,
    ) {
        self.enqueue(
            Target::module(device_id, module_id),
            message,
            callback,
            context,
        );
    }

    /// Ask the transport to open the sender link.
    ///
    /// Dispatch starts once the remote side confirms with
    /// [`on_link_opened`](Dispatcher::on_link_opened). A failed open closes
    /// the dispatcher, releasing every queued message.
    #[tracing::instrument(skip(self))]
    pub async fn open(&self) -> Result<(), DispatchRunError> {
        let mut state = self.state.lock().await;
        if self.closing.load(Ordering::Acquire) {
            return Err(DispatchRunError::new(DispatchRunErrorKind::Closed));
        }
        if state.link != LinkState::Closed {
            return Err(DispatchRunError::new(DispatchRunErrorKind::AlreadyOpen));
        }

        state.link = LinkState::Opening;
        if let Err(err) = state.transport.open(ENDPOINT).await {
            drop(state);
            self.hook.on_transport_error(&err);
            self.close().await;
            return Err(DispatchRunError::transport(err));
        }
        Ok(())
    }

    /// Remote side opened the link. Returns `true` if the link became open.
    pub async fn on_link_opened(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.link != LinkState::Opening {
            return false;
        }
        state.link = LinkState::Open;
        self.hook.on_link_open();
        true
    }

    /// Flow-control trigger: dispatch at most one queued message.
    pub async fn on_link_ready(&self) -> Option<DeliveryTag> {
        self.dispatch_next().await
    }

    /// Timer trigger: dispatch at most one queued message.
    pub async fn on_timer(&self) -> Option<DeliveryTag> {
        self.dispatch_next().await
    }

    /// Pop, encode, tag, track and submit the head of the queue.
    ///
    /// Returns the tag of the submitted message.
    async fn dispatch_next(&self) -> Option<DeliveryTag> {
        let mut state = self.state.lock().await;
        if state.link != LinkState::Open {
            return None;
        }
        let message = state.pending.pop()?;

        let address = message.target().address();
        let encoded = match wire::encode_message(
            message.message(),
            &address,
            self.config.initial_buffer_size,
            self.config.max_buffer_size,
        ) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.hook.on_encode_error(message.target(), &err);
                message.resolve(
                    Acknowledgement::released().with_status_description(err.to_string()),
                );
                return None;
            }
        };

        let tag = self.tags.next();
        state.in_flight.insert(tag, message);

        let delivery = Delivery {
            tag,
            payload: encoded.bytes,
        };
        match state.transport.submit(delivery).await {
            Ok(()) => {
                self.hook.on_message_sent(tag, &address);
                Some(tag)
            }
            Err(err) => {
                self.hook.on_transport_error(&err);
                // Never made it onto the link: report it now, nothing will
                // acknowledge it later.
                if let Some(message) = state.in_flight.remove(tag) {
                    let ack = Acknowledgement::released()
                        .with_status_description(err.kind().to_string());
                    message.resolve(ack);
                }
                None
            }
        }
    }

    /// Correlate an acknowledgement with the message sent under `tag`.
    ///
    /// Unknown tags, including those of messages already released by a
    /// close, are logged and ignored.
    #[tracing::instrument(skip(self, ack), fields(state = %ack.state))]
    pub async fn on_acknowledged(&self, tag: DeliveryTag, ack: Acknowledgement) {
        let entry = self.state.lock().await.in_flight.remove(tag);
        match entry {
            Some(message) => {
                self.hook.on_acknowledged(tag, &ack);
                message.resolve(ack);
            }
            None => self.hook.on_unknown_acknowledgement(tag, &ack),
        }
    }

    /// Reject a delivery received on the sender link.
    pub async fn on_inbound(&self, tag: &[u8]) {
        let mut state = self.state.lock().await;
        if let Err(err) = state
            .transport
            .settle_inbound(tag, AcknowledgementState::Rejected)
            .await
        {
            self.hook.on_transport_error(&err);
        }
    }

    /// The transport lost the link. Handled exactly like [`close`](Dispatcher::close).
    pub async fn on_link_closed(&self, error: Option<String>) {
        if let Some(error) = &error {
            tracing::warn!(%error, "Link closed by transport");
        }
        self.close().await;
    }

    /// Close the link and release every pending and in-flight message.
    ///
    /// Idempotent: only the first call drains; later or nested calls return
    /// immediately without firing callbacks.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.state.lock().await;
        state.link = LinkState::Closing;
        if let Err(err) = state.transport.close().await {
            self.hook.on_transport_error(&err);
        }

        let in_flight = state.in_flight.drain();
        let pending = state.pending.close_and_drain();
        self.hook.on_messages_released(in_flight.len(), pending.len());

        for (_, message) in in_flight {
            message.release();
        }
        for message in pending {
            message.release();
        }

        state.link = LinkState::Closed;
        drop(state);

        self.hook.on_link_closed();
        self.shutdown.cancel();
    }

    /// Drive the link until it closes.
    ///
    /// Opens the link, then reacts to link events and to a periodic timer
    /// (see [`DispatcherConfig::send_interval`]) that runs while the link is
    /// open. Each flow event or tick dispatches at most one message.
    ///
    /// The loop ends when:
    /// - The link is closed, locally or by the transport
    /// - The event stream ends
    /// - The [`CancellationToken`] is triggered
    ///
    /// Every exit path closes the dispatcher.
    #[tracing::instrument(skip_all)]
    pub async fn run<E>(
        &self,
        mut events: E,
        cancel: CancellationToken,
    ) -> Result<(), DispatchRunError>
    where
        E: Stream<Item = LinkEvent> + Unpin,
    {
        self.open().await?;

        let mut ticker = tokio::time::interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut open = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.close().await;
                    break;
                }
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick(), if open => {
                    self.on_timer().await;
                }
                event = events.next() => match event {
                    Some(LinkEvent::Opened) => {
                        if self.on_link_opened().await {
                            open = true;
                            ticker.reset();
                        }
                    }
                    Some(LinkEvent::Ready) => {
                        self.on_link_ready().await;
                    }
                    Some(LinkEvent::Acknowledged { tag, ack }) => {
                        self.on_acknowledged(tag, ack).await;
                    }
                    Some(LinkEvent::Inbound { tag }) => self.on_inbound(&tag).await,
                    Some(LinkEvent::Closed { error }) => {
                        self.on_link_closed(error).await;
                        break;
                    }
                    None => {
                        tracing::debug!("Link event stream ended");
                        self.close().await;
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    pub async fn state(&self) -> LinkState {
        self.state.lock().await.link
    }

    /// Number of messages waiting to be sent.
    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Number of messages sent and not yet acknowledged.
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

/// Error returned when the dispatcher cannot open or run its link.
#[derive(Debug)]
pub struct DispatchRunError {
    context: tracing_error::SpanTrace,
    kind: DispatchRunErrorKind,
}

impl DispatchRunError {
    fn new(kind: DispatchRunErrorKind) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind,
        }
    }

    fn transport(error: TransportError) -> Self {
        Self::new(DispatchRunErrorKind::Transport(error))
    }

    pub fn kind(&self) -> &DispatchRunErrorKind {
        &self.kind
    }
}

/// Classification of dispatcher runtime errors.
#[derive(Debug)]
pub enum DispatchRunErrorKind {
    /// Errors originating from the transport.
    Transport(TransportError),
    /// The link was already opened.
    AlreadyOpen,
    /// The dispatcher has been closed and cannot be reopened.
    Closed,
}

impl std::fmt::Display for DispatchRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchRunErrorKind::Transport(err) => {
                writeln!(f, "Transport error: {}", err.kind())
            }
            DispatchRunErrorKind::AlreadyOpen => writeln!(f, "Link already opened"),
            DispatchRunErrorKind::Closed => writeln!(f, "Dispatcher is closed"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchRunErrorKind::Transport(err) => Some(err),
            DispatchRunErrorKind::AlreadyOpen | DispatchRunErrorKind::Closed => None,
        }
    }
}

/// Hook trait for observing dispatcher lifecycle events.
///
/// Hooks are invoked synchronously, some of them under the dispatch lock, and
/// should avoid heavy or blocking work. Typical use cases include logging,
/// metrics, and tracing integration.
pub trait DispatchHook: Send + Sync {
    fn on_link_open(&self);
    fn on_link_closed(&self);
    fn on_message_queued(&self, target: &Target);
    fn on_message_sent(&self, tag: DeliveryTag, address: &str);
    fn on_acknowledged(&self, tag: DeliveryTag, ack: &Acknowledgement);
    fn on_unknown_acknowledgement(&self, tag: DeliveryTag, ack: &Acknowledgement);
    fn on_encode_error(&self, target: &Target, error: &EncodeError);
    fn on_transport_error(&self, error: &dyn std::error::Error);
    fn on_messages_released(&self, in_flight: usize, pending: usize);
}

/// Default dispatcher hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultDispatchHook;

impl DispatchHook for DefaultDispatchHook {
    fn on_link_open(&self) {
        tracing::info!("Sender link is open");
    }

    fn on_link_closed(&self) {
        tracing::info!("Sender link is closed");
    }

    fn on_message_queued(&self, target: &Target) {
        tracing::debug!(to = %target, "Message queued");
    }

    fn on_message_sent(&self, tag: DeliveryTag, address: &str) {
        tracing::debug!(%tag, to = address, "Message sent");
    }

    fn on_acknowledged(&self, tag: DeliveryTag, ack: &Acknowledgement) {
        tracing::debug!(
            %tag,
            state = %ack.state,
            status_code = ?ack.status_code,
            "Message acknowledged",
        );
    }

    fn on_unknown_acknowledgement(&self, tag: DeliveryTag, ack: &Acknowledgement) {
        tracing::warn!(
            %tag,
            state = %ack.state,
            "Acknowledgement for a message this sender did not send or already released, ignoring",
        );
    }

    fn on_encode_error(&self, target: &Target, error: &EncodeError) {
        tracing::error!(to = %target, %error, "Failed to encode message");
    }

    fn on_transport_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Transport error");
    }

    fn on_messages_released(&self, in_flight: usize, pending: usize) {
        tracing::info!(in_flight, pending, "Releasing unacknowledged messages");
    }
}
