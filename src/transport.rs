//! Transport abstractions.
//!
//! The dispatcher never talks to a protocol engine directly. It depends on
//! the [`Link`] capability: something that can open a sender link, accept
//! tagged deliveries, settle inbound deliveries and close. Transport-side
//! happenings (remote open, flow credit, acknowledgements, remote close)
//! come back as a stream of [`LinkEvent`]s.
//!
//! ## Key components
//!
//! - [`Link`]: Trait implemented by concrete transport adapters
//! - [`Transport`]: Wrapper used by the dispatcher; normalizes errors and
//!   routes submissions through a Tower service so middleware can be layered
//! - [`SubmitService`]: Adapter from a [`Link`] to a Tower service
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::{Acknowledgement, AcknowledgementState, outbox::DeliveryTag};

pub use inmemory::InMemoryLink;

/// One encoded message handed to the transport under its delivery tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub payload: Vec<u8>,
}

/// Event raised by the transport for the sender link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The remote peer opened the link; dispatch may start.
    Opened,
    /// The link has credit for another delivery.
    Ready,
    /// The remote peer settled the delivery sent under `tag`.
    Acknowledged {
        tag: DeliveryTag,
        ack: Acknowledgement,
    },
    /// A delivery arrived on the link. Sender links do not accept messages.
    Inbound { tag: Vec<u8> },
    /// The link, session or connection went away.
    Closed { error: Option<String> },
}

/// Transport capability driven by the dispatcher.
///
/// Implementations are expected to be cheap handles over shared state: the
/// dispatcher keeps one handle for the link lifecycle and clones another into
/// the submission service.
#[async_trait::async_trait]
pub trait Link {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Open the sender link against `endpoint`.
    async fn open(&mut self, endpoint: &str) -> Result<(), Self::Error>;

    /// Hand one delivery to the transport.
    async fn submit(&mut self, delivery: Delivery) -> Result<(), Self::Error>;

    /// Settle a delivery received on the link.
    async fn settle_inbound(
        &mut self,
        _tag: &[u8],
        _state: AcknowledgementState,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Close the link together with its session and connection.
    async fn close(&mut self) -> Result<(), Self::Error>;
}

/// Transport used by the dispatcher.
///
/// Lifecycle calls go straight to the [`Link`]; submissions go through the
/// Tower service `S`, which is a [`SubmitService`] unless wrapped with
/// [`layer`](Transport::layer).
pub struct Transport<L, S = SubmitService<L>> {
    link: L,
    service: S,
}

impl<L> Transport<L>
where
    L: Clone,
{
    /// Create a new transport from a link handle.
    pub fn new(link: L) -> Self {
        Self {
            service: SubmitService::new(link.clone()),
            link,
        }
    }
}

impl<L, S> Transport<L, S> {
    /// Apply a Tower layer to the submission path.
    ///
    /// This enables composition with middleware such as timeouts,
    /// concurrency limits, or tracing.
    pub fn layer<Y>(self, layer: Y) -> Transport<L, Y::Service>
    where
        Y: tower::Layer<S>,
    {
        Transport {
            link: self.link,
            service: layer.layer(self.service),
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

impl<L, S> Transport<L, S>
where
    L: Link + Send,
    S: Service<Delivery, Response = ()> + Send,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
{
    #[tracing::instrument(skip(self))]
    pub async fn open(&mut self, endpoint: &str) -> Result<(), TransportError> {
        self.link
            .open(endpoint)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Open(e.into())))
    }

    /// Submit a delivery once the submission service reports readiness.
    #[tracing::instrument(skip_all, fields(tag = %delivery.tag))]
    pub async fn submit(&mut self, delivery: Delivery) -> Result<(), TransportError> {
        let service = self
            .service
            .ready()
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Submit(e.into())))?;
        service
            .call(delivery)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Submit(e.into())))
    }

    pub async fn settle_inbound(
        &mut self,
        tag: &[u8],
        state: AcknowledgementState,
    ) -> Result<(), TransportError> {
        self.link
            .settle_inbound(tag, state)
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Settle(e.into())))
    }

    #[tracing::instrument(skip(self))]
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.link
            .close()
            .await
            .map_err(|e| TransportError::new(TransportErrorKind::Close(e.into())))
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Opening the sender link failed.
    Open(tower::BoxError),
    /// The transport refused a delivery.
    Submit(tower::BoxError),
    /// Settling an inbound delivery failed.
    Settle(tower::BoxError),
    /// Closing the link failed.
    Close(tower::BoxError),
}

impl TransportError {
    fn new(kind: TransportErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Open(err) => write!(f, "Open error: {err}"),
            TransportErrorKind::Submit(err) => write!(f, "Submit error: {err}"),
            TransportErrorKind::Settle(err) => write!(f, "Settle error: {err}"),
            TransportErrorKind::Close(err) => write!(f, "Close error: {err}"),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Open(err)
            | TransportErrorKind::Submit(err)
            | TransportErrorKind::Settle(err)
            | TransportErrorKind::Close(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Link`].
#[derive(Clone)]
pub struct SubmitService<L> {
    link: L,
}

impl<L> SubmitService<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }
}

/// `tower::Service` implementation delegating to [`Link::submit`].
impl<L> Service<Delivery> for SubmitService<L>
where
    L: Link + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Delivery) -> Self::Future {
        let mut link = self.link.clone();
        Box::pin(async move {
            link.submit(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}
