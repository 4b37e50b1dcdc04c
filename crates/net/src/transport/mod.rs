//! Point-to-point transport capability
//!
//! A transport lets a process claim a unique identity string and open
//! reliable, ordered channels to other claimed identities. Channel lifecycle
//! is reported as events: `Open`, `Data`, `Close`, `Error`.
//!
//! Two implementations ship with the crate:
//! - [`MemoryNetwork`]: in-process, used by tests and the demo
//! - [`TcpTransport`]: relays channels through a [`crate::broker::Broker`]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

pub mod memory;
pub mod tcp;

pub use memory::MemoryNetwork;
pub use tcp::TcpTransport;

/// Transport-level failure, classified the way peer-to-peer brokers report them
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Identity already taken: {0}")]
    UnavailableId(String),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Socket closed")]
    SocketClosed,

    #[error("Disconnected from broker")]
    Disconnected,

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Failures worth retrying: unreachable peer, network blip, socket error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::PeerUnavailable(_)
                | TransportError::Network(_)
                | TransportError::Socket(_)
        )
    }

    /// Short machine-readable name used on the relay wire
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::UnavailableId(_) => "unavailable-id",
            TransportError::PeerUnavailable(_) => "peer-unavailable",
            TransportError::Network(_) => "network",
            TransportError::Socket(_) => "socket-error",
            TransportError::SocketClosed => "socket-closed",
            TransportError::Disconnected => "disconnected",
            TransportError::Other(_) => "other",
        }
    }

    /// Inverse of [`TransportError::kind`]
    pub fn from_kind(kind: &str, detail: String) -> Self {
        match kind {
            "unavailable-id" => TransportError::UnavailableId(detail),
            "peer-unavailable" => TransportError::PeerUnavailable(detail),
            "network" => TransportError::Network(detail),
            "socket-error" => TransportError::Socket(detail),
            "socket-closed" => TransportError::SocketClosed,
            "disconnected" => TransportError::Disconnected,
            _ => TransportError::Other(detail),
        }
    }
}

/// A source of claimable identities
#[async_trait]
pub trait Transport: Send + Sync {
    /// Claim `id`, or a random identity when `None`.
    ///
    /// Fails with [`TransportError::UnavailableId`] when another process
    /// already holds the identity.
    async fn claim(&self, id: Option<String>) -> Result<Endpoint, TransportError>;
}

/// Implementation hook behind [`Dialer`]
pub trait Link: Send + Sync {
    /// Start opening a channel from `from` to `to`. Never blocks; the
    /// outcome arrives as the channel's first event.
    fn open(&self, from: &str, to: &str, metadata: Option<Value>) -> Channel;

    /// Give the identity back
    fn release(&self, id: &str);
}

/// Options for [`Dialer::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Out-of-band data visible to the remote side as soon as the channel arrives
    pub metadata: Option<Value>,
}

/// Opens outbound channels on behalf of a claimed identity
#[derive(Clone)]
pub struct Dialer {
    local_id: Arc<str>,
    link: Arc<dyn Link>,
}

impl Dialer {
    pub fn new(local_id: &str, link: Arc<dyn Link>) -> Self {
        Self {
            local_id: Arc::from(local_id),
            link,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn connect(&self, peer: &str, options: ConnectOptions) -> Channel {
        self.link.open(&self.local_id, peer, options.metadata)
    }

    pub fn release(&self) {
        self.link.release(&self.local_id);
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("local_id", &self.local_id)
            .finish()
    }
}

/// A claimed identity: dial out, accept inbound channels
pub struct Endpoint {
    dialer: Dialer,
    incoming: mpsc::UnboundedReceiver<Channel>,
}

impl Endpoint {
    pub fn new(dialer: Dialer, incoming: mpsc::UnboundedReceiver<Channel>) -> Self {
        Self { dialer, incoming }
    }

    pub fn id(&self) -> &str {
        self.dialer.local_id()
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Next inbound channel, `None` once the identity is gone
    pub async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }

    pub fn into_parts(self) -> (Dialer, mpsc::UnboundedReceiver<Channel>) {
        (self.dialer, self.incoming)
    }

    pub fn release(&self) {
        self.dialer.release();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint").field("id", &self.id()).finish()
    }
}

/// Channel lifecycle and payload events
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Data(Value),
    Close,
    Error(TransportError),
}

/// Outbound request from a handle to the transport
#[derive(Debug)]
pub enum Outbound {
    Data(Value),
    Close,
}

/// Sending half of a channel; cheap to clone
#[derive(Clone)]
pub struct ChannelHandle {
    peer: Arc<str>,
    metadata: Option<Arc<Value>>,
    open: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ChannelHandle {
    /// Remote identity
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queue a message. Fails when the channel is not open.
    pub fn send<T: Serialize>(&self, message: &T) -> crate::Result<()> {
        if !self.is_open() {
            return Err(crate::Error::ChannelClosed);
        }
        let value = serde_json::to_value(message)
            .map_err(|e| crate::Error::Protocol(format!("Serialization failed: {}", e)))?;
        self.outbound
            .send(Outbound::Data(value))
            .map_err(|_| crate::Error::ChannelClosed)
    }

    /// Close the channel. Safe to call repeatedly.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// A channel as handed to its owner: handle plus event stream
pub struct Channel {
    handle: ChannelHandle,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    /// Create a channel and the transport-side pump that drives it
    pub fn pair(peer: &str, metadata: Option<Value>) -> (Channel, ChannelPump) {
        let open = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let channel = Channel {
            handle: ChannelHandle {
                peer: Arc::from(peer),
                metadata: metadata.map(Arc::new),
                open: open.clone(),
                outbound: out_tx,
            },
            events: event_rx,
        };
        let pump = ChannelPump {
            sink: EventSink { open, events: event_tx },
            outbound: out_rx,
        };
        (channel, pump)
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn peer(&self) -> &str {
        self.handle.peer()
    }

    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>) {
        (self.handle, self.events)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("peer", &self.peer()).finish()
    }
}

/// Transport side of a channel
pub struct ChannelPump {
    pub sink: EventSink,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

/// Emits events into a channel and tracks its open flag
#[derive(Clone)]
pub struct EventSink {
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl EventSink {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn opened(&self) {
        self.open.store(true, Ordering::Release);
        let _ = self.events.send(ChannelEvent::Open);
    }

    pub fn deliver(&self, value: Value) {
        let _ = self.events.send(ChannelEvent::Data(value));
    }

    pub fn closed(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.events.send(ChannelEvent::Close);
    }

    pub fn failed(&self, error: TransportError) {
        self.open.store(false, Ordering::Release);
        let _ = self.events.send(ChannelEvent::Error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::PeerUnavailable("x".into()).is_transient());
        assert!(TransportError::Network("x".into()).is_transient());
        assert!(TransportError::Socket("x".into()).is_transient());
        assert!(!TransportError::UnavailableId("x".into()).is_transient());
        assert!(!TransportError::Disconnected.is_transient());
        assert!(!TransportError::Other("x".into()).is_transient());
    }

    #[test]
    fn test_kind_roundtrip() {
        let err = TransportError::PeerUnavailable("bob".into());
        assert_eq!(TransportError::from_kind(err.kind(), "bob".into()), err);
        assert_eq!(
            TransportError::from_kind("bogus", "x".into()),
            TransportError::Other("x".into())
        );
    }

    #[tokio::test]
    async fn test_send_requires_open() {
        let (channel, mut pump) = Channel::pair("bob", None);
        let handle = channel.handle().clone();
        assert!(handle.send(&"early").is_err());

        pump.sink.opened();
        handle.send(&"hello").unwrap();
        match pump.outbound.recv().await {
            Some(Outbound::Data(v)) => assert_eq!(v, "hello"),
            other => panic!("Unexpected outbound: {:?}", other),
        }

        handle.close();
        assert!(!handle.is_open());
        assert!(handle.send(&"late").is_err());
    }

    #[tokio::test]
    async fn test_endpoint_debug_shows_id() {
        let net = MemoryNetwork::new();
        let endpoint = net.claim(Some("bob".into())).await.unwrap();
        assert_eq!(format!("{:?}", endpoint), r#"Endpoint { id: "bob" }"#);

        let err = net.claim(Some("bob".into())).await.unwrap_err();
        assert_eq!(err, TransportError::UnavailableId("bob".into()));
    }
}
