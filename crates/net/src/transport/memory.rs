//! In-process transport
//!
//! All endpoints share one registry. Channels are bridged by a small task
//! per channel pair, which preserves per-channel ordering.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{Channel, ChannelPump, Dialer, Endpoint, Link, Outbound, Transport, TransportError};

#[derive(Default)]
struct Registry {
    endpoints: HashMap<String, mpsc::UnboundedSender<Channel>>,
    /// Failures to report on the next dials towards an identity
    faults: HashMap<String, VecDeque<TransportError>>,
    dials: HashMap<String, usize>,
}

/// Shared in-memory network; clone it to hand the same network to many sessions
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next dial towards `target` fail with `error`
    pub fn inject_failure(&self, target: &str, error: TransportError) {
        self.lock()
            .faults
            .entry(target.to_string())
            .or_default()
            .push_back(error);
    }

    /// Number of channels ever dialled towards `target`
    pub fn dial_count(&self, target: &str) -> usize {
        self.lock().dials.get(target).copied().unwrap_or(0)
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.lock().endpoints.contains_key(id)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn claim(&self, id: Option<String>) -> Result<Endpoint, TransportError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut registry = self.lock();
            if let Some(existing) = registry.endpoints.get(&id) {
                if !existing.is_closed() {
                    return Err(TransportError::UnavailableId(id));
                }
            }
            registry.endpoints.insert(id.clone(), tx);
        }

        debug!(id = %id, "Identity claimed");
        let link = Arc::new(MemoryLink {
            registry: self.registry.clone(),
        });
        Ok(Endpoint::new(Dialer::new(&id, link), rx))
    }
}

struct MemoryLink {
    registry: Arc<Mutex<Registry>>,
}

impl Link for MemoryLink {
    fn open(&self, from: &str, to: &str, metadata: Option<Value>) -> Channel {
        let (local, local_pump) = Channel::pair(to, None);

        let target = {
            let mut registry = lock(&self.registry);
            *registry.dials.entry(to.to_string()).or_default() += 1;

            if let Some(fault) = registry.faults.get_mut(to).and_then(|q| q.pop_front()) {
                local_pump.sink.failed(fault);
                return local;
            }
            registry.endpoints.get(to).cloned()
        };

        let Some(target) = target else {
            local_pump
                .sink
                .failed(TransportError::PeerUnavailable(to.to_string()));
            return local;
        };

        let (remote, remote_pump) = Channel::pair(from, metadata);
        if target.send(remote).is_err() {
            local_pump
                .sink
                .failed(TransportError::PeerUnavailable(to.to_string()));
            return local;
        }

        tokio::spawn(bridge(local_pump, remote_pump));
        local
    }

    fn release(&self, id: &str) {
        if lock(&self.registry).endpoints.remove(id).is_some() {
            debug!(id = %id, "Identity released");
        }
    }
}

/// Carry traffic both ways until either side closes
async fn bridge(a: ChannelPump, b: ChannelPump) {
    let ChannelPump {
        sink: a_sink,
        outbound: mut a_out,
    } = a;
    let ChannelPump {
        sink: b_sink,
        outbound: mut b_out,
    } = b;

    a_sink.opened();
    b_sink.opened();

    loop {
        tokio::select! {
            msg = a_out.recv() => match msg {
                Some(Outbound::Data(v)) => b_sink.deliver(v),
                Some(Outbound::Close) | None => break,
            },
            msg = b_out.recv() => match msg {
                Some(Outbound::Data(v)) => a_sink.deliver(v),
                Some(Outbound::Close) | None => break,
            },
        }
    }

    a_sink.closed();
    b_sink.closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelEvent, ConnectOptions};

    #[tokio::test]
    async fn test_claim_collision() {
        let net = MemoryNetwork::new();
        let first = net.claim(Some("hub_kitchen_007".into())).await.unwrap();
        assert_eq!(first.id(), "hub_kitchen_007");

        let second = net.claim(Some("hub_kitchen_007".into())).await;
        assert!(matches!(second, Err(TransportError::UnavailableId(_))));

        first.release();
        assert!(net.claim(Some("hub_kitchen_007".into())).await.is_ok());
    }

    #[tokio::test]
    async fn test_channel_exchange() {
        let net = MemoryNetwork::new();
        let a = net.claim(Some("a".into())).await.unwrap();
        let mut b = net.claim(Some("b".into())).await.unwrap();

        let mut outbound = a.dialer().connect(
            "b",
            ConnectOptions {
                metadata: Some(serde_json::json!({"username": "Pho"})),
            },
        );
        let mut inbound = b.accept().await.unwrap();
        assert_eq!(inbound.peer(), "a");
        assert_eq!(inbound.handle().metadata().unwrap()["username"], "Pho");

        assert_eq!(outbound.next_event().await, Some(ChannelEvent::Open));
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Open));

        outbound.handle().send(&1).unwrap();
        outbound.handle().send(&2).unwrap();
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Data(1.into())));
        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Data(2.into())));

        inbound.handle().close();
        assert_eq!(outbound.next_event().await, Some(ChannelEvent::Close));
        assert!(!outbound.handle().is_open());
    }

    #[tokio::test]
    async fn test_unknown_peer_and_injected_fault() {
        let net = MemoryNetwork::new();
        let a = net.claim(None).await.unwrap();

        let mut ch = a.dialer().connect("nobody", ConnectOptions::default());
        match ch.next_event().await {
            Some(ChannelEvent::Error(e)) => assert!(e.is_transient()),
            other => panic!("Unexpected event: {:?}", other),
        }

        let _b = net.claim(Some("b".into())).await.unwrap();
        net.inject_failure("b", TransportError::Network("blip".into()));
        let mut ch = a.dialer().connect("b", ConnectOptions::default());
        assert_eq!(
            ch.next_event().await,
            Some(ChannelEvent::Error(TransportError::Network("blip".into())))
        );
        assert_eq!(net.dial_count("b"), 1);
    }
}
