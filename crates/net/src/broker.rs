//! TCP relay broker
//!
//! Stands between TCP transports: hands out unique identities and relays
//! channel traffic between them. Identity uniqueness enforced here is what
//! makes rendezvous election work across processes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::ReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::protocol::RelayMessage;
use crate::transport::TransportError;

/// Maximum number of claimed identities
const MAX_CLIENTS: usize = 1024;

/// Both ends of a relayed channel
#[derive(Debug, Clone)]
struct Route {
    opener: String,
    target: String,
}

impl Route {
    fn other_side(&self, id: &str) -> Option<&str> {
        if self.opener == id {
            Some(&self.target)
        } else if self.target == id {
            Some(&self.opener)
        } else {
            None
        }
    }
}

/// Broker state shared across connection tasks
#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, mpsc::UnboundedSender<RelayMessage>>,
    routes: HashMap<Uuid, Route>,
}

impl BrokerState {
    fn send_to(&self, id: &str, msg: RelayMessage) {
        match self.clients.get(id) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!(id = %id, "Failed to queue message for client");
                }
            }
            None => debug!(id = %id, "Dropping message for departed client"),
        }
    }
}

/// Relay broker handle
pub struct Broker {
    addr: SocketAddr,
    state: Arc<RwLock<BrokerState>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Broker {
    /// Start a broker on the given port (0 picks a free one)
    pub async fn start(port: u16) -> Result<Self> {
        Self::bind(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    /// Start a broker on a specific address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "Broker started");

        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(RwLock::new(BrokerState::default()));

        tokio::spawn(accept_loop(
            listener,
            state.clone(),
            shutdown_tx.subscribe(),
        ));

        Ok(Broker {
            addr: bound_addr,
            state,
            shutdown_tx,
        })
    }

    /// Get the broker's bound address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Identities currently claimed
    pub async fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().await.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Channels currently relayed
    pub async fn channel_count(&self) -> usize {
        self.state.read().await.routes.len()
    }

    /// Stop accepting connections
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Broker shutdown initiated");
    }
}

/// Accept incoming connections
async fn accept_loop(
    listener: TcpListener,
    state: Arc<RwLock<BrokerState>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        debug!(addr = %addr, "New connection");
                        tokio::spawn(handle_connection(stream, addr, state.clone()));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Accept loop shutting down");
                break;
            }
        }
    }
}

/// Handle a single transport connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<RwLock<BrokerState>>) {
    let (mut reader, writer) = tokio::io::split(stream);

    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let writer_handle = tokio::spawn(writer_task(writer, msg_rx));

    // First message must be Claim
    let id = match handle_claim(&mut reader, &state, &msg_tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(addr = %addr, error = %e, "Claim failed");
            // let the writer flush the rejection
            drop(msg_tx);
            let _ = writer_handle.await;
            return;
        }
    };
    drop(msg_tx);

    info!(addr = %addr, id = %id, "Identity claimed");

    loop {
        match read_frame(&mut reader).await {
            Ok(msg) => handle_message(msg, &id, &state).await,
            Err(Error::ConnectionClosed) => {
                debug!(id = %id, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Read error");
                break;
            }
        }
    }

    release_client(&state, &id).await;
    writer_handle.abort();

    info!(id = %id, "Identity released");
}

/// Handle the claim handshake
async fn handle_claim(
    reader: &mut ReadHalf<TcpStream>,
    state: &Arc<RwLock<BrokerState>>,
    tx: &mpsc::UnboundedSender<RelayMessage>,
) -> Result<String> {
    let requested = match read_frame(reader).await? {
        RelayMessage::Claim { id } => id,
        _ => return Err(Error::Protocol("Expected Claim".into())),
    };

    let mut s = state.write().await;

    let rejection = match &requested {
        _ if s.clients.len() >= MAX_CLIENTS => {
            Some(TransportError::Other("Broker full".into()))
        }
        Some(id) if id.trim().is_empty() => {
            Some(TransportError::Other("Empty identity".into()))
        }
        Some(id) if s.clients.contains_key(id) => {
            Some(TransportError::UnavailableId(id.clone()))
        }
        _ => None,
    };

    if let Some(err) = rejection {
        let _ = tx.send(RelayMessage::ClaimRejected {
            kind: err.kind().to_string(),
            reason: err.to_string(),
        });
        return Err(Error::Transport(err));
    }

    let id = requested.unwrap_or_else(|| Uuid::new_v4().to_string());
    s.clients.insert(id.clone(), tx.clone());
    let _ = tx.send(RelayMessage::Claimed { id: id.clone() });

    Ok(id)
}

/// Writer task - sends frames to the transport
async fn writer_task(
    mut writer: tokio::io::WriteHalf<TcpStream>,
    mut rx: mpsc::UnboundedReceiver<RelayMessage>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &msg).await {
            debug!(error = %e, "Write failed");
            break;
        }
    }
}

/// Route one message from `sender`
async fn handle_message(msg: RelayMessage, sender: &str, state: &Arc<RwLock<BrokerState>>) {
    match msg {
        RelayMessage::Connect {
            channel,
            to,
            metadata,
        } => {
            let mut s = state.write().await;

            let failure = if s.routes.contains_key(&channel) {
                Some(TransportError::Other("Duplicate channel id".into()))
            } else if !s.clients.contains_key(&to) {
                Some(TransportError::PeerUnavailable(to.clone()))
            } else {
                None
            };

            if let Some(err) = failure {
                debug!(from = %sender, to = %to, error = %err, "Connect failed");
                s.send_to(
                    sender,
                    RelayMessage::ConnectFailed {
                        channel,
                        kind: err.kind().to_string(),
                        reason: err.to_string(),
                    },
                );
                return;
            }

            s.routes.insert(
                channel,
                Route {
                    opener: sender.to_string(),
                    target: to.clone(),
                },
            );
            s.send_to(
                &to,
                RelayMessage::Incoming {
                    channel,
                    from: sender.to_string(),
                    metadata,
                },
            );
            s.send_to(sender, RelayMessage::Opened { channel });
            debug!(from = %sender, to = %to, channel = %channel, "Channel opened");
        }
        RelayMessage::Data { channel, payload } => {
            let s = state.read().await;
            let Some(other) = s.routes.get(&channel).and_then(|r| r.other_side(sender)) else {
                debug!(sender = %sender, channel = %channel, "Data for unknown channel");
                return;
            };
            s.send_to(other, RelayMessage::Data { channel, payload });
        }
        RelayMessage::Close { channel } => {
            let mut s = state.write().await;
            let other = match s.routes.get(&channel).and_then(|r| r.other_side(sender)) {
                Some(other) => other.to_string(),
                None => return,
            };
            s.routes.remove(&channel);
            s.send_to(&other, RelayMessage::Closed { channel });
            debug!(sender = %sender, channel = %channel, "Channel closed");
        }
        RelayMessage::Ping => {
            state.read().await.send_to(sender, RelayMessage::Pong);
        }
        _ => {
            debug!(sender = %sender, "Ignoring unexpected message type");
        }
    }
}

/// Drop a client and close every channel it was part of
async fn release_client(state: &Arc<RwLock<BrokerState>>, id: &str) {
    let mut s = state.write().await;
    s.clients.remove(id);

    let orphaned: Vec<(Uuid, String)> = s
        .routes
        .iter()
        .filter_map(|(channel, route)| route.other_side(id).map(|o| (*channel, o.to_string())))
        .collect();

    for (channel, other) in orphaned {
        s.routes.remove(&channel);
        s.send_to(&other, RelayMessage::Closed { channel });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn claim(addr: SocketAddr, id: Option<&str>) -> (TcpStream, RelayMessage) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &RelayMessage::Claim {
                id: id.map(str::to_string),
            },
        )
        .await
        .unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_broker_start() {
        let broker = Broker::start(0).await.unwrap();
        assert!(broker.addr().port() > 0);
        broker.shutdown();
    }

    #[tokio::test]
    async fn test_claim_uniqueness() {
        let broker = Broker::start(0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], broker.addr().port()));

        let (_first, reply) = claim(addr, Some("hub_kitchen_007")).await;
        assert_eq!(
            reply,
            RelayMessage::Claimed {
                id: "hub_kitchen_007".into()
            }
        );

        let (_second, reply) = claim(addr, Some("hub_kitchen_007")).await;
        match reply {
            RelayMessage::ClaimRejected { kind, .. } => assert_eq!(kind, "unavailable-id"),
            other => panic!("Unexpected reply: {:?}", other),
        }

        let (_third, reply) = claim(addr, None).await;
        assert!(matches!(reply, RelayMessage::Claimed { .. }));
        assert_eq!(broker.identities().await.len(), 2);

        broker.shutdown();
    }

    #[tokio::test]
    async fn test_relay_and_disconnect_cleanup() {
        let broker = Broker::start(0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], broker.addr().port()));

        let (mut a, _) = claim(addr, Some("a")).await;
        let (mut b, _) = claim(addr, Some("b")).await;

        let channel = Uuid::new_v4();
        write_frame(
            &mut a,
            &RelayMessage::Connect {
                channel,
                to: "b".into(),
                metadata: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            RelayMessage::Incoming {
                channel,
                from: "a".into(),
                metadata: None
            }
        );
        assert_eq!(
            read_frame(&mut a).await.unwrap(),
            RelayMessage::Opened { channel }
        );

        let payload = serde_json::json!({"type": "ping", "payload": {}});
        write_frame(
            &mut b,
            &RelayMessage::Data {
                channel,
                payload: payload.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            read_frame(&mut a).await.unwrap(),
            RelayMessage::Data { channel, payload }
        );

        b.shutdown().await.unwrap();
        drop(b);
        assert_eq!(
            read_frame(&mut a).await.unwrap(),
            RelayMessage::Closed { channel }
        );
        assert_eq!(broker.channel_count().await, 0);
        assert_eq!(broker.identities().await, vec!["a".to_string()]);

        broker.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_unknown_identity() {
        let broker = Broker::start(0).await.unwrap();
        let addr = SocketAddr::from(([127, 0, 0, 1], broker.addr().port()));
        let (mut a, _) = claim(addr, Some("a")).await;

        let channel = Uuid::new_v4();
        write_frame(
            &mut a,
            &RelayMessage::Connect {
                channel,
                to: "nobody".into(),
                metadata: None,
            },
        )
        .await
        .unwrap();

        match read_frame(&mut a).await.unwrap() {
            RelayMessage::ConnectFailed { kind, .. } => assert_eq!(kind, "peer-unavailable"),
            other => panic!("Unexpected reply: {:?}", other),
        }
        broker.shutdown();
    }
}
