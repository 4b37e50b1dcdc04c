//! TCP transport through a relay broker
//!
//! Each claimed identity is one TCP connection to the broker. Channels are
//! multiplexed over it by id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Channel, Dialer, Endpoint, EventSink, Link, Outbound, Transport, TransportError};
use crate::error::Error;
use crate::frame::{read_frame, write_frame};
use crate::protocol::RelayMessage;

/// Transport that claims identities on a [`crate::broker::Broker`]
#[derive(Debug, Clone)]
pub struct TcpTransport {
    broker_addr: String,
}

impl TcpTransport {
    pub fn new(broker_addr: impl Into<String>) -> Self {
        Self {
            broker_addr: broker_addr.into(),
        }
    }
}

fn socket_error(e: Error) -> TransportError {
    match e {
        Error::ConnectionClosed => TransportError::SocketClosed,
        other => TransportError::Socket(other.to_string()),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn claim(&self, id: Option<String>) -> Result<Endpoint, TransportError> {
        let stream = TcpStream::connect(&self.broker_addr)
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_frame(&mut writer, &RelayMessage::Claim { id })
            .await
            .map_err(socket_error)?;

        let id = match read_frame(&mut reader).await.map_err(socket_error)? {
            RelayMessage::Claimed { id } => id,
            RelayMessage::ClaimRejected { kind, reason } => {
                return Err(TransportError::from_kind(&kind, reason));
            }
            other => {
                return Err(TransportError::Other(format!(
                    "Unexpected claim reply: {:?}",
                    other
                )));
            }
        };

        info!(broker = %self.broker_addr, id = %id, "Identity claimed on broker");

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(reader_task(reader, frame_tx));
        tokio::spawn(connection_task(
            writer,
            frame_rx,
            cmd_rx,
            cmd_tx.downgrade(),
            incoming_tx,
        ));

        let link = Arc::new(TcpLink { cmd_tx });
        Ok(Endpoint::new(Dialer::new(&id, link), incoming_rx))
    }
}

enum Command {
    Open {
        channel: Uuid,
        to: String,
        metadata: Option<Value>,
        sink: EventSink,
    },
    Data {
        channel: Uuid,
        payload: Value,
    },
    Close {
        channel: Uuid,
    },
    Release,
}

struct TcpLink {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Link for TcpLink {
    fn open(&self, _from: &str, to: &str, metadata: Option<Value>) -> Channel {
        let (channel, pump) = Channel::pair(to, None);
        let id = Uuid::new_v4();

        let open = Command::Open {
            channel: id,
            to: to.to_string(),
            metadata,
            sink: pump.sink.clone(),
        };
        if self.cmd_tx.send(open).is_err() {
            pump.sink.failed(TransportError::Disconnected);
            return channel;
        }

        tokio::spawn(forward_outbound(id, pump.outbound, self.cmd_tx.clone()));
        channel
    }

    fn release(&self, id: &str) {
        debug!(id = %id, "Releasing broker identity");
        let _ = self.cmd_tx.send(Command::Release);
    }
}

/// Turn a channel's outbound queue into connection commands
async fn forward_outbound(
    channel: Uuid,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) {
    while let Some(out) = outbound.recv().await {
        match out {
            Outbound::Data(payload) => {
                if cmd_tx.send(Command::Data { channel, payload }).is_err() {
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = cmd_tx.send(Command::Close { channel });
}

/// Reader task - decodes frames from the broker
async fn reader_task(mut reader: ReadHalf<TcpStream>, tx: mpsc::UnboundedSender<RelayMessage>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    break;
                }
            }
            Err(Error::ConnectionClosed) => {
                debug!("Broker closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Read error");
                break;
            }
        }
    }
}

/// Main connection task: owns the writer and every channel's event sink
async fn connection_task(
    mut writer: WriteHalf<TcpStream>,
    mut frame_rx: mpsc::UnboundedReceiver<RelayMessage>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    incoming_tx: mpsc::UnboundedSender<Channel>,
) {
    let mut sinks: HashMap<Uuid, EventSink> = HashMap::new();

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(msg) = frame else {
                    debug!("Broker connection lost");
                    break;
                };
                if let Some(reply) = handle_relay(msg, &mut sinks, &cmd_tx, &incoming_tx) {
                    if let Err(e) = write_frame(&mut writer, &reply).await {
                        warn!(error = %e, "Write error");
                        break;
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                let frame = match cmd {
                    Some(Command::Open { channel, to, metadata, sink }) => {
                        sinks.insert(channel, sink);
                        RelayMessage::Connect { channel, to, metadata }
                    }
                    Some(Command::Data { channel, payload }) => {
                        if !sinks.contains_key(&channel) {
                            continue;
                        }
                        RelayMessage::Data { channel, payload }
                    }
                    Some(Command::Close { channel }) => {
                        let Some(sink) = sinks.remove(&channel) else {
                            continue;
                        };
                        sink.closed();
                        RelayMessage::Close { channel }
                    }
                    Some(Command::Release) | None => {
                        debug!("Release requested");
                        break;
                    }
                };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!(error = %e, "Write error");
                    break;
                }
            }
        }
    }

    for (_, sink) in sinks.drain() {
        if sink.is_open() {
            sink.closed();
        } else {
            sink.failed(TransportError::Disconnected);
        }
    }

    // the reader still holds the socket; shutdown lets the broker see EOF
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Shutdown failed");
    }
}

/// Apply one broker message; returns a frame to send back, if any
fn handle_relay(
    msg: RelayMessage,
    sinks: &mut HashMap<Uuid, EventSink>,
    cmd_tx: &mpsc::WeakUnboundedSender<Command>,
    incoming_tx: &mpsc::UnboundedSender<Channel>,
) -> Option<RelayMessage> {
    match msg {
        RelayMessage::Incoming {
            channel,
            from,
            metadata,
        } => {
            let Some(cmd_tx) = cmd_tx.upgrade() else {
                return Some(RelayMessage::Close { channel });
            };
            let (ch, pump) = Channel::pair(&from, metadata);
            pump.sink.opened();
            if incoming_tx.send(ch).is_err() {
                debug!(from = %from, "Nobody accepting channels, closing");
                return Some(RelayMessage::Close { channel });
            }
            sinks.insert(channel, pump.sink);
            tokio::spawn(forward_outbound(channel, pump.outbound, cmd_tx));
        }
        RelayMessage::Opened { channel } => {
            if let Some(sink) = sinks.get(&channel) {
                sink.opened();
            }
        }
        RelayMessage::ConnectFailed {
            channel,
            kind,
            reason,
        } => {
            if let Some(sink) = sinks.remove(&channel) {
                sink.failed(TransportError::from_kind(&kind, reason));
            }
        }
        RelayMessage::Data { channel, payload } => match sinks.get(&channel) {
            Some(sink) => sink.deliver(payload),
            None => debug!(channel = %channel, "Data for unknown channel"),
        },
        RelayMessage::Closed { channel } => {
            if let Some(sink) = sinks.remove(&channel) {
                sink.closed();
            }
        }
        RelayMessage::Ping => return Some(RelayMessage::Pong),
        RelayMessage::Pong => debug!("Received pong"),
        _ => debug!("Ignoring unexpected message"),
    }
    None
}
