//! Client discovery
//!
//! Non-hub participants open a signaling channel to the rendezvous identity,
//! announce their profile, then learn about other members from the hub's
//! `peer_list` / `peer_joined` / `peer_left` messages.

use std::time::Duration;

use huddle_core::{ParticipantProfile, RetryPolicy};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::SignalMessage;
use crate::transport::{Channel, ChannelEvent, ConnectOptions, Dialer};

/// What a signaling message means for the local mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Connect to this identity
    Discovered(String),
    /// The hub saw this identity leave
    Left(String),
}

/// Open a signaling channel to the hub and announce `profile`.
///
/// Each attempt waits up to `open_timeout` for the channel to open. Failed
/// attempts back off `base * 2^(attempt-1)` before the next one; after
/// `policy.limit` attempts the join fails with [`Error::HubUnreachable`].
pub async fn join_hub(
    dialer: &Dialer,
    rendezvous: &str,
    profile: &ParticipantProfile,
    open_timeout: Duration,
    policy: RetryPolicy,
) -> Result<Channel> {
    let metadata = serde_json::to_value(profile)?;

    for attempt in 1..=policy.limit {
        debug!(rendezvous = %rendezvous, attempt = attempt, "Connecting to hub");

        let mut channel = dialer.connect(
            rendezvous,
            ConnectOptions {
                metadata: Some(metadata.clone()),
            },
        );

        match tokio::time::timeout(open_timeout, wait_open(&mut channel)).await {
            Ok(Ok(())) => {
                channel
                    .handle()
                    .send(&SignalMessage::join(dialer.local_id(), profile))?;
                info!(rendezvous = %rendezvous, attempt = attempt, "Joined hub");
                return Ok(channel);
            }
            Ok(Err(e)) => {
                warn!(rendezvous = %rendezvous, attempt = attempt, error = %e, "Hub connection failed");
            }
            Err(_) => {
                warn!(rendezvous = %rendezvous, attempt = attempt, "Hub connection timed out");
            }
        }
        channel.handle().close();

        if attempt < policy.limit {
            let delay = policy.delay(attempt - 1);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before next hub attempt");
            tokio::time::sleep(delay).await;
        }
    }

    Err(Error::HubUnreachable {
        attempts: policy.limit,
    })
}

async fn wait_open(channel: &mut Channel) -> Result<()> {
    loop {
        match channel.next_event().await {
            Some(ChannelEvent::Open) => return Ok(()),
            Some(ChannelEvent::Error(e)) => return Err(e.into()),
            Some(ChannelEvent::Close) | None => return Err(Error::ChannelClosed),
            Some(ChannelEvent::Data(_)) => debug!("Data before open, ignoring"),
        }
    }
}

/// Translate a hub message into discovery events, never naming `local_id`
pub fn interpret(msg: SignalMessage, local_id: &str) -> Vec<DiscoveryEvent> {
    match msg {
        SignalMessage::PeerList { peers } => {
            info!(count = peers.len(), "Received peer list");
            peers
                .into_iter()
                .filter(|id| id != local_id)
                .map(DiscoveryEvent::Discovered)
                .collect()
        }
        SignalMessage::PeerJoined { peer_id } if peer_id != local_id => {
            vec![DiscoveryEvent::Discovered(peer_id)]
        }
        SignalMessage::PeerLeft { peer_id } if peer_id != local_id => {
            vec![DiscoveryEvent::Left(peer_id)]
        }
        SignalMessage::Join { .. } => {
            debug!("Ignoring join sent to a client");
            Vec::new()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryNetwork, Transport, TransportError};

    const HUB_ID: &str = "hub_kitchen_007";

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, 1000)
    }

    #[tokio::test]
    async fn test_join_announces_profile() {
        let net = MemoryNetwork::new();
        let mut hub = net.claim(Some(HUB_ID.into())).await.unwrap();
        let me = net.claim(Some("B".into())).await.unwrap();
        let profile = ParticipantProfile::generate();

        let _chan = join_hub(me.dialer(), HUB_ID, &profile, Duration::from_secs(15), policy())
            .await
            .unwrap();

        let mut inbound = hub.accept().await.unwrap();
        let seeded: ParticipantProfile =
            serde_json::from_value(inbound.handle().metadata().unwrap().clone()).unwrap();
        assert_eq!(seeded, profile);

        assert_eq!(inbound.next_event().await, Some(ChannelEvent::Open));
        match inbound.next_event().await {
            Some(ChannelEvent::Data(v)) => {
                assert_eq!(
                    SignalMessage::from_value(v).unwrap(),
                    SignalMessage::join("B", &profile)
                );
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_retries_then_succeeds() {
        let net = MemoryNetwork::new();
        let _hub = net.claim(Some(HUB_ID.into())).await.unwrap();
        let me = net.claim(Some("B".into())).await.unwrap();
        net.inject_failure(HUB_ID, TransportError::Network("blip".into()));
        net.inject_failure(HUB_ID, TransportError::Network("blip".into()));

        let start = tokio::time::Instant::now();
        let result = join_hub(
            me.dialer(),
            HUB_ID,
            &ParticipantProfile::generate(),
            Duration::from_secs(15),
            policy(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(net.dial_count(HUB_ID), 3);
        // 1s after the first failure, 2s after the second
        assert!(start.elapsed() >= Duration::from_millis(3000));
        assert!(start.elapsed() < Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_exhaustion() {
        let net = MemoryNetwork::new();
        let me = net.claim(Some("B".into())).await.unwrap();

        let err = join_hub(
            me.dialer(),
            HUB_ID,
            &ParticipantProfile::generate(),
            Duration::from_secs(15),
            policy(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::HubUnreachable { attempts: 3 }));
        assert_eq!(net.dial_count(HUB_ID), 3);
    }

    #[test]
    fn test_interpret_excludes_self() {
        let events = interpret(
            SignalMessage::PeerList {
                peers: vec!["A".into(), "B".into(), "C".into()],
            },
            "B",
        );
        assert_eq!(
            events,
            vec![
                DiscoveryEvent::Discovered("A".into()),
                DiscoveryEvent::Discovered("C".into())
            ]
        );

        assert!(interpret(SignalMessage::PeerJoined { peer_id: "B".into() }, "B").is_empty());
        assert_eq!(
            interpret(SignalMessage::PeerLeft { peer_id: "C".into() }, "B"),
            vec![DiscoveryEvent::Left("C".into())]
        );
    }
}
