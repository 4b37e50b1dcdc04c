//! Rendezvous election
//!
//! Every participant tries to claim the room's rendezvous identity. The
//! transport guarantees uniqueness, so exactly one claim wins; the winner
//! becomes the room's hub and everybody else joins it as a client.

use std::time::Duration;

use huddle_core::RoomKey;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transport::{Endpoint, Transport, TransportError};

/// Outcome of an election attempt
pub enum Election {
    /// We hold the rendezvous identity
    Hub(Endpoint),
    /// Somebody else does
    Client,
}

impl Election {
    pub fn is_hub(&self) -> bool {
        matches!(self, Election::Hub(_))
    }
}

impl std::fmt::Debug for Election {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Election::Hub(endpoint) => write!(f, "Hub({})", endpoint.id()),
            Election::Client => f.write_str("Client"),
        }
    }
}

/// Try to claim `hub_<room>_<password>` within `timeout`.
///
/// A collision is an ordinary outcome. Any other failure, including the
/// timeout, is returned as an error and is not retried here.
pub async fn elect(transport: &dyn Transport, room: &RoomKey, timeout: Duration) -> Result<Election> {
    let rendezvous = room.rendezvous_id();
    debug!(rendezvous = %rendezvous, "Starting election");

    match tokio::time::timeout(timeout, transport.claim(Some(rendezvous.clone()))).await {
        Ok(Ok(endpoint)) => {
            info!(rendezvous = %rendezvous, "Became room hub");
            Ok(Election::Hub(endpoint))
        }
        Ok(Err(TransportError::UnavailableId(_))) => {
            info!(rendezvous = %rendezvous, "Hub already exists, joining as client");
            Ok(Election::Client)
        }
        Ok(Err(e)) => {
            warn!(rendezvous = %rendezvous, error = %e, "Election failed");
            Err(Error::Transport(e))
        }
        Err(_) => {
            warn!(rendezvous = %rendezvous, "Election timed out");
            Err(Error::ElectionTimeout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use async_trait::async_trait;

    fn kitchen() -> RoomKey {
        RoomKey::new("kitchen", "007").unwrap()
    }

    #[tokio::test]
    async fn test_single_hub_per_room() {
        let net = MemoryNetwork::new();

        let first = elect(&net, &kitchen(), Duration::from_secs(5)).await.unwrap();
        let second = elect(&net, &kitchen(), Duration::from_secs(5)).await.unwrap();
        let third = elect(&net, &kitchen(), Duration::from_secs(5)).await.unwrap();

        assert!(first.is_hub());
        assert!(!second.is_hub());
        assert!(!third.is_hub());
        assert!(net.is_claimed("hub_kitchen_007"));

        // another room is independent
        let other = RoomKey::new("kitchen", "008").unwrap();
        assert!(elect(&net, &other, Duration::from_secs(5)).await.unwrap().is_hub());
    }

    #[tokio::test]
    async fn test_released_hub_can_be_reclaimed() {
        let net = MemoryNetwork::new();
        let Election::Hub(endpoint) = elect(&net, &kitchen(), Duration::from_secs(5)).await.unwrap()
        else {
            panic!("Expected hub");
        };
        endpoint.release();

        assert!(elect(&net, &kitchen(), Duration::from_secs(5)).await.unwrap().is_hub());
    }

    struct Broken;

    #[async_trait]
    impl Transport for Broken {
        async fn claim(&self, _id: Option<String>) -> std::result::Result<Endpoint, TransportError> {
            Err(TransportError::Network("offline".into()))
        }
    }

    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn claim(&self, _id: Option<String>) -> std::result::Result<Endpoint, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_other_failures_surface() {
        let err = elect(&Broken, &kitchen(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Network(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_timeout() {
        let err = elect(&Stalled, &kitchen(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::ElectionTimeout));
    }
}
