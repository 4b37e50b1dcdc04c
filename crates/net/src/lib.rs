//! Huddle Network Library
//!
//! Room signaling and the peer mesh on top of a pluggable transport.
//!
//! # Architecture
//!
//! - **Election**: every participant tries to claim `hub_<room>_<password>`;
//!   the winner becomes the room's hub
//! - **Hub directory**: the hub tracks members and gossips joins and leaves
//! - **Discovery**: everyone else joins the hub and learns who to dial
//! - **Mesh**: direct channels between all participants carry chat traffic
//! - **Transport**: in-memory for tests, TCP through a relay [`Broker`]
//!
//! # Usage
//!
//! ```ignore
//! let transport = Arc::new(TcpTransport::new("127.0.0.1:7331"));
//! let room = RoomKey::new("kitchen", "007")?;
//! let mut session = Session::start(transport, room, profile, SessionConfig::default()).await?;
//!
//! while let Some(event) = session.next_event().await {
//!     match event {
//!         SessionEvent::Message(msg) => { /* handle */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod broker;
pub mod discovery;
pub mod election;
pub mod error;
mod frame;
pub mod hub;
pub mod mesh;
pub mod protocol;
pub mod session;
pub mod transport;

pub use broker::Broker;
pub use election::{elect, Election};
pub use error::{Error, Result};
pub use protocol::{MeshMessage, SignalMessage, UserInfo};
pub use session::{Role, Session, SessionEvent};
pub use transport::{MemoryNetwork, TcpTransport, Transport, TransportError};

/// Default port for the relay broker
pub const DEFAULT_PORT: u16 = 7331;
