//! Huddle Core Library
//!
//! Room keys, participant profiles, chat messages, in-memory room state and
//! configuration shared by the network layer and the app.

pub mod config;
pub mod error;
pub mod models;
pub mod state;

pub use config::{RetryPolicy, SessionConfig};
pub use error::{Error, Result};
pub use models::*;
pub use state::{PeerEntry, RoomState};
