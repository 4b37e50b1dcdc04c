//! Data models for Huddle

mod message;
mod peer;
mod profile;
mod room;

pub use message::*;
pub use peer::*;
pub use profile::*;
pub use room::*;
