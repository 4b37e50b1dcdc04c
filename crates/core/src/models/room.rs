//! Room key model
//!
//! A room is addressed by its name and a three-digit password. Both are
//! concatenated into the rendezvous identity every participant tries to claim.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Prefix of every rendezvous identity
pub const RENDEZVOUS_PREFIX: &str = "hub_";

/// Required number of password digits
pub const PASSWORD_DIGITS: usize = 3;

/// Room name plus password
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRoomKey")]
pub struct RoomKey {
    room_id: String,
    password: String,
}

/// Unvalidated form, deserialized first and checked by [`RoomKey::new`]
#[derive(Deserialize)]
struct RawRoomKey {
    room_id: String,
    password: String,
}

impl TryFrom<RawRoomKey> for RoomKey {
    type Error = Error;

    fn try_from(raw: RawRoomKey) -> Result<Self> {
        RoomKey::new(&raw.room_id, &raw.password)
    }
}

impl RoomKey {
    /// Validate and build a room key. The room id is trimmed.
    pub fn new(room_id: &str, password: &str) -> Result<Self> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(Error::InvalidRoom("room id is empty".into()));
        }
        if !is_valid_password(password) {
            return Err(Error::InvalidPassword(format!(
                "expected {} digits",
                PASSWORD_DIGITS
            )));
        }

        Ok(Self {
            room_id: room_id.to_string(),
            password: password.to_string(),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Deterministic identity of the room's hub: `hub_<room>_<password>`.
    ///
    /// Never hashed, so two keys only collide when their concatenations do.
    pub fn rendezvous_id(&self) -> String {
        format!("{}{}_{}", RENDEZVOUS_PREFIX, self.room_id, self.password)
    }

    /// Random room name in the form `room_xxxxxxxxx`
    pub fn random_room_id() -> String {
        format!("room_{}", random_base36(9))
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.room_id)
    }
}

/// Passwords are exactly three ASCII digits
pub fn is_valid_password(password: &str) -> bool {
    password.len() == PASSWORD_DIGITS && password.bytes().all(|b| b.is_ascii_digit())
}

/// Random lowercase base36 string
pub(crate) fn random_base36(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendezvous_id() {
        let key = RoomKey::new("kitchen", "007").unwrap();
        assert_eq!(key.rendezvous_id(), "hub_kitchen_007");

        let same = RoomKey::new("  kitchen ", "007").unwrap();
        assert_eq!(key.rendezvous_id(), same.rendezvous_id());

        let other = RoomKey::new("kitchen", "008").unwrap();
        assert_ne!(key.rendezvous_id(), other.rendezvous_id());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(RoomKey::new("   ", "123").is_err());
        assert!(RoomKey::new("room", "12").is_err());
        assert!(RoomKey::new("room", "1234").is_err());
        assert!(RoomKey::new("room", "12a").is_err());
        assert!(RoomKey::new("room", "").is_err());
    }

    #[test]
    fn test_random_room_id() {
        let id = RoomKey::random_room_id();
        assert!(id.starts_with("room_"));
        assert_eq!(id.len(), "room_".len() + 9);
        assert!(RoomKey::new(&id, "000").is_ok());
    }

    #[test]
    fn test_deserialize_validates() {
        let key: RoomKey =
            serde_json::from_str(r#"{"room_id": " kitchen ", "password": "007"}"#).unwrap();
        assert_eq!(key.rendezvous_id(), "hub_kitchen_007");

        let bad = serde_json::from_str::<RoomKey>(r#"{"room_id": "kitchen", "password": "7"}"#);
        assert!(bad.is_err());
        let empty = serde_json::from_str::<RoomKey>(r#"{"room_id": "  ", "password": "007"}"#);
        assert!(empty.is_err());
    }
}
