//! Participant profile model

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::room::random_base36;
use crate::error::{Error, Result};

/// Maximum username length in characters
pub const MAX_USERNAME_LEN: usize = 30;

/// Username shown for members whose profile has not arrived yet
pub const UNKNOWN_USERNAME: &str = "Unknown";

/// Names handed out to anonymous participants
const DISH_NAMES: &[&str] = &[
    "Ramen", "Sushi", "Tempura", "Yakitori", "Udon", "Soba", "Takoyaki", "Gyoza",
    "Bibimbap", "Kimchi", "Bulgogi", "Tteokbokki", "Mapo Tofu", "Peking Duck", "Hot Pot",
    "Dim Sum", "Spring Roll", "Dumplings", "Wonton", "Xiaolongbao", "Pad Thai", "Tom Yum",
    "Green Curry", "Satay", "Pho", "Banh Mi", "Nasi Goreng", "Rendang", "Biryani",
    "Samosa", "Naan", "Dosa", "Falafel", "Hummus", "Shawarma", "Laksa", "Pizza",
    "Lasagna", "Risotto", "Carbonara", "Tiramisu", "Gelato", "Gnocchi", "Paella",
    "Gazpacho", "Churros", "Croissant", "Baguette", "Crepe", "Quiche", "Ratatouille",
    "Macaron", "Fish and Chips", "Scone", "Pretzel", "Schnitzel", "Moussaka", "Baklava",
    "Pierogi", "Borscht", "Goulash", "Hamburger", "Pancake", "Waffle", "Taco", "Burrito",
    "Nachos", "Empanada", "Ceviche", "Poutine",
];

/// Public identity a participant announces to the room.
///
/// Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantProfile {
    pub user_id: String,
    pub username: String,
    pub avatar_seed: String,
}

impl ParticipantProfile {
    /// Build a validated profile
    pub fn new(user_id: String, username: String, avatar_seed: String) -> Result<Self> {
        if user_id.trim().is_empty() {
            return Err(Error::InvalidProfile("user id is empty".into()));
        }
        if !is_valid_username(&username) {
            return Err(Error::InvalidProfile(format!(
                "username must be 1..={} characters",
                MAX_USERNAME_LEN
            )));
        }

        Ok(Self {
            user_id,
            username,
            avatar_seed,
        })
    }

    /// Fresh anonymous profile with a random dish name
    pub fn generate() -> Self {
        let username = random_username();
        Self {
            user_id: generate_user_id(),
            avatar_seed: username.clone(),
            username,
        }
    }

    /// Anonymous profile using a chosen name
    pub fn with_username(username: &str) -> Result<Self> {
        Self::new(
            generate_user_id(),
            username.to_string(),
            username.to_string(),
        )
    }

    /// Stand-in used until a member announces itself
    pub fn placeholder(peer_id: &str) -> Self {
        Self {
            user_id: peer_id.to_string(),
            username: UNKNOWN_USERNAME.to_string(),
            avatar_seed: peer_id.to_string(),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.username == UNKNOWN_USERNAME && self.user_id == self.avatar_seed
    }
}

/// `user_<unix millis>_<9 base36 chars>`
pub fn generate_user_id() -> String {
    format!("user_{}_{}", Utc::now().timestamp_millis(), random_base36(9))
}

pub fn is_valid_username(username: &str) -> bool {
    let len = username.chars().count();
    len > 0 && len <= MAX_USERNAME_LEN
}

/// Random dish name
pub fn random_username() -> String {
    DISH_NAMES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("Dumplings")
        .to_string()
}

/// Deterministic dish name for a seed
pub fn username_for_seed(seed: &str) -> String {
    let hash = seed
        .encode_utf16()
        .fold(0i32, |h, c| h.wrapping_shl(5).wrapping_sub(h).wrapping_add(c as i32));
    let index = hash.unsigned_abs() as usize % DISH_NAMES.len();
    DISH_NAMES[index].to_string()
}
