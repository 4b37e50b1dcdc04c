//! Error types for Huddle Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid room: {0}")]
    InvalidRoom(String),

    #[error("Invalid password: {0}")]
    InvalidPassword(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Attachment error: {0}")]
    Attachment(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
