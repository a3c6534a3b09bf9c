use thiserror::Error;

use crate::session::UserId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Session not found for user {0}")]
    SessionNotFound(UserId),

    #[error("Task is no longer current")]
    StaleTask,

    #[error("A {0} request is already pending")]
    GateBusy(crate::gate::GateType),

    #[error("Execution client error: {0}")]
    Client(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
