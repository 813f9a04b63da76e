pub mod bridge;
pub mod cli;
pub mod config;
pub mod db;
pub mod event;
pub mod extract;
pub mod fold;
pub mod ledger;
pub mod schema;
pub mod session;
pub mod status;
pub mod summarizer;
pub mod trigger;

#[derive(Debug)]
pub enum RecapError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
    Summarizer(String),
    Pairing(String),
    /// A ledger write or read the store cannot represent or complete.
    Ledger(String),
    Bridge(String),
}

impl std::fmt::Display for RecapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecapError::Database(e) => write!(f, "database: {e}"),
            RecapError::Io(e) => write!(f, "io: {e}"),
            RecapError::Json(e) => write!(f, "json: {e}"),
            RecapError::Config(msg) => write!(f, "config: {msg}"),
            RecapError::Summarizer(msg) => write!(f, "summarizer: {msg}"),
            RecapError::Pairing(msg) => write!(f, "pairing: {msg}"),
            RecapError::Ledger(msg) => write!(f, "ledger: {msg}"),
            RecapError::Bridge(msg) => write!(f, "bridge: {msg}"),
        }
    }
}

impl std::error::Error for RecapError {}

impl From<rusqlite::Error> for RecapError {
    fn from(e: rusqlite::Error) -> Self {
        RecapError::Database(e)
    }
}

impl From<std::io::Error> for RecapError {
    fn from(e: std::io::Error) -> Self {
        RecapError::Io(e)
    }
}

impl From<serde_json::Error> for RecapError {
    fn from(e: serde_json::Error) -> Self {
        RecapError::Json(e)
    }
}

impl From<rusqlite_migration::Error> for RecapError {
    fn from(e: rusqlite_migration::Error) -> Self {
        match e {
            rusqlite_migration::Error::RusqliteError { query: _, err } => RecapError::Database(err),
            other => RecapError::Config(format!("migration: {other}")),
        }
    }
}
