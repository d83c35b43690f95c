// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    /// Handler got a payload that does not belong to the topic it subscribed.
    #[error("topic {topic}: expected {expected} payload, got {got}")]
    Payload {
        topic: String,
        expected: &'static str,
        got: &'static str,
    },

    #[error("invalid bin size: {0}")]
    BinSize(String),

    #[error("config: {0}")]
    Config(String),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("processer {name} failed: {reason}")]
    Processer { name: String, reason: String },

    #[error("shutdown: {0}")]
    Shutdown(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
