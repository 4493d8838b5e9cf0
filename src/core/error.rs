use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: principal '{principal}' lacks {permission} permission")]
    Authorization {
        principal: String,
        permission: String,
    },
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Timing error: {0}")]
    Timing(String),
    #[error("Collision: address {address} already holds different content")]
    Collision { address: String },
    #[error("Insufficient fee: required {required}, paid {paid}")]
    InsufficientFee { required: u64, paid: u64 },
    #[error("Not found: {0}")]
    NotFound(String),
}
