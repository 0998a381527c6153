//! Solace: a therapy-chat backend.
//!
//! Every user turn is relayed to a remote conversational assistant. Creating a
//! remote conversation is slow, so a small pool of handles is kept warm in the
//! background and a session's first turn takes one from the pool instead of
//! waiting on the remote service.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod pool;
pub mod remote;
pub mod server;
pub mod session;
pub mod store;
pub mod waiter;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolaceError {
    #[error("Remote service unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote rejected conversation handle: {0}")]
    InvalidHandle(String),

    #[error("Assistant run failed with status: {status}")]
    RunFailed { status: String },

    #[error("No assistant reply found in conversation")]
    NoAssistantTurnFound,

    #[error("Timed out after {0:?} waiting for assistant run")]
    WaitTimedOut(std::time::Duration),

    #[error("Wait for assistant run was cancelled")]
    WaitCancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{source} (message {} was saved without a reply)", .user_turn.id)]
    PartialTurn {
        user_turn: Box<store::Message>,
        #[source]
        source: Box<SolaceError>,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),
}

impl SolaceError {
    /// The innermost error, looking through `PartialTurn` wrappers.
    pub fn root(&self) -> &SolaceError {
        match self {
            SolaceError::PartialTurn { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, SolaceError>;
