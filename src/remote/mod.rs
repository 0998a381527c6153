//! Remote conversational-assistant abstraction.
//!
//! The chat backend never talks to a vendor API directly. Everything goes
//! through [`RemoteConversationService`], which models the five calls the
//! request path needs: create a conversation, append a turn, start a run,
//! poll the run, and read turns back.

mod local;
#[cfg(test)]
pub(crate) mod scripted;

pub use local::LocalAssistant;

use crate::{Result, SolaceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque reference to a remote conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub String);

impl Handle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(SolaceError::InvalidInput(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight remote computation tied to a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTicket {
    pub handle: Handle,
    pub run_id: String,
}

/// Status reported for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Expired,
    /// A status string the client does not understand.
    Unrecognized(String),
}

impl RunStatus {
    /// Parse a wire status. Unknown strings are kept verbatim.
    pub fn parse(value: &str) -> Self {
        match value {
            "queued" => RunStatus::Queued,
            "in_progress" => RunStatus::InProgress,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            "expired" => RunStatus::Expired,
            other => RunStatus::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Expired => "expired",
            RunStatus::Unrecognized(raw) => raw,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RunStatus::Queued | RunStatus::InProgress)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering for [`RemoteConversationService::list_turns`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOrder {
    NewestFirst,
    OldestFirst,
}

/// A turn as stored by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTurn {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait RemoteConversationService: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails with `RemoteUnavailable`.
    async fn create_handle(&self) -> Result<Handle>;

    /// Fails with `RemoteUnavailable` or `InvalidHandle`.
    async fn append_turn(&self, handle: &Handle, content: &str, role: Role) -> Result<()>;

    /// Fails with `RemoteUnavailable` or `InvalidHandle`.
    async fn start_run(&self, handle: &Handle) -> Result<RunTicket>;

    /// Fails with `RemoteUnavailable`.
    async fn run_status(&self, ticket: &RunTicket) -> Result<RunStatus>;

    /// Fails with `RemoteUnavailable`.
    async fn list_turns(
        &self,
        handle: &Handle,
        limit: usize,
        order: TurnOrder,
    ) -> Result<Vec<RemoteTurn>>;
}
