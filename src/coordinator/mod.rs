//! Request coordinator: one user turn in, one assistant turn out.
//!
//! ```text
//! user turn ─► persist ─► session handle ─► append turn ─► start run
//!                          (stored │ pool │ on demand)          │
//!                                                               ▼
//!          persist reply ◄─ newest assistant turn ◄─ RunWaiter::wait
//! ```
//!
//! This is the only component that touches the transcript store. The user
//! turn is persisted first; any failure after that is reported as
//! [`SolaceError::PartialTurn`] so callers can tell the message was kept
//! without a reply.

use crate::pool::{HandlePool, PoolStatus};
use crate::remote::{Handle, RemoteConversationService, Role, RunTicket, TurnOrder};
use crate::session::SessionLocks;
use crate::store::{Message, StoreHandle};
use crate::waiter::{PollPolicy, RunWaiter};
use crate::{Result, SolaceError};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Reply stored when a run completes without any readable assistant output.
pub const FALLBACK_REPLY: &str =
    "I'm sorry, I couldn't find the right words just now. Could you tell me that again?";

/// How many recent turns to scan for the reply.
const RECENT_TURN_LIMIT: usize = 20;

/// Both halves of a completed turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnExchange {
    pub user_message: Message,
    pub assistant_response: Message,
}

pub struct RequestCoordinator {
    remote: Arc<dyn RemoteConversationService>,
    pool: HandlePool,
    waiter: RunWaiter,
    store: StoreHandle,
    sessions: SessionLocks,
}

impl RequestCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteConversationService>,
        pool: HandlePool,
        poll: PollPolicy,
        store: StoreHandle,
    ) -> Result<Self> {
        Ok(Self {
            waiter: RunWaiter::new(remote.clone(), poll)?,
            remote,
            pool,
            store,
            sessions: SessionLocks::new(),
        })
    }

    pub fn pool(&self) -> &HandlePool {
        &self.pool
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Relay a user turn and return it together with the assistant's reply.
    pub async fn submit_turn(
        &self,
        session_id: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnExchange> {
        if session_id.trim().is_empty() {
            return Err(SolaceError::InvalidInput("session id is required".to_string()));
        }
        if content.trim().is_empty() {
            return Err(SolaceError::InvalidInput("message content is empty".to_string()));
        }

        let _session = self.sessions.lock(session_id).await;
        let user_message = self.store
            .append_message(session_id, Role::User, content)
            .await?;

        match self.reply_to(session_id, &user_message, cancel).await {
            Ok(assistant_response) => Ok(TurnExchange {
                user_message,
                assistant_response,
            }),
            Err(e) => {
                tracing::error!("Turn {} in session {} failed: {}", user_message.id, session_id, e);
                Err(SolaceError::PartialTurn {
                    user_turn: Box::new(user_message),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Persisted messages of a session, oldest first.
    pub async fn history(&self, session_id: &str) -> Result<Vec<Message>> {
        self.store.messages_for_session(session_id).await
    }

    /// Forget a session's messages and its remote conversation.
    ///
    /// Waits for any turn in flight on the session to finish first.
    pub async fn clear_session(&self, session_id: &str) -> Result<usize> {
        let _session = self.sessions.lock(session_id).await;
        let removed = self.store.clear_session(session_id).await?;
        tracing::info!("Cleared {} messages from session {}", removed, session_id);
        Ok(removed)
    }

    async fn reply_to(
        &self,
        session_id: &str,
        user_message: &Message,
        cancel: &CancellationToken,
    ) -> Result<Message> {
        let handle = match self.store.session_handle(session_id).await? {
            Some(handle) => handle,
            None => self.attach_handle(session_id).await?,
        };

        let ticket = match self.submit(&handle, &user_message.content).await {
            Err(SolaceError::InvalidHandle(reason)) => {
                tracing::warn!(
                    "Handle {} of session {} rejected ({}), attaching a new one",
                    handle,
                    session_id,
                    reason
                );
                self.store.forget_session_handle(session_id).await?;
                let fresh = self.attach_handle(session_id).await?;
                self.submit(&fresh, &user_message.content).await?
            }
            other => other?,
        };

        let status = self.waiter.wait(&ticket, cancel).await?;
        if !status.is_success() {
            return Err(SolaceError::RunFailed {
                status: status.to_string(),
            });
        }

        let reply = match self.latest_reply(&ticket.handle).await {
            Ok(reply) => reply,
            Err(SolaceError::NoAssistantTurnFound) => {
                tracing::warn!(
                    "Run {} completed without a reply, using fallback",
                    ticket.run_id
                );
                FALLBACK_REPLY.to_string()
            }
            Err(e) => return Err(e),
        };

        self.store
            .append_message(session_id, Role::Assistant, &reply)
            .await
    }

    /// Give a session a handle: pooled if one is warm, otherwise created now.
    async fn attach_handle(&self, session_id: &str) -> Result<Handle> {
        let handle = match self.pool.take() {
            Some(handle) => handle,
            None => {
                tracing::debug!("Pool empty, creating handle for session {}", session_id);
                self.pool.create_on_demand().await?
            }
        };
        self.store.set_session_handle(session_id, &handle).await?;
        tracing::info!("Session {} attached to handle {}", session_id, handle);
        Ok(handle)
    }

    async fn submit(&self, handle: &Handle, content: &str) -> Result<RunTicket> {
        self.remote.append_turn(handle, content, Role::User).await?;
        self.remote.start_run(handle).await
    }

    /// Newest assistant turn after the most recent user turn.
    async fn latest_reply(&self, handle: &Handle) -> Result<String> {
        let turns = self
            .remote
            .list_turns(handle, RECENT_TURN_LIMIT, TurnOrder::NewestFirst)
            .await?;

        turns
            .iter()
            .take_while(|turn| turn.role == Role::Assistant)
            .find(|turn| !turn.content.trim().is_empty())
            .map(|turn| turn.content.clone())
            .ok_or(SolaceError::NoAssistantTurnFound)
    }
}
