//! In-process assistant used when no external provider is wired in.
//!
//! Conversations live in memory. A run is "computed" by elapsed time: it is
//! queued for the first quarter of the configured latency, in progress until
//! the latency has passed, and completed afterwards, at which point the reply
//! is appended to the conversation.

use super::{Handle, RemoteConversationService, RemoteTurn, Role, RunStatus, RunTicket, TurnOrder};
use crate::{Result, SolaceError};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

const ID_LEN: usize = 24;

struct LocalRun {
    started: Instant,
    reply: String,
    delivered: bool,
}

#[derive(Default)]
struct Conversation {
    turns: Vec<RemoteTurn>,
    runs: HashMap<String, LocalRun>,
}

/// Reflective-listening responder with simulated run latency.
pub struct LocalAssistant {
    latency: Duration,
    conversations: Mutex<HashMap<Handle, Conversation>>,
}

impl LocalAssistant {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Drop a conversation, as a provider would after its retention window.
    pub fn expire(&self, handle: &Handle) -> Result<bool> {
        Ok(self.conversations()?.remove(handle).is_some())
    }

    pub fn conversation_count(&self) -> Result<usize> {
        Ok(self.conversations()?.len())
    }

    fn conversations(&self) -> Result<MutexGuard<'_, HashMap<Handle, Conversation>>> {
        self.conversations.lock().map_err(|_| {
            SolaceError::RemoteUnavailable("local assistant state poisoned".to_string())
        })
    }

    fn status_of(&self, run: &LocalRun) -> RunStatus {
        let elapsed = run.started.elapsed();
        if run.delivered || elapsed >= self.latency {
            RunStatus::Completed
        } else if elapsed < self.latency / 4 {
            RunStatus::Queued
        } else {
            RunStatus::InProgress
        }
    }
}

impl Default for LocalAssistant {
    fn default() -> Self {
        Self::new(Duration::from_millis(800))
    }
}

#[async_trait]
impl RemoteConversationService for LocalAssistant {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_handle(&self) -> Result<Handle> {
        let handle = Handle(format!("conv_{}", random_id()));
        self.conversations()?
            .insert(handle.clone(), Conversation::default());
        Ok(handle)
    }

    async fn append_turn(&self, handle: &Handle, content: &str, role: Role) -> Result<()> {
        let mut conversations = self.conversations()?;
        let conversation = conversations
            .get_mut(handle)
            .ok_or_else(|| SolaceError::InvalidHandle(handle.to_string()))?;
        conversation.turns.push(RemoteTurn {
            id: format!("turn_{}", random_id()),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn start_run(&self, handle: &Handle) -> Result<RunTicket> {
        let mut conversations = self.conversations()?;
        let conversation = conversations
            .get_mut(handle)
            .ok_or_else(|| SolaceError::InvalidHandle(handle.to_string()))?;

        let last_user = conversation
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.content.as_str())
            .unwrap_or_default();
        let reply = compose_reply(last_user);

        let run_id = format!("run_{}", random_id());
        conversation.runs.insert(
            run_id.clone(),
            LocalRun {
                started: Instant::now(),
                reply,
                delivered: false,
            },
        );

        Ok(RunTicket {
            handle: handle.clone(),
            run_id,
        })
    }

    async fn run_status(&self, ticket: &RunTicket) -> Result<RunStatus> {
        let mut conversations = self.conversations()?;
        // A conversation dropped mid-run reads as an expired run.
        let Some(conversation) = conversations.get_mut(&ticket.handle) else {
            return Ok(RunStatus::Expired);
        };
        let Some(run) = conversation.runs.get_mut(&ticket.run_id) else {
            return Ok(RunStatus::Expired);
        };

        let status = self.status_of(run);
        if status == RunStatus::Completed && !run.delivered {
            run.delivered = true;
            let content = run.reply.clone();
            conversation.turns.push(RemoteTurn {
                id: format!("turn_{}", random_id()),
                role: Role::Assistant,
                content,
                created_at: Utc::now(),
            });
        }
        Ok(status)
    }

    async fn list_turns(
        &self,
        handle: &Handle,
        limit: usize,
        order: TurnOrder,
    ) -> Result<Vec<RemoteTurn>> {
        let conversations = self.conversations()?;
        let conversation = conversations
            .get(handle)
            .ok_or_else(|| SolaceError::InvalidHandle(handle.to_string()))?;

        let turns: Vec<RemoteTurn> = match order {
            TurnOrder::OldestFirst => conversation.turns.iter().take(limit).cloned().collect(),
            TurnOrder::NewestFirst => conversation.turns.iter().rev().take(limit).cloned().collect(),
        };
        Ok(turns)
    }
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

/// Keyword cues and the reflection offered when one appears in a message.
const REFLECTIONS: &[(&[&str], &str)] = &[
    (
        &["anxious", "anxiety", "worried", "nervous", "panic"],
        "It sounds like there is a lot of worry sitting with you right now.",
    ),
    (
        &["sad", "down", "depressed", "lonely", "cry"],
        "That sounds really heavy, and it makes sense that you feel low.",
    ),
    (
        &["angry", "furious", "annoyed", "frustrated"],
        "I can hear how frustrated you are, and that feeling deserves room.",
    ),
    (
        &["tired", "exhausted", "sleep", "burned out", "burnout"],
        "Being that worn out makes everything harder to carry.",
    ),
    (&["hello", "hi", "hey"], "Hello, I'm glad you reached out."),
];

const FOLLOW_UPS: &[&str] = &[
    "What feels most important to talk about right now?",
    "Could you tell me a bit more about what that has been like?",
    "When did you first notice feeling this way?",
    "What usually helps, even a little, when it gets like this?",
];

fn compose_reply(message: &str) -> String {
    let lowered = message.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let reflection = REFLECTIONS
        .iter()
        .find(|(cues, _)| {
            cues.iter().any(|cue| {
                if cue.contains(' ') {
                    lowered.contains(cue)
                } else {
                    words.contains(cue)
                }
            })
        })
        .map(|(_, text)| *text)
        .unwrap_or("Thank you for sharing that with me.");

    let follow_up = FOLLOW_UPS[rand::thread_rng().gen_range(0..FOLLOW_UPS.len())];
    format!("{} {}", reflection, follow_up)
}
