//! Scripted remote service for unit tests.

use super::{Handle, RemoteConversationService, RemoteTurn, Role, RunStatus, RunTicket, TurnOrder};
use crate::{Result, SolaceError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) struct ScriptedRemote {
    next_id: AtomicUsize,
    create_attempts: AtomicUsize,
    failing_creates: AtomicUsize,
    create_delay: Mutex<Duration>,
    statuses: Mutex<VecDeque<RunStatus>>,
    status_times: Mutex<Vec<Instant>>,
    fail_status: AtomicBool,
    invalid: Mutex<HashSet<Handle>>,
    turns: Mutex<HashMap<Handle, Vec<RemoteTurn>>>,
    delivered: Mutex<HashSet<String>>,
    reply: Mutex<Option<String>>,
}

impl ScriptedRemote {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            create_attempts: AtomicUsize::new(0),
            failing_creates: AtomicUsize::new(0),
            create_delay: Mutex::new(Duration::ZERO),
            statuses: Mutex::new(VecDeque::new()),
            status_times: Mutex::new(Vec::new()),
            fail_status: AtomicBool::new(false),
            invalid: Mutex::new(HashSet::new()),
            turns: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashSet::new()),
            reply: Mutex::new(Some("I hear you.".to_string())),
        }
    }

    /// Statuses returned by successive checks; `Completed` once exhausted.
    pub(crate) fn script_statuses(&self, statuses: impl IntoIterator<Item = RunStatus>) {
        *self.statuses.lock().unwrap() = statuses.into_iter().collect();
    }

    /// Fail the next `count` handle creations.
    pub(crate) fn fail_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub(crate) fn fail_status_checks(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn invalidate(&self, handle: &Handle) {
        self.invalid.lock().unwrap().insert(handle.clone());
    }

    /// Assistant text appended when a run completes; `None` appends nothing.
    pub(crate) fn set_reply(&self, reply: Option<&str>) {
        *self.reply.lock().unwrap() = reply.map(str::to_string);
    }

    pub(crate) fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.status_times.lock().unwrap().len()
    }

    pub(crate) fn status_call_times(&self) -> Vec<Instant> {
        self.status_times.lock().unwrap().clone()
    }

    pub(crate) fn turns_for(&self, handle: &Handle) -> Vec<RemoteTurn> {
        self.turns
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .unwrap_or_default()
    }

    fn check_valid(&self, handle: &Handle) -> Result<()> {
        if self.invalid.lock().unwrap().contains(handle) {
            return Err(SolaceError::InvalidHandle(handle.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteConversationService for ScriptedRemote {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn create_handle(&self) -> Result<Handle> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SolaceError::RemoteUnavailable("scripted outage".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Handle(format!("h-{}", id)))
    }

    async fn append_turn(&self, handle: &Handle, content: &str, role: Role) -> Result<()> {
        self.check_valid(handle)?;
        self.turns
            .lock()
            .unwrap()
            .entry(handle.clone())
            .or_default()
            .push(RemoteTurn {
                id: format!("t-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
                role,
                content: content.to_string(),
                created_at: Utc::now(),
            });
        Ok(())
    }

    async fn start_run(&self, handle: &Handle) -> Result<RunTicket> {
        self.check_valid(handle)?;
        Ok(RunTicket {
            handle: handle.clone(),
            run_id: format!("r-{}", self.next_id.fetch_add(1, Ordering::SeqCst)),
        })
    }

    async fn run_status(&self, ticket: &RunTicket) -> Result<RunStatus> {
        self.status_times.lock().unwrap().push(Instant::now());
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(SolaceError::RemoteUnavailable("scripted status outage".to_string()));
        }

        let status = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RunStatus::Completed);

        if status == RunStatus::Completed
            && self.delivered.lock().unwrap().insert(ticket.run_id.clone())
        {
            let reply = self.reply.lock().unwrap().clone();
            if let Some(reply) = reply {
                self.append_turn(&ticket.handle, &reply, Role::Assistant).await?;
            }
        }
        Ok(status)
    }

    async fn list_turns(
        &self,
        handle: &Handle,
        limit: usize,
        order: TurnOrder,
    ) -> Result<Vec<RemoteTurn>> {
        let mut turns = self.turns_for(handle);
        if order == TurnOrder::NewestFirst {
            turns.reverse();
        }
        turns.truncate(limit);
        Ok(turns)
    }
}
