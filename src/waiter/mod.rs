//! Adaptive-interval wait for remote runs.
//!
//! A run is polled until it reaches a terminal status. The first checks come
//! quickly so short runs resolve fast; every check grows the interval by a
//! constant factor up to a cap, so a run of duration `T` costs roughly
//! `log_F(T / I0)` status calls instead of `T / I0`.
//!
//! The state machine is [`PollState::next`], a pure function of the observed
//! status. [`RunWaiter`] drives it against a [`RemoteConversationService`].

use crate::remote::{RemoteConversationService, RunStatus, RunTicket};
use crate::{Result, SolaceError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Interval growth and ceiling for one wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Ceiling on the whole wait.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            factor: 1.5,
            max: Duration::from_secs(4),
            timeout: Duration::from_secs(120),
        }
    }
}

impl PollPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.initial.is_zero() {
            return Err(SolaceError::Config("initial poll interval must be non-zero".to_string()));
        }
        if !self.factor.is_finite() || self.factor <= 1.0 {
            return Err(SolaceError::Config(format!(
                "poll growth factor must be > 1.0, got {}",
                self.factor
            )));
        }
        if self.max < self.initial {
            return Err(SolaceError::Config(
                "max poll interval is below the initial interval".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(SolaceError::Config("run timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    fn grow(&self, interval: Duration) -> Duration {
        // Saturates at `max` instead of overflowing on very large intervals.
        Duration::try_from_secs_f64(interval.as_secs_f64() * self.factor)
            .map_or(self.max, |grown| grown.min(self.max))
    }
}

/// Final status of a run. Anything but `Completed` is a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Cancelled,
    Expired,
    /// The service kept answering with a status we could not interpret.
    Unrecognized(String),
}

impl TerminalStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Cancelled => "cancelled",
            TerminalStatus::Expired => "expired",
            TerminalStatus::Unrecognized(raw) => raw,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TerminalStatus::Completed)
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do after a status check.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStep {
    Finish(TerminalStatus),
    Sleep { delay: Duration, next: PollState },
}

/// Poll loop state between two status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollState {
    pub interval: Duration,
    /// An unrecognized status gets one retry; a second one ends the wait.
    pub unrecognized_seen: bool,
}

impl PollState {
    pub fn new(policy: &PollPolicy) -> Self {
        Self {
            interval: policy.initial,
            unrecognized_seen: false,
        }
    }

    pub fn next(&self, status: &RunStatus, policy: &PollPolicy) -> PollStep {
        let sleep = |unrecognized_seen| PollStep::Sleep {
            delay: self.interval,
            next: PollState {
                interval: policy.grow(self.interval),
                unrecognized_seen,
            },
        };

        match status {
            RunStatus::Queued | RunStatus::InProgress => sleep(self.unrecognized_seen),
            RunStatus::Completed => PollStep::Finish(TerminalStatus::Completed),
            RunStatus::Failed => PollStep::Finish(TerminalStatus::Failed),
            RunStatus::Cancelled => PollStep::Finish(TerminalStatus::Cancelled),
            RunStatus::Expired => PollStep::Finish(TerminalStatus::Expired),
            RunStatus::Unrecognized(raw) if self.unrecognized_seen => {
                PollStep::Finish(TerminalStatus::Unrecognized(raw.clone()))
            }
            RunStatus::Unrecognized(_) => sleep(true),
        }
    }
}

/// Waits for runs to finish.
#[derive(Clone)]
pub struct RunWaiter {
    remote: Arc<dyn RemoteConversationService>,
    policy: PollPolicy,
}

impl RunWaiter {
    /// Fails with `Config` if `policy` would not back off.
    pub fn new(remote: Arc<dyn RemoteConversationService>, policy: PollPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { remote, policy })
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Poll `ticket` until it is terminal.
    ///
    /// Stops without another status call once `cancel` fires or the policy
    /// timeout elapses. The remote run itself is left alone either way.
    pub async fn wait(
        &self,
        ticket: &RunTicket,
        cancel: &CancellationToken,
    ) -> Result<TerminalStatus> {
        let timeout = self.policy.timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Wait for run {} cancelled", ticket.run_id);
                Err(SolaceError::WaitCancelled)
            }
            outcome = tokio::time::timeout(timeout, self.poll_until_terminal(ticket)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(
                            "Run {} on {} still pending after {:?}",
                            ticket.run_id,
                            ticket.handle,
                            timeout
                        );
                        Err(SolaceError::WaitTimedOut(timeout))
                    }
                }
            }
        }
    }

    async fn poll_until_terminal(&self, ticket: &RunTicket) -> Result<TerminalStatus> {
        let mut state = PollState::new(&self.policy);
        let mut checks = 0u32;

        loop {
            let status = self.remote.run_status(ticket).await?;
            checks += 1;

            match state.next(&status, &self.policy) {
                PollStep::Finish(terminal) => {
                    tracing::debug!(
                        "Run {} finished as {} after {} checks",
                        ticket.run_id,
                        terminal,
                        checks
                    );
                    return Ok(terminal);
                }
                PollStep::Sleep { delay, next } => {
                    if let RunStatus::Unrecognized(raw) = &status {
                        tracing::warn!("Run {} reported unknown status '{}'", ticket.run_id, raw);
                    }
                    tokio::time::sleep(delay).await;
                    state = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Handle;
    use crate::remote::scripted::ScriptedRemote;
    use tokio::time::Instant;

    fn policy() -> PollPolicy {
        PollPolicy {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }

    fn ticket() -> RunTicket {
        RunTicket {
            handle: Handle("h-test".to_string()),
            run_id: "run-1".to_string(),
        }
    }

    #[test]
    fn transition_delays_grow_and_cap() {
        let policy = policy();
        let mut state = PollState::new(&policy);
        let mut delays = Vec::new();
        for _ in 0..6 {
            match state.next(&RunStatus::InProgress, &policy) {
                PollStep::Sleep { delay, next } => {
                    delays.push(delay.as_millis());
                    state = next;
                }
                PollStep::Finish(status) => panic!("finished early with {}", status),
            }
        }
        assert_eq!(delays, vec![100, 200, 400, 500, 500, 500]);
    }

    #[test]
    fn terminal_statuses_finish_immediately() {
        let policy = policy();
        let state = PollState::new(&policy);
        let cases = [
            (RunStatus::Completed, TerminalStatus::Completed),
            (RunStatus::Failed, TerminalStatus::Failed),
            (RunStatus::Cancelled, TerminalStatus::Cancelled),
            (RunStatus::Expired, TerminalStatus::Expired),
        ];
        for (status, expected) in cases {
            assert_eq!(state.next(&status, &policy), PollStep::Finish(expected));
        }
    }

    #[test]
    fn unrecognized_status_gets_one_retry() {
        let policy = policy();
        let weird = RunStatus::Unrecognized("requires_action".to_string());
        let state = PollState::new(&policy);

        let PollStep::Sleep { next, .. } = state.next(&weird, &policy) else {
            panic!("first unrecognized status should be retried");
        };
        assert!(next.unrecognized_seen);
        assert_eq!(
            next.next(&weird, &policy),
            PollStep::Finish(TerminalStatus::Unrecognized("requires_action".to_string()))
        );
    }

    #[test]
    fn policy_validation() {
        assert!(PollPolicy::default().validate().is_ok());
        let flat = PollPolicy { factor: 1.0, ..policy() };
        assert!(flat.validate().is_err());
        let inverted = PollPolicy { max: Duration::from_millis(10), ..policy() };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_on_first_check_makes_one_call() {
        let remote = Arc::new(ScriptedRemote::new());
        let waiter = RunWaiter::new(remote.clone(), policy()).unwrap();

        let started = Instant::now();
        let status = waiter.wait(&ticket(), &CancellationToken::new()).await.unwrap();

        assert_eq!(status, TerminalStatus::Completed);
        assert_eq!(remote.status_calls(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_gaps_are_non_decreasing_and_capped() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.script_statuses(
            std::iter::once(RunStatus::Queued)
                .chain(std::iter::repeat_n(RunStatus::InProgress, 6))
                .chain(std::iter::once(RunStatus::Completed)),
        );
        let waiter = RunWaiter::new(remote.clone(), policy()).unwrap();

        let status = waiter.wait(&ticket(), &CancellationToken::new()).await.unwrap();
        assert_eq!(status, TerminalStatus::Completed);
        assert_eq!(remote.status_calls(), 8);

        let times = remote.status_call_times();
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]));
        assert!(gaps.iter().all(|gap| *gap <= policy().max));
        assert_eq!(gaps.first(), Some(&Duration::from_millis(100)));
        assert_eq!(gaps.last(), Some(&Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_reported_verbatim() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.script_statuses([RunStatus::InProgress, RunStatus::Failed]);
        let waiter = RunWaiter::new(remote.clone(), policy()).unwrap();

        let status = waiter.wait(&ticket(), &CancellationToken::new()).await.unwrap();
        assert_eq!(status, TerminalStatus::Failed);
        assert_eq!(status.as_str(), "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_polling() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.script_statuses(std::iter::repeat_n(RunStatus::InProgress, 1000));
        let waiter = RunWaiter::new(
            remote.clone(),
            PollPolicy {
                timeout: Duration::from_secs(2),
                ..policy()
            },
        )
        .unwrap();

        let err = waiter.wait(&ticket(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SolaceError::WaitTimedOut(_)));

        let calls = remote.status_calls();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.status_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_polling() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.script_statuses(std::iter::repeat_n(RunStatus::InProgress, 1000));
        let waiter = RunWaiter::new(remote.clone(), policy()).unwrap();
        let cancel = CancellationToken::new();

        let task = {
            let waiter = waiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { waiter.wait(&ticket(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(1000)).await;
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(SolaceError::WaitCancelled)));

        let calls = remote.status_calls();
        assert!(calls >= 2);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(remote.status_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_propagates() {
        let remote = Arc::new(ScriptedRemote::new());
        remote.fail_status_checks(true);
        let waiter = RunWaiter::new(remote.clone(), policy()).unwrap();

        let err = waiter.wait(&ticket(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SolaceError::RemoteUnavailable(_)));
    }

    #[test]
    fn waiter_rejects_a_policy_that_does_not_back_off() {
        let remote = Arc::new(ScriptedRemote::new());
        for factor in [1.0, 0.5, f64::NAN] {
            let result = RunWaiter::new(remote.clone(), PollPolicy { factor, ..policy() });
            assert!(matches!(result, Err(SolaceError::Config(_))), "factor {}", factor);
        }
    }

    #[test]
    fn growth_saturates_at_an_enormous_cap() {
        let policy = PollPolicy {
            max: Duration::MAX,
            factor: 10.0,
            ..PollPolicy::default()
        };
        assert_eq!(policy.grow(Duration::MAX / 2), Duration::MAX);
        assert_eq!(policy.grow(Duration::from_secs(1)), Duration::from_secs(10));
    }
}
