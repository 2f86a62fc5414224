//! A proposal is a client-submitted atomic batch of reference updates with
//! a lifecycle the leader drives: QUEUED when accepted into the pending
//! queue, RUNNING while a round carries it, EXECUTED with per-command
//! results after quorum, or ABORTED when it conflicts or the leader shuts
//! down. Waiters block on a condition variable until a terminal state.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::internal::refs::{RefCommand, RefUpdateResult, abort_remaining};

/// Lifecycle of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalState {
    New,
    Queued,
    Running,
    Executed,
    Aborted,
}

impl ProposalState {
    pub fn is_done(&self) -> bool {
        matches!(self, ProposalState::Executed | ProposalState::Aborted)
    }
}

struct ProposalInner {
    state: ProposalState,
    commands: Vec<RefCommand>,
}

/// An atomic set of reference transitions submitted to the leader.
pub struct Proposal {
    inner: Mutex<ProposalInner>,
    done: Condvar,
}

impl Proposal {
    pub fn new(commands: Vec<RefCommand>) -> Arc<Proposal> {
        Arc::new(Proposal {
            inner: Mutex::new(ProposalInner {
                state: ProposalState::New,
                commands,
            }),
            done: Condvar::new(),
        })
    }

    pub fn state(&self) -> ProposalState {
        self.inner.lock().expect("proposal lock poisoned").state
    }

    /// Snapshot of the commands with their current results.
    pub fn commands(&self) -> Vec<RefCommand> {
        self.inner
            .lock()
            .expect("proposal lock poisoned")
            .commands
            .clone()
    }

    /// Block until the proposal reaches a terminal state.
    pub fn await_done(&self) -> ProposalState {
        let mut inner = self.inner.lock().expect("proposal lock poisoned");
        while !inner.state.is_done() {
            inner = self.done.wait(inner).expect("proposal lock poisoned");
        }
        inner.state
    }

    /// Like `await_done` with a bound; `None` on timeout.
    pub fn await_done_timeout(&self, timeout: Duration) -> Option<ProposalState> {
        let mut inner = self.inner.lock().expect("proposal lock poisoned");
        let deadline = std::time::Instant::now() + timeout;
        while !inner.state.is_done() {
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .done
                .wait_timeout(inner, deadline - now)
                .expect("proposal lock poisoned");
            inner = guard;
        }
        Some(inner.state)
    }

    pub(crate) fn mark_queued(&self) {
        self.inner.lock().expect("proposal lock poisoned").state = ProposalState::Queued;
    }

    pub(crate) fn mark_running(&self) {
        self.inner.lock().expect("proposal lock poisoned").state = ProposalState::Running;
    }

    /// Terminal success: every command carries OK.
    pub(crate) fn complete(&self) {
        let mut inner = self.inner.lock().expect("proposal lock poisoned");
        for cmd in &mut inner.commands {
            cmd.result = RefUpdateResult::Ok;
        }
        inner.state = ProposalState::Executed;
        self.done.notify_all();
    }

    /// Terminal failure, replacing the commands with their rejected forms.
    pub(crate) fn abort_with(&self, commands: Vec<RefCommand>) {
        let mut inner = self.inner.lock().expect("proposal lock poisoned");
        inner.commands = commands;
        abort_remaining(&mut inner.commands);
        inner.state = ProposalState::Aborted;
        self.done.notify_all();
    }

    /// Terminal failure keeping the commands as they are, aborting any
    /// untouched ones.
    pub(crate) fn abort(&self) {
        let mut inner = self.inner.lock().expect("proposal lock poisoned");
        abort_remaining(&mut inner.commands);
        inner.state = ProposalState::Aborted;
        self.done.notify_all();
    }
}
