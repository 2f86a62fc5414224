//! Per-replica state machine as the leader sees it: push queues, deferral
//! and collapse rules, retry backoff, accepted/committed tracking, staged
//! object bookkeeping, and the ALL_REFS commit delta computation.
//!
//! All mutable bookkeeping here is owned by the leader and mutated only
//! under the leader's lock; transports run on worker threads and never see
//! the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::{
    config::{ReplicaConfig, ReplicaType},
    errors::GitError,
    hash::ObjectHash,
    internal::{
        odb::{ObjectStore, read_commit},
        refs::{HEAD, R_TXN, RefCommand, RefDatabase, ref_tree::RefTree},
    },
};

use super::LogIndex;

/// Overall state of a replica from the leader's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Unknown,
    Lagging,
    Current,
    Divergent,
    Ahead,
    Offline,
}

/// How a peer is pushed to and fetched from. Implementations block; the
/// leader always calls them from a worker thread.
pub trait ReplicaTransport: Send + Sync {
    /// References the remote currently advertises, as (name, leaf id).
    fn advertised_refs(&self) -> Result<BTreeMap<String, ObjectHash>, GitError>;

    /// Push reference updates, filling each command's result. `Err` means
    /// the peer is unreachable (transport failure).
    fn push(&self, commands: &mut [RefCommand]) -> Result<(), GitError>;

    /// Fetch the given objects from the peer into the local store. A
    /// no-op where object transfer is shared out-of-band.
    fn blocking_fetch(&self, want: &[ObjectHash]) -> Result<(), GitError> {
        let _ = want;
        Ok(())
    }
}

/// Transport for a replica living in the same process: commands apply
/// straight onto its reference database.
pub struct LocalTransport {
    db: Arc<dyn RefDatabase>,
}

impl LocalTransport {
    pub fn new(db: Arc<dyn RefDatabase>) -> LocalTransport {
        LocalTransport { db }
    }
}

impl ReplicaTransport for LocalTransport {
    fn advertised_refs(&self) -> Result<BTreeMap<String, ObjectHash>, GitError> {
        let mut out = BTreeMap::new();
        for (name, r) in self.db.get_refs("")? {
            if let Some(id) = r.object_id() {
                out.insert(name, id);
            }
        }
        if let Some(head) = self.db.exact_ref(HEAD)? {
            if let Some(id) = head.object_id() {
                out.insert(HEAD.to_string(), id);
            }
        }
        Ok(out)
    }

    fn push(&self, commands: &mut [RefCommand]) -> Result<(), GitError> {
        // Commands are pushed independently, like a non-atomic receive-pack.
        for cmd in commands.iter_mut() {
            let mut one = cmd.clone();
            one.result = crate::internal::refs::RefUpdateResult::NotAttempted;
            cmd.result = self.db.update_ref(one)?;
        }
        Ok(())
    }
}

/// Immutable definition of one replica in the topology.
pub struct ReplicaDef {
    pub name: String,
    pub config: ReplicaConfig,
    pub transport: Arc<dyn ReplicaTransport>,
    /// Exactly one voter in a leader's topology is the local replica.
    pub is_local: bool,
}

impl ReplicaDef {
    pub fn is_voter(&self) -> bool {
        self.config.replica_type == ReplicaType::Voter
    }
}

/// What one push carries.
#[derive(Debug, Clone)]
pub(crate) enum PushPayload {
    /// Explicit reference commands (accept pushes, txn-committed pushes).
    Commands(Vec<RefCommand>),
    /// ALL_REFS commit: the delta is computed against the remote's
    /// advertisement on the worker thread, never under the lock.
    CommitDelta { committed: LogIndex },
}

/// One queued or running push against a replica.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaPushRequest {
    pub payload: PushPayload,
    /// Log entry this push tries to make the replica accept.
    pub accept: Option<LogIndex>,
    /// Log entry this push tells the replica is committed.
    pub commit: Option<LogIndex>,
}

impl ReplicaPushRequest {
    pub fn commands(&self) -> &[RefCommand] {
        match &self.payload {
            PushPayload::Commands(cmds) => cmds,
            PushPayload::CommitDelta { .. } => &[],
        }
    }
}

/// Next retry delay: doubled, clamped into the configured window.
pub fn next_retry_millis(config: &ReplicaConfig, last_millis: u64) -> u64 {
    let doubled = last_millis.saturating_mul(2);
    doubled.clamp(config.min_retry_millis, config.max_retry_millis)
}

/// Mutable bookkeeping for one replica. Lives inside the leader's lock.
pub(crate) struct ReplicaMachine {
    pub state: ReplicaState,
    pub error: Option<String>,
    /// Last log entry the replica is known to have accepted.
    pub txn_accepted: Option<LogIndex>,
    /// Last log entry the replica is known to have committed.
    pub txn_committed: Option<LogIndex>,
    /// Commands currently being sent, by reference name.
    pub running: HashMap<String, RefCommand>,
    /// Commands deferred behind running ones or a retry, by name.
    pub waiting: HashMap<String, RefCommand>,
    /// Pending push requests in arrival order.
    pub queued: Vec<ReplicaPushRequest>,
    /// Stage reference names per accepted log index; purged once a commit
    /// at that index or higher is observed.
    pub staged: HashMap<u64, Vec<String>>,
    /// A commit held back for piggybacking (BATCHED speed).
    pub pending_commit: Option<LogIndex>,
    pub last_retry_millis: u64,
    pub retrying: bool,
    pub retry_task: Option<tokio::task::JoinHandle<()>>,
}

impl ReplicaMachine {
    pub fn new() -> ReplicaMachine {
        ReplicaMachine {
            state: ReplicaState::Unknown,
            error: None,
            txn_accepted: None,
            txn_committed: None,
            running: HashMap::new(),
            waiting: HashMap::new(),
            queued: Vec::new(),
            staged: HashMap::new(),
            pending_commit: None,
            last_retry_millis: 0,
            retrying: false,
            retry_task: None,
        }
    }

    /// A request is deferred while a retry is armed or any of its refs is
    /// already waiting or running. Delta pushes serialize behind
    /// everything on the replica.
    pub fn must_defer(&self, req: &ReplicaPushRequest) -> bool {
        if self.retrying {
            return true;
        }
        match &req.payload {
            PushPayload::CommitDelta { .. } => {
                !self.running.is_empty() || !self.waiting.is_empty() || !self.queued.is_empty()
            }
            PushPayload::Commands(cmds) => cmds
                .iter()
                .any(|c| self.waiting.contains_key(&c.name) || self.running.contains_key(&c.name)),
        }
    }

    /// Park a request behind the in-flight work.
    pub fn defer(&mut self, req: ReplicaPushRequest) {
        for cmd in req.commands() {
            self.waiting.insert(cmd.name.clone(), cmd.clone());
        }
        self.queued.push(req);
    }

    /// Move a request's commands into the running set.
    pub fn mark_running(&mut self, req: &ReplicaPushRequest) {
        for cmd in req.commands() {
            self.waiting.remove(&cmd.name);
            self.running.insert(cmd.name.clone(), cmd.clone());
        }
    }

    /// Remove a finished request's commands from the running set.
    pub fn clear_running(&mut self, req: &ReplicaPushRequest) {
        for cmd in req.commands() {
            self.running.remove(&cmd.name);
        }
    }

    /// Collapse every queued command request into one, merging per-ref
    /// commands by earliest old value and latest new value. Returns the
    /// next request to start, if the replica is free to send one.
    pub fn take_next_push(&mut self) -> Option<ReplicaPushRequest> {
        if self.retrying || !self.running.is_empty() || self.queued.is_empty() {
            return None;
        }
        if matches!(self.queued[0].payload, PushPayload::CommitDelta { .. }) {
            let req = self.queued.remove(0);
            return Some(req);
        }

        let take = self
            .queued
            .iter()
            .take_while(|r| matches!(r.payload, PushPayload::Commands(_)))
            .count();
        let mut merged: Vec<RefCommand> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut accept: Option<LogIndex> = None;
        let mut commit: Option<LogIndex> = None;
        for req in self.queued.drain(..take) {
            accept = max_index(accept, req.accept);
            commit = max_index(commit, req.commit);
            if let PushPayload::Commands(cmds) = req.payload {
                for cmd in cmds {
                    match by_name.get(&cmd.name) {
                        // Earliest old value wins, latest new value wins.
                        Some(i) => merged[*i].new = cmd.new,
                        None => {
                            by_name.insert(cmd.name.clone(), merged.len());
                            merged.push(cmd);
                        }
                    }
                }
            }
        }
        for cmd in &merged {
            self.waiting.remove(&cmd.name);
        }
        debug!(commands = merged.len(), "collapsed queued pushes");
        Some(ReplicaPushRequest {
            payload: PushPayload::Commands(merged),
            accept,
            commit,
        })
    }

    /// Drop stage bookkeeping for log entries at or below `index`.
    pub fn purge_staged(&mut self, index: u64) {
        self.staged.retain(|k, _| *k > index);
    }

    /// Cancel any scheduled retry.
    pub fn cancel_retry(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        self.retrying = false;
    }
}

fn max_index(a: Option<LogIndex>, b: Option<LogIndex>) -> Option<LogIndex> {
    match (a, b) {
        (Some(x), Some(y)) => Some(if y.index > x.index { y } else { x }),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Observable snapshot of one replica.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicaSnapshot {
    pub name: String,
    pub state: ReplicaState,
    pub error: Option<String>,
    pub accepted: Option<LogIndex>,
    pub committed: Option<LogIndex>,
    pub queued_pushes: usize,
    pub retrying: bool,
}

/// Compute the ALL_REFS commit delta: the commands bringing the remote's
/// advertised references to the state of the RefTree at `committed_id`.
/// Symbolic references are not pushed; `HEAD` and everything under the
/// transactional namespace are protected from deletion.
pub fn commit_commands(
    store: &dyn ObjectStore,
    remote_refs: &BTreeMap<String, ObjectHash>,
    committed_id: &ObjectHash,
) -> Result<Vec<RefCommand>, GitError> {
    let commit = read_commit(store, committed_id)?;
    let tree = RefTree::read(store, &commit.tree_id)?;
    let desired = tree.gitlink_refs();

    let mut commands = Vec::new();
    for (name, id) in &desired {
        match remote_refs.get(name) {
            Some(have) if have == id => {}
            Some(have) => commands.push(RefCommand::update(name.clone(), *have, *id)),
            None => commands.push(RefCommand::create(name.clone(), *id)),
        }
    }
    for (name, have) in remote_refs {
        if desired.contains_key(name) || name == HEAD || name.starts_with(R_TXN) {
            continue;
        }
        commands.push(RefCommand::delete(name.clone(), *have));
    }
    Ok(commands)
}

/// Classify a rejected accept: compare the remote's advertised value with
/// the leader's head through an ancestry walk over the leader's store.
pub fn classify_divergence(
    store: &dyn ObjectStore,
    remote_value: Option<&ObjectHash>,
    head: &ObjectHash,
) -> Result<ReplicaState, GitError> {
    let Some(remote) = remote_value else {
        return Ok(ReplicaState::Divergent);
    };
    if remote == head {
        return Ok(ReplicaState::Current);
    }
    if store.get(remote)?.is_none() {
        return Ok(ReplicaState::Divergent);
    }
    if crate::internal::odb::is_ancestor(store, remote, head)? {
        return Ok(ReplicaState::Lagging);
    }
    if crate::internal::odb::is_ancestor(store, head, remote)? {
        return Ok(ReplicaState::Ahead);
    }
    Ok(ReplicaState::Divergent)
}
