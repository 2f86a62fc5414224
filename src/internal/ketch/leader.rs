//! The Ketch leader: a queue of proposals, round scheduling, quorum tally,
//! and commit advancement.
//!
//! One mutex guards the whole leader — role, term, head, committed, the
//! proposal queue, the cached tree, the running round, and every replica's
//! bookkeeping. Pushes run on the system thread pool, never under the
//! lock; retries wait on the timer runtime. The cached tree is shared with
//! running rounds through an `Arc`, so the first speculative apply after a
//! round starts copies it instead of mutating the round's snapshot.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::{CommitMethod, CommitSpeed},
    errors::GitError,
    hash::ObjectHash,
    internal::{
        odb::ObjectStore,
        refs::{
            RefCommand, RefTarget, RefUpdateResult, TXN_ACCEPTED, TXN_COMMITTED,
            ref_tree::RefTree, ref_tree_db::RefTreeDatabase,
        },
    },
};

use super::{
    KetchSystem, LeaderRole, LogIndex,
    proposal::Proposal,
    replica::{
        PushPayload, ReplicaDef, ReplicaMachine, ReplicaPushRequest, ReplicaSnapshot,
        ReplicaState, classify_divergence, commit_commands, next_retry_millis,
    },
    round::{ElectionRound, ProposalRound, Round},
};

/// Observable snapshot of a leader.
#[derive(Debug, Clone, Serialize)]
pub struct LeaderSnapshot {
    pub role: LeaderRole,
    pub term: u64,
    pub head: Option<LogIndex>,
    pub committed: Option<LogIndex>,
    pub queued_proposals: usize,
    /// Idle means no round is running.
    pub idle: bool,
    pub replicas: Vec<ReplicaSnapshot>,
}

/// Work discovered under the lock, executed after it is released.
enum Action {
    StartPush { replica: usize, req: ReplicaPushRequest },
    ScheduleLeaderTask,
    ScheduleRetry { replica: usize, delay_millis: u64 },
}

struct LeaderState {
    role: LeaderRole,
    term: u64,
    head: Option<LogIndex>,
    committed: Option<LogIndex>,
    queued: VecDeque<Arc<Proposal>>,
    /// Cached tree: the head tree plus every queued proposal's effect.
    tree: Option<Arc<RefTree>>,
    /// Tree as of the current head, before speculative applies.
    head_tree: Option<Arc<RefTree>>,
    round: Option<Arc<Round>>,
    task_scheduled: bool,
    initialized: bool,
    machines: Vec<ReplicaMachine>,
}

pub(crate) struct LeaderShared {
    system: Arc<KetchSystem>,
    store: Arc<dyn ObjectStore>,
    ref_db: Arc<RefTreeDatabase>,
    defs: Vec<Arc<ReplicaDef>>,
    state: Mutex<LeaderState>,
}

/// Leader handle. Cloning shares the same leader.
#[derive(Clone)]
pub struct KetchLeader {
    shared: Arc<LeaderShared>,
}

impl KetchLeader {
    /// Build a leader over a topology. The voter count must be odd, at
    /// most 9, and exactly one voter must be the local replica.
    pub fn new(
        system: Arc<KetchSystem>,
        store: Arc<dyn ObjectStore>,
        ref_db: Arc<RefTreeDatabase>,
        replicas: Vec<ReplicaDef>,
    ) -> Result<KetchLeader, GitError> {
        let voters = replicas.iter().filter(|r| r.is_voter()).count();
        if !matches!(voters, 1 | 3 | 5 | 7 | 9) {
            return Err(GitError::InvalidKetchConfig(format!(
                "{voters} voters; the voter count must be odd and within 1..=9"
            )));
        }
        let local_voters = replicas
            .iter()
            .filter(|r| r.is_voter() && r.is_local)
            .count();
        if local_voters != 1 {
            return Err(GitError::InvalidKetchConfig(format!(
                "{local_voters} local voters; exactly one voter must be the local replica"
            )));
        }
        for def in &replicas {
            def.config.validate()?;
        }

        let machines = replicas.iter().map(|_| ReplicaMachine::new()).collect();
        Ok(KetchLeader {
            shared: Arc::new(LeaderShared {
                system,
                store,
                ref_db,
                defs: replicas.into_iter().map(Arc::new).collect(),
                state: Mutex::new(LeaderState {
                    role: LeaderRole::Candidate,
                    term: 0,
                    head: None,
                    committed: None,
                    queued: VecDeque::new(),
                    tree: None,
                    head_tree: None,
                    round: None,
                    task_scheduled: false,
                    initialized: false,
                    machines,
                }),
            }),
        })
    }

    /// Submit a proposal. The commands are applied to the cached tree
    /// speculatively; a conflict aborts the proposal immediately,
    /// otherwise it is queued and a round is scheduled if none is running.
    pub fn execute_async(&self, proposal: Arc<Proposal>) -> Result<(), GitError> {
        let mut actions = Vec::new();
        let conflict_commands;
        {
            let mut st = self.shared.lock();
            if st.role == LeaderRole::Shutdown {
                return Err(GitError::CustomError("leader is shut down".to_string()));
            }
            self.shared.lazy_init(&mut st)?;

            let mut commands = proposal.commands();
            let tree = st.tree.as_mut().expect("initialized leader has a tree");
            if Arc::make_mut(tree).apply(&mut commands) {
                proposal.mark_queued();
                st.queued.push_back(proposal.clone());
                debug!(queued = st.queued.len(), "proposal queued");
                if st.round.is_none() && !st.task_scheduled {
                    st.task_scheduled = true;
                    actions.push(Action::ScheduleLeaderTask);
                }
                conflict_commands = None;
            } else {
                conflict_commands = Some(commands);
            }
        }
        if let Some(commands) = conflict_commands {
            debug!("proposal conflicts with the speculative tree");
            proposal.abort_with(commands);
        }
        self.shared.perform(actions);
        Ok(())
    }

    /// Snapshot the leader and all replica states.
    pub fn snapshot(&self) -> LeaderSnapshot {
        let st = self.shared.lock();
        LeaderSnapshot {
            role: st.role,
            term: st.term,
            head: st.head,
            committed: st.committed,
            queued_proposals: st.queued.len(),
            idle: st.round.is_none(),
            replicas: self
                .shared
                .defs
                .iter()
                .zip(&st.machines)
                .map(|(def, m)| ReplicaSnapshot {
                    name: def.name.clone(),
                    state: m.state,
                    error: m.error.clone(),
                    accepted: m.txn_accepted,
                    committed: m.txn_committed,
                    queued_pushes: m.queued.len(),
                    retrying: m.retrying,
                })
                .collect(),
        }
    }

    /// Stop the leader: cancel every scheduled retry and abort anything
    /// pending. In-flight pushes complete and their results are discarded.
    pub fn shutdown(&self) {
        let (round, proposals) = {
            let mut st = self.shared.lock();
            st.role = LeaderRole::Shutdown;
            for machine in &mut st.machines {
                machine.cancel_retry();
            }
            let round = st.round.take();
            let proposals: Vec<Arc<Proposal>> = st.queued.drain(..).collect();
            (round, proposals)
        };
        if let Some(round) = round {
            round.abort();
        }
        for proposal in proposals {
            proposal.abort();
        }
        info!("leader shut down");
    }
}

impl LeaderShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, LeaderState> {
        self.state.lock().expect("leader lock poisoned")
    }

    /// First use: adopt the bootstrap's committed state as head.
    fn lazy_init(&self, st: &mut LeaderState) -> Result<(), GitError> {
        if st.initialized {
            return Ok(());
        }
        let committed_id = self.ref_db.committed_id()?;
        if committed_id.is_zero() {
            st.tree = Some(Arc::new(RefTree::new_empty()));
            st.head_tree = Some(Arc::new(RefTree::new_empty()));
        } else {
            let (cid, tree) = self.ref_db.current()?;
            let tree = Arc::new(tree);
            let head = LogIndex { id: cid, index: 0 };
            st.head = Some(head);
            st.committed = Some(head);
            st.tree = Some(tree.clone());
            st.head_tree = Some(tree);
        }
        st.initialized = true;
        debug!(head = ?st.head, "leader initialized");
        Ok(())
    }

    /// Run queued work: form an election round while still a candidate,
    /// otherwise a proposal round over the whole queue.
    fn run_leader_task(self: &Arc<Self>) {
        let round = {
            let mut st = self.lock();
            st.task_scheduled = false;
            if st.round.is_some()
                || matches!(st.role, LeaderRole::Shutdown | LeaderRole::Deposed)
                || !st.initialized
            {
                return;
            }
            let round = match st.role {
                LeaderRole::Candidate => {
                    st.term += 1;
                    Arc::new(Round::Election(ElectionRound {
                        term: st.term,
                        tree: st.head_tree.clone().expect("initialized"),
                        parent: st.head,
                    }))
                }
                LeaderRole::Leader => {
                    if st.queued.is_empty() {
                        return;
                    }
                    let proposals: Vec<Arc<Proposal>> = st.queued.drain(..).collect();
                    for proposal in &proposals {
                        proposal.mark_running();
                    }
                    let stage = ProposalRound::stage_commands(
                        st.head_tree.as_ref().expect("initialized"),
                        &proposals,
                    );
                    Arc::new(Round::Proposal(ProposalRound {
                        proposals,
                        tree: st.tree.clone().expect("initialized"),
                        parent: st.head,
                        stage,
                    }))
                }
                LeaderRole::Deposed | LeaderRole::Shutdown => return,
            };
            st.round = Some(round.clone());
            round
        };

        // Build the log entry off the lock; only the object store is hit.
        match round.start(&self.ref_db) {
            Ok(new_id) => self.run_async(new_id),
            Err(e) => {
                warn!(error = %e, "round failed to build its log entry; deposing");
                let round = {
                    let mut st = self.lock();
                    st.role = LeaderRole::Deposed;
                    st.round.take()
                };
                if let Some(round) = round {
                    round.abort();
                }
            }
        }
    }

    /// Install the new head and fan it out to every replica.
    fn run_async(self: &Arc<Self>, new_id: ObjectHash) {
        let mut actions = Vec::new();
        {
            let mut st = self.lock();
            if st.role == LeaderRole::Shutdown {
                return;
            }
            let index = st.head.map(|h| h.index + 1).unwrap_or(1);
            let new_head = LogIndex {
                id: new_id,
                index,
            };
            st.head = Some(new_head);
            let (round_tree, stage) = match st.round.as_deref() {
                Some(Round::Proposal(r)) => (Some(r.tree.clone()), r.stage.clone()),
                Some(Round::Election(r)) => (Some(r.tree.clone()), Vec::new()),
                None => (None, Vec::new()),
            };
            if let Some(tree) = round_tree {
                st.head_tree = Some(tree);
            }
            debug!(head = %new_head, "new head; distributing accept");
            for idx in 0..self.defs.len() {
                let req = self.build_accept_request(&mut st, idx, new_head, &stage);
                self.queue_push(&mut st, idx, req, &mut actions);
            }
        }
        self.perform(actions);
    }

    /// Accept push for one replica: stage refs, the accepted-ref advance,
    /// and any piggybacked commit (BATCHED speed).
    fn build_accept_request(
        &self,
        st: &mut LeaderState,
        idx: usize,
        head: LogIndex,
        stage: &[RefCommand],
    ) -> ReplicaPushRequest {
        let def = &self.defs[idx];
        let machine = &mut st.machines[idx];
        let mut commands: Vec<RefCommand> = stage.to_vec();
        if !stage.is_empty() {
            machine
                .staged
                .insert(head.index, stage.iter().map(|c| c.name.clone()).collect());
        }
        let old_accepted = machine
            .txn_accepted
            .map(|a| a.id)
            .unwrap_or_default();
        commands.push(RefCommand::new(
            TXN_ACCEPTED,
            RefTarget::Id(old_accepted),
            RefTarget::Id(head.id),
        ));

        let mut commit = None;
        if let Some(pending) = machine.pending_commit.take() {
            match def.config.commit_method {
                CommitMethod::TxnCommitted => {
                    let old_committed = machine
                        .txn_committed
                        .map(|c| c.id)
                        .unwrap_or_default();
                    commands.push(RefCommand::new(
                        TXN_COMMITTED,
                        RefTarget::Id(old_committed),
                        RefTarget::Id(pending.id),
                    ));
                    commit = Some(pending);
                }
                CommitMethod::AllRefs => {
                    // The delta cannot piggyback; it still goes out, right
                    // behind this accept.
                    machine.queued.push(ReplicaPushRequest {
                        payload: PushPayload::CommitDelta { committed: pending },
                        accept: None,
                        commit: Some(pending),
                    });
                }
            }
        }
        ReplicaPushRequest {
            payload: PushPayload::Commands(commands),
            accept: Some(head),
            commit,
        }
    }

    /// Start or defer a push per the replica's deferral rule.
    fn queue_push(
        &self,
        st: &mut LeaderState,
        idx: usize,
        req: ReplicaPushRequest,
        actions: &mut Vec<Action>,
    ) {
        let machine = &mut st.machines[idx];
        if machine.must_defer(&req) {
            debug!(replica = %self.defs[idx].name, "push deferred");
            machine.defer(req);
        } else {
            machine.mark_running(&req);
            actions.push(Action::StartPush { replica: idx, req });
        }
    }

    /// Execute actions discovered under the lock.
    fn perform(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::StartPush { replica, req } => {
                    let shared = self.clone();
                    self.system.execute(move || shared.do_push(replica, req));
                }
                Action::ScheduleLeaderTask => {
                    let shared = self.clone();
                    self.system.execute(move || shared.run_leader_task());
                }
                Action::ScheduleRetry {
                    replica,
                    delay_millis,
                } => {
                    let weak: Weak<LeaderShared> = Arc::downgrade(self);
                    let handle = self.system.timer().spawn(async move {
                        tokio::time::sleep(Duration::from_millis(delay_millis)).await;
                        if let Some(shared) = weak.upgrade() {
                            shared.retry_fire(replica);
                        }
                    });
                    let mut st = self.lock();
                    if st.role != LeaderRole::Shutdown {
                        st.machines[replica].retry_task = Some(handle);
                    } else {
                        handle.abort();
                    }
                }
            }
        }
    }

    /// One transport round-trip, fully off the lock.
    fn do_push(self: &Arc<Self>, idx: usize, req: ReplicaPushRequest) {
        let def = &self.defs[idx];
        let outcome = match req.payload.clone() {
            PushPayload::Commands(mut commands) => def
                .transport
                .push(&mut commands)
                .map(|_| commands),
            PushPayload::CommitDelta { committed } => {
                def.transport.advertised_refs().and_then(|remote| {
                    let mut commands =
                        commit_commands(self.store.as_ref(), &remote, &committed.id)?;
                    def.transport.push(&mut commands)?;
                    Ok(commands)
                })
            }
        };

        // A rejected accept needs the remote's advertised value so the lag
        // classification can run; fetch it while still off the lock.
        let remote_accepted = match &outcome {
            Ok(commands)
                if commands
                    .iter()
                    .any(|c| c.name == TXN_ACCEPTED && c.result != RefUpdateResult::Ok) =>
            {
                def.transport
                    .advertised_refs()
                    .ok()
                    .and_then(|refs| refs.get(TXN_ACCEPTED).copied())
            }
            _ => None,
        };

        self.after_push(idx, req, outcome, remote_accepted);
    }

    fn after_push(
        self: &Arc<Self>,
        idx: usize,
        req: ReplicaPushRequest,
        outcome: Result<Vec<RefCommand>, GitError>,
        remote_accepted: Option<ObjectHash>,
    ) {
        let mut actions = Vec::new();
        {
            let mut st = self.lock();
            if st.role == LeaderRole::Shutdown {
                return;
            }
            st.machines[idx].clear_running(&req);

            match outcome {
                Err(error) => {
                    let machine = &mut st.machines[idx];
                    warn!(replica = %self.defs[idx].name, %error, "replica offline");
                    machine.state = ReplicaState::Offline;
                    machine.error = Some(error.to_string());
                    // Park the failed work in front and arm the retry.
                    for cmd in req.commands() {
                        machine.waiting.insert(cmd.name.clone(), cmd.clone());
                    }
                    machine.queued.insert(0, req);
                    let delay =
                        next_retry_millis(&self.defs[idx].config, machine.last_retry_millis);
                    machine.last_retry_millis = delay;
                    machine.retrying = true;
                    actions.push(Action::ScheduleRetry {
                        replica: idx,
                        delay_millis: delay,
                    });
                }
                Ok(commands) => {
                    self.on_push_done(&mut st, idx, &req, &commands, remote_accepted, &mut actions);
                }
            }

            if let Some(next) = st.machines[idx].take_next_push() {
                st.machines[idx].mark_running(&next);
                actions.push(Action::StartPush { replica: idx, req: next });
            }
        }
        self.perform(actions);
    }

    fn on_push_done(
        &self,
        st: &mut LeaderState,
        idx: usize,
        req: &ReplicaPushRequest,
        commands: &[RefCommand],
        remote_accepted: Option<ObjectHash>,
        actions: &mut Vec<Action>,
    ) {
        let head = st.head;
        let machine = &mut st.machines[idx];
        machine.error = None;
        machine.last_retry_millis = 0;

        let mut tally = false;
        if let Some(accept) = req.accept {
            let accept_result = commands
                .iter()
                .find(|c| c.name == TXN_ACCEPTED)
                .map(|c| c.result.clone());
            match accept_result {
                Some(RefUpdateResult::Ok) => {
                    machine.txn_accepted = Some(accept);
                    machine.state = if head.map(|h| h.id) == Some(accept.id) {
                        ReplicaState::Current
                    } else {
                        ReplicaState::Lagging
                    };
                    tally = true;
                }
                Some(_) => {
                    let head_id = head.map(|h| h.id).unwrap_or_default();
                    let state = classify_divergence(
                        self.store.as_ref(),
                        remote_accepted.as_ref(),
                        &head_id,
                    )
                    .unwrap_or(ReplicaState::Divergent);
                    debug!(replica = %self.defs[idx].name, ?state, "accept rejected");
                    machine.state = state;
                    // Adopt the remote's actual value and retry the accept
                    // once with a corrected expectation.
                    if let Some(remote) = remote_accepted {
                        let tried = commands
                            .iter()
                            .find(|c| c.name == TXN_ACCEPTED)
                            .and_then(|c| c.old.id())
                            .unwrap_or_default();
                        machine.txn_accepted = Some(LogIndex {
                            id: remote,
                            index: accept.index.saturating_sub(1),
                        });
                        if state == ReplicaState::Lagging && remote != tried {
                            let retry = ReplicaPushRequest {
                                payload: PushPayload::Commands(vec![RefCommand::new(
                                    TXN_ACCEPTED,
                                    RefTarget::Id(remote),
                                    RefTarget::Id(accept.id),
                                )]),
                                accept: Some(accept),
                                commit: None,
                            };
                            machine.defer(retry);
                        }
                    }
                }
                None => {}
            }
        }

        if let Some(commit) = req.commit {
            let committed_ok = match &req.payload {
                PushPayload::CommitDelta { .. } => {
                    commands.iter().all(|c| c.result == RefUpdateResult::Ok)
                }
                PushPayload::Commands(_) => commands
                    .iter()
                    .any(|c| c.name == TXN_COMMITTED && c.result == RefUpdateResult::Ok),
            };
            if committed_ok {
                machine.txn_committed = Some(commit);
                machine.purge_staged(commit.index);
            } else if let Some(cmd) = commands
                .iter()
                .find(|c| c.name == TXN_COMMITTED && c.result != RefUpdateResult::Ok)
            {
                // The CAS raced an earlier commit push; retry once with
                // the now-known value.
                let known = machine.txn_committed.map(|c| c.id).unwrap_or_default();
                let tried = cmd.old.id().unwrap_or_default();
                if known != tried {
                    machine.defer(ReplicaPushRequest {
                        payload: PushPayload::Commands(vec![RefCommand::new(
                            TXN_COMMITTED,
                            RefTarget::Id(known),
                            RefTarget::Id(commit.id),
                        )]),
                        accept: None,
                        commit: Some(commit),
                    });
                }
            }
        }

        if tally && self.defs[idx].is_voter() {
            self.on_replica_update(st, actions);
        }
    }

    /// Quorum tally: runs under the lock whenever a voter acknowledged.
    fn on_replica_update(&self, st: &mut LeaderState, actions: &mut Vec<Action>) {
        if st.round.is_none() {
            return;
        }
        let Some(head) = st.head else { return };

        let voters = self.defs.iter().filter(|d| d.is_voter()).count();
        let accepted = self
            .defs
            .iter()
            .zip(&st.machines)
            .filter(|(def, m)| def.is_voter() && m.txn_accepted.map(|a| a.id) == Some(head.id))
            .count();
        let majority = voters / 2 + 1;
        debug!(accepted, majority, "tally");
        if accepted < majority {
            return;
        }

        if st.role == LeaderRole::Candidate {
            info!(term = st.term, "election won; promoted to leader");
            st.role = LeaderRole::Leader;
        }
        st.committed = Some(head);

        // Local ground truth advances with the quorum so a completed
        // proposal is visible the moment its waiters wake.
        if let Some(tree) = st.head_tree.clone() {
            let prev = self.ref_db.committed_id().unwrap_or_default();
            if prev != head.id {
                if let Err(e) = self.ref_db.advance_committed(prev, head.id, &tree) {
                    warn!(error = %e, "local committed advance failed");
                }
            }
        }

        let round = st.round.take().expect("round checked above");
        round.success();

        // Propagate the commit to everyone already on the new head.
        for idx in 0..self.defs.len() {
            if st.machines[idx].txn_accepted.map(|a| a.id) != Some(head.id) {
                continue;
            }
            let def = &self.defs[idx];
            if def.is_local && def.config.commit_method == CommitMethod::TxnCommitted {
                // Already advanced directly above.
                st.machines[idx].txn_committed = Some(head);
                st.machines[idx].purge_staged(head.index);
                continue;
            }
            if def.config.commit_speed == CommitSpeed::Batched && !st.queued.is_empty() {
                // A new round is about to start; ride along with its accept.
                st.machines[idx].pending_commit = Some(head);
                continue;
            }
            let req = match def.config.commit_method {
                CommitMethod::TxnCommitted => {
                    let old = st.machines[idx]
                        .txn_committed
                        .map(|c| c.id)
                        .unwrap_or_default();
                    ReplicaPushRequest {
                        payload: PushPayload::Commands(vec![RefCommand::new(
                            TXN_COMMITTED,
                            RefTarget::Id(old),
                            RefTarget::Id(head.id),
                        )]),
                        accept: None,
                        commit: Some(head),
                    }
                }
                CommitMethod::AllRefs => ReplicaPushRequest {
                    payload: PushPayload::CommitDelta { committed: head },
                    accept: None,
                    commit: Some(head),
                },
            };
            self.queue_push(st, idx, req, actions);
        }

        if !st.queued.is_empty() && !st.task_scheduled {
            st.task_scheduled = true;
            actions.push(Action::ScheduleLeaderTask);
        }
    }

    /// A retry delay elapsed; release the parked work.
    fn retry_fire(self: &Arc<Self>, idx: usize) {
        let mut actions = Vec::new();
        {
            let mut st = self.lock();
            if st.role == LeaderRole::Shutdown {
                return;
            }
            let machine = &mut st.machines[idx];
            machine.retrying = false;
            machine.retry_task = None;
            debug!(replica = %self.defs[idx].name, "retry window elapsed");
            if let Some(next) = machine.take_next_push() {
                machine.mark_running(&next);
                actions.push(Action::StartPush { replica: idx, req: next });
            }
        }
        self.perform(actions);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::{
        config::{RefTreeConfig, ReplicaConfig, ReplicaType},
        hash::{HashKind, set_hash_kind_for_test},
        internal::{
            ketch::proposal::ProposalState,
            ketch::replica::{LocalTransport, ReplicaTransport},
            odb::MemObjectStore,
            refs::{RefDatabase, loose::LooseRefDatabase, ref_tree_db::BootstrapPolicy},
        },
    };

    fn id(n: u8) -> ObjectHash {
        ObjectHash::Sha1([n; 20])
    }

    fn voter(name: &str, transport: Arc<dyn ReplicaTransport>, is_local: bool) -> ReplicaDef {
        ReplicaDef {
            name: name.to_string(),
            config: ReplicaConfig {
                replica_type: ReplicaType::Voter,
                commit_method: CommitMethod::TxnCommitted,
                min_retry_millis: 10,
                max_retry_millis: 100,
                ..ReplicaConfig::default()
            },
            transport,
            is_local,
        }
    }

    struct Env {
        _dir: tempfile::TempDir,
        store: Arc<MemObjectStore>,
        ref_db: Arc<RefTreeDatabase>,
        bootstrap: Arc<LooseRefDatabase>,
    }

    fn env() -> Env {
        let dir = tempfile::tempdir().unwrap();
        let store = MemObjectStore::new();
        let bootstrap = Arc::new(LooseRefDatabase::new(dir.path()));
        let ref_db = Arc::new(RefTreeDatabase::new(
            store.clone(),
            bootstrap.clone(),
            BootstrapPolicy::RejectRefsTxn,
            &RefTreeConfig::default(),
        ));
        Env {
            _dir: dir,
            store,
            ref_db,
            bootstrap,
        }
    }

    fn local_leader(env: &Env) -> KetchLeader {
        let system = KetchSystem::new().unwrap();
        KetchLeader::new(
            system,
            env.store.clone(),
            env.ref_db.clone(),
            vec![voter(
                "local",
                Arc::new(LocalTransport::new(env.bootstrap.clone())),
                true,
            )],
        )
        .unwrap()
    }

    /// Topology validation: even or oversized voter sets are fatal, as is
    /// a missing or duplicated local voter.
    #[test]
    fn test_topology_validation() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let e = env();
        let system = KetchSystem::new().unwrap();
        let t = || -> Arc<dyn ReplicaTransport> {
            Arc::new(LocalTransport::new(e.bootstrap.clone()))
        };

        let two = vec![voter("a", t(), true), voter("b", t(), false)];
        assert!(KetchLeader::new(system.clone(), e.store.clone(), e.ref_db.clone(), two).is_err());

        let none_local = vec![voter("a", t(), false)];
        assert!(
            KetchLeader::new(system.clone(), e.store.clone(), e.ref_db.clone(), none_local)
                .is_err()
        );

        let ok = vec![voter("a", t(), true)];
        assert!(KetchLeader::new(system, e.store.clone(), e.ref_db.clone(), ok).is_ok());
    }

    /// Single-voter quorum: a proposal executes and the committed state
    /// becomes visible through the reference database.
    #[test]
    fn test_single_voter_commit() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let e = env();
        let leader = local_leader(&e);

        let proposal = Proposal::new(vec![RefCommand::create("refs/heads/main", id(1))]);
        leader.execute_async(proposal.clone()).unwrap();
        assert_eq!(
            proposal.await_done_timeout(Duration::from_secs(10)),
            Some(ProposalState::Executed)
        );

        let r = e.ref_db.exact_ref("refs/heads/main").unwrap().unwrap();
        assert_eq!(r.object_id(), Some(id(1)));

        let snap = leader.snapshot();
        assert_eq!(snap.role, LeaderRole::Leader);
        assert_eq!(snap.head, snap.committed);
        assert!(snap.idle);
        leader.shutdown();
    }

    /// Conflicting second proposal aborts while the first commits.
    #[test]
    fn test_conflict_abort() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let e = env();
        let leader = local_leader(&e);

        let p1 = Proposal::new(vec![RefCommand::create("refs/heads/main", id(1))]);
        leader.execute_async(p1.clone()).unwrap();
        p1.await_done();

        // Both claim old = C1; the second no longer matches after the first.
        let p2 = Proposal::new(vec![RefCommand::update("refs/heads/main", id(1), id(2))]);
        let p3 = Proposal::new(vec![RefCommand::update("refs/heads/main", id(1), id(3))]);
        leader.execute_async(p2.clone()).unwrap();
        leader.execute_async(p3.clone()).unwrap();

        assert_eq!(
            p2.await_done_timeout(Duration::from_secs(10)),
            Some(ProposalState::Executed)
        );
        assert_eq!(p3.state(), ProposalState::Aborted);
        assert!(p3
            .commands()
            .iter()
            .any(|c| c.result == RefUpdateResult::LockFailure));

        let r = e.ref_db.exact_ref("refs/heads/main").unwrap().unwrap();
        assert_eq!(r.object_id(), Some(id(2)));
        leader.shutdown();
    }

    /// A transport that can be switched into a failing mode.
    struct FlakyTransport {
        inner: LocalTransport,
        failing: AtomicBool,
    }

    impl FlakyTransport {
        fn new(db: Arc<dyn RefDatabase>) -> Arc<FlakyTransport> {
            Arc::new(FlakyTransport {
                inner: LocalTransport::new(db),
                failing: AtomicBool::new(false),
            })
        }
    }

    impl ReplicaTransport for FlakyTransport {
        fn advertised_refs(&self) -> Result<BTreeMap<String, ObjectHash>, GitError> {
            if self.failing.load(Ordering::Acquire) {
                return Err(GitError::ReplicaOffline(
                    "flaky".to_string(),
                    "connection refused".to_string(),
                ));
            }
            self.inner.advertised_refs()
        }

        fn push(&self, commands: &mut [RefCommand]) -> Result<(), GitError> {
            if self.failing.load(Ordering::Acquire) {
                return Err(GitError::ReplicaOffline(
                    "flaky".to_string(),
                    "connection refused".to_string(),
                ));
            }
            self.inner.push(commands)
        }
    }

    /// Three voters with one offline: quorum still commits, the dead peer
    /// goes OFFLINE with a retry armed, and recovers on the next window.
    #[test]
    fn test_three_voters_one_offline() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let e = env();
        let v2_dir = tempfile::tempdir().unwrap();
        let v3_dir = tempfile::tempdir().unwrap();
        let v2_db = Arc::new(LooseRefDatabase::new(v2_dir.path()));
        let v3_db = Arc::new(LooseRefDatabase::new(v3_dir.path()));
        let v3_transport = FlakyTransport::new(v3_db.clone());
        v3_transport.failing.store(true, Ordering::Release);

        let system = KetchSystem::new().unwrap();
        let leader = KetchLeader::new(
            system,
            e.store.clone(),
            e.ref_db.clone(),
            vec![
                voter(
                    "local",
                    Arc::new(LocalTransport::new(e.bootstrap.clone())),
                    true,
                ),
                voter("v2", Arc::new(LocalTransport::new(v2_db.clone())), false),
                voter("v3", v3_transport.clone(), false),
            ],
        )
        .unwrap();

        let proposal = Proposal::new(vec![RefCommand::create("refs/heads/main", id(1))]);
        leader.execute_async(proposal.clone()).unwrap();
        assert_eq!(
            proposal.await_done_timeout(Duration::from_secs(10)),
            Some(ProposalState::Executed)
        );

        // The healthy voter observed the accepted log entry.
        assert!(v2_db.exact_ref(TXN_ACCEPTED).unwrap().is_some());

        // The dead peer is OFFLINE with a retry scheduled.
        let snap = leader.snapshot();
        let v3 = snap.replicas.iter().find(|r| r.name == "v3").unwrap();
        assert_eq!(v3.state, ReplicaState::Offline);
        assert!(v3.error.is_some());
        assert!(v3.retrying || v3.queued_pushes > 0);

        // Heal the peer; the retry loop catches it up.
        v3_transport.failing.store(false, Ordering::Release);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let snap = leader.snapshot();
            let v3 = snap.replicas.iter().find(|r| r.name == "v3").unwrap();
            if v3.state == ReplicaState::Current {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "v3 never recovered: {v3:?}"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
        leader.shutdown();
    }

    /// Sequential proposals keep FIFO order and advance the log index.
    #[test]
    fn test_sequential_proposals() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let e = env();
        let leader = local_leader(&e);

        for n in 1..=3u8 {
            let cmd = if n == 1 {
                RefCommand::create("refs/heads/main", id(1))
            } else {
                RefCommand::update("refs/heads/main", id(n - 1), id(n))
            };
            let p = Proposal::new(vec![cmd]);
            leader.execute_async(p.clone()).unwrap();
            assert_eq!(
                p.await_done_timeout(Duration::from_secs(10)),
                Some(ProposalState::Executed),
                "proposal {n}"
            );
        }
        let r = e.ref_db.exact_ref("refs/heads/main").unwrap().unwrap();
        assert_eq!(r.object_id(), Some(id(3)));

        let snap = leader.snapshot();
        assert!(snap.committed.unwrap().index >= 3);
        leader.shutdown();
    }

    /// Proposals after shutdown are refused; pending ones abort.
    #[test]
    fn test_shutdown() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let e = env();
        let leader = local_leader(&e);
        leader.shutdown();

        let p = Proposal::new(vec![RefCommand::create("refs/heads/main", id(1))]);
        assert!(leader.execute_async(p).is_err());
        assert_eq!(leader.snapshot().role, LeaderRole::Shutdown);
    }

    /// Snapshots serialize for external observation.
    #[test]
    fn test_snapshot_serializes() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let e = env();
        let leader = local_leader(&e);
        let json = serde_json::to_string(&leader.snapshot()).unwrap();
        assert!(json.contains("CANDIDATE"));
        leader.shutdown();
    }
}
