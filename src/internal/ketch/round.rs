//! One consensus attempt for one log entry.
//!
//! An election round writes a commit with no content change that merely
//! advances the term; a proposal round bundles the queued proposals, whose
//! effects are already in the leader's cached tree, stages any new objects
//! under the stage namespace, and writes the next log-entry commit. Rounds
//! are created under the leader's lock but run `start` without it; their
//! `success` runs back under the lock, invoked only by the quorum tally.

use std::sync::Arc;

use tracing::debug;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::{
        refs::{R_TXN_STAGE, RefCommand, ref_tree::RefTree, ref_tree_db::RefTreeDatabase},
    },
};

use super::{LogIndex, proposal::Proposal};

/// The round kinds are a closed set; dispatch is by variant.
pub(crate) enum Round {
    Election(ElectionRound),
    Proposal(ProposalRound),
}

/// Advances the term without changing the reference content.
pub(crate) struct ElectionRound {
    pub term: u64,
    pub tree: Arc<RefTree>,
    pub parent: Option<LogIndex>,
}

/// Carries a FIFO batch of proposals into one log entry.
pub(crate) struct ProposalRound {
    pub proposals: Vec<Arc<Proposal>>,
    pub tree: Arc<RefTree>,
    pub parent: Option<LogIndex>,
    /// Stage references created for object ids this entry introduces.
    pub stage: Vec<RefCommand>,
}

impl ProposalRound {
    /// Stage commands for every id the proposals introduce that the
    /// previous tree did not reference.
    pub fn stage_commands(previous: &RefTree, proposals: &[Arc<Proposal>]) -> Vec<RefCommand> {
        let known = previous.gitlink_refs();
        let mut known_ids: std::collections::HashSet<ObjectHash> =
            known.values().copied().collect();
        let mut stage = Vec::new();
        for proposal in proposals {
            for cmd in proposal.commands() {
                let Some(id) = cmd.new.id() else { continue };
                if known_ids.insert(id) {
                    stage.push(RefCommand::create(format!("{R_TXN_STAGE}{id}"), id));
                }
            }
        }
        stage
    }
}

impl Round {
    pub fn parent(&self) -> Option<LogIndex> {
        match self {
            Round::Election(r) => r.parent,
            Round::Proposal(r) => r.parent,
        }
    }

    /// Write the tree and the new log-entry commit. Runs off the leader
    /// lock; only the object store is touched.
    pub fn start(&self, ref_db: &RefTreeDatabase) -> Result<ObjectHash, GitError> {
        let (tree, message) = match self {
            Round::Election(r) => (&r.tree, format!("term {}\n", r.term)),
            Round::Proposal(r) => {
                let updates: usize = r.proposals.iter().map(|p| p.commands().len()).sum();
                (&r.tree, format!("update {updates} refs\n"))
            }
        };
        let parent = self.parent().map(|p| p.id).unwrap_or_default();
        let new_id = ref_db.write_tree_commit(tree, parent, &message)?;
        debug!(%new_id, "round created log entry");
        Ok(new_id)
    }

    /// Quorum reached: release the round's proposals with their results.
    pub fn success(&self) {
        if let Round::Proposal(r) = self {
            for proposal in &r.proposals {
                proposal.complete();
            }
        }
    }

    /// The round cannot complete (leader shutdown); abort its proposals.
    pub fn abort(&self) {
        if let Round::Proposal(r) = self {
            for proposal in &r.proposals {
                proposal.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hash::{HashKind, set_hash_kind_for_test},
        internal::refs::RefTarget,
    };

    fn id(n: u8) -> ObjectHash {
        ObjectHash::Sha1([n; 20])
    }

    /// Only ids new to the tree are staged, each exactly once.
    #[test]
    fn test_stage_commands() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut previous = RefTree::new_empty();
        let mut seed = vec![RefCommand::create("refs/heads/main", id(1))];
        assert!(previous.apply(&mut seed));

        let p1 = Proposal::new(vec![
            RefCommand::update("refs/heads/main", id(1), id(2)),
            RefCommand::create("refs/heads/copy", id(1)), // already referenced
        ]);
        let p2 = Proposal::new(vec![RefCommand::create("refs/heads/other", id(2))]);

        let stage = ProposalRound::stage_commands(&previous, &[p1, p2]);
        assert_eq!(stage.len(), 1);
        assert_eq!(stage[0].name, format!("refs/txn/stage/{}", id(2)));
        assert_eq!(stage[0].new, RefTarget::Id(id(2)));
    }

    /// Election success touches no proposals; proposal success completes
    /// them all.
    #[test]
    fn test_success_dispatch() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let tree = Arc::new(RefTree::new_empty());

        let election = Round::Election(ElectionRound {
            term: 1,
            tree: tree.clone(),
            parent: None,
        });
        election.success();

        let proposal = Proposal::new(vec![RefCommand::create("refs/heads/main", id(1))]);
        let round = Round::Proposal(ProposalRound {
            proposals: vec![proposal.clone()],
            tree,
            parent: None,
            stage: Vec::new(),
        });
        round.success();
        assert!(proposal.state().is_done());
    }
}
