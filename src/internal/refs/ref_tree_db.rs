//! Reference database whose ground truth is a RefTree commit.
//!
//! The committed namespace is one commit object: its tree is the RefTree,
//! its parent the previous committed state. The commit is anchored by a
//! bootstrap reference (`refs/txn/committed` by default) living in a
//! separate loose store, because storing `refs/txn/*` inside the tree
//! would create a cycle. Batch updates rebuild the tree, write a new
//! commit, and advance the bootstrap reference by compare-and-swap.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::{
    config::RefTreeConfig,
    errors::GitError,
    hash::ObjectHash,
    internal::{
        object::{commit::Commit, types::ObjectType},
        odb::{ObjectStore, peel_tag_chain, read_commit, read_tag, write_object},
        refs::{
            BatchRefUpdate, Peeled, R_TXN, Ref, RefCommand, RefDatabase, RefTarget,
            RefUpdateResult, RefValue, abort_remaining, is_valid_prefix, is_valid_ref_name,
            ref_tree::RefTree,
        },
    },
};

/// How the bootstrap layer and the tree layer overlap on `refs/txn/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapPolicy {
    /// Bootstrap references are visible under `refs/txn/`; updates there
    /// go to the bootstrap store.
    ShowAll,
    /// Bootstrap is hidden; any update under `refs/txn/` is rejected with
    /// a lock failure.
    #[default]
    RejectRefsTxn,
    /// Bootstrap is hidden; ordinary user references may reuse the
    /// namespace. The bootstrap is reached only through its getter.
    HideRefsTxn,
}

/// Committer identity stamped on log-entry commits.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        CommitIdentity {
            name: "ketch".to_string(),
            email: "ketch@localhost".to_string(),
        }
    }
}

/// The RefTree-backed reference database.
pub struct RefTreeDatabase {
    store: Arc<dyn ObjectStore>,
    bootstrap: Arc<dyn RefDatabase>,
    policy: BootstrapPolicy,
    committed_ref: String,
    identity: CommitIdentity,
    cache: RwLock<Option<(ObjectHash, RefTree)>>,
}

impl RefTreeDatabase {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bootstrap: Arc<dyn RefDatabase>,
        policy: BootstrapPolicy,
        config: &RefTreeConfig,
    ) -> RefTreeDatabase {
        RefTreeDatabase {
            store,
            bootstrap,
            policy,
            committed_ref: config.committed_ref.clone(),
            identity: CommitIdentity::default(),
            cache: RwLock::new(None),
        }
    }

    pub fn with_identity(mut self, identity: CommitIdentity) -> RefTreeDatabase {
        self.identity = identity;
        self
    }

    /// The bootstrap store, reachable regardless of policy.
    pub fn bootstrap(&self) -> &Arc<dyn RefDatabase> {
        &self.bootstrap
    }

    /// Name of the bootstrap anchor reference.
    pub fn committed_ref_name(&self) -> &str {
        &self.committed_ref
    }

    /// Id of the current committed log-entry commit, zero when unborn.
    pub fn committed_id(&self) -> Result<ObjectHash, GitError> {
        Ok(self
            .bootstrap
            .exact_ref(&self.committed_ref)?
            .and_then(|r| r.object_id())
            .unwrap_or_default())
    }

    /// Snapshot of the current tree alongside the commit id it came from.
    pub fn current(&self) -> Result<(ObjectHash, RefTree), GitError> {
        let committed = self.committed_id()?;
        if let Some((cached_id, tree)) = self.cache.read().expect("ref tree cache lock").as_ref()
        {
            if *cached_id == committed {
                return Ok((committed, tree.clone()));
            }
        }
        let tree = if committed.is_zero() {
            RefTree::new_empty()
        } else {
            let commit = read_commit(self.store.as_ref(), &committed)?;
            RefTree::read(self.store.as_ref(), &commit.tree_id)?
        };
        *self.cache.write().expect("ref tree cache lock") = Some((committed, tree.clone()));
        Ok((committed, tree))
    }

    fn is_txn_name(&self, name: &str) -> bool {
        name.starts_with(R_TXN)
    }

    /// Write `tree`, wrap it in a commit with `parent`, and return the new
    /// commit id. Used both here and by the consensus rounds.
    pub fn write_tree_commit(
        &self,
        tree: &RefTree,
        parent: ObjectHash,
        message: &str,
    ) -> Result<ObjectHash, GitError> {
        let tree_id = tree.write(self.store.as_ref())?;
        let parents = if parent.is_zero() {
            Vec::new()
        } else {
            vec![parent]
        };
        let commit = Commit::from_tree_id(
            tree_id,
            parents,
            &self.identity.name,
            &self.identity.email,
            message,
        )?;
        write_object(self.store.as_ref(), &commit)
    }

    /// Advance the bootstrap anchor from `old` to `new` by CAS. On success
    /// the cache is primed with the new tree.
    pub fn advance_committed(
        &self,
        old: ObjectHash,
        new: ObjectHash,
        tree: &RefTree,
    ) -> Result<RefUpdateResult, GitError> {
        let result = self.bootstrap.update_ref(RefCommand::new(
            self.committed_ref.clone(),
            RefTarget::Id(old),
            RefTarget::Id(new),
        ))?;
        if result == RefUpdateResult::Ok {
            *self.cache.write().expect("ref tree cache lock") = Some((new, tree.clone()));
        }
        Ok(result)
    }
}

impl RefDatabase for RefTreeDatabase {
    fn exact_ref(&self, name: &str) -> Result<Option<Ref>, GitError> {
        if self.is_txn_name(name) && self.policy == BootstrapPolicy::ShowAll {
            return self.bootstrap.exact_ref(name);
        }
        let (_, tree) = self.current()?;
        Ok(tree.exact_ref(name))
    }

    fn get_refs(&self, prefix: &str) -> Result<BTreeMap<String, Ref>, GitError> {
        if !is_valid_prefix(prefix) {
            return Ok(BTreeMap::new());
        }
        let (_, tree) = self.current()?;
        let mut out = tree.get_refs(prefix);
        if self.policy == BootstrapPolicy::ShowAll {
            for (name, r) in self.bootstrap.get_refs(prefix)? {
                if self.is_txn_name(&name) {
                    out.insert(name, r);
                }
            }
        } else {
            out.retain(|name, _| self.policy == BootstrapPolicy::HideRefsTxn || !self.is_txn_name(name));
        }
        Ok(out)
    }

    fn additional_refs(&self) -> Result<Vec<Ref>, GitError> {
        self.bootstrap.additional_refs()
    }

    fn peel(&self, reference: &Ref) -> Result<Ref, GitError> {
        let leaf = reference.leaf();
        let RefValue::Object { id, peeled } = &leaf.value else {
            return Ok(reference.clone());
        };
        if *peeled != Peeled::Unpeeled || id.is_zero() {
            return Ok(reference.clone());
        }
        let peeled_value = match self.store.get(id)? {
            Some(obj) if obj.obj_type == ObjectType::Tag => {
                let tag = read_tag(self.store.as_ref(), id)?;
                Peeled::Tag(peel_tag_chain(self.store.as_ref(), &tag.object_hash)?)
            }
            _ => Peeled::NonTag,
        };
        let mut peeled_ref = reference.clone();
        let mut cursor = &mut peeled_ref;
        loop {
            match &mut cursor.value {
                RefValue::Symbolic { target } => cursor = target,
                RefValue::Object { peeled, .. } => {
                    *peeled = peeled_value;
                    break;
                }
            }
        }
        Ok(peeled_ref)
    }

    fn apply_batch(&self, batch: &mut BatchRefUpdate) -> Result<(), GitError> {
        // Validate names and apply policy before touching anything.
        for i in 0..batch.commands.len() {
            let cmd = &batch.commands[i];
            if !is_valid_ref_name(&cmd.name) {
                batch.commands[i].result = RefUpdateResult::RejectedInvalidName;
                abort_remaining(&mut batch.commands);
                return Ok(());
            }
            if self.is_txn_name(&cmd.name) && self.policy == BootstrapPolicy::RejectRefsTxn {
                debug!(name = %cmd.name, "refs/txn update rejected by policy");
                batch.commands[i].result = RefUpdateResult::LockFailure;
                abort_remaining(&mut batch.commands);
                return Ok(());
            }
        }

        // Under show-all, transactional names route to the bootstrap
        // store; a batch mixing the two layers cannot be atomic and is
        // rejected on its first transactional command.
        if self.policy == BootstrapPolicy::ShowAll {
            if batch.commands.iter().all(|c| self.is_txn_name(&c.name)) {
                return self.bootstrap.apply_batch(batch);
            }
            if let Some(i) = batch
                .commands
                .iter()
                .position(|c| self.is_txn_name(&c.name))
            {
                batch.commands[i].result = RefUpdateResult::LockFailure;
                abort_remaining(&mut batch.commands);
                return Ok(());
            }
        }

        let (committed, mut tree) = self.current()?;
        if !tree.apply(&mut batch.commands) {
            abort_remaining(&mut batch.commands);
            return Ok(());
        }

        let new_commit = self.write_tree_commit(&tree, committed, "update refs\n")?;
        match self.advance_committed(committed, new_commit, &tree)? {
            RefUpdateResult::Ok => {
                for cmd in &mut batch.commands {
                    cmd.result = RefUpdateResult::Ok;
                }
            }
            rejected => {
                debug!(?rejected, "bootstrap compare-and-swap lost");
                for cmd in &mut batch.commands {
                    cmd.result = rejected.clone();
                }
            }
        }
        Ok(())
    }

    fn performs_atomic_transactions(&self) -> bool {
        true
    }
}
