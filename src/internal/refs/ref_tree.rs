//! The reference namespace encoded as a single Git tree.
//!
//! Each reference `refs/X` lives at path `X` under a synthetic root; names
//! outside `refs/` (such as `HEAD`) are escaped with the `..` prefix. A
//! plain reference is a gitlink-mode entry carrying the referenced id; a
//! symbolic reference is a symlink-mode entry whose blob holds the target
//! name; a peeled annotated tag adds a gitlink entry at `<path> ^` with
//! the peeled id. Reading the universe of references therefore reduces to
//! reading one tree.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::{
        object::{
            blob::Blob,
            tree::{Tree, TreeItem, TreeItemMode},
        },
        odb::{ObjectStore, read_blob, read_tree, write_object},
        refs::{
            MAX_SYMBOLIC_REF_DEPTH, R_REFS, Ref, RefCommand, RefStorage, RefTarget,
            RefUpdateResult, is_valid_ref_name,
        },
    },
};

/// Escape prefix for names outside `refs/`.
pub const ROOT_DOTDOT: &str = "..";
/// Suffix of the gitlink entry carrying a peeled tag id.
pub const PEEL_SUFFIX: &str = " ^";

/// One stored entry of the namespace tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum TreeRecord {
    /// Gitlink entry: the reference points at this id.
    Gitlink(ObjectHash),
    /// Symlink entry: a blob holding the target reference name.
    Symref(String),
}

/// In-memory image of the reference namespace tree.
///
/// Cloning is a plain map copy; the leader's copy-on-write cache relies on
/// that being cheap relative to a round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefTree {
    entries: BTreeMap<String, TreeRecord>,
}

/// Map a reference name to its tree path.
fn ref_to_path(name: &str) -> String {
    match name.strip_prefix(R_REFS) {
        Some(rest) => rest.to_string(),
        None => format!("{ROOT_DOTDOT}{name}"),
    }
}

/// Map a tree path back to its reference name.
fn path_to_ref(path: &str) -> String {
    match path.strip_prefix(ROOT_DOTDOT) {
        Some(rest) => rest.to_string(),
        None => format!("{R_REFS}{path}"),
    }
}

impl RefTree {
    /// The empty namespace.
    pub fn new_empty() -> RefTree {
        RefTree::default()
    }

    /// Number of references (peel entries excluded).
    pub fn len(&self) -> usize {
        self.entries
            .keys()
            .filter(|k| !k.ends_with(PEEL_SUFFIX))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load the namespace from a written tree.
    pub fn read(store: &dyn ObjectStore, tree_id: &ObjectHash) -> Result<RefTree, GitError> {
        let mut tree = RefTree::new_empty();
        tree.read_dir(store, tree_id, "")?;
        Ok(tree)
    }

    fn read_dir(
        &mut self,
        store: &dyn ObjectStore,
        tree_id: &ObjectHash,
        prefix: &str,
    ) -> Result<(), GitError> {
        let dir = read_tree(store, tree_id)?;
        for item in dir.tree_items {
            let path = if prefix.is_empty() {
                item.name.clone()
            } else {
                format!("{prefix}/{}", item.name)
            };
            match item.mode {
                TreeItemMode::Tree => self.read_dir(store, &item.id, &path)?,
                TreeItemMode::Commit => {
                    self.entries.insert(path, TreeRecord::Gitlink(item.id));
                }
                TreeItemMode::Link => {
                    let blob = read_blob(store, &item.id)?;
                    let target = String::from_utf8(blob.data).map_err(|_| {
                        GitError::ConversionError(format!("symref blob at {path}"))
                    })?;
                    self.entries
                        .insert(path, TreeRecord::Symref(target.trim_end().to_string()));
                }
                other => {
                    return Err(GitError::InvalidTreeItem(format!(
                        "{path} has mode {:?} inside a ref tree",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write the namespace as nested tree objects, returning the root id.
    pub fn write(&self, store: &dyn ObjectStore) -> Result<ObjectHash, GitError> {
        #[derive(Default)]
        struct Dir {
            files: Vec<TreeItem>,
            dirs: BTreeMap<String, Dir>,
        }

        fn place(dir: &mut Dir, path: &str, item: TreeItem) {
            match path.split_once('/') {
                Some((head, rest)) => {
                    place(dir.dirs.entry(head.to_string()).or_default(), rest, item)
                }
                None => dir.files.push(item),
            }
        }

        fn flush(store: &dyn ObjectStore, dir: Dir) -> Result<ObjectHash, GitError> {
            let mut items = dir.files;
            for (name, sub) in dir.dirs {
                let id = flush(store, sub)?;
                items.push(TreeItem::new(TreeItemMode::Tree, id, name));
            }
            let tree = Tree::from_tree_items(items)?;
            write_object(store, &tree)
        }

        let mut root = Dir::default();
        for (path, record) in &self.entries {
            let leaf_name = path.rsplit('/').next().unwrap_or(path).to_string();
            let item = match record {
                TreeRecord::Gitlink(id) => TreeItem::new(TreeItemMode::Commit, *id, leaf_name),
                TreeRecord::Symref(target) => {
                    let blob = Blob::from_content_bytes(target.as_bytes().to_vec());
                    let id = write_object(store, &blob)?;
                    TreeItem::new(TreeItemMode::Link, id, leaf_name)
                }
            };
            place(&mut root, path, item);
        }
        flush(store, root)
    }

    /// True if the namespace holds `name` directly (symbolic or object).
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&ref_to_path(name))
    }

    /// Exact lookup, resolving symbolic chains up to the depth bound.
    pub fn exact_ref(&self, name: &str) -> Option<Ref> {
        self.lookup(name, 0)
    }

    fn lookup(&self, name: &str, depth: usize) -> Option<Ref> {
        if depth >= MAX_SYMBOLIC_REF_DEPTH {
            return None;
        }
        let path = ref_to_path(name);
        match self.entries.get(&path)? {
            TreeRecord::Gitlink(id) => {
                let peeled_path = format!("{path}{PEEL_SUFFIX}");
                match self.entries.get(&peeled_path) {
                    Some(TreeRecord::Gitlink(peeled)) => Some(Ref::peeled_tag(
                        name,
                        RefStorage::Packed,
                        *id,
                        *peeled,
                    )),
                    _ => Some(Ref::object(name, RefStorage::Packed, *id)),
                }
            }
            TreeRecord::Symref(target) => {
                let leaf = match self.lookup(target, depth + 1) {
                    Some(r) => r,
                    None => {
                        if self.entries.contains_key(&ref_to_path(target)) {
                            // Present but beyond the depth bound.
                            return None;
                        }
                        Ref::unborn(target.clone())
                    }
                };
                Some(Ref::symbolic(name, RefStorage::Packed, leaf))
            }
        }
    }

    /// All references whose name starts with `prefix`, peel entries
    /// excluded. Prefix-shape rules are the caller's concern.
    pub fn get_refs(&self, prefix: &str) -> BTreeMap<String, Ref> {
        let mut out = BTreeMap::new();
        for path in self.entries.keys() {
            if path.ends_with(PEEL_SUFFIX) {
                continue;
            }
            let name = path_to_ref(path);
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(r) = self.exact_ref(&name) {
                out.insert(name, r);
            }
        }
        out
    }

    /// Raw (name, id) pairs of every gitlink entry, peel entries excluded.
    /// This is the surface commit propagation walks.
    pub fn gitlink_refs(&self) -> BTreeMap<String, ObjectHash> {
        let mut out = BTreeMap::new();
        for (path, record) in &self.entries {
            if path.ends_with(PEEL_SUFFIX) {
                continue;
            }
            if let TreeRecord::Gitlink(id) = record {
                out.insert(path_to_ref(path), *id);
            }
        }
        out
    }

    /// Within-tree name conflicts: `name` used as a directory by an
    /// existing entry, or an existing entry sitting on a parent path.
    fn conflicts(entries: &BTreeMap<String, TreeRecord>, name: &str) -> bool {
        let path = ref_to_path(name);
        let as_dir = format!("{path}/");
        if entries
            .range(as_dir.clone()..)
            .take_while(|(k, _)| k.starts_with(&as_dir))
            .next()
            .is_some()
        {
            return true;
        }
        let mut parent = path.as_str();
        while let Some((head, _)) = parent.rsplit_once('/') {
            if entries.contains_key(head) {
                return true;
            }
            parent = head;
        }
        false
    }

    /// Apply a batch of commands atomically.
    ///
    /// Every command's expected old value must match the current entry and
    /// no name conflict may arise; otherwise the offending command gets its
    /// specific result, the tree is left untouched, and `false` is
    /// returned (the caller aborts the remaining commands).
    pub fn apply(&mut self, commands: &mut [RefCommand]) -> bool {
        let mut scratch = self.entries.clone();
        for cmd in commands.iter_mut() {
            if !is_valid_ref_name(&cmd.name) {
                cmd.result = RefUpdateResult::RejectedInvalidName;
                return false;
            }
            if !Self::matches_in(&scratch, cmd) {
                debug!(name = %cmd.name, "ref tree old value mismatch");
                cmd.result = RefUpdateResult::LockFailure;
                return false;
            }
            let path = ref_to_path(&cmd.name);
            let peel_path = format!("{path}{PEEL_SUFFIX}");
            scratch.remove(&path);
            scratch.remove(&peel_path);
            if !cmd.is_delete() {
                if Self::conflicts(&scratch, &cmd.name) {
                    debug!(name = %cmd.name, "ref tree name conflict");
                    cmd.result = RefUpdateResult::LockFailure;
                    return false;
                }
                match &cmd.new {
                    RefTarget::Id(id) => {
                        scratch.insert(path, TreeRecord::Gitlink(*id));
                    }
                    RefTarget::PeeledTag { id, peeled } => {
                        scratch.insert(path, TreeRecord::Gitlink(*id));
                        scratch.insert(peel_path, TreeRecord::Gitlink(*peeled));
                    }
                    RefTarget::Symbolic(target) => {
                        scratch.insert(path, TreeRecord::Symref(target.clone()));
                    }
                }
            }
        }
        self.entries = scratch;
        true
    }

    fn matches_in(scratch: &BTreeMap<String, TreeRecord>, cmd: &RefCommand) -> bool {
        let observed = scratch.get(&ref_to_path(&cmd.name));
        match (&cmd.old, observed) {
            (old, None) => old.is_absent(),
            (RefTarget::Id(want), Some(TreeRecord::Gitlink(have))) => want == have,
            (RefTarget::PeeledTag { id, .. }, Some(TreeRecord::Gitlink(have))) => id == have,
            (RefTarget::Symbolic(want), Some(TreeRecord::Symref(have))) => want == have,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hash::{HashKind, set_hash_kind_for_test},
        internal::{odb::MemObjectStore, refs::HEAD},
    };

    fn id(n: u8) -> ObjectHash {
        ObjectHash::Sha1([n; 20])
    }

    /// Name-to-path mapping, including the root escape.
    #[test]
    fn test_path_mapping() {
        assert_eq!(ref_to_path("refs/heads/main"), "heads/main");
        assert_eq!(ref_to_path("HEAD"), "..HEAD");
        assert_eq!(path_to_ref("heads/main"), "refs/heads/main");
        assert_eq!(path_to_ref("..HEAD"), "HEAD");
    }

    /// Creating, updating, and deleting entries through apply.
    #[test]
    fn test_apply_basic() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut tree = RefTree::new_empty();

        let mut cmds = vec![
            RefCommand::create("refs/heads/main", id(1)),
            RefCommand::link(HEAD, RefTarget::zero(), "refs/heads/main"),
        ];
        assert!(tree.apply(&mut cmds));
        assert_eq!(tree.len(), 2);

        let main = tree.exact_ref("refs/heads/main").unwrap();
        assert_eq!(main.object_id(), Some(id(1)));
        let head = tree.exact_ref(HEAD).unwrap();
        assert!(head.is_symbolic());
        assert_eq!(head.object_id(), Some(id(1)));

        let mut del = vec![RefCommand::delete("refs/heads/main", id(1))];
        assert!(tree.apply(&mut del));
        assert!(tree.exact_ref("refs/heads/main").is_none());
        // HEAD now dangles at an unborn leaf.
        assert_eq!(tree.exact_ref(HEAD).unwrap().object_id(), None);
    }

    /// A stale old value rejects the batch and leaves the tree untouched.
    #[test]
    fn test_apply_atomic_reject() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut tree = RefTree::new_empty();
        let mut seed = vec![RefCommand::create("refs/heads/main", id(1))];
        assert!(tree.apply(&mut seed));
        let before = tree.clone();

        let mut cmds = vec![
            RefCommand::create("refs/heads/ok", id(2)),
            RefCommand::update("refs/heads/main", id(9), id(3)),
        ];
        assert!(!tree.apply(&mut cmds));
        assert_eq!(cmds[1].result, RefUpdateResult::LockFailure);
        assert_eq!(tree, before);
        assert!(tree.exact_ref("refs/heads/ok").is_none());
    }

    /// `refs/heads/a` blocks `refs/heads/a/b` and vice versa.
    #[test]
    fn test_name_conflicts() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut tree = RefTree::new_empty();
        let mut seed = vec![RefCommand::create("refs/heads/a", id(1))];
        assert!(tree.apply(&mut seed));

        let mut nested = vec![RefCommand::create("refs/heads/a/b", id(2))];
        assert!(!tree.apply(&mut nested));
        assert_eq!(nested[0].result, RefUpdateResult::LockFailure);

        let mut tree2 = RefTree::new_empty();
        let mut seed2 = vec![RefCommand::create("refs/heads/a/b", id(1))];
        assert!(tree2.apply(&mut seed2));
        let mut parent = vec![RefCommand::create("refs/heads/a", id(2))];
        assert!(!tree2.apply(&mut parent));
    }

    /// A peeled tag writes the extra `<name> ^` entry and reads back.
    #[test]
    fn test_peeled_tag_entries() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut tree = RefTree::new_empty();
        let mut cmds = vec![RefCommand::new(
            "refs/tags/v1",
            RefTarget::zero(),
            RefTarget::PeeledTag {
                id: id(7),
                peeled: id(8),
            },
        )];
        assert!(tree.apply(&mut cmds));

        let tag = tree.exact_ref("refs/tags/v1").unwrap();
        assert_eq!(tag.object_id(), Some(id(7)));
        assert_eq!(tag.peeled_id(), Some(id(8)));

        // The peel entry travels through write/read.
        let store = MemObjectStore::new();
        let tree_id = tree.write(store.as_ref()).unwrap();
        let back = RefTree::read(store.as_ref(), &tree_id).unwrap();
        assert_eq!(back, tree);
    }

    /// write/read round-trips a namespace with nesting and symrefs.
    #[test]
    fn test_write_read_round_trip() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut tree = RefTree::new_empty();
        let mut cmds = vec![
            RefCommand::create("refs/heads/main", id(1)),
            RefCommand::create("refs/heads/feature/x", id(2)),
            RefCommand::create("refs/tags/v1", id(3)),
            RefCommand::link(HEAD, RefTarget::zero(), "refs/heads/main"),
        ];
        assert!(tree.apply(&mut cmds));

        let store = MemObjectStore::new();
        let tree_id = tree.write(store.as_ref()).unwrap();
        let back = RefTree::read(store.as_ref(), &tree_id).unwrap();
        assert_eq!(back, tree);
        assert_eq!(back.get_refs("refs/heads/").len(), 2);
        assert_eq!(back.gitlink_refs().len(), 3);

        // Same content writes the same tree id.
        assert_eq!(tree.write(store.as_ref()).unwrap(), tree_id);
    }

    /// Six symbolic hops inside the tree resolve to None.
    #[test]
    fn test_symbolic_depth_bound() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let mut tree = RefTree::new_empty();
        let mut cmds = vec![RefCommand::create("refs/chain/t", id(1))];
        for i in 0..6 {
            let target = if i == 5 {
                "refs/chain/t".to_string()
            } else {
                format!("refs/chain/{}", i + 1)
            };
            cmds.push(RefCommand::link(
                format!("refs/chain/{i}"),
                RefTarget::zero(),
                target,
            ));
        }
        assert!(tree.apply(&mut cmds));
        assert!(tree.exact_ref("refs/chain/0").is_none());
        assert!(tree.exact_ref("refs/chain/2").is_some());
    }
}
