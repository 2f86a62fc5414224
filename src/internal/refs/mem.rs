//! Prefix-queryable in-memory reference cache.
//!
//! A ternary search tree keyed by full reference name fronts a wrapped
//! reference database. Writes that go through the wrapped database are
//! reflected into the trie by explicit callbacks, and `reload` swaps the
//! whole trie atomically. A reader-writer lock keeps many concurrent
//! readers consistent against the one reloader.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::{
    errors::GitError,
    internal::refs::{
        BatchRefUpdate, Ref, RefCommand, RefDatabase, RefStorage, RefTarget, RefUpdateResult,
        is_valid_prefix,
    },
};

struct Node<V> {
    ch: u8,
    lo: Option<Box<Node<V>>>,
    eq: Option<Box<Node<V>>>,
    hi: Option<Box<Node<V>>>,
    value: Option<V>,
}

impl<V> Node<V> {
    fn new(ch: u8) -> Box<Node<V>> {
        Box::new(Node {
            ch,
            lo: None,
            eq: None,
            hi: None,
            value: None,
        })
    }
}

/// Ternary search tree over byte-string keys. In-order traversal yields
/// keys in lexicographic order, which makes prefix enumeration a plain
/// subtree walk.
pub struct TernarySearchTree<V> {
    root: Option<Box<Node<V>>>,
    len: usize,
}

impl<V> Default for TernarySearchTree<V> {
    fn default() -> Self {
        TernarySearchTree { root: None, len: 0 }
    }
}

impl<V> TernarySearchTree<V> {
    pub fn new() -> TernarySearchTree<V> {
        TernarySearchTree::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, key: &str, value: V) -> Option<V> {
        assert!(!key.is_empty(), "empty keys are not stored");
        let bytes = key.as_bytes();
        let mut slot = &mut self.root;
        let mut i = 0;
        loop {
            match slot {
                None => {
                    *slot = Some(Node::new(bytes[i]));
                }
                Some(node) => match bytes[i].cmp(&node.ch) {
                    std::cmp::Ordering::Less => slot = &mut node.lo,
                    std::cmp::Ordering::Greater => slot = &mut node.hi,
                    std::cmp::Ordering::Equal => {
                        if i + 1 == bytes.len() {
                            let old = node.value.replace(value);
                            if old.is_none() {
                                self.len += 1;
                            }
                            return old;
                        }
                        i += 1;
                        slot = &mut node.eq;
                    }
                },
            }
        }
    }

    fn find_node<'a>(&'a self, key: &str) -> Option<&'a Node<V>> {
        let bytes = key.as_bytes();
        if bytes.is_empty() {
            return None;
        }
        let mut node = self.root.as_deref()?;
        let mut i = 0;
        loop {
            match bytes[i].cmp(&node.ch) {
                std::cmp::Ordering::Less => node = node.lo.as_deref()?,
                std::cmp::Ordering::Greater => node = node.hi.as_deref()?,
                std::cmp::Ordering::Equal => {
                    if i + 1 == bytes.len() {
                        return Some(node);
                    }
                    i += 1;
                    node = node.eq.as_deref()?;
                }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.find_node(key)?.value.as_ref()
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let bytes = key.as_bytes();
        if bytes.is_empty() {
            return None;
        }
        // Take the value; empty nodes are left in place, which is fine for
        // a cache that is rebuilt wholesale on reload.
        let mut slot = &mut self.root;
        let mut i = 0;
        loop {
            match slot {
                None => return None,
                Some(node) => match bytes[i].cmp(&node.ch) {
                    std::cmp::Ordering::Less => slot = &mut node.lo,
                    std::cmp::Ordering::Greater => slot = &mut node.hi,
                    std::cmp::Ordering::Equal => {
                        if i + 1 == bytes.len() {
                            let old = node.value.take();
                            if old.is_some() {
                                self.len -= 1;
                            }
                            return old;
                        }
                        i += 1;
                        slot = &mut node.eq;
                    }
                },
            }
        }
    }

    fn walk<'a, F: FnMut(&str, &'a V)>(
        node: Option<&'a Node<V>>,
        prefix: &mut Vec<u8>,
        f: &mut F,
    ) {
        let Some(node) = node else { return };
        Self::walk(node.lo.as_deref(), prefix, f);
        prefix.push(node.ch);
        if let Some(value) = &node.value {
            f(std::str::from_utf8(prefix).expect("keys are utf-8"), value);
        }
        Self::walk(node.eq.as_deref(), prefix, f);
        prefix.pop();
        Self::walk(node.hi.as_deref(), prefix, f);
    }

    /// Visit every (key, value) whose key starts with `prefix`, in order.
    pub fn for_each_prefix<'a, F: FnMut(&str, &'a V)>(&'a self, prefix: &str, mut f: F) {
        if prefix.is_empty() {
            let mut buf = Vec::new();
            Self::walk(self.root.as_deref(), &mut buf, &mut f);
            return;
        }
        let Some(node) = self.find_node(prefix) else {
            return;
        };
        let mut buf = prefix.as_bytes().to_vec();
        if let Some(value) = &node.value {
            f(prefix, value);
        }
        Self::walk(node.eq.as_deref(), &mut buf, &mut f);
    }
}

/// Caching facade over a wrapped reference database.
pub struct InMemoryRefDatabase {
    wrapped: Arc<dyn RefDatabase>,
    trie: RwLock<TernarySearchTree<Ref>>,
}

impl InMemoryRefDatabase {
    pub fn new(wrapped: Arc<dyn RefDatabase>) -> InMemoryRefDatabase {
        InMemoryRefDatabase {
            wrapped,
            trie: RwLock::new(TernarySearchTree::new()),
        }
    }

    /// Number of cached references.
    pub fn len(&self) -> usize {
        self.trie.read().expect("ref cache lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reference was written through the wrapped database.
    pub fn on_updated(&self, reference: Ref) {
        self.trie
            .write()
            .expect("ref cache lock")
            .insert(&reference.name.clone(), reference);
    }

    /// A reference was deleted through the wrapped database.
    pub fn on_deleted(&self, name: &str) {
        self.trie.write().expect("ref cache lock").remove(name);
    }

    /// A symbolic reference was created or retargeted.
    pub fn on_linked(&self, name: &str, target: &str) -> Result<(), GitError> {
        let leaf = self
            .wrapped
            .exact_ref(target)?
            .unwrap_or_else(|| Ref::unborn(target));
        self.on_updated(Ref::symbolic(name, RefStorage::Loose, leaf));
        Ok(())
    }

    /// A reference was renamed through the wrapped database.
    pub fn on_renamed(&self, old_name: &str, renamed: Ref) {
        let mut trie = self.trie.write().expect("ref cache lock");
        trie.remove(old_name);
        trie.insert(&renamed.name.clone(), renamed);
    }

    /// A batch completed; fold every OK command into the cache.
    pub fn on_batch_updated(&self, commands: &[RefCommand]) -> Result<(), GitError> {
        for cmd in commands {
            if cmd.result != RefUpdateResult::Ok {
                continue;
            }
            match &cmd.new {
                RefTarget::Id(id) if id.is_zero() => self.on_deleted(&cmd.name),
                RefTarget::Id(id) => {
                    self.on_updated(Ref::object(&cmd.name, RefStorage::Loose, *id))
                }
                RefTarget::PeeledTag { id, peeled } => self.on_updated(Ref::peeled_tag(
                    &cmd.name,
                    RefStorage::Loose,
                    *id,
                    *peeled,
                )),
                RefTarget::Symbolic(target) => self.on_linked(&cmd.name, target)?,
            }
        }
        Ok(())
    }

    /// Atomically replace the cache from (name, ref) pairs.
    pub fn reload<I: IntoIterator<Item = (String, Ref)>>(&self, refs: I) {
        let mut fresh = TernarySearchTree::new();
        for (name, reference) in refs {
            fresh.insert(&name, reference);
        }
        *self.trie.write().expect("ref cache lock") = fresh;
    }
}

impl RefDatabase for InMemoryRefDatabase {
    fn exact_ref(&self, name: &str) -> Result<Option<Ref>, GitError> {
        Ok(self.trie.read().expect("ref cache lock").get(name).cloned())
    }

    fn get_refs(&self, prefix: &str) -> Result<BTreeMap<String, Ref>, GitError> {
        if !is_valid_prefix(prefix) {
            return Ok(BTreeMap::new());
        }
        let trie = self.trie.read().expect("ref cache lock");
        let mut out = BTreeMap::new();
        trie.for_each_prefix(prefix, |name, r| {
            out.insert(name.to_string(), r.clone());
        });
        Ok(out)
    }

    fn peel(&self, reference: &Ref) -> Result<Ref, GitError> {
        self.wrapped.peel(reference)
    }

    fn apply_batch(&self, batch: &mut BatchRefUpdate) -> Result<(), GitError> {
        self.wrapped.apply_batch(batch)?;
        self.on_batch_updated(&batch.commands)
    }

    fn performs_atomic_transactions(&self) -> bool {
        self.wrapped.performs_atomic_transactions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hash::{HashKind, ObjectHash, set_hash_kind_for_test},
        internal::refs::loose::LooseRefDatabase,
    };

    fn id(n: u8) -> ObjectHash {
        ObjectHash::Sha1([n; 20])
    }

    /// TST insert/get/remove with shared prefixes.
    #[test]
    fn test_tst_basic() {
        let mut tst = TernarySearchTree::new();
        assert_eq!(tst.insert("refs/heads/main", 1), None);
        assert_eq!(tst.insert("refs/heads/maint", 2), None);
        assert_eq!(tst.insert("refs/heads/main", 3), Some(1));
        assert_eq!(tst.len(), 2);

        assert_eq!(tst.get("refs/heads/main"), Some(&3));
        assert_eq!(tst.get("refs/heads/mai"), None);
        assert_eq!(tst.remove("refs/heads/main"), Some(3));
        assert_eq!(tst.remove("refs/heads/main"), None);
        assert_eq!(tst.len(), 1);
        assert_eq!(tst.get("refs/heads/maint"), Some(&2));
    }

    /// Prefix walk yields matching keys in sorted order.
    #[test]
    fn test_tst_prefix() {
        let mut tst = TernarySearchTree::new();
        for key in ["refs/tags/v1", "refs/heads/b", "refs/heads/a", "HEAD"] {
            tst.insert(key, ());
        }

        let mut heads = Vec::new();
        tst.for_each_prefix("refs/heads/", |k, _| heads.push(k.to_string()));
        assert_eq!(heads, vec!["refs/heads/a", "refs/heads/b"]);

        let mut all = Vec::new();
        tst.for_each_prefix("", |k, _| all.push(k.to_string()));
        assert_eq!(all, vec!["HEAD", "refs/heads/a", "refs/heads/b", "refs/tags/v1"]);

        let mut none = Vec::new();
        tst.for_each_prefix("refs/remotes/", |k, _| none.push(k.to_string()));
        assert!(none.is_empty());
    }

    /// Writes through the facade land in both layers; reads hit the trie.
    #[test]
    fn test_facade_write_through() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let dir = tempfile::tempdir().unwrap();
        let wrapped = Arc::new(LooseRefDatabase::new(dir.path()));
        let db = InMemoryRefDatabase::new(wrapped.clone());

        db.update_ref(RefCommand::create("refs/heads/main", id(1)))
            .unwrap();
        assert_eq!(
            db.exact_ref("refs/heads/main").unwrap().unwrap().object_id(),
            Some(id(1))
        );
        assert_eq!(
            wrapped
                .exact_ref("refs/heads/main")
                .unwrap()
                .unwrap()
                .object_id(),
            Some(id(1))
        );

        db.update_ref(RefCommand::delete("refs/heads/main", id(1)))
            .unwrap();
        assert!(db.exact_ref("refs/heads/main").unwrap().is_none());
    }

    /// Explicit callbacks mutate the cache without touching the wrapped db.
    #[test]
    fn test_callbacks() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let dir = tempfile::tempdir().unwrap();
        let db = InMemoryRefDatabase::new(Arc::new(LooseRefDatabase::new(dir.path())));

        db.on_updated(Ref::object("refs/heads/main", RefStorage::Loose, id(1)));
        assert_eq!(db.len(), 1);

        db.on_renamed(
            "refs/heads/main",
            Ref::object("refs/heads/trunk", RefStorage::Loose, id(1)),
        );
        assert!(db.exact_ref("refs/heads/main").unwrap().is_none());
        assert!(db.exact_ref("refs/heads/trunk").unwrap().is_some());

        db.on_deleted("refs/heads/trunk");
        assert!(db.is_empty());
    }

    /// reload atomically replaces the whole cache.
    #[test]
    fn test_reload() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let dir = tempfile::tempdir().unwrap();
        let db = InMemoryRefDatabase::new(Arc::new(LooseRefDatabase::new(dir.path())));
        db.on_updated(Ref::object("refs/heads/old", RefStorage::Loose, id(1)));

        db.reload(vec![
            (
                "refs/heads/a".to_string(),
                Ref::object("refs/heads/a", RefStorage::Loose, id(2)),
            ),
            (
                "refs/heads/b".to_string(),
                Ref::object("refs/heads/b", RefStorage::Loose, id(3)),
            ),
        ]);

        assert!(db.exact_ref("refs/heads/old").unwrap().is_none());
        assert_eq!(db.get_refs("refs/heads/").unwrap().len(), 2);
    }
}
