//! Content-addressed object storage the reference layer reads from and the
//! replication log writes into.
//!
//! The store is deliberately small: `put`/`get`/`has` over `(type, bytes)`
//! pairs keyed by object id, typed read/write helpers for the object model,
//! and an ancestry walk over commit parents used by replica lag
//! classification.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::object::{
        ObjectTrait, blob::Blob, commit::Commit, tag::Tag, tree::Tree, types::ObjectType,
    },
};

/// A stored object: its type and canonical bytes.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub obj_type: ObjectType,
    pub data: Vec<u8>,
}

/// Minimal content-addressed object database.
///
/// Implementations are shared-immutable per id: an id is never remapped to
/// different bytes, so readers take no locks beyond the map's own sharding.
pub trait ObjectStore: Send + Sync {
    /// Store canonical object bytes, returning the computed id. Idempotent.
    fn put(&self, obj_type: ObjectType, data: Vec<u8>) -> Result<ObjectHash, GitError>;

    /// Load an object by id.
    fn get(&self, id: &ObjectHash) -> Result<Option<StoredObject>, GitError>;

    /// True if the id is present.
    fn has(&self, id: &ObjectHash) -> Result<bool, GitError> {
        Ok(self.get(id)?.is_some())
    }
}

/// In-memory object store backed by a sharded concurrent map.
#[derive(Default)]
pub struct MemObjectStore {
    objects: DashMap<ObjectHash, StoredObject, ahash::RandomState>,
}

impl MemObjectStore {
    pub fn new() -> Arc<MemObjectStore> {
        Arc::new(MemObjectStore::default())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectStore for MemObjectStore {
    fn put(&self, obj_type: ObjectType, data: Vec<u8>) -> Result<ObjectHash, GitError> {
        let id = ObjectHash::from_type_and_data(obj_type, &data);
        self.objects
            .entry(id)
            .or_insert(StoredObject { obj_type, data });
        Ok(id)
    }

    fn get(&self, id: &ObjectHash) -> Result<Option<StoredObject>, GitError> {
        Ok(self.objects.get(id).map(|o| o.clone()))
    }
}

fn expect_type(
    id: &ObjectHash,
    stored: StoredObject,
    want: ObjectType,
) -> Result<Vec<u8>, GitError> {
    if stored.obj_type != want {
        return Err(GitError::InvalidObjectInfo(format!(
            "{id} is a {} (expected {want})",
            stored.obj_type
        )));
    }
    Ok(stored.data)
}

fn load(store: &dyn ObjectStore, id: &ObjectHash) -> Result<StoredObject, GitError> {
    store
        .get(id)?
        .ok_or_else(|| GitError::MissingObject(id.to_string()))
}

/// Read a commit object by id.
pub fn read_commit(store: &dyn ObjectStore, id: &ObjectHash) -> Result<Commit, GitError> {
    let data = expect_type(id, load(store, id)?, ObjectType::Commit)?;
    Commit::from_bytes(&data, *id)
}

/// Read a tree object by id.
pub fn read_tree(store: &dyn ObjectStore, id: &ObjectHash) -> Result<Tree, GitError> {
    let data = expect_type(id, load(store, id)?, ObjectType::Tree)?;
    Tree::from_bytes(&data, *id)
}

/// Read a blob object by id.
pub fn read_blob(store: &dyn ObjectStore, id: &ObjectHash) -> Result<Blob, GitError> {
    let data = expect_type(id, load(store, id)?, ObjectType::Blob)?;
    Blob::from_bytes(&data, *id)
}

/// Read a tag object by id.
pub fn read_tag(store: &dyn ObjectStore, id: &ObjectHash) -> Result<Tag, GitError> {
    let data = expect_type(id, load(store, id)?, ObjectType::Tag)?;
    Tag::from_bytes(&data, *id)
}

/// Store any object-model value.
pub fn write_object<T: ObjectTrait>(store: &dyn ObjectStore, obj: &T) -> Result<ObjectHash, GitError> {
    store.put(obj.get_type(), obj.to_data()?)
}

/// Peel a tag chain: follow `object` pointers through tag objects until a
/// non-tag id is reached. Ids not present in the store terminate the walk
/// (treated as the final target, matching lazily-fetched repositories).
pub fn peel_tag_chain(store: &dyn ObjectStore, id: &ObjectHash) -> Result<ObjectHash, GitError> {
    let mut cur = *id;
    loop {
        match store.get(&cur)? {
            Some(obj) if obj.obj_type == ObjectType::Tag => {
                let tag = Tag::from_bytes(&obj.data, cur)?;
                cur = tag.object_hash;
            }
            _ => return Ok(cur),
        }
    }
}

/// True if `ancestor` is reachable from `tip` by following commit parents.
/// `ancestor == tip` counts as reachable. Ids missing from the store end
/// their branch of the walk.
pub fn is_ancestor(
    store: &dyn ObjectStore,
    ancestor: &ObjectHash,
    tip: &ObjectHash,
) -> Result<bool, GitError> {
    if ancestor == tip {
        return Ok(true);
    }
    let mut seen: HashSet<ObjectHash> = HashSet::new();
    let mut queue: VecDeque<ObjectHash> = VecDeque::new();
    queue.push_back(*tip);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(obj) = store.get(&id)? else { continue };
        if obj.obj_type != ObjectType::Commit {
            continue;
        }
        let commit = Commit::from_bytes(&obj.data, id)?;
        for parent in commit.parent_commit_ids {
            if parent == *ancestor {
                return Ok(true);
            }
            queue.push_back(parent);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hash::{HashKind, set_hash_kind_for_test},
        internal::object::signature::{Signature, SignatureType},
    };

    fn commit_on(
        store: &dyn ObjectStore,
        tree_id: ObjectHash,
        parents: Vec<ObjectHash>,
        msg: &str,
    ) -> ObjectHash {
        let commit = Commit::from_tree_id(tree_id, parents, "t", "t@e.c", msg).unwrap();
        write_object(store, &commit).unwrap()
    }

    /// put/get round-trips and is idempotent.
    #[test]
    fn test_put_get() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let store = MemObjectStore::new();
        let id = store.put(ObjectType::Blob, b"data".to_vec()).unwrap();
        let again = store.put(ObjectType::Blob, b"data".to_vec()).unwrap();
        assert_eq!(id, again);
        assert_eq!(store.len(), 1);
        let obj = store.get(&id).unwrap().unwrap();
        assert_eq!(obj.obj_type, ObjectType::Blob);
        assert_eq!(obj.data, b"data");
        assert!(store.has(&id).unwrap());
    }

    /// Typed readers reject a wrong object type.
    #[test]
    fn test_typed_read_mismatch() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let store = MemObjectStore::new();
        let id = store.put(ObjectType::Blob, b"x".to_vec()).unwrap();
        assert!(read_commit(store.as_ref(), &id).is_err());
        assert!(read_blob(store.as_ref(), &id).is_ok());
    }

    /// Ancestry walk follows parents across merges.
    #[test]
    fn test_is_ancestor() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let store = MemObjectStore::new();
        let tree = ObjectHash::Sha1([9; 20]);
        let a = commit_on(store.as_ref(), tree, vec![], "a");
        let b = commit_on(store.as_ref(), tree, vec![a], "b");
        let c = commit_on(store.as_ref(), tree, vec![b], "c");
        let side = commit_on(store.as_ref(), tree, vec![a], "side");
        let merge = commit_on(store.as_ref(), tree, vec![c, side], "merge");

        assert!(is_ancestor(store.as_ref(), &a, &merge).unwrap());
        assert!(is_ancestor(store.as_ref(), &side, &merge).unwrap());
        assert!(is_ancestor(store.as_ref(), &merge, &merge).unwrap());
        assert!(!is_ancestor(store.as_ref(), &merge, &c).unwrap());
        assert!(!is_ancestor(store.as_ref(), &side, &c).unwrap());
    }

    /// Tag chains peel to the terminal non-tag id.
    #[test]
    fn test_peel_tag_chain() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let store = MemObjectStore::new();
        let tree = ObjectHash::Sha1([7; 20]);
        let target = commit_on(store.as_ref(), tree, vec![], "tip");

        let inner = Tag::new(
            target,
            ObjectType::Commit,
            "v1".into(),
            Signature::now(SignatureType::Tagger, "t", "t@e.c"),
            "m".into(),
        )
        .unwrap();
        let inner_id = write_object(store.as_ref(), &inner).unwrap();
        let outer = Tag::new(
            inner_id,
            ObjectType::Tag,
            "meta".into(),
            Signature::now(SignatureType::Tagger, "t", "t@e.c"),
            "m".into(),
        )
        .unwrap();
        let outer_id = write_object(store.as_ref(), &outer).unwrap();

        assert_eq!(peel_tag_chain(store.as_ref(), &outer_id).unwrap(), target);
        assert_eq!(peel_tag_chain(store.as_ref(), &target).unwrap(), target);
    }
}
