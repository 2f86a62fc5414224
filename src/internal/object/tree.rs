//! The Tree object represents one directory level: a sorted list of entries,
//! each a mode, a name, and the id of the blob or subtree it points at.
//! Gitlink entries (mode 160000) record a commit id without owning the
//! object, and symlink entries point at a blob holding the link target —
//! the two encodings the reference tree is built from.

use std::fmt::Display;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::{
    errors::GitError,
    hash::{ObjectHash, get_hash_kind},
    internal::object::{ObjectTrait, types::ObjectType},
};

/// File mode of a tree entry, as spelled in the on-disk tree format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeItemMode {
    Blob,
    BlobExecutable,
    Link,
    Tree,
    Commit,
}

impl TreeItemMode {
    /// On-disk spelling (no leading zero on directory mode).
    pub fn to_bytes(self) -> &'static [u8] {
        match self {
            TreeItemMode::Blob => b"100644",
            TreeItemMode::BlobExecutable => b"100755",
            TreeItemMode::Link => b"120000",
            TreeItemMode::Tree => b"40000",
            TreeItemMode::Commit => b"160000",
        }
    }

    pub fn from_bytes(mode: &[u8]) -> Result<TreeItemMode, GitError> {
        match mode {
            b"100644" | b"100664" => Ok(TreeItemMode::Blob),
            b"100755" => Ok(TreeItemMode::BlobExecutable),
            b"120000" => Ok(TreeItemMode::Link),
            b"40000" | b"040000" => Ok(TreeItemMode::Tree),
            b"160000" => Ok(TreeItemMode::Commit),
            _ => Err(GitError::InvalidTreeItem(
                String::from_utf8_lossy(mode).to_string(),
            )),
        }
    }

    pub fn is_tree(self) -> bool {
        self == TreeItemMode::Tree
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeItem {
    pub mode: TreeItemMode,
    pub id: ObjectHash,
    pub name: String,
}

impl TreeItem {
    pub fn new(mode: TreeItemMode, id: ObjectHash, name: String) -> TreeItem {
        TreeItem { mode, id, name }
    }

    /// Git sorts tree entries as if directory names carried a trailing `/`.
    fn sort_key(&self) -> Vec<u8> {
        let mut key = self.name.as_bytes().to_vec();
        if self.mode.is_tree() {
            key.push(b'/');
        }
        key
    }
}

impl Display for TreeItem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            String::from_utf8_lossy(self.mode.to_bytes()),
            self.id,
            self.name
        )
    }
}

/// One directory level of the object graph.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub id: ObjectHash,
    pub tree_items: Vec<TreeItem>,
}

impl PartialEq for Tree {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for item in &self.tree_items {
            writeln!(f, "{item}")?;
        }
        Ok(())
    }
}

impl Tree {
    /// Build a tree from entries, sorting them into canonical order and
    /// computing the id.
    pub fn from_tree_items(mut tree_items: Vec<TreeItem>) -> Result<Tree, GitError> {
        tree_items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        let mut tree = Tree {
            id: ObjectHash::default(),
            tree_items,
        };
        tree.id = ObjectHash::from_type_and_data(ObjectType::Tree, &tree.to_data()?);
        Ok(tree)
    }
}

impl ObjectTrait for Tree {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let hash_len = get_hash_kind().size();
        let mut tree_items = Vec::new();
        let mut rest = data;

        while !rest.is_empty() {
            let mode_end = rest
                .find_byte(b' ')
                .ok_or_else(|| GitError::InvalidTreeObject("missing mode terminator".into()))?;
            let mode = TreeItemMode::from_bytes(&rest[..mode_end])?;
            rest = &rest[mode_end + 1..];

            let name_end = rest
                .find_byte(0x00)
                .ok_or_else(|| GitError::InvalidTreeObject("missing name terminator".into()))?;
            let name = rest[..name_end]
                .to_str()
                .map_err(|_| GitError::InvalidTreeObject("name is not utf-8".into()))?
                .to_string();
            rest = &rest[name_end + 1..];

            if rest.len() < hash_len {
                return Err(GitError::InvalidTreeObject("truncated entry id".into()));
            }
            let id = ObjectHash::from_bytes(&rest[..hash_len])?;
            rest = &rest[hash_len..];

            tree_items.push(TreeItem { mode, id, name });
        }

        Ok(Tree {
            id: hash,
            tree_items,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Tree
    }

    fn get_size(&self) -> usize {
        0
    }

    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();
        for item in &self.tree_items {
            data.extend(item.mode.to_bytes());
            data.push(b' ');
            data.extend(item.name.as_bytes());
            data.push(0x00);
            data.extend(item.id.as_ref());
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_for_test};

    fn gitlink(name: &str, fill: u8) -> TreeItem {
        TreeItem::new(
            TreeItemMode::Commit,
            ObjectHash::Sha1([fill; 20]),
            name.to_string(),
        )
    }

    /// Entries serialize as `<mode> <name>\0<raw id>` and parse back.
    #[test]
    fn test_tree_round_trip() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let tree =
            Tree::from_tree_items(vec![gitlink("main", 0x11), gitlink("trunk", 0x22)]).unwrap();
        let back = Tree::from_bytes(&tree.to_data().unwrap(), tree.id).unwrap();
        assert_eq!(back.tree_items.len(), 2);
        assert_eq!(back.tree_items[0].name, "main");
        assert_eq!(back.tree_items[0].mode, TreeItemMode::Commit);
        assert_eq!(back.id, tree.id);
    }

    /// Directories sort as if their name had a trailing slash: `a/` after
    /// `a.txt` but a directory `a` before a file `a0`.
    #[test]
    fn test_git_entry_ordering() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let dir_a = TreeItem::new(TreeItemMode::Tree, ObjectHash::Sha1([1; 20]), "a".into());
        let file_a0 = TreeItem::new(TreeItemMode::Blob, ObjectHash::Sha1([2; 20]), "a0".into());
        let file_adot = TreeItem::new(TreeItemMode::Blob, ObjectHash::Sha1([3; 20]), "a.txt".into());

        let tree = Tree::from_tree_items(vec![file_a0, dir_a, file_adot]).unwrap();
        let names: Vec<&str> = tree.tree_items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "a", "a0"]);
    }

    /// Unknown modes and truncated ids are rejected.
    #[test]
    fn test_invalid_trees() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        assert!(TreeItemMode::from_bytes(b"100600").is_err());
        let bad = b"160000 main\x00short".to_vec();
        assert!(Tree::from_bytes(&bad, ObjectHash::default()).is_err());
    }
}
