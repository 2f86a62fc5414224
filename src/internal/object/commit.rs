//! The Commit object records one state of the project: a tree id, the parent
//! commit ids, author and committer identities, and a message. The
//! replication log is built entirely of commits — every accepted reference
//! transition is one commit whose tree is the reference namespace after the
//! transition and whose parent is the previous log entry.

use std::fmt::Display;
use std::str::FromStr;

use bstr::ByteSlice;
use serde::{Deserialize, Serialize};

use crate::errors::GitError;
use crate::hash::ObjectHash;
use crate::internal::object::ObjectTrait;
use crate::internal::object::signature::{Signature, SignatureType};
use crate::internal::object::types::ObjectType;

/// The `Commit` struct is used to represent a commit object.
///
/// - The tree id points to the top level tree for this commit, reflecting the
///   complete state at the time of the commit.
/// - The parent ids chain commits into history; the replication log is a
///   linear chain of single-parent commits.
/// - Author and committer carry name, email, timestamp and timezone.
#[derive(Eq, Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: ObjectHash,
    pub tree_id: ObjectHash,
    pub parent_commit_ids: Vec<ObjectHash>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl PartialEq for Commit {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "tree: {}", self.tree_id)?;
        for parent in self.parent_commit_ids.iter() {
            writeln!(f, "parent: {parent}")?;
        }
        writeln!(f, "author {}", self.author)?;
        writeln!(f, "committer {}", self.committer)?;
        writeln!(f, "{}", self.message)
    }
}

impl Commit {
    pub fn new(
        author: Signature,
        committer: Signature,
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        message: &str,
    ) -> Result<Commit, GitError> {
        let mut commit = Commit {
            id: ObjectHash::default(),
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message: message.to_string(),
        };
        commit.id = ObjectHash::from_type_and_data(ObjectType::Commit, &commit.to_data()?);
        Ok(commit)
    }

    /// Creates a commit from a tree id and parents, stamping author and
    /// committer with the given identity at the current time.
    pub fn from_tree_id(
        tree_id: ObjectHash,
        parent_commit_ids: Vec<ObjectHash>,
        name: &str,
        email: &str,
        message: &str,
    ) -> Result<Commit, GitError> {
        let author = Signature::now(SignatureType::Author, name, email);
        let committer = Signature::now(SignatureType::Committer, name, email);
        Commit::new(author, committer, tree_id, parent_commit_ids, message)
    }
}

impl ObjectTrait for Commit {
    fn from_bytes(data: &[u8], hash: ObjectHash) -> Result<Self, GitError> {
        let invalid = |what: &str| GitError::InvalidCommitObject(what.to_string());

        let mut commit = data;
        // Find the tree id and move past it
        let tree_end = commit.find_byte(0x0a).ok_or_else(|| invalid("no tree"))?;
        if !commit.starts_with(b"tree ") {
            return Err(invalid("missing tree header"));
        }
        let tree_id = ObjectHash::from_str(
            commit[5..tree_end]
                .to_str()
                .map_err(|_| invalid("tree id"))?,
        )
        .map_err(|_| invalid("tree id"))?;
        commit = &commit[tree_end + 1..];

        // All lines before the author are parent lines
        let mut parent_commit_ids = Vec::new();
        while commit.starts_with(b"parent ") {
            let end = commit
                .find_byte(0x0a)
                .ok_or_else(|| invalid("parent line"))?;
            let id = ObjectHash::from_str(commit[7..end].to_str().map_err(|_| invalid("parent"))?)
                .map_err(|_| invalid("parent id"))?;
            parent_commit_ids.push(id);
            commit = &commit[end + 1..];
        }

        let author_end = commit.find_byte(0x0a).ok_or_else(|| invalid("author"))?;
        let author = Signature::from_data(commit[..author_end].to_vec())?;
        commit = &commit[author_end + 1..];

        let committer_end = commit.find_byte(0x0a).ok_or_else(|| invalid("committer"))?;
        let committer = Signature::from_data(commit[..committer_end].to_vec())?;
        commit = &commit[committer_end + 1..];

        // The rest is the message, including any signature block
        let message = String::from_utf8_lossy(commit).to_string();

        Ok(Commit {
            id: hash,
            tree_id,
            parent_commit_ids,
            author,
            committer,
            message,
        })
    }

    fn get_type(&self) -> ObjectType {
        ObjectType::Commit
    }

    fn get_size(&self) -> usize {
        0
    }

    /// [Git-Internals-Git-Objects](https://git-scm.com/book/en/v2/Git-Internals-Git-Objects)
    fn to_data(&self) -> Result<Vec<u8>, GitError> {
        let mut data = Vec::new();

        data.extend(b"tree ");
        data.extend(self.tree_id.to_string().as_bytes());
        data.extend(&[0x0a]);

        for parent_tree_id in &self.parent_commit_ids {
            data.extend(b"parent ");
            data.extend(parent_tree_id.to_string().as_bytes());
            data.extend(&[0x0a]);
        }

        data.extend(self.author.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.committer.to_data()?);
        data.extend(&[0x0a]);
        data.extend(self.message.as_bytes());

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashKind, set_hash_kind_for_test};

    fn log_commit(parent: Option<ObjectHash>, msg: &str) -> Commit {
        Commit::from_tree_id(
            ObjectHash::Sha1([0x31; 20]),
            parent.into_iter().collect(),
            "ketch",
            "ketch@example.com",
            msg,
        )
        .unwrap()
    }

    /// A serialized commit parses back with the same tree, parents and
    /// identities.
    #[test]
    fn test_commit_round_trip() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let root = log_commit(None, "log entry 1\n");
        let child = log_commit(Some(root.id), "log entry 2\n");

        let parsed = Commit::from_bytes(&child.to_data().unwrap(), child.id).unwrap();
        assert_eq!(parsed.tree_id, child.tree_id);
        assert_eq!(parsed.parent_commit_ids, vec![root.id]);
        assert_eq!(parsed.author.name, "ketch");
        assert_eq!(parsed.message, "log entry 2\n");
        assert_eq!(parsed.id, child.id);
    }

    /// Parsing keeps a trailing signature block inside the message.
    #[test]
    fn test_message_keeps_signature_block() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let raw = b"tree 341e54913a3a43069f2927cc0f703e5a9f730df1\n\
author a <a@b.c> 1757467768 +0800\n\
committer a <a@b.c> 1757491219 +0800\n\
gpgsig -----BEGIN PGP SIGNATURE-----\n\
 body\n\
 -----END PGP SIGNATURE-----\n\
\n\
subject line\n";
        let commit = Commit::from_bytes(raw, ObjectHash::default()).unwrap();
        assert!(commit.message.contains("-----BEGIN PGP SIGNATURE-----"));
        assert!(commit.message.contains("subject line"));
        assert!(commit.parent_commit_ids.is_empty());
    }

    /// Missing tree header is rejected.
    #[test]
    fn test_missing_tree_rejected() {
        let _guard = set_hash_kind_for_test(HashKind::Sha1);
        let raw = b"author a <a@b.c> 1 +0000\ncommitter a <a@b.c> 1 +0000\nmsg";
        assert!(Commit::from_bytes(raw, ObjectHash::default()).is_err());
    }
}
