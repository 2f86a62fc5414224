//! Object type enumeration shared across the object, pack, and reference
//! modules.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::GitError;

/// In Git, each object type is assigned a unique integer value, which is used
/// to identify the type of the object in pack entries.
///
/// * `Commit` (1): records a tree, its parents, and the author/committer.
/// * `Tree` (2): a directory listing of blobs and subtrees.
/// * `Blob` (3): file content.
/// * `Tag` (4): an annotated tag pointing at another object.
/// * `OffsetDelta` (6): a delta whose base is located by a relative pack
///   offset.
/// * `HashDelta` (7): a delta whose base is named by object id.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Commit = 1,
    Tree,
    Blob,
    Tag,
    OffsetDelta = 6,
    HashDelta = 7,
}

const COMMIT_OBJECT_TYPE: &[u8] = b"commit";
const TREE_OBJECT_TYPE: &[u8] = b"tree";
const BLOB_OBJECT_TYPE: &[u8] = b"blob";
const TAG_OBJECT_TYPE: &[u8] = b"tag";

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectType::Commit => write!(f, "commit"),
            ObjectType::Tree => write!(f, "tree"),
            ObjectType::Blob => write!(f, "blob"),
            ObjectType::Tag => write!(f, "tag"),
            ObjectType::OffsetDelta => write!(f, "OffsetDelta"),
            ObjectType::HashDelta => write!(f, "HashDelta"),
        }
    }
}

impl ObjectType {
    /// Canonical header bytes of a base object type.
    ///
    /// Delta types never appear in object headers; calling this with one is
    /// a programming error.
    pub fn to_bytes(&self) -> &'static [u8] {
        match self {
            ObjectType::Commit => COMMIT_OBJECT_TYPE,
            ObjectType::Tree => TREE_OBJECT_TYPE,
            ObjectType::Blob => BLOB_OBJECT_TYPE,
            ObjectType::Tag => TAG_OBJECT_TYPE,
            _ => panic!("delta object types have no canonical header bytes"),
        }
    }

    /// Parses a string representation of a Git object type.
    pub fn from_string(s: &str) -> Result<ObjectType, GitError> {
        match s {
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "commit" => Ok(ObjectType::Commit),
            "tag" => Ok(ObjectType::Tag),
            _ => Err(GitError::InvalidObjectType(s.to_string())),
        }
    }

    /// Convert object type to 3-bit pack header type id.
    pub fn to_u8(&self) -> u8 {
        match self {
            ObjectType::Commit => 1,
            ObjectType::Tree => 2,
            ObjectType::Blob => 3,
            ObjectType::Tag => 4,
            ObjectType::OffsetDelta => 6,
            ObjectType::HashDelta => 7,
        }
    }

    /// Decode 3-bit pack header type id to object type.
    pub fn from_u8(number: u8) -> Result<ObjectType, GitError> {
        match number {
            1 => Ok(ObjectType::Commit),
            2 => Ok(ObjectType::Tree),
            3 => Ok(ObjectType::Blob),
            4 => Ok(ObjectType::Tag),
            6 => Ok(ObjectType::OffsetDelta),
            7 => Ok(ObjectType::HashDelta),
            _ => Err(GitError::InvalidObjectType(format!(
                "Invalid object type number: {number}"
            ))),
        }
    }

    /// True for whole (non-delta) object types.
    pub fn is_base(&self) -> bool {
        !matches!(self, ObjectType::OffsetDelta | ObjectType::HashDelta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify ObjectType::Blob converts to its ASCII byte representation "blob".
    #[test]
    fn test_object_type_to_bytes() {
        assert_eq!(ObjectType::Blob.to_bytes(), b"blob");
        assert_eq!(ObjectType::Commit.to_bytes(), b"commit");
    }

    /// Verify parsing type names returns the matching variants.
    #[test]
    fn test_object_type_from_string() {
        assert_eq!(ObjectType::from_string("blob").unwrap(), ObjectType::Blob);
        assert_eq!(ObjectType::from_string("tree").unwrap(), ObjectType::Tree);
        assert_eq!(
            ObjectType::from_string("commit").unwrap(),
            ObjectType::Commit
        );
        assert_eq!(ObjectType::from_string("tag").unwrap(), ObjectType::Tag);
        assert!(ObjectType::from_string("invalid_type").is_err());
    }

    /// Pack type numbers round-trip; 5 is reserved and rejected.
    #[test]
    fn test_pack_type_numbers() {
        assert_eq!(ObjectType::Commit.to_u8(), 1);
        assert_eq!(ObjectType::from_u8(4).unwrap(), ObjectType::Tag);
        assert_eq!(ObjectType::from_u8(6).unwrap(), ObjectType::OffsetDelta);
        assert!(ObjectType::from_u8(5).is_err());
        assert!(ObjectType::from_u8(0).is_err());
    }

    /// Delta types are not base types.
    #[test]
    fn test_is_base() {
        assert!(ObjectType::Tree.is_base());
        assert!(!ObjectType::HashDelta.is_base());
    }
}
