//! Error types for the git-ketch crate.
//!
//! This module defines a unified error enumeration used across object parsing,
//! pack index handling, fsck verification, reference storage, and the Ketch
//! replication layer. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.

use thiserror::Error;

/// Failure kinds `verify_index` can signal when cross-checking a pack
/// against its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptPackIndexKind {
    /// An object found in the pack is absent from the index.
    MissingObj,
    /// The index stores a different offset than the pack position.
    MismatchOffset,
    /// The index stores a CRC32 that differs from the recomputed one.
    MismatchCrc,
    /// The index should carry a CRC32 for this object but has none.
    MissingCrc,
    /// The index lists an object the pack does not contain.
    UnknownObj,
}

impl std::fmt::Display for CorruptPackIndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CorruptPackIndexKind::MissingObj => "MISSING_OBJ",
            CorruptPackIndexKind::MismatchOffset => "MISMATCH_OFFSET",
            CorruptPackIndexKind::MismatchCrc => "MISMATCH_CRC",
            CorruptPackIndexKind::MissingCrc => "MISSING_CRC",
            CorruptPackIndexKind::UnknownObj => "UNKNOWN_OBJ",
        };
        f.write_str(s)
    }
}

/// Object-checker taxonomy for structurally invalid objects found during
/// fsck. Non-fatal: the scan records the finding and continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptObjectKind {
    MissingTree,
    MissingAuthor,
    MissingCommitter,
    MissingObjectField,
    MissingTypeEntry,
    MissingTagEntry,
    BadDate,
    BadObjectId,
    InvalidMode,
    EmptyName,
    FullPathName,
    DuplicateEntry,
    TreeNotSorted,
}

impl std::fmt::Display for CorruptObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CorruptObjectKind::MissingTree => "missing tree",
            CorruptObjectKind::MissingAuthor => "missing author",
            CorruptObjectKind::MissingCommitter => "missing committer",
            CorruptObjectKind::MissingObjectField => "missing object",
            CorruptObjectKind::MissingTypeEntry => "missing type",
            CorruptObjectKind::MissingTagEntry => "missing tag",
            CorruptObjectKind::BadDate => "bad date",
            CorruptObjectKind::BadObjectId => "bad object id",
            CorruptObjectKind::InvalidMode => "invalid mode",
            CorruptObjectKind::EmptyName => "empty name",
            CorruptObjectKind::FullPathName => "full path name",
            CorruptObjectKind::DuplicateEntry => "duplicate entry",
            CorruptObjectKind::TreeNotSorted => "tree not sorted",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
/// Unified error enumeration for the git-ketch library.
///
/// - Used across object parsing, pack index and MIDX handling, fsck,
///   reference storage, and replication.
/// - Implements `std::error::Error` via `thiserror`.
pub enum GitError {
    /// Invalid or unsupported git object type name.
    #[error("The `{0}` is not a valid git object type.")]
    InvalidObjectType(String),

    /// Malformed or unsupported blob object encoding.
    #[error("The `{0}` is not a valid git blob object.")]
    InvalidBlobObject(String),

    /// Malformed tree object.
    #[error("Not a valid git tree object: {0}")]
    InvalidTreeObject(String),

    /// Invalid tree entry (mode/name/hash).
    #[error("The `{0}` is not a valid git tree item.")]
    InvalidTreeItem(String),

    /// Invalid commit signature line.
    #[error("The `{0}` is not a valid git commit signature.")]
    InvalidSignatureType(String),

    /// Malformed commit object.
    #[error("Not a valid git commit object: {0}")]
    InvalidCommitObject(String),

    /// Malformed tag object.
    #[error("Not a valid git tag object: {0}")]
    InvalidTagObject(String),

    /// Malformed or unsupported pack index (.idx) file.
    #[error("The `{0}` is not a valid idx file.")]
    InvalidIdxFile(String),

    /// Malformed or unsupported pack file.
    #[error("The `{0}` is not a valid pack file.")]
    InvalidPackFile(String),

    /// Invalid pack header magic or version.
    #[error("The `{0}` is not a valid pack header.")]
    InvalidPackHeader(String),

    /// Unreadable multi-pack index: bad magic, unsupported version, or an
    /// integer overflow in the fan-out. Fatal to the open; callers may
    /// proceed without a MIDX.
    #[error("Invalid multi-pack index: {0}")]
    MultiPackIndexFormat(String),

    /// Cross-check failure between a pack and its index. Fatal to the
    /// verify operation.
    #[error("Corrupt pack index ({kind}): {message}")]
    CorruptPackIndex {
        kind: CorruptPackIndexKind,
        message: String,
    },

    /// Requested object id is not present in any open store.
    #[error("Missing object: {0}")]
    MissingObject(String),

    /// A reference's observed old value does not match the expected old
    /// value, or a name conflict prevents the update.
    #[error("Lock failure on `{0}`")]
    LockFailure(String),

    /// A batch was rejected; commands that were not attempted carry this.
    #[error("transaction aborted")]
    TransactionAborted,

    /// Invalid reference name.
    #[error("The `{0}` is not a valid reference name.")]
    InvalidRefName(String),

    /// Transport failure talking to a replica. Drives the retry loop; not
    /// surfaced to proposal clients.
    #[error("Replica `{0}` offline: {1}")]
    ReplicaOffline(String, String),

    /// Fatal Ketch topology configuration (voter count, local voter).
    #[error("Invalid Ketch configuration: {0}")]
    InvalidKetchConfig(String),

    /// Invalid CLI or function argument.
    #[error("Argument parse failed: {0}")]
    InvalidArgument(String),

    /// I/O error from underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Invalid hash formatting or value.
    #[error("The {0} is not a valid Hash value ")]
    InvalidHashValue(String),

    /// Delta object reconstruction error.
    #[error("Delta Object Error Info:{0}")]
    DeltaObjectError(String),

    /// Invalid decoded object info.
    #[error("Error decode in the Object ,info:{0}")]
    InvalidObjectInfo(String),

    /// Hash not found in current file context.
    #[error("Cannot find Hash value: {0} from current file")]
    NotFoundHashValue(String),

    /// Failed to encode object to bytes.
    #[error("Can't encode the object which id [{0}] to bytes")]
    EncodeObjectError(String),

    /// Text encoding or UTF-8 conversion error.
    #[error("UTF-8 conversion error: {0}")]
    ConversionError(String),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

impl GitError {
    /// Shorthand for a pack-index cross-check failure.
    pub fn corrupt_index(kind: CorruptPackIndexKind, message: impl Into<String>) -> GitError {
        GitError::CorruptPackIndex {
            kind,
            message: message.into(),
        }
    }
}
