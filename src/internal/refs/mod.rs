//! Reference model and the abstract reference database.
//!
//! A reference is a named pointer into the object graph: either an object
//! reference (optionally carrying the cached peeled id of a tag chain) or a
//! symbolic reference targeting another reference. Databases provide exact
//! lookup, prefix enumeration, peeling, and atomic batch updates.

pub mod loose;
pub mod mem;
pub mod ref_tree;
pub mod ref_tree_db;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{errors::GitError, hash::ObjectHash};

/// Well-known names and namespaces.
pub const HEAD: &str = "HEAD";
pub const R_REFS: &str = "refs/";
pub const R_HEADS: &str = "refs/heads/";
pub const R_TAGS: &str = "refs/tags/";
pub const R_TXN: &str = "refs/txn/";
pub const TXN_COMMITTED: &str = "refs/txn/committed";
pub const TXN_ACCEPTED: &str = "refs/txn/accepted";
pub const R_TXN_STAGE: &str = "refs/txn/stage/";

/// Symbolic chains longer than this are treated as broken.
pub const MAX_SYMBOLIC_REF_DEPTH: usize = 5;

/// Where a cached reference value was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefStorage {
    /// Not yet created; the leaf of an unborn symbolic chain.
    New,
    /// A loose file.
    Loose,
    /// A packed store (the RefTree).
    Packed,
    /// Advertised by a remote peer.
    Network,
}

/// Cached peel state of an object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Peeled {
    /// Peel status unknown.
    Unpeeled,
    /// Known not to be an annotated tag.
    NonTag,
    /// Annotated tag whose chain terminates at the carried id.
    Tag(ObjectHash),
}

/// The value a reference carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefValue {
    Object { id: ObjectHash, peeled: Peeled },
    Symbolic { target: Box<Ref> },
}

/// A named pointer into the object graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub name: String,
    pub storage: RefStorage,
    pub value: RefValue,
}

impl Ref {
    pub fn object(name: impl Into<String>, storage: RefStorage, id: ObjectHash) -> Ref {
        Ref {
            name: name.into(),
            storage,
            value: RefValue::Object {
                id,
                peeled: Peeled::Unpeeled,
            },
        }
    }

    pub fn peeled_tag(
        name: impl Into<String>,
        storage: RefStorage,
        id: ObjectHash,
        peeled: ObjectHash,
    ) -> Ref {
        Ref {
            name: name.into(),
            storage,
            value: RefValue::Object {
                id,
                peeled: Peeled::Tag(peeled),
            },
        }
    }

    pub fn symbolic(name: impl Into<String>, storage: RefStorage, target: Ref) -> Ref {
        Ref {
            name: name.into(),
            storage,
            value: RefValue::Symbolic {
                target: Box::new(target),
            },
        }
    }

    /// An unborn reference: named but pointing nowhere yet.
    pub fn unborn(name: impl Into<String>) -> Ref {
        Ref::object(name, RefStorage::New, ObjectHash::default())
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self.value, RefValue::Symbolic { .. })
    }

    /// Walk symbolic targets to the terminal non-symbolic reference.
    pub fn leaf(&self) -> &Ref {
        let mut cur = self;
        while let RefValue::Symbolic { target } = &cur.value {
            cur = target;
        }
        cur
    }

    /// Object id of the leaf; `None` if the chain ends unborn.
    pub fn object_id(&self) -> Option<ObjectHash> {
        match &self.leaf().value {
            RefValue::Object { id, .. } if !id.is_zero() => Some(*id),
            _ => None,
        }
    }

    /// Cached peeled id, if the leaf is a peeled annotated tag.
    pub fn peeled_id(&self) -> Option<ObjectHash> {
        match &self.leaf().value {
            RefValue::Object {
                peeled: Peeled::Tag(p),
                ..
            } => Some(*p),
            _ => None,
        }
    }
}

/// Desired or observed target of a reference in an update command. The
/// zero id means "absent".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefTarget {
    Id(ObjectHash),
    /// Annotated tag target with its known peeled id.
    PeeledTag { id: ObjectHash, peeled: ObjectHash },
    Symbolic(String),
}

impl RefTarget {
    pub fn zero() -> RefTarget {
        RefTarget::Id(ObjectHash::default())
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, RefTarget::Id(id) if id.is_zero())
    }

    /// The plain object id of this target, if it has one.
    pub fn id(&self) -> Option<ObjectHash> {
        match self {
            RefTarget::Id(id) if !id.is_zero() => Some(*id),
            RefTarget::PeeledTag { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// Per-command outcome of a batch update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefUpdateResult {
    NotAttempted,
    Ok,
    /// Observed old value differs from the expected one, or a name
    /// conflict prevents the update.
    LockFailure,
    RejectedInvalidName,
    RejectedOtherReason(String),
    IoFailure(String),
}

/// One reference transition: expected old value, desired new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCommand {
    pub name: String,
    pub old: RefTarget,
    pub new: RefTarget,
    pub result: RefUpdateResult,
}

impl RefCommand {
    pub fn new(name: impl Into<String>, old: RefTarget, new: RefTarget) -> RefCommand {
        RefCommand {
            name: name.into(),
            old,
            new,
            result: RefUpdateResult::NotAttempted,
        }
    }

    pub fn create(name: impl Into<String>, id: ObjectHash) -> RefCommand {
        RefCommand::new(name, RefTarget::zero(), RefTarget::Id(id))
    }

    pub fn update(name: impl Into<String>, old: ObjectHash, new: ObjectHash) -> RefCommand {
        RefCommand::new(name, RefTarget::Id(old), RefTarget::Id(new))
    }

    pub fn delete(name: impl Into<String>, old: ObjectHash) -> RefCommand {
        RefCommand::new(name, RefTarget::Id(old), RefTarget::zero())
    }

    pub fn link(name: impl Into<String>, old: RefTarget, target: impl Into<String>) -> RefCommand {
        RefCommand::new(name, old, RefTarget::Symbolic(target.into()))
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_absent()
    }
}

/// An atomic set of reference transitions.
#[derive(Debug, Clone, Default)]
pub struct BatchRefUpdate {
    pub commands: Vec<RefCommand>,
}

impl BatchRefUpdate {
    pub fn new() -> BatchRefUpdate {
        BatchRefUpdate::default()
    }

    pub fn add(&mut self, command: RefCommand) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// True if every command ended `Ok`.
    pub fn all_ok(&self) -> bool {
        self.commands
            .iter()
            .all(|c| c.result == RefUpdateResult::Ok)
    }
}

/// Mark a rejected batch: the offending command keeps its specific result,
/// every still-unattempted command becomes REJECTED_OTHER_REASON with the
/// transaction-aborted message.
pub fn abort_remaining(commands: &mut [RefCommand]) {
    for cmd in commands {
        if cmd.result == RefUpdateResult::NotAttempted {
            cmd.result =
                RefUpdateResult::RejectedOtherReason(GitError::TransactionAborted.to_string());
        }
    }
}

/// Git reference naming rules. `HEAD` is always accepted.
pub fn is_valid_ref_name(name: &str) -> bool {
    if name == HEAD {
        return true;
    }
    if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    if name.contains("//") || name.contains("..") || name.contains("@{") {
        return false;
    }
    for c in name.chars() {
        if c.is_ascii_control()
            || matches!(c, ' ' | ':' | '?' | '[' | '\\' | '^' | '~' | '*')
        {
            return false;
        }
    }
    for component in name.split('/') {
        if component.is_empty() || component.starts_with('.') || component.ends_with(".lock") {
            return false;
        }
    }
    true
}

/// True when `prefix` is `""` or ends with `/`, the only shapes prefix
/// enumeration accepts.
pub fn is_valid_prefix(prefix: &str) -> bool {
    prefix.is_empty() || prefix.ends_with('/')
}

/// Abstract reference store.
pub trait RefDatabase: Send + Sync {
    /// Read one reference by exact name, resolving symbolic chains up to
    /// [`MAX_SYMBOLIC_REF_DEPTH`]; deeper chains yield `None`.
    fn exact_ref(&self, name: &str) -> Result<Option<Ref>, GitError>;

    /// All references under `prefix`, which must be empty or end with `/`;
    /// any other non-empty prefix yields an empty map.
    fn get_refs(&self, prefix: &str) -> Result<BTreeMap<String, Ref>, GitError>;

    /// References outside the main namespace (MERGE_HEAD, FETCH_HEAD, ...).
    fn additional_refs(&self) -> Result<Vec<Ref>, GitError> {
        Ok(Vec::new())
    }

    /// Resolve the peeled id of a tag-valued reference, caching it on the
    /// returned leaf; non-tag references come back unchanged.
    fn peel(&self, reference: &Ref) -> Result<Ref, GitError>;

    /// Apply an atomic batch, filling each command's result.
    fn apply_batch(&self, batch: &mut BatchRefUpdate) -> Result<(), GitError>;

    /// Whether `apply_batch` is genuinely all-or-nothing.
    fn performs_atomic_transactions(&self) -> bool;

    /// Begin an empty batch for this database.
    fn new_batch_update(&self) -> BatchRefUpdate {
        BatchRefUpdate::new()
    }

    /// Begin a single-reference update: the returned command carries the
    /// current value as its expected old; the caller fills in `new`.
    /// Updating a symbolic reference follows it to the leaf unless
    /// `detach` is set, in which case the symbolic entry itself is
    /// replaced.
    fn new_update(&self, name: &str, detach: bool) -> Result<RefCommand, GitError> {
        match self.exact_ref(name)? {
            None => Ok(RefCommand::new(name, RefTarget::zero(), RefTarget::zero())),
            Some(r) => match &r.value {
                RefValue::Symbolic { .. } if !detach => {
                    let leaf = r.leaf();
                    Ok(RefCommand::new(
                        leaf.name.clone(),
                        RefTarget::Id(leaf.object_id().unwrap_or_default()),
                        RefTarget::zero(),
                    ))
                }
                RefValue::Symbolic { target } => Ok(RefCommand::new(
                    name,
                    RefTarget::Symbolic(target.name.clone()),
                    RefTarget::zero(),
                )),
                RefValue::Object { id, .. } => Ok(RefCommand::new(
                    name,
                    RefTarget::Id(*id),
                    RefTarget::zero(),
                )),
            },
        }
    }

    /// Single-command convenience over `apply_batch`.
    fn update_ref(&self, command: RefCommand) -> Result<RefUpdateResult, GitError> {
        let mut batch = BatchRefUpdate::new();
        batch.add(command);
        self.apply_batch(&mut batch)?;
        Ok(batch.commands.remove(0).result)
    }

    /// Build the batch realizing a rename: delete the source, create the
    /// destination, and retarget any symbolic reference (HEAD included)
    /// pointing at the source.
    fn new_rename(&self, from: &str, to: &str) -> Result<BatchRefUpdate, GitError> {
        let source = self
            .exact_ref(from)?
            .and_then(|r| r.object_id())
            .ok_or_else(|| GitError::MissingObject(from.to_string()))?;
        let mut batch = BatchRefUpdate::new();
        batch.add(RefCommand::delete(from, source));
        batch.add(RefCommand::create(to, source));

        let mut retarget = |r: &Ref| {
            if let RefValue::Symbolic { target } = &r.value {
                if target.name == from {
                    batch.add(RefCommand::link(
                        r.name.clone(),
                        RefTarget::Symbolic(from.to_string()),
                        to,
                    ));
                }
            }
        };
        if let Some(head) = self.exact_ref(HEAD)? {
            retarget(&head);
        }
        for (_, r) in self.get_refs(R_REFS)? {
            retarget(&r);
        }
        Ok(batch)
    }

    /// True if `name` cannot coexist with the current namespace: an
    /// existing reference is a strict `/`-boundary prefix of `name`, or
    /// `name` is such a prefix of an existing reference.
    fn is_name_conflicting(&self, name: &str) -> Result<bool, GitError> {
        let all = self.get_refs("")?;
        let as_dir = format!("{name}/");
        for existing in all.keys() {
            if existing.starts_with(&as_dir) {
                return Ok(true);
            }
            if name.starts_with(&format!("{existing}/")) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
