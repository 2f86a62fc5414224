//! Loose reference files under a directory: one file per reference, either
//! a hex object id or a `ref: <target>` symbolic line. This is the
//! bootstrap store the transactional namespace anchors on — small, simple,
//! and capable of an atomic compare-and-swap through temp-file rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::{
    errors::GitError,
    hash::ObjectHash,
    internal::{
        odb::{ObjectStore, peel_tag_chain, read_tag},
        object::types::ObjectType,
        refs::{
            BatchRefUpdate, MAX_SYMBOLIC_REF_DEPTH, Peeled, Ref, RefCommand, RefDatabase,
            RefStorage, RefTarget, RefUpdateResult, RefValue, abort_remaining, is_valid_prefix,
            is_valid_ref_name,
        },
    },
};

/// File-backed loose reference database rooted at a directory.
pub struct LooseRefDatabase {
    root: PathBuf,
    store: Option<Arc<dyn ObjectStore>>,
    // One writer at a time; reads go straight to the filesystem.
    write_lock: Mutex<()>,
}

impl LooseRefDatabase {
    pub fn new(root: impl Into<PathBuf>) -> LooseRefDatabase {
        LooseRefDatabase {
            root: root.into(),
            store: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Attach an object store so `peel` can walk tag chains.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> LooseRefDatabase {
        self.store = Some(store);
        self
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn read_target(&self, name: &str) -> Result<Option<RefTarget>, GitError> {
        let path = self.path_of(name);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(GitError::IOError(e)),
        };
        let line = content.trim_end();
        if let Some(target) = line.strip_prefix("ref: ") {
            return Ok(Some(RefTarget::Symbolic(target.to_string())));
        }
        let id = ObjectHash::from_str(line)
            .map_err(|_| GitError::InvalidHashValue(format!("{name}: {line}")))?;
        Ok(Some(RefTarget::Id(id)))
    }

    fn resolve(&self, name: &str, depth: usize) -> Result<Option<Ref>, GitError> {
        if depth >= MAX_SYMBOLIC_REF_DEPTH {
            return Ok(None);
        }
        match self.read_target(name)? {
            None => Ok(None),
            Some(RefTarget::Id(id)) => Ok(Some(Ref::object(name, RefStorage::Loose, id))),
            Some(RefTarget::PeeledTag { id, .. }) => {
                Ok(Some(Ref::object(name, RefStorage::Loose, id)))
            }
            Some(RefTarget::Symbolic(target)) => {
                let leaf = match self.resolve(&target, depth + 1)? {
                    Some(r) => r,
                    None => {
                        if self.read_target(&target)?.is_some() {
                            // Present but beyond the depth bound: broken chain.
                            return Ok(None);
                        }
                        Ref::unborn(target.clone())
                    }
                };
                Ok(Some(Ref::symbolic(name, RefStorage::Loose, leaf)))
            }
        }
    }

    fn collect_names(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let full = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}{name}")
            };
            if path.is_dir() {
                self.collect_names(&path, &format!("{full}/"), out);
            } else {
                out.push(full);
            }
        }
    }

    fn write_target(&self, name: &str, target: &RefTarget) -> Result<(), GitError> {
        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = match target {
            RefTarget::Symbolic(t) => format!("ref: {t}\n"),
            RefTarget::Id(id) => format!("{id}\n"),
            RefTarget::PeeledTag { id, .. } => format!("{id}\n"),
        };
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(&path)
            .map_err(|e| GitError::IOError(e.error))?;
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<(), GitError> {
        let path = self.path_of(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GitError::IOError(e)),
        }
    }

    fn observed_matches(&self, cmd: &RefCommand) -> Result<bool, GitError> {
        let observed = self.read_target(&cmd.name)?;
        Ok(match (&cmd.old, observed) {
            (old, None) => old.is_absent(),
            (RefTarget::Id(want), Some(RefTarget::Id(have))) => *want == have,
            (RefTarget::PeeledTag { id, .. }, Some(RefTarget::Id(have))) => *id == have,
            (RefTarget::Symbolic(want), Some(RefTarget::Symbolic(have))) => *want == have,
            _ => false,
        })
    }
}

impl RefDatabase for LooseRefDatabase {
    fn exact_ref(&self, name: &str) -> Result<Option<Ref>, GitError> {
        self.resolve(name, 0)
    }

    fn get_refs(&self, prefix: &str) -> Result<BTreeMap<String, Ref>, GitError> {
        if !is_valid_prefix(prefix) {
            return Ok(BTreeMap::new());
        }
        let mut names = Vec::new();
        self.collect_names(&self.root, "", &mut names);
        let mut out = BTreeMap::new();
        for name in names {
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(r) = self.exact_ref(&name)? {
                out.insert(name, r);
            }
        }
        Ok(out)
    }

    fn additional_refs(&self) -> Result<Vec<Ref>, GitError> {
        let mut out = Vec::new();
        for name in ["MERGE_HEAD", "ORIG_HEAD", "FETCH_HEAD", "CHERRY_PICK_HEAD"] {
            if let Some(r) = self.exact_ref(name)? {
                out.push(r);
            }
        }
        Ok(out)
    }

    fn peel(&self, reference: &Ref) -> Result<Ref, GitError> {
        let Some(store) = &self.store else {
            return Ok(reference.clone());
        };
        let leaf = reference.leaf();
        let RefValue::Object { id, peeled } = &leaf.value else {
            return Ok(reference.clone());
        };
        if *peeled != Peeled::Unpeeled || id.is_zero() {
            return Ok(reference.clone());
        }
        let peeled_value = match store.get(id)? {
            Some(obj) if obj.obj_type == ObjectType::Tag => {
                let tag = read_tag(store.as_ref(), id)?;
                Peeled::Tag(peel_tag_chain(store.as_ref(), &tag.object_hash)?)
            }
            _ => Peeled::NonTag,
        };
        let mut peeled_ref = reference.clone();
        // Rewrite the leaf in place, preserving any symbolic wrappers.
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
        let _guard = self.write_lock.lock().expect("loose ref lock poisoned");

        for i in 0..batch.commands.len() {
            let cmd = &batch.commands[i];
            if !is_valid_ref_name(&cmd.name) {
                batch.commands[i].result = RefUpdateResult::RejectedInvalidName;
                abort_remaining(&mut batch.commands);
                return Ok(());
            }
            if !self.observed_matches(cmd)? {
                debug!(name = %cmd.name, "loose ref old value mismatch");
                batch.commands[i].result = RefUpdateResult::LockFailure;
                abort_remaining(&mut batch.commands);
                return Ok(());
            }
        }

        for i in 0..batch.commands.len() {
            let (name, new) = {
                let cmd = &batch.commands[i];
                (cmd.name.clone(), cmd.new.clone())
            };
            let outcome = if new.is_absent() {
                self.delete_file(&name)
            } else {
                self.write_target(&name, &new)
            };
            batch.commands[i].result = match outcome {
                Ok(()) => RefUpdateResult::Ok,
                Err(e) => RefUpdateResult::IoFailure(e.to_string()),
            };
        }
        Ok(())
    }

    fn performs_atomic_transactions(&self) -> bool {
        // Old values are checked under the writer lock, but a crash between
        // file writes can leave a batch half applied.
        false
    }
}
