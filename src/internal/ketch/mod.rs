//! Ketch: leader-driven replication of reference transitions.
//!
//! A leader serializes proposals into an ordered log of commits under the
//! transactional namespace, distributes each entry to its replicas, and
//! commits once a majority of voters has accepted. The modules here follow
//! the ownership rule that makes the protocol auditable: one mutex per
//! leader guards every piece of leader, round, and replica bookkeeping;
//! transports and timers always run outside it.

pub mod leader;
pub mod proposal;
pub mod replica;
pub(crate) mod round;

use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use threadpool::ThreadPool;

use crate::{errors::GitError, hash::ObjectHash};

/// A log entry's commit id together with its monotone position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogIndex {
    pub id: ObjectHash,
    pub index: u64,
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.id)
    }
}

/// Role of a leader instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaderRole {
    Candidate,
    Leader,
    Deposed,
    Shutdown,
}

/// Shared executors for every leader in the process: a thread pool for
/// pushes (which block on transport I/O) and a small timer runtime for
/// retry delays.
pub struct KetchSystem {
    executor: ThreadPool,
    timer: tokio::runtime::Runtime,
}

impl KetchSystem {
    pub fn new() -> Result<Arc<KetchSystem>, GitError> {
        let workers = num_cpus::get().max(2);
        let timer = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ketch-timer")
            .enable_time()
            .build()?;
        Ok(Arc::new(KetchSystem {
            executor: ThreadPool::with_name("ketch-push".to_string(), workers),
            timer,
        }))
    }

    pub(crate) fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        self.executor.execute(job);
    }

    pub(crate) fn timer(&self) -> &tokio::runtime::Handle {
        self.timer.handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The system builds its executors and accepts jobs.
    #[test]
    fn test_system_executes() {
        let system = KetchSystem::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        system.execute(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap(), 42);
    }

    /// LogIndex ordering is by position, display carries both fields.
    #[test]
    fn test_log_index_display() {
        let idx = LogIndex {
            id: ObjectHash::Sha1([0xAB; 20]),
            index: 7,
        };
        let shown = idx.to_string();
        assert!(shown.starts_with("7/abab"));
    }
}
