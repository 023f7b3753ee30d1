//! Registry of spawned extension processes.
//!
//! The command runner registers each child and marks it finished; the
//! environment monitor prunes finished entries and reports long-running ones.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub pid: u32,
    pub handler_dir: PathBuf,
    pub started: Instant,
    pub finished: bool,
}

impl ChildRecord {
    pub fn running_for(&self) -> Duration {
        self.started.elapsed()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChildRegistry {
    inner: Arc<Mutex<HashMap<u32, ChildRecord>>>,
}

impl ChildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, ChildRecord>> {
        // A poisoned map is still a valid map.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, pid: u32, handler_dir: PathBuf) {
        self.lock().insert(
            pid,
            ChildRecord {
                pid,
                handler_dir,
                started: Instant::now(),
                finished: false,
            },
        );
    }

    pub fn complete(&self, pid: u32) {
        if let Some(record) = self.lock().get_mut(&pid) {
            record.finished = true;
        }
    }

    /// Remove and return finished children.
    pub fn reap(&self) -> Vec<ChildRecord> {
        let mut children = self.lock();
        let finished: Vec<u32> = children
            .values()
            .filter(|c| c.finished)
            .map(|c| c.pid)
            .collect();
        finished
            .into_iter()
            .filter_map(|pid| children.remove(&pid))
            .collect()
    }

    pub fn running(&self) -> Vec<ChildRecord> {
        self.lock().values().filter(|c| !c.finished).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
