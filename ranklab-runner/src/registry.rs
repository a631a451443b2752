//! Run registry — concurrent map of run id → handle.
//!
//! Runs are isolated from each other (own id, progress, logs) but share
//! whatever services the orchestrator holds (rate limiter, cache). Run ids
//! are a short strategy-content hash plus a process-wide sequence number,
//! so identical requests still get distinct runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::run::RunHandle;

#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, Arc<RunHandle>>>,
    sequence: AtomicU64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a handle for a new run and register it.
    pub fn create(&self, strategy_id: &str) -> Arc<RunHandle> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let hash = blake3::hash(strategy_id.as_bytes()).to_hex();
        let run_id = format!("{}-{seq:06}", &hash.as_str()[..8]);

        let handle = Arc::new(RunHandle::new(run_id.clone()));
        self.runs.lock().unwrap().insert(run_id, handle.clone());
        handle
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.lock().unwrap().get(run_id).cloned()
    }

    /// Flag a run as cancelled. Returns false for unknown ids or runs that
    /// already reached a terminal status.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.get(run_id) {
            Some(handle) if !handle.status().is_terminal() => {
                handle.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().unwrap().is_empty()
    }
}
