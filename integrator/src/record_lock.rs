//! Per-record serialization of pipeline runs.
//!
//! REDCap can fire several triggers for a single save. Without serialization
//! two runs for the same record could both miss the subject identifier and
//! create two subjects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

type RecordKey = (u32, u32);

/// Table of async locks keyed by `(project_id, record_id)`.
///
/// Entries live only as long as someone holds or waits for them.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<RecordKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl RecordLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other run holds the lock for this record.
    pub async fn lock(&self, project_id: u32, record_id: u32) -> RecordGuard<'_> {
        let key = (project_id, record_id);
        // Built before waiting so a cancelled waiter still cleans up its entry.
        // The pending acquire drops first and releases its `Arc` clone.
        let mut entry = RecordGuard {
            locks: self,
            key,
            guard: None,
        };
        let lock = self.table().entry(key).or_default().clone();
        entry.guard = Some(lock.lock_owned().await);
        entry
    }

    /// Number of records currently locked or waited on.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RecordKey, Arc<tokio::sync::Mutex<()>>>> {
        // The map is left consistent by every critical section.
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RecordGuard<'a> {
    locks: &'a RecordLocks,
    key: RecordKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();

        let mut table = self.locks.table();
        if table
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            table.remove(&self.key);
        }
    }
}
