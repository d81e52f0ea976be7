use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    Error, Result,
    clock::{Clock, SystemClock},
    feed::{OperationKind, ResumeToken, memory::MemoryFeed},
    lease::{LeaseRecord, LeaseStore, Renewal},
    store::LEASE_FEED_RETENTION,
};

#[derive(Debug, Default)]
struct State {
    records: HashMap<String, LeaseRecord>,
    failing_ops: usize,
}

/// Lease collection held in process memory.
///
/// Every handle cloned from the same store sees the same records, so it can
/// stand in for a shared database across worker threads.
#[derive(Clone)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    feed: MemoryFeed,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            state: Arc::default(),
            clock: Arc::new(clock),
            feed: MemoryFeed::with_retention(LEASE_FEED_RETENTION as usize),
        }
    }

    /// Change feed of the lease collection.
    pub fn feed(&self) -> MemoryFeed {
        self.feed.clone()
    }

    /// Makes the next `count` store operations fail with a transient error.
    pub fn fail_next(&self, count: usize) {
        self.lock().failing_ops = count;
    }

    /// Overwrites a record without any checks, for arranging test scenarios.
    pub fn put(&self, record: LeaseRecord) -> Result<()> {
        self.publish(OperationKind::Replace, &record)?;
        self.lock().records.insert(record.owner_key.clone(), record);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        if state.failing_ops > 0 {
            state.failing_ops -= 1;
            return Err(Error::TransientStore("injected store failure".into()));
        }
        Ok(state)
    }

    fn publish(&self, operation: OperationKind, record: &LeaseRecord) -> Result<()> {
        self.feed.append(operation, serde_json::to_value(record)?);
        Ok(())
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn get(&self, owner_key: &str) -> Result<Option<LeaseRecord>> {
        Ok(self.begin()?.records.get(owner_key).cloned())
    }

    fn create_if_absent(&self, owner_key: &str, host_name: &str) -> Result<LeaseRecord> {
        let mut state = self.begin()?;
        if state.records.contains_key(owner_key) {
            return Err(Error::AlreadyExists(owner_key.to_string()));
        }
        let record = LeaseRecord::new(owner_key, host_name, self.clock.now_ms());
        state.records.insert(owner_key.to_string(), record.clone());
        self.publish(OperationKind::Insert, &record)?;
        Ok(record)
    }

    fn try_renew(
        &self,
        owner_key: &str,
        expected_host: &str,
        checkpoint: Option<&ResumeToken>,
    ) -> Result<Renewal> {
        let mut state = self.begin()?;
        let Some(record) = state.records.get_mut(owner_key) else {
            return Ok(Renewal::OwnershipLost {
                holder: String::new(),
            });
        };
        if !record.is_held_by(expected_host) {
            return Ok(Renewal::OwnershipLost {
                holder: record.host_name.clone(),
            });
        }
        record.renew(checkpoint, self.clock.now_ms());
        let record = record.clone();
        self.publish(OperationKind::Replace, &record)?;
        Ok(Renewal::Renewed(record))
    }

    fn force_acquire(&self, owner_key: &str, new_host: &str) -> Result<LeaseRecord> {
        let mut state = self.begin()?;
        let now = self.clock.now_ms();
        let (operation, record) = match state.records.get_mut(owner_key) {
            Some(record) => {
                record.take_over(new_host, now);
                (OperationKind::Replace, record.clone())
            }
            None => {
                let record = LeaseRecord::new(owner_key, new_host, now);
                state.records.insert(owner_key.to_string(), record.clone());
                (OperationKind::Insert, record)
            }
        };
        self.publish(operation, &record)?;
        Ok(record)
    }
}
