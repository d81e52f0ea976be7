//! Lease collection stored as one JSON document per owner key.
//!
//! Layout under the store directory:
//! - `<ownerKey>.json`: the lease record, replaced atomically via rename
//! - `<ownerKey>.lease.lock`: `flock` target serializing read-modify-write
//!   cycles
//! - `changes.jsonl`: change feed of every lease mutation, rotated to
//!   `changes.jsonl.1` every [`LEASE_FEED_RETENTION`] entries
//!
//! A mutation is published to the feed before its record is renamed into
//! place. A record that fails to publish is never written.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::{
    Error, Result,
    clock::{Clock, SystemClock},
    feed::{OperationKind, ResumeToken, file::FileFeed},
    lease::{LeaseRecord, LeaseStore, Renewal},
    lock::FileLock,
    store::LEASE_FEED_RETENTION,
};

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct FileLeaseStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    feed: FileFeed,
}

impl FileLeaseStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_clock(dir, SystemClock)
    }

    pub fn open_with_clock(dir: impl AsRef<Path>, clock: impl Clock + 'static) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let feed = FileFeed::open_with_retention(&dir, LEASE_FEED_RETENTION)?;
        Ok(Self {
            dir,
            clock: Arc::new(clock),
            feed,
        })
    }

    /// Change feed of the lease collection.
    pub fn feed(&self) -> FileFeed {
        self.feed.clone()
    }

    fn record_path(&self, owner_key: &str) -> Result<PathBuf> {
        validate_key(owner_key)?;
        Ok(self.dir.join(format!("{owner_key}.json")))
    }

    fn read(&self, path: &Path) -> Result<Option<LeaseRecord>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Corrupt(format!("{}: {e}", path.display())))
    }

    fn write(&self, path: &Path, record: &LeaseRecord, operation: OperationKind) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(record)?)?;
        file.sync_all()?;
        self.feed
            .append(operation, serde_json::to_value(record)?)
            .map_err(|e| match e {
                Error::Io(e) => Error::TransientStore(format!("lease feed append failed: {e}")),
                other => other,
            })?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Runs `f` on the current record while holding the key's lock.
    fn locked<R>(
        &self,
        owner_key: &str,
        f: impl FnOnce(&Path, Option<LeaseRecord>) -> Result<R>,
    ) -> Result<R> {
        let path = self.record_path(owner_key)?;
        let lock_path = self.dir.join(format!("{owner_key}.lease.lock"));
        for _ in 0..LOCK_ATTEMPTS {
            if let Some(_guard) = FileLock::try_exclusive(&lock_path)? {
                let current = self.read(&path)?;
                return f(&path, current);
            }
            thread::sleep(LOCK_BACKOFF);
        }
        Err(Error::TransientStore(format!(
            "lease '{owner_key}' is locked by another process"
        )))
    }
}

impl LeaseStore for FileLeaseStore {
    fn get(&self, owner_key: &str) -> Result<Option<LeaseRecord>> {
        let path = self.record_path(owner_key)?;
        self.read(&path)
    }

    fn create_if_absent(&self, owner_key: &str, host_name: &str) -> Result<LeaseRecord> {
        self.locked(owner_key, |path, current| {
            if current.is_some() {
                return Err(Error::AlreadyExists(owner_key.to_string()));
            }
            let record = LeaseRecord::new(owner_key, host_name, self.clock.now_ms());
            self.write(path, &record, OperationKind::Insert)?;
            Ok(record)
        })
    }

    fn try_renew(
        &self,
        owner_key: &str,
        expected_host: &str,
        checkpoint: Option<&ResumeToken>,
    ) -> Result<Renewal> {
        self.locked(owner_key, |path, current| {
            let Some(mut record) = current else {
                return Ok(Renewal::OwnershipLost {
                    holder: String::new(),
                });
            };
            if !record.is_held_by(expected_host) {
                return Ok(Renewal::OwnershipLost {
                    holder: record.host_name,
                });
            }
            record.renew(checkpoint, self.clock.now_ms());
            self.write(path, &record, OperationKind::Replace)?;
            Ok(Renewal::Renewed(record))
        })
    }

    fn force_acquire(&self, owner_key: &str, new_host: &str) -> Result<LeaseRecord> {
        self.locked(owner_key, |path, current| {
            let now = self.clock.now_ms();
            let (record, operation) = match current {
                Some(mut record) => {
                    record.take_over(new_host, now);
                    (record, OperationKind::Replace)
                }
                None => (
                    LeaseRecord::new(owner_key, new_host, now),
                    OperationKind::Insert,
                ),
            };
            self.write(path, &record, operation)?;
            Ok(record)
        })
    }
}

/// Owner keys double as file names.
fn validate_key(owner_key: &str) -> Result<()> {
    let valid = !owner_key.is_empty()
        && !owner_key.starts_with('.')
        && owner_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "owner key '{owner_key}' must be non-empty ASCII letters, digits, '-', '_' or '.'"
        )))
    }
}
