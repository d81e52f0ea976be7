use serde::{Deserialize, Serialize};

use crate::{Result, clock::Millis, feed::ResumeToken};

/// The single document recording who holds the lease for an owner key and
/// how far into the feed that holder has durably progressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub owner_key: String,
    pub host_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
    pub last_health_check_at: Millis,
}

impl LeaseRecord {
    pub fn new(owner_key: &str, host_name: &str, now: Millis) -> Self {
        Self {
            owner_key: owner_key.to_string(),
            host_name: host_name.to_string(),
            resume_token: None,
            last_health_check_at: now,
        }
    }

    pub fn is_held_by(&self, host_name: &str) -> bool {
        self.host_name == host_name
    }

    /// Applies a renewal by the current holder. The health-check timestamp
    /// never moves backwards and an absent checkpoint keeps the stored one.
    pub(crate) fn renew(&mut self, checkpoint: Option<&ResumeToken>, now: Millis) {
        self.last_health_check_at = self.last_health_check_at.max(now);
        if let Some(token) = checkpoint {
            self.resume_token = Some(token.clone());
        }
    }

    /// Hands the lease to `host_name`, keeping the checkpoint so the new
    /// holder resumes where the old one stopped.
    pub(crate) fn take_over(&mut self, host_name: &str, now: Millis) {
        self.host_name = host_name.to_string();
        self.last_health_check_at = now;
    }
}

/// Outcome of a conditional renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Renewal {
    Renewed(LeaseRecord),
    /// The stored holder is no longer the caller. Empty when the record is
    /// missing altogether.
    OwnershipLost { holder: String },
}

/// Point reads and writes against the lease collection.
///
/// Implementations must make [`try_renew`](LeaseStore::try_renew) an atomic
/// compare-and-set on `hostName`: it is the only thing preventing a demoted
/// holder from overwriting its successor. Transient failures are reported as
/// [`Error::TransientStore`](crate::Error::TransientStore).
pub trait LeaseStore {
    fn get(&self, owner_key: &str) -> Result<Option<LeaseRecord>>;

    /// Inserts a fresh record held by `host_name`, or fails with
    /// [`Error::AlreadyExists`](crate::Error::AlreadyExists).
    fn create_if_absent(&self, owner_key: &str, host_name: &str) -> Result<LeaseRecord>;

    /// Advances `lastHealthCheckAt` and, when given, the checkpoint, only if
    /// `expected_host` still holds the lease. Never mutates on mismatch.
    fn try_renew(
        &self,
        owner_key: &str,
        expected_host: &str,
        checkpoint: Option<&ResumeToken>,
    ) -> Result<Renewal>;

    /// Unconditionally claims the lease. Only called after the caller has
    /// established that the current holder's lease expired.
    fn force_acquire(&self, owner_key: &str, new_host: &str) -> Result<LeaseRecord>;
}

impl<S: LeaseStore + ?Sized> LeaseStore for &S {
    fn get(&self, owner_key: &str) -> Result<Option<LeaseRecord>> {
        (**self).get(owner_key)
    }

    fn create_if_absent(&self, owner_key: &str, host_name: &str) -> Result<LeaseRecord> {
        (**self).create_if_absent(owner_key, host_name)
    }

    fn try_renew(
        &self,
        owner_key: &str,
        expected_host: &str,
        checkpoint: Option<&ResumeToken>,
    ) -> Result<Renewal> {
        (**self).try_renew(owner_key, expected_host, checkpoint)
    }

    fn force_acquire(&self, owner_key: &str, new_host: &str) -> Result<LeaseRecord> {
        (**self).force_acquire(owner_key, new_host)
    }
}
