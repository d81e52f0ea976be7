//! Reference [`LeaseStore`](crate::lease::LeaseStore) backends.
//!
//! Both publish every lease mutation to a change feed so passive workers can
//! watch the record instead of polling it.

/// Lease notifications each backend keeps before discarding the oldest.
/// Watchers only ever subscribe from now, so old renewals are never replayed.
pub const LEASE_FEED_RETENTION: u64 = 256;

pub mod file;
pub mod memory;

pub use file::FileLeaseStore;
pub use memory::MemoryLeaseStore;
