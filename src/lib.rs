//! Lease-coordinated consumption of a document collection's change feed.
//!
//! Several redundant workers run the same [`worker::run`] loop. A lease
//! record in a shared store decides which one consumes the feed; the others
//! watch the lease and take over once its holder stops renewing it. The
//! holder stores its feed checkpoint in the lease, so a successor resumes
//! where it stopped.

pub mod clock;
pub mod config;
pub mod consumer;
pub mod election;
pub mod error;
pub mod feed;
pub mod filter;
pub mod handler;
pub mod lease;
mod lock;
pub mod monitor;
pub mod renewer;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use feed::{ChangeEvent, ChangeFeed, OperationKind, ResumeToken};
pub use filter::Filter;
pub use handler::Handler;
pub use lease::{LeaseRecord, LeaseStore, Renewal};
pub use shutdown::Shutdown;

/// An open change feed subscription.
///
/// Polling is non-blocking: the worker loops own the waiting so that it can
/// be interrupted by [`Shutdown`].
pub trait Subscription {
    /// Returns the next event matching the subscription's filter, or `None`
    /// when none is available yet.
    ///
    /// An idle feed is not an error. Errors mean the subscription is broken
    /// and must be reopened from the last checkpoint.
    fn try_next(&mut self) -> Result<Option<ChangeEvent>>;

    /// Releases the subscription. Later polls fail.
    fn close(&mut self);
}
