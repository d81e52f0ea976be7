use std::time::Duration;

use log::{debug, info, warn};

use crate::{
    Result,
    clock::{Clock, Millis, elapsed},
    config::Config,
    feed::ResumeToken,
    lease::{LeaseStore, Renewal},
};

/// Result of handing a checkpoint to the [`Renewer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heartbeat {
    /// Renewal not due yet. The checkpoint is held until the next renewal.
    Skipped,
    /// The lease and any pending checkpoint were written.
    Renewed,
    /// The store was unreachable. The next call retries.
    Deferred,
    /// Another host holds the lease. Stop consuming.
    Demoted { holder: String },
}

/// Throttled lease renewal on behalf of the active worker.
///
/// The consumer calls [`on_checkpoint_advanced`](Renewer::on_checkpoint_advanced)
/// after every delivered event and on every idle tick. At most once per
/// health-check interval that turns into a conditional write of the health
/// check timestamp and the newest checkpoint. Only an explicit ownership
/// mismatch demotes; store outages are retried.
pub struct Renewer<'a, S: ?Sized, C: ?Sized> {
    store: Option<&'a S>,
    clock: &'a C,
    owner_key: &'a str,
    host_name: &'a str,
    interval: Duration,
    last_renewal: Option<Millis>,
    pending: Option<ResumeToken>,
    persisted: Option<ResumeToken>,
    demoted: Option<String>,
}

impl<'a, S, C> Renewer<'a, S, C>
where
    S: LeaseStore + ?Sized,
    C: Clock + ?Sized,
{
    /// A renewer for a lease just acquired, whose stored checkpoint is
    /// `persisted`.
    pub fn new(
        store: &'a S,
        config: &'a Config,
        clock: &'a C,
        persisted: Option<ResumeToken>,
    ) -> Self {
        Self {
            store: Some(store),
            ..Self::uncoordinated(config, clock)
        }
        .with_persisted(persisted)
    }

    /// A renewer that never writes a lease and never demotes, for workers
    /// running without coordination. It still tracks the newest checkpoint.
    pub fn uncoordinated(config: &'a Config, clock: &'a C) -> Self {
        Self {
            store: None,
            clock,
            owner_key: &config.owner_key,
            host_name: &config.host_name,
            interval: config.health_check_interval,
            last_renewal: None,
            pending: None,
            persisted: None,
            demoted: None,
        }
    }

    fn with_persisted(mut self, persisted: Option<ResumeToken>) -> Self {
        self.persisted = persisted;
        self
    }

    pub fn on_checkpoint_advanced(&mut self, checkpoint: Option<ResumeToken>) -> Result<Heartbeat> {
        if let Some(holder) = &self.demoted {
            return Ok(Heartbeat::Demoted {
                holder: holder.clone(),
            });
        }
        if let Some(token) = checkpoint {
            self.pending = Some(token);
        }
        let Some(store) = self.store else {
            return Ok(Heartbeat::Skipped);
        };

        let now = self.clock.now_ms();
        if self
            .last_renewal
            .is_some_and(|last| elapsed(last, now) < self.interval)
        {
            return Ok(Heartbeat::Skipped);
        }

        match store.try_renew(self.owner_key, self.host_name, self.pending.as_ref()) {
            Ok(Renewal::Renewed(record)) => {
                self.last_renewal = Some(now);
                if let Some(token) = self.pending.take() {
                    self.persisted = Some(token);
                }
                debug!(
                    "renewed lease '{}' at {}",
                    self.owner_key, record.last_health_check_at
                );
                Ok(Heartbeat::Renewed)
            }
            Ok(Renewal::OwnershipLost { holder }) => {
                info!(
                    "{} lost lease '{}' to '{}'",
                    self.host_name, self.owner_key, holder
                );
                self.demoted = Some(holder.clone());
                Ok(Heartbeat::Demoted { holder })
            }
            Err(e) if e.is_transient() => {
                warn!("renewal of lease '{}' deferred: {e}", self.owner_key);
                Ok(Heartbeat::Deferred)
            }
            Err(e) => Err(e),
        }
    }

    /// The newest checkpoint handed in, durable or not. Resubscribing after
    /// it neither skips nor redelivers delivered events.
    pub fn checkpoint(&self) -> Option<&ResumeToken> {
        self.pending.as_ref().or(self.persisted.as_ref())
    }

    /// The newest checkpoint known to be stored in the lease.
    pub fn last_persisted(&self) -> Option<&ResumeToken> {
        self.persisted.as_ref()
    }

    pub fn is_demoted(&self) -> bool {
        self.demoted.is_some()
    }
}
