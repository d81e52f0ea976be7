//! Passive monitoring of a lease held by another worker.
//!
//! The monitor subscribes to the lease collection's change feed, filtered to
//! our owner key, and keeps the most recent record it has seen. Once per
//! health-check interval it re-evaluates staleness against that record. When
//! the feed is unavailable a point read stands in for notifications.
//!
//! The monitor never writes the lease. An [`Watch::Expired`] result only
//! means the caller should run the election again.

use log::{debug, info, warn};

use crate::{
    ChangeFeed, Result, Subscription,
    clock::Clock,
    config::Config,
    election::{LeaseState, classify},
    filter::Filter,
    lease::{LeaseRecord, LeaseStore},
    shutdown::Shutdown,
};

/// Why the monitor returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Watch {
    /// The holder stopped renewing. Carries the last record observed.
    Expired(LeaseRecord),
    Shutdown,
}

/// Blocks while the lease described by `last_known` stays fresh.
pub fn run<F, S, C>(
    lease_feed: &F,
    store: &S,
    config: &Config,
    clock: &C,
    shutdown: &Shutdown,
    last_known: LeaseRecord,
) -> Result<Watch>
where
    F: ChangeFeed,
    S: LeaseStore + ?Sized,
    C: Clock + ?Sized,
{
    let filter = Filter::new().field_eq("ownerKey", config.owner_key.as_str());
    let mut latest = last_known;
    let mut subscription: Option<F::Subscription> = None;

    loop {
        if subscription.is_none() {
            match lease_feed.subscribe_from_now(&filter) {
                Ok(sub) => subscription = Some(sub),
                Err(e) if e.is_transient() => warn!("lease feed subscription failed: {e}"),
                Err(e) => return Err(e),
            }
        }

        let drained = match subscription.as_mut() {
            Some(sub) => drain(sub, &mut latest),
            None => Ok(false),
        };
        match drained {
            Ok(true) => {}
            Ok(false) if subscription.is_some() => {}
            Ok(false) => refresh(store, config, &mut latest)?,
            Err(e) if e.is_transient() => {
                warn!("lease feed subscription dropped: {e}");
                close(&mut subscription);
                refresh(store, config, &mut latest)?;
            }
            Err(e) => return Err(e),
        }

        let state = classify(Some(&latest), clock.now_ms(), config.lease_stale_interval);
        if state == LeaseState::OwnedExpired {
            info!(
                "lease '{}' held by {} expired at health check {}",
                config.owner_key, latest.host_name, latest.last_health_check_at
            );
            close(&mut subscription);
            return Ok(Watch::Expired(latest));
        }

        if shutdown.wait(config.health_check_interval) {
            close(&mut subscription);
            return Ok(Watch::Shutdown);
        }
    }
}

/// Applies every pending notification. Returns whether any arrived.
fn drain<T: Subscription>(sub: &mut T, latest: &mut LeaseRecord) -> Result<bool> {
    let mut seen = false;
    while let Some(event) = sub.try_next()? {
        match serde_json::from_value::<LeaseRecord>(event.document) {
            Ok(record) => {
                debug!(
                    "lease notification: {} at {}",
                    record.host_name, record.last_health_check_at
                );
                *latest = record;
                seen = true;
            }
            Err(e) => warn!("ignoring undecodable lease notification: {e}"),
        }
    }
    Ok(seen)
}

/// Replaces `latest` with a point read. A failed read keeps the last known
/// record.
fn refresh<S>(store: &S, config: &Config, latest: &mut LeaseRecord) -> Result<()>
where
    S: LeaseStore + ?Sized,
{
    match store.get(&config.owner_key) {
        Ok(Some(record)) => *latest = record,
        Ok(None) => {}
        Err(e) if e.is_transient() => warn!("lease read failed: {e}"),
        Err(e) => return Err(e),
    }
    Ok(())
}

fn close<T: Subscription>(subscription: &mut Option<T>) {
    if let Some(mut sub) = subscription.take() {
        sub.close();
    }
}
