//! Lease election.
//!
//! Deciding a role is split into two pure steps, [`classify`] and
//! [`decide`], followed by [`elect`] which performs the store write the
//! decision calls for. The passive monitor reuses [`classify`] so both agree
//! on when a lease has expired.
//!
//! Semantics:
//! - A missing lease is created and the creator becomes active.
//! - A fresh lease is left alone and the caller becomes passive.
//! - An expired lease is force-acquired. Concurrent claimants are not
//!   arbitrated: the last write wins and the loser finds out on its first
//!   renewal.

use std::time::Duration;

use log::info;

use crate::{
    Error, Result,
    clock::{Clock, Millis, elapsed},
    config::Config,
    lease::{LeaseRecord, LeaseStore},
};

const CREATE_ATTEMPTS: usize = 3;

/// Ownership of a lease as seen at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    NoOwner,
    OwnedFresh,
    OwnedExpired,
}

/// What a candidate should do about a lease in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Insert the record and become active.
    Create,
    /// Another host is healthy. Stay passive, do not contend.
    Stand,
    /// Claim the abandoned lease and become active.
    Takeover,
}

/// The role a worker ends up in after an election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// This worker holds the lease described by the record.
    Active(LeaseRecord),
    /// Another worker holds the lease; the record is the last one observed.
    Passive(LeaseRecord),
}

/// Classifies a lease by the time elapsed since its last health check.
/// Exactly `stale_after` is still fresh.
pub fn classify(record: Option<&LeaseRecord>, now: Millis, stale_after: Duration) -> LeaseState {
    match record {
        None => LeaseState::NoOwner,
        Some(record) if elapsed(record.last_health_check_at, now) > stale_after => {
            LeaseState::OwnedExpired
        }
        Some(_) => LeaseState::OwnedFresh,
    }
}

pub fn decide(state: LeaseState) -> Action {
    match state {
        LeaseState::NoOwner => Action::Create,
        LeaseState::OwnedFresh => Action::Stand,
        LeaseState::OwnedExpired => Action::Takeover,
    }
}

/// Reads the lease for `config.owner_key` and acts on it.
///
/// Losing a creation race re-reads and decides again.
pub fn elect<S, C>(store: &S, config: &Config, clock: &C) -> Result<Role>
where
    S: LeaseStore + ?Sized,
    C: Clock + ?Sized,
{
    for _ in 0..CREATE_ATTEMPTS {
        let current = store.get(&config.owner_key)?;
        let state = classify(
            current.as_ref(),
            clock.now_ms(),
            config.lease_stale_interval,
        );
        match (decide(state), current) {
            (Action::Create, _) => {
                match store.create_if_absent(&config.owner_key, &config.host_name) {
                    Ok(record) => {
                        info!(
                            "created lease '{}', {} is active",
                            config.owner_key, config.host_name
                        );
                        return Ok(Role::Active(record));
                    }
                    Err(Error::AlreadyExists(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            (Action::Takeover, Some(previous)) => {
                let record = store.force_acquire(&config.owner_key, &config.host_name)?;
                info!(
                    "lease '{}' held by {} expired, {} took over",
                    config.owner_key, previous.host_name, config.host_name
                );
                return Ok(Role::Active(record));
            }
            (Action::Stand, Some(record)) => {
                info!(
                    "lease '{}' held by {}, {} is passive",
                    config.owner_key, record.host_name, config.host_name
                );
                return Ok(Role::Passive(record));
            }
            (_, None) => unreachable!("an owned lease state always has a record"),
        }
    }
    Err(Error::TransientStore(format!(
        "lease '{}' creation raced {CREATE_ATTEMPTS} times",
        config.owner_key
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        lease::Renewal,
        store::MemoryLeaseStore,
    };

    const NOW: Millis = 10_000_000;

    fn config(host: &str) -> Config {
        Config::builder("orders-worker", host)
            .lease_stale_interval(Duration::from_secs(185))
            .build()
            .unwrap()
    }

    fn record_at(at: Millis) -> LeaseRecord {
        LeaseRecord::new("orders-worker", "hostA", at)
    }

    #[test]
    fn classify_boundaries() {
        let t = Duration::from_secs(185);
        let t_ms = t.as_millis() as Millis;
        assert_eq!(classify(None, NOW, t), LeaseState::NoOwner);
        assert_eq!(classify(Some(&record_at(NOW)), NOW, t), LeaseState::OwnedFresh);
        assert_eq!(
            classify(Some(&record_at(NOW - t_ms)), NOW, t),
            LeaseState::OwnedFresh
        );
        assert_eq!(
            classify(Some(&record_at(NOW - t_ms - 1)), NOW, t),
            LeaseState::OwnedExpired
        );
        // Health check stamped by a clock running ahead of ours.
        assert_eq!(
            classify(Some(&record_at(NOW + 5_000)), NOW, t),
            LeaseState::OwnedFresh
        );
    }

    #[test]
    fn decide_maps_every_state() {
        assert_eq!(decide(LeaseState::NoOwner), Action::Create);
        assert_eq!(decide(LeaseState::OwnedFresh), Action::Stand);
        assert_eq!(decide(LeaseState::OwnedExpired), Action::Takeover);
    }

    #[test]
    fn fresh_start_becomes_active() {
        let clock = ManualClock::new(NOW);
        let store = MemoryLeaseStore::with_clock(clock.clone());
        let role = elect(&store, &config("hostA"), &clock).unwrap();
        let Role::Active(record) = role else {
            panic!("expected active role");
        };
        assert_eq!(record.host_name, "hostA");
        assert_eq!(store.get("orders-worker").unwrap(), Some(record));
    }

    #[test]
    fn healthy_owner_keeps_lease() {
        let clock = ManualClock::new(NOW);
        let store = MemoryLeaseStore::with_clock(clock.clone());
        store.put(record_at(NOW)).unwrap();

        let role = elect(&store, &config("hostB"), &clock).unwrap();
        assert!(matches!(role, Role::Passive(ref r) if r.host_name == "hostA"));
        // No takeover happened: hostA can still renew.
        assert!(matches!(
            store.try_renew("orders-worker", "hostA", None).unwrap(),
            Renewal::Renewed(_)
        ));
    }

    #[test]
    fn expired_owner_is_taken_over() {
        let clock = ManualClock::new(NOW);
        let store = MemoryLeaseStore::with_clock(clock.clone());
        store.put(record_at(NOW - 200_000)).unwrap();

        let role = elect(&store, &config("hostB"), &clock).unwrap();
        let Role::Active(record) = role else {
            panic!("expected active role");
        };
        assert_eq!(record.host_name, "hostB");
        assert_eq!(record.last_health_check_at, NOW);
    }

    #[test]
    fn transient_read_failure_propagates() {
        let clock = ManualClock::new(NOW);
        let store = MemoryLeaseStore::with_clock(clock.clone());
        store.fail_next(1);
        let err = elect(&store, &config("hostA"), &clock).unwrap_err();
        assert!(err.is_transient());
    }
}
