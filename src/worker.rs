//! Worker control flow.
//!
//! One thread alternates between two roles:
//! 1. Elect: read the lease and become active or passive
//! 2. Passive: monitor the lease until it expires, then elect again
//! 3. Active: consume the feed from the lease's checkpoint until demoted,
//!    then elect again
//!
//! Expiry detected by the monitor never confers ownership by itself; the
//! election that follows performs the takeover write. With coordination
//! disabled the worker skips all of this and consumes unconditionally.

use log::{info, warn};

use crate::{
    ChangeFeed, Result,
    clock::Clock,
    config::Config,
    consumer::{self, Exit},
    election::{self, Role},
    handler::Handler,
    lease::LeaseStore,
    monitor::{self, Watch},
    renewer::Renewer,
    shutdown::Shutdown,
};

/// Runs the worker until `shutdown` is triggered.
///
/// `feed` is the primary collection's change feed and `lease_feed` the
/// lease collection's. Returns early only on errors that are neither
/// transient nor ownership loss: invalid configuration, corrupt state, or a
/// handler failure.
pub fn run<F, L, S, C, H>(
    feed: &F,
    lease_feed: &L,
    store: &S,
    config: &Config,
    clock: &C,
    handler: &mut H,
    shutdown: &Shutdown,
) -> Result<()>
where
    F: ChangeFeed,
    L: ChangeFeed,
    S: LeaseStore + ?Sized,
    C: Clock + ?Sized,
    H: Handler,
{
    if !config.coordination_enabled {
        info!(
            "lease coordination disabled, {} consumes unconditionally",
            config.host_name
        );
        let mut renewer: Renewer<'_, S, C> = Renewer::uncoordinated(config, clock);
        return match consumer::run(feed, &mut renewer, config, handler, shutdown)? {
            Exit::Shutdown => Ok(()),
            Exit::Demoted { holder } => {
                unreachable!("uncoordinated renewer demoted by {holder}")
            }
        };
    }

    while !shutdown.is_triggered() {
        let role = match election::elect(store, config, clock) {
            Ok(role) => role,
            Err(e) if e.is_transient() => {
                warn!("election for lease '{}' failed: {e}", config.owner_key);
                shutdown.wait(config.health_check_interval);
                continue;
            }
            Err(e) => return Err(e),
        };

        match role {
            Role::Passive(record) => {
                match monitor::run(lease_feed, store, config, clock, shutdown, record)? {
                    Watch::Expired(_) => {
                        info!("{} re-runs election for '{}'", config.host_name, config.owner_key)
                    }
                    Watch::Shutdown => break,
                }
            }
            Role::Active(record) => {
                info!(
                    "{} active for '{}', resuming after {:?}",
                    config.host_name, config.owner_key, record.resume_token
                );
                let mut renewer = Renewer::new(store, config, clock, record.resume_token);
                match consumer::run(feed, &mut renewer, config, handler, shutdown)? {
                    Exit::Demoted { holder } => info!(
                        "{} demoted, '{}' now held by {holder}",
                        config.host_name, config.owner_key
                    ),
                    Exit::Shutdown => break,
                }
            }
        }
    }

    info!("{} shutting down", config.host_name);
    Ok(())
}
