use log::{debug, info, warn};

use crate::{
    ChangeFeed, Result, Subscription,
    clock::Clock,
    config::Config,
    handler::Handler,
    lease::LeaseStore,
    renewer::{Heartbeat, Renewer},
    shutdown::Shutdown,
};

/// Why the consumer loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// Another host took the lease.
    Demoted { holder: String },
    Shutdown,
}

/// Runs the active consumption loop.
///
/// Subscribes to `feed` after the renewer's checkpoint (the start of the feed
/// when there is none) and polls it. For every event the checkpoint is handed
/// to the renewer, and the event is delivered to `handler` unless that
/// revealed a demotion. Idle polls tick the renewer too, then sleep for the
/// poll interval.
///
/// A broken subscription is reopened after the newest checkpoint, so nothing
/// is replayed from the beginning. The loop ends on demotion or shutdown,
/// closing its subscription either way.
pub fn run<F, S, C, H>(
    feed: &F,
    renewer: &mut Renewer<'_, S, C>,
    config: &Config,
    handler: &mut H,
    shutdown: &Shutdown,
) -> Result<Exit>
where
    F: ChangeFeed,
    S: LeaseStore + ?Sized,
    C: Clock + ?Sized,
    H: Handler,
{
    let mut subscription: Option<F::Subscription> = None;
    loop {
        if shutdown.is_triggered() {
            close(&mut subscription);
            return Ok(Exit::Shutdown);
        }

        if subscription.is_none() {
            match feed.subscribe(&config.filter, renewer.checkpoint()) {
                Ok(sub) => {
                    debug!("subscribed to change feed after {:?}", renewer.checkpoint());
                    subscription = Some(sub);
                }
                Err(e) if e.is_transient() => {
                    warn!("change feed subscription failed: {e}");
                    if shutdown.wait(config.poll_interval) {
                        return Ok(Exit::Shutdown);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        let Some(sub) = subscription.as_mut() else {
            continue;
        };

        let heartbeat = match sub.try_next() {
            Ok(Some(event)) => {
                let heartbeat = renewer.on_checkpoint_advanced(Some(event.token.clone()))?;
                if !matches!(heartbeat, Heartbeat::Demoted { .. }) {
                    if let Err(e) = handler.handle(&event) {
                        sub.close();
                        return Err(e);
                    }
                }
                heartbeat
            }
            Ok(None) => {
                let heartbeat = renewer.on_checkpoint_advanced(None)?;
                if !matches!(heartbeat, Heartbeat::Demoted { .. })
                    && shutdown.wait(config.poll_interval)
                {
                    sub.close();
                    return Ok(Exit::Shutdown);
                }
                heartbeat
            }
            Err(e) if e.is_transient() => {
                warn!("change feed subscription dropped: {e}");
                sub.close();
                subscription = None;
                continue;
            }
            Err(e) => {
                sub.close();
                return Err(e);
            }
        };

        if let Heartbeat::Demoted { holder } = heartbeat {
            info!("{} stops consuming, lease now held by {holder}", config.host_name);
            close(&mut subscription);
            return Ok(Exit::Demoted { holder });
        }
    }
}

fn close<T: Subscription>(subscription: &mut Option<T>) {
    if let Some(mut sub) = subscription.take() {
        sub.close();
    }
}
