use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Process-level shutdown signal.
///
/// Both worker loops park on [`Shutdown::wait`] between ticks; calling
/// [`Shutdown::trigger`] wakes them immediately. Clones share the signal.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        let mut requested = lock.lock().unwrap_or_else(|e| e.into_inner());
        *requested = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleeps for up to `timeout`. Returns `true` if shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut requested = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*requested {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            requested = match cvar.wait_timeout(requested, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *requested
    }
}
