use crate::{ChangeEvent, Result};

/// Downstream processing of delivered change events.
///
/// The consumer calls [`handle`](Handler::handle) once per event, in feed
/// order, only while it holds the lease. Returning an error stops the
/// consumer and surfaces the error to the caller of [`worker::run`].
///
/// The event's token reaches the renewer before the event reaches the
/// handler. When that renewal is due it stores the token, so a failed event
/// may already be checkpointed and the next holder resumes after it. Retry
/// inside `handle`, or record the failure elsewhere, if such an event must
/// not be lost.
///
/// [`worker::run`]: crate::worker::run
pub trait Handler {
    fn handle(&mut self, event: &ChangeEvent) -> Result<()>;
}

// Blanket impl: any closure matching the signature is a handler.
impl<F: FnMut(&ChangeEvent) -> Result<()>> Handler for F {
    fn handle(&mut self, event: &ChangeEvent) -> Result<()> {
        self(event)
    }
}
