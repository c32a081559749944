//! Handler execution states and asynchronous completion jobs.

use crate::event_context::EventContext;
use crate::state::StateStore;

/// Returned by an event processor or interjector in response to an
/// [`EventContext`]. `ExecutionState` describes progress, not success or
/// failure: a handler that swallowed an application error and moved on
/// still returns [`ExecutionState::Complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// The event or interjection is fully processed. Its offset becomes
    /// eligible for the next producer transaction commit.
    Complete,
    /// Processing is still ongoing and the application promises to fulfill
    /// the context later via [`EventContext::async_complete`]. The offset is
    /// not committed yet.
    Incomplete,
    /// Processing failed in a way the application cannot recover from. The
    /// worker escalates this to a terminal source failure.
    Fatal,
    /// The handler could not classify the outcome. Treated like
    /// [`ExecutionState::Incomplete`]: the context stays pending.
    Unknown,
}

/// A deferred completion for a context whose handler returned
/// [`ExecutionState::Incomplete`].
///
/// The finalizer runs on the owning partition worker's dispatch loop, so it
/// may touch partition state without further synchronization.
pub struct AsyncJob<S: StateStore> {
    ctx: EventContext<S>,
    finalizer: Box<dyn FnOnce() -> ExecutionState + Send>,
}

impl<S: StateStore> AsyncJob<S> {
    /// Creates a job finalizing `ctx`.
    pub fn new(
        ctx: EventContext<S>,
        finalizer: impl FnOnce() -> ExecutionState + Send + 'static,
    ) -> Self {
        Self {
            ctx,
            finalizer: Box::new(finalizer),
        }
    }

    /// Runs the finalizer, returning the owning context and its outcome.
    pub fn finalize(self) -> (EventContext<S>, ExecutionState) {
        let state = (self.finalizer)();
        (self.ctx, state)
    }
}

impl<S: StateStore> std::fmt::Debug for AsyncJob<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncJob")
            .field("topic_partition", self.ctx.topic_partition())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_state_equality() {
        assert_eq!(ExecutionState::Complete, ExecutionState::Complete);
        assert_ne!(ExecutionState::Complete, ExecutionState::Incomplete);
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", ExecutionState::Fatal), "Fatal");
    }
}
