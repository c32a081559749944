//! Hierarchical run/halt handles.
//!
//! A [`RunStatus`] is a two-state cancellation handle: it starts running and
//! can be halted exactly once. `fork()` produces a child whose halt is
//! implied by the parent's but never the other way around, which is what
//! lets one partition worker be revoked without touching its siblings.

use tokio_util::sync::CancellationToken;

/// A forkable running/halted flag backed by a cancellation token.
#[derive(Debug, Clone, Default)]
pub struct RunStatus {
    token: CancellationToken,
}

impl RunStatus {
    /// Creates a new root status in the running state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a child status: halting `self` halts the child, halting the
    /// child leaves `self` running.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Transitions to halted. Idempotent.
    pub fn halt(&self) {
        self.token.cancel();
    }

    /// Returns `true` until `halt()` is called here or on an ancestor.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Resolves once this status has halted. Safe to await from any number
    /// of tasks; resolves immediately if already halted.
    pub async fn done(&self) {
        self.token.cancelled().await;
    }

    /// The cancellation token behind this status, for embedding in
    /// per-event contexts and timer tasks.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_running() {
        let status = RunStatus::new();
        assert!(status.is_running());
    }

    #[test]
    fn test_halt_is_idempotent() {
        let status = RunStatus::new();
        status.halt();
        status.halt();
        assert!(!status.is_running());
    }

    #[test]
    fn test_parent_halt_reaches_child() {
        let parent = RunStatus::new();
        let child = parent.fork();
        parent.halt();
        assert!(!child.is_running());
    }

    #[test]
    fn test_child_halt_leaves_parent_running() {
        let parent = RunStatus::new();
        let child = parent.fork();
        child.halt();
        assert!(parent.is_running());
        assert!(!child.is_running());
    }

    #[test]
    fn test_sibling_isolation() {
        let parent = RunStatus::new();
        let a = parent.fork();
        let b = parent.fork();
        a.halt();
        assert!(b.is_running());
    }

    #[tokio::test]
    async fn test_done_resolves_on_halt() {
        let status = RunStatus::new();
        let waiter = status.clone();
        let handle = tokio::spawn(async move { waiter.done().await });
        status.halt();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_done_resolves_when_already_halted() {
        let status = RunStatus::new();
        status.halt();
        status.done().await;
    }

    #[test]
    fn test_token_tracks_halt() {
        let status = RunStatus::new();
        let token = status.token();
        assert!(!token.is_cancelled());
        status.halt();
        assert!(token.is_cancelled());
    }
}
